// Routes inbound frames to the active session

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{FailureReason, ProtocolError};
use crate::protocol::{
    encode_audio_request, encode_control, parse_binary_frame, parse_frame, ControlAction,
    InboundMessage, SessionId,
};
use crate::session::SessionShared;

/// Where a successfully parsed frame went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Connection-level frame (welcome, pong), not addressed to a session.
    Connection,
    /// Application-level ping; the receive loop answers it with a pong.
    Ping,
    NoActiveSession,
}

/// Owns the active-session slot.
///
/// The slot lock is the single coordination point for session transitions:
/// installing a session, cancelling it, failing it and routing frames to it
/// all happen under it, and a session is removed from the slot as soon as it
/// reaches a terminal state.
#[derive(Default)]
pub struct MessageRouter {
    active: Mutex<Option<Arc<SessionShared>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<SessionShared>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.lock().as_ref().map(|s| s.id())
    }

    /// Parse a text frame and route it to the active session.
    pub fn dispatch(&self, raw: &str) -> Result<DispatchOutcome, ProtocolError> {
        self.route(parse_frame(raw))
    }

    pub fn dispatch_bytes(&self, raw: &[u8]) -> Result<DispatchOutcome, ProtocolError> {
        self.route(parse_binary_frame(raw))
    }

    fn route(&self, parsed: Result<InboundMessage, ProtocolError>) -> Result<DispatchOutcome, ProtocolError> {
        let mut slot = self.lock();

        let message = match parsed {
            Ok(message) => message,
            Err(err) => {
                if let Some(session) = slot.clone() {
                    session.report_malformed(&err);
                    release_if_terminal(&mut slot, &session);
                }
                return Err(err);
            }
        };

        if let InboundMessage::Connection(action) = &message {
            debug!(?action, "Connection-level frame");
            return Ok(match action {
                ControlAction::Ping => DispatchOutcome::Ping,
                _ => DispatchOutcome::Connection,
            });
        }

        let addressed_to = message.session_id();
        let Some(session) = slot.clone() else {
            return match addressed_to {
                Some(received) => {
                    debug!(session_id = %received, "Discarding frame, no active session");
                    Err(ProtocolError::UnexpectedSessionId { received })
                }
                None => Ok(DispatchOutcome::NoActiveSession),
            };
        };

        if let Some(received) = addressed_to {
            if received != session.id() {
                debug!(session_id = %received, active = %session.id(), "Discarding late frame");
                return Err(ProtocolError::UnexpectedSessionId { received });
            }
        }

        session.handle(message);
        release_if_terminal(&mut slot, &session);
        Ok(DispatchOutcome::Delivered)
    }

    /// Make `next` the active session. The previous one is cancelled before
    /// `next` moves to Opening. Returns the cancelled session's id.
    pub(crate) fn replace_active(&self, next: Arc<SessionShared>) -> Option<SessionId> {
        let mut slot = self.lock();
        let previous = slot.take().map(|previous| {
            previous.cancel();
            previous.id()
        });
        next.begin_opening();
        *slot = Some(next);
        previous
    }

    /// Bind the session to the ready transport. `false` if it was replaced or finished meanwhile.
    pub(crate) fn attach(&self, session: &Arc<SessionShared>) -> bool {
        let slot = self.lock();
        is_active(&slot, session) && session.attach()
    }

    pub(crate) fn cancel(&self, session: &Arc<SessionShared>) -> bool {
        let mut slot = self.lock();
        let cancelled = session.cancel();
        release_if_terminal(&mut slot, session);
        cancelled
    }

    /// Cancel whatever session is active.
    pub fn cancel_active(&self) -> bool {
        let mut slot = self.lock();
        match slot.take() {
            Some(session) => session.cancel(),
            None => false,
        }
    }

    pub(crate) fn fail(&self, session: &Arc<SessionShared>, reason: FailureReason) -> bool {
        let mut slot = self.lock();
        let failed = session.fail(reason);
        release_if_terminal(&mut slot, session);
        failed
    }

    pub(crate) fn finish(&self, session: &Arc<SessionShared>) {
        let mut slot = self.lock();
        session.finish_drained();
        release_if_terminal(&mut slot, session);
    }

    /// The transport went away; the active session decides whether that is fatal.
    pub fn on_connection_lost(&self, reason: &str) {
        let mut slot = self.lock();
        if let Some(session) = slot.clone() {
            session.on_connection_lost(reason);
            release_if_terminal(&mut slot, &session);
        }
    }

    pub fn encode_control(
        &self,
        session_id: SessionId,
        sequence: u64,
        action: ControlAction,
    ) -> Result<Message, ProtocolError> {
        encode_control(session_id, sequence, action)
    }

    pub fn encode_audio_request(
        &self,
        session_id: SessionId,
        sequence: u64,
        pcm: &[u8],
        last: bool,
    ) -> Result<Message, ProtocolError> {
        encode_audio_request(session_id, sequence, pcm, last)
    }
}

fn is_active(slot: &Option<Arc<SessionShared>>, session: &Arc<SessionShared>) -> bool {
    slot.as_ref().is_some_and(|active| Arc::ptr_eq(active, session))
}

fn release_if_terminal(slot: &mut Option<Arc<SessionShared>>, session: &Arc<SessionShared>) {
    if is_active(slot, session) && session.is_terminal() {
        *slot = None;
    }
}
