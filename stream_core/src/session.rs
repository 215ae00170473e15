//! One speak request, from open to a terminal state.
//!
//! A session is shared between three tasks: the connection's receive loop
//! (through the router), the pacing task that feeds the sink, and the upload
//! task that sends the source upstream. State changes that affect which
//! session is active always go through [`MessageRouter`], so open, cancel and
//! disconnect cannot interleave into a torn state.
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::audio::{load_asset, AudioFormat};
use crate::clock::{ClockEvent, ClockInput, ClockOutput, PlaybackClock};
use crate::connection::ConnectionManager;
use crate::error::{FailureReason, ProtocolError, SessionError};
use crate::metrics::{LatencyMetrics, Outcome};
use crate::protocol::{
    encode_audio_request, encode_control, AudioChunk, ControlAction, InboundMessage, SessionId,
    SessionMode,
};
use crate::router::MessageRouter;
use crate::sink::PlaybackSink;
use crate::timing::{LatencyBreakdown, Milestone, TimingMarks};
use crate::validation::validate_text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Streaming,
    Draining,
    Completed,
    Cancelled,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed(_)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Opening => f.write_str("opening"),
            SessionState::Streaming => f.write_str("streaming"),
            SessionState::Draining => f.write_str("draining"),
            SessionState::Completed => f.write_str("completed"),
            SessionState::Cancelled => f.write_str("cancelled"),
            SessionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    OutOfOrder,
    Overflow,
}

/// Notifications delivered only to the owner of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// First audio arrived; `latency` is measured from the open request.
    FirstAudio { latency: Duration },
    ChunkDropped { sequence: u64, reason: DropReason },
    Underrun { position: Duration },
    MalformedFrame { consecutive: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DropCounts {
    pub duplicate: u64,
    pub out_of_order: u64,
    pub overflow: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub mode: SessionMode,
    pub state: String,
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub bytes_rendered: u64,
    pub dropped: DropCounts,
    pub underruns: u64,
    pub malformed_frames: u64,
    pub latency: LatencyBreakdown,
}

/// What a session plays.
#[derive(Debug)]
pub enum SessionSource {
    /// WAV (16 kHz mono 16-bit) or raw `.pcm` file, uploaded for replay.
    AssetFile(PathBuf),
    /// Raw PCM already in memory.
    AssetPcm(Vec<u8>),
    /// One complete utterance.
    Text(String),
    /// Text increments; closing the channel ends the utterance.
    TextStream(mpsc::Receiver<String>),
}

impl SessionSource {
    pub fn mode(&self) -> SessionMode {
        match self {
            SessionSource::AssetFile(_) | SessionSource::AssetPcm(_) => SessionMode::AssetReplay,
            SessionSource::Text(_) | SessionSource::TextStream(_) => SessionMode::LiveText,
        }
    }

    /// Load and validate the source before any session state is touched.
    pub(crate) fn prepare(self) -> Result<Upload, SessionError> {
        match self {
            SessionSource::AssetFile(path) => Ok(Upload::Asset(load_asset(path)?)),
            SessionSource::AssetPcm(pcm) => {
                if pcm.is_empty() {
                    return Err(SessionError::InvalidAsset("asset contains no audio".to_string()));
                }
                if pcm.len() % AudioFormat::default().block_align() != 0 {
                    return Err(SessionError::InvalidAsset(
                        "asset is not whole 16-bit samples".to_string(),
                    ));
                }
                Ok(Upload::Asset(pcm))
            }
            SessionSource::Text(text) => {
                validate_text(&text)?;
                Ok(Upload::Text(text))
            }
            SessionSource::TextStream(rx) => Ok(Upload::TextStream(rx)),
        }
    }
}

pub(crate) enum Upload {
    Asset(Vec<u8>),
    Text(String),
    TextStream(mpsc::Receiver<String>),
}

impl Upload {
    pub(crate) fn asset_len(&self) -> Option<usize> {
        match self {
            Upload::Asset(pcm) => Some(pcm.len()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    chunks_received: u64,
    bytes_received: u64,
    bytes_rendered: u64,
    dropped: DropCounts,
    underruns: u64,
    malformed_frames: u64,
}

struct SessionInner {
    state: SessionState,
    /// Set once the session owns a ready transport and its start frame is going out.
    attached: bool,
    highest_sequence: Option<u64>,
    malformed_streak: u32,
    buffered_bytes: usize,
    stats: Stats,
    timing: TimingMarks,
    // dropped at the terminal transition so the owner's event stream ends
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionInner {
    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

pub(crate) struct SessionShared {
    id: SessionId,
    mode: SessionMode,
    connection: ConnectionManager,
    inner: Mutex<SessionInner>,
    state_tx: watch::Sender<SessionState>,
    clock_tx: mpsc::UnboundedSender<ClockInput>,
    outbound_sequence: AtomicU64,
    malformed_threshold: u32,
    metrics: LatencyMetrics,
}

impl SessionShared {
    pub(crate) fn new(
        mode: SessionMode,
        connection: ConnectionManager,
        clock_tx: mpsc::UnboundedSender<ClockInput>,
        malformed_threshold: u32,
        metrics: LatencyMetrics,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let shared = Arc::new(Self {
            id: SessionId::new(),
            mode,
            connection,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                attached: false,
                highest_sequence: None,
                malformed_streak: 0,
                buffered_bytes: 0,
                stats: Stats::default(),
                timing: TimingMarks::default(),
                events: Some(events_tx),
            }),
            state_tx,
            clock_tx,
            outbound_sequence: AtomicU64::new(0),
            malformed_threshold: malformed_threshold.max(1),
            metrics,
        });
        (shared, events_rx)
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub(crate) fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    pub(crate) fn highest_sequence(&self) -> Option<u64> {
        self.lock().highest_sequence
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn next_outbound_sequence(&self) -> u64 {
        self.outbound_sequence.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn mark(&self, milestone: Milestone) {
        self.lock().timing.mark(milestone, Instant::now());
    }

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        if inner.state == next {
            return;
        }
        info!(session_id = %self.id, from = %inner.state, to = %next, "Session state changed");
        inner.state = next.clone();
        self.state_tx.send_replace(next.clone());
        inner.emit(SessionEvent::StateChanged(next.clone()));

        if next.is_terminal() {
            let outcome = match next {
                SessionState::Completed => Outcome::Completed,
                SessionState::Cancelled => Outcome::Cancelled,
                _ => Outcome::Failed,
            };
            if outcome != Outcome::Completed {
                inner.buffered_bytes = 0;
                let _ = self.clock_tx.send(ClockInput::Flush);
            }
            self.metrics.record_session(
                outcome,
                inner.timing.breakdown().total_to_first_audio_ms,
                inner.stats.bytes_rendered as usize,
            );
            inner.events = None;
        }
    }

    /// Idle -> Opening. Called by the router while installing the session.
    pub(crate) fn begin_opening(&self) {
        let mut inner = self.lock();
        if inner.state == SessionState::Idle {
            self.transition(&mut inner, SessionState::Opening);
        }
    }

    pub(crate) fn attach(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.attached = true;
        true
    }

    /// Route one inbound message addressed to this session.
    pub(crate) fn handle(&self, message: InboundMessage) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            debug!(session_id = %self.id, "Discarding frame for finished session");
            return;
        }
        inner.malformed_streak = 0;

        match message {
            InboundMessage::ControlAck { of, .. } => {
                if of == "start" && inner.state == SessionState::Opening {
                    self.transition(&mut inner, SessionState::Streaming);
                }
            }
            InboundMessage::Audio(chunk) => self.feed(&mut inner, chunk),
            InboundMessage::Error { message, .. } => {
                warn!(session_id = %self.id, "Upstream error: {}", message);
                self.transition(&mut inner, SessionState::Failed(FailureReason::Upstream(message)));
            }
            InboundMessage::EndOfStream { .. } => self.begin_draining(&mut inner),
            InboundMessage::Connection(_) => {}
        }
    }

    fn feed(&self, inner: &mut SessionInner, chunk: AudioChunk) {
        if !matches!(inner.state, SessionState::Opening | SessionState::Streaming) {
            debug!(session_id = %self.id, sequence = chunk.sequence, "Audio after end of stream ignored");
            return;
        }

        if let Some(highest) = inner.highest_sequence {
            if chunk.sequence <= highest {
                let reason = if chunk.sequence == highest {
                    inner.stats.dropped.duplicate += 1;
                    DropReason::Duplicate
                } else {
                    inner.stats.dropped.out_of_order += 1;
                    DropReason::OutOfOrder
                };
                debug!(session_id = %self.id, sequence = chunk.sequence, highest, ?reason, "Dropping chunk");
                inner.emit(SessionEvent::ChunkDropped {
                    sequence: chunk.sequence,
                    reason,
                });
                return;
            }
        }

        let len = chunk.payload.len();
        inner.highest_sequence = Some(chunk.sequence);
        inner.stats.chunks_received += 1;
        inner.stats.bytes_received += len as u64;
        inner.buffered_bytes += len;

        if inner.timing.mark(Milestone::FirstAudio, Instant::now()) {
            let latency = match (
                inner.timing.get(Milestone::RequestStart),
                inner.timing.get(Milestone::FirstAudio),
            ) {
                (Some(start), Some(first)) => first.duration_since(start),
                _ => Duration::ZERO,
            };
            info!(session_id = %self.id, latency_ms = latency.as_millis() as u64, "First audio received");
            inner.emit(SessionEvent::FirstAudio { latency });
        }

        if inner.state == SessionState::Opening {
            self.transition(inner, SessionState::Streaming);
        }

        let last = chunk.end_of_stream;
        let _ = self.clock_tx.send(ClockInput::Chunk(chunk));
        if last {
            self.begin_draining(inner);
        }
    }

    fn begin_draining(&self, inner: &mut SessionInner) {
        if matches!(inner.state, SessionState::Opening | SessionState::Streaming) {
            self.transition(inner, SessionState::Draining);
            let _ = self.clock_tx.send(ClockInput::Finish);
        }
    }

    pub(crate) fn report_malformed(&self, error: &ProtocolError) {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return;
        }
        inner.malformed_streak += 1;
        inner.stats.malformed_frames += 1;
        let consecutive = inner.malformed_streak;
        warn!(session_id = %self.id, consecutive, "{}", error);
        inner.emit(SessionEvent::MalformedFrame { consecutive });

        if consecutive >= self.malformed_threshold {
            self.transition(
                &mut inner,
                SessionState::Failed(FailureReason::MalformedFrames(consecutive)),
            );
        }
    }

    /// Returns `false` if the session had already reached a terminal state.
    pub(crate) fn cancel(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        let notify_upstream = inner.attached;
        self.transition(&mut inner, SessionState::Cancelled);
        drop(inner);

        if notify_upstream && self.connection.is_ready() {
            // best effort, the session is already torn down locally
            match encode_control(self.id, self.next_outbound_sequence(), ControlAction::Cancel) {
                Ok(frame) => {
                    let _ = self.connection.send(frame);
                }
                Err(e) => warn!(session_id = %self.id, "Cancel frame not sent: {}", e),
            }
        }
        true
    }

    pub(crate) fn fail(&self, reason: FailureReason) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            return false;
        }
        self.transition(&mut inner, SessionState::Failed(reason));
        true
    }

    pub(crate) fn on_connection_lost(&self, reason: &str) {
        let mut inner = self.lock();
        let streaming = matches!(inner.state, SessionState::Opening | SessionState::Streaming);
        if streaming && inner.attached {
            self.transition(
                &mut inner,
                SessionState::Failed(FailureReason::ConnectionLost(reason.to_string())),
            );
        }
    }

    /// The pacing task handed everything to the sink.
    pub(crate) fn finish_drained(&self) -> bool {
        let mut inner = self.lock();
        if inner.state != SessionState::Draining {
            return false;
        }
        self.transition(&mut inner, SessionState::Completed);
        true
    }

    fn on_rendered(&self, bytes: usize) {
        let mut inner = self.lock();
        inner.buffered_bytes = inner.buffered_bytes.saturating_sub(bytes);
        inner.stats.bytes_rendered += bytes as u64;
    }

    fn on_overflow(&self, sequence: u64, bytes: usize) {
        let mut inner = self.lock();
        inner.buffered_bytes = inner.buffered_bytes.saturating_sub(bytes);
        inner.stats.dropped.overflow += 1;
        warn!(session_id = %self.id, sequence, bytes, "Pacing buffer full, dropped oldest chunk");
        inner.emit(SessionEvent::ChunkDropped {
            sequence,
            reason: DropReason::Overflow,
        });
    }

    fn on_underrun(&self, position: Duration) {
        let mut inner = self.lock();
        inner.stats.underruns += 1;
        debug!(session_id = %self.id, position_ms = position.as_millis() as u64, "Playback underrun");
        inner.emit(SessionEvent::Underrun { position });
    }

    fn report(&self) -> SessionReport {
        let inner = self.lock();
        SessionReport {
            session_id: self.id,
            mode: self.mode,
            state: inner.state.to_string(),
            chunks_received: inner.stats.chunks_received,
            bytes_received: inner.stats.bytes_received,
            bytes_rendered: inner.stats.bytes_rendered,
            dropped: inner.stats.dropped,
            underruns: inner.stats.underruns,
            malformed_frames: inner.stats.malformed_frames,
            latency: inner.timing.breakdown(),
        }
    }
}

/// Handle returned to the caller that opened a session.
pub struct StreamingSession {
    shared: Arc<SessionShared>,
    router: Arc<MessageRouter>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    state_rx: watch::Receiver<SessionState>,
}

impl StreamingSession {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        router: Arc<MessageRouter>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let state_rx = shared.subscribe_state();
        Self {
            shared,
            router,
            events,
            state_rx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn mode(&self) -> SessionMode {
        self.shared.mode
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Received audio not yet handed to the sink.
    pub fn buffered_bytes(&self) -> usize {
        self.shared.lock().buffered_bytes
    }

    pub fn highest_sequence(&self) -> Option<u64> {
        self.shared.highest_sequence()
    }

    pub fn timing(&self) -> LatencyBreakdown {
        self.shared.lock().timing.breakdown()
    }

    pub fn report(&self) -> SessionReport {
        self.shared.report()
    }

    /// Cancel the session. Only the first call has any effect.
    pub fn cancel(&self) -> bool {
        self.router.cancel(&self.shared)
    }

    /// Next event, or `None` once the session is finished and all events were read.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Watch state changes without consuming events.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> Result<SessionReport, SessionError> {
        let mut rx = self.state_rx.clone();
        let state = match rx.wait_for(SessionState::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.shared.state(),
        };
        match state {
            SessionState::Completed => Ok(self.report()),
            SessionState::Failed(reason) => Err(SessionError::Failed(reason)),
            _ => Err(SessionError::Cancelled),
        }
    }
}

impl fmt::Debug for StreamingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingSession")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Drive the paced frame sequence into the sink until the clock is drained.
pub(crate) async fn run_pacing(
    router: Arc<MessageRouter>,
    session: Arc<SessionShared>,
    clock: PlaybackClock,
    input: mpsc::UnboundedReceiver<ClockInput>,
    mut sink: Box<dyn PlaybackSink>,
) {
    let frames = clock.drain(input);
    futures_util::pin_mut!(frames);

    while let Some(output) = frames.next().await {
        match output {
            ClockOutput::Frame(frame) => {
                let bytes = frame.pcm.len();
                sink.play(frame);
                session.on_rendered(bytes);
            }
            ClockOutput::Event(ClockEvent::Overflow { sequence, bytes }) => {
                session.on_overflow(sequence, bytes);
            }
            ClockOutput::Event(ClockEvent::Underrun { position }) => {
                sink.underrun(position);
                session.on_underrun(position);
            }
        }
    }

    sink.finish();
    router.finish(&session);
}

/// Send the session's source upstream after the start frame.
pub(crate) async fn run_upload(
    router: Arc<MessageRouter>,
    session: Arc<SessionShared>,
    upload: Upload,
    frame_bytes: usize,
) {
    let connection = session.connection.clone();
    let id = session.id;

    let result = match upload {
        Upload::Asset(pcm) => {
            let total = pcm.chunks(frame_bytes.max(1)).count();
            let mut outcome = Ok(());
            for (index, frame) in pcm.chunks(frame_bytes.max(1)).enumerate() {
                if session.is_terminal() {
                    break;
                }
                let last = index + 1 == total;
                let message = encode_audio_request(id, session.next_outbound_sequence(), frame, last);
                if let Err(e) = send_frame(&connection, message).await {
                    outcome = Err(e);
                    break;
                }
            }
            outcome
        }
        Upload::Text(text) => {
            let message = encode_control(id, session.next_outbound_sequence(), ControlAction::Text { text });
            match send_frame(&connection, message).await {
                Ok(()) => {
                    let end = encode_control(id, session.next_outbound_sequence(), ControlAction::TextEnd);
                    send_frame(&connection, end).await
                }
                Err(e) => Err(e),
            }
        }
        Upload::TextStream(mut increments) => {
            let mut outcome = Ok(());
            while let Some(text) = increments.recv().await {
                if session.is_terminal() {
                    break;
                }
                if let Err(e) = validate_text(&text) {
                    warn!(session_id = %id, "Skipping text increment: {}", e);
                    continue;
                }
                let message = encode_control(id, session.next_outbound_sequence(), ControlAction::Text { text });
                if let Err(e) = send_frame(&connection, message).await {
                    outcome = Err(e);
                    break;
                }
            }
            if outcome.is_ok() && !session.is_terminal() {
                let end = encode_control(id, session.next_outbound_sequence(), ControlAction::TextEnd);
                outcome = send_frame(&connection, end).await;
            }
            outcome
        }
    };

    if let Err(e) = result {
        if !session.is_terminal() {
            warn!(session_id = %id, "Upload failed: {}", e);
            router.fail(&session, FailureReason::SendFailed(e));
        }
    }
}

/// Encode-or-send failure, flattened into the reason a session fails with.
pub(crate) async fn send_frame(
    connection: &ConnectionManager,
    frame: Result<Message, ProtocolError>,
) -> Result<(), String> {
    let message = frame.map_err(|e| e.to_string())?;
    connection.send(message).await.map_err(|e| e.to_string())
}
