//! Transport lifecycle for the speech backend.
//!
//! A [`ConnectionManager`] owns at most one WebSocket transport. Connect
//! attempts are deduplicated: every caller that asks for the endpoint while
//! an attempt is in flight gets a [`Completion`] resolved by that attempt.
//! The manager never retries on its own; callers observe `Error` and
//! `Disconnected` through state listeners and decide when to reconnect.
//!
//! A ready transport is read from the moment it connects, so a pooled
//! connection that the server closes while idle leaves `Connected` at once.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::{EndpointProvider, StreamConfig};
use crate::error::{ConnectionError, ProtocolError};
use crate::protocol::encode_pong;
use crate::router::{DispatchOutcome, MessageRouter};
use crate::validation::validate_endpoint;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// One state transition, as seen by listeners.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub endpoint: Option<String>,
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub error: Option<ConnectionError>,
    pub at: DateTime<Utc>,
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub endpoint: Option<String>,
    pub state: ConnectionState,
    pub last_error: Option<ConnectionError>,
    pub created_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub listener_count: usize,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub connect_timeout: Duration,
    /// Interval of WebSocket pings while connected. `None` disables them.
    pub keepalive: Option<Duration>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&StreamConfig::default())
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            keepalive: config.keepalive(),
        }
    }
}

/// Resolves once with the outcome of a connect attempt or a write.
#[must_use = "a completion does nothing unless awaited"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), ConnectionError>>,
}

impl Completion {
    fn pending() -> (oneshot::Sender<Result<(), ConnectionError>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    fn ready(result: Result<(), ConnectionError>) -> Self {
        let (tx, completion) = Self::pending();
        let _ = tx.send(result);
        completion
    }
}

impl Future for Completion {
    type Output = Result<(), ConnectionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(ConnectionError::TransportClosed(
                    "connection manager dropped the request".to_string(),
                ))
            })
        })
    }
}

struct Outgoing {
    message: Message,
    done: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

struct Inner {
    state: ConnectionState,
    endpoint: Option<String>,
    last_error: Option<ConnectionError>,
    created_at: Option<DateTime<Utc>>,
    ready_at: Option<DateTime<Utc>>,
    // bumped whenever the transport is replaced, so stale tasks can tell
    generation: u64,
    waiters: Vec<oneshot::Sender<Result<(), ConnectionError>>>,
    writer: Option<mpsc::UnboundedSender<Outgoing>>,
    reader_task: Option<JoinHandle<()>>,
    listeners: HashMap<String, Listener>,
}

struct Shared {
    inner: Mutex<Inner>,
    notify_tx: mpsc::UnboundedSender<(StateChange, Vec<Listener>)>,
    router: Arc<MessageRouter>,
    options: ConnectionOptions,
}

/// Handle to the streaming transport. Clones share the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Must be called from within a Tokio runtime.
    pub fn new(router: Arc<MessageRouter>, options: ConnectionOptions) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        tokio::spawn(notify_listeners(notify_rx));

        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    endpoint: None,
                    last_error: None,
                    created_at: None,
                    ready_at: None,
                    generation: 0,
                    waiters: Vec::new(),
                    writer: None,
                    reader_task: None,
                    listeners: HashMap::new(),
                }),
                notify_tx,
                router,
                options,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.shared.router
    }

    pub fn current_state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.current_state() == ConnectionState::Connected
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        let inner = self.lock();
        ConnectionSnapshot {
            endpoint: inner.endpoint.clone(),
            state: inner.state,
            last_error: inner.last_error.clone(),
            created_at: inner.created_at,
            ready_at: inner.ready_at,
            listener_count: inner.listeners.len(),
        }
    }

    /// Start connecting to `endpoint` unless a transport to it is already
    /// ready or connecting. Never tears down a transport to another endpoint;
    /// that case resolves with `EndpointMismatch`.
    ///
    /// The attempt proceeds whether or not the returned completion is awaited.
    pub fn pre_connect(&self, endpoint: &str) -> Completion {
        self.request(endpoint, false)
    }

    /// Resolve once a transport to `endpoint` is ready, switching endpoints if needed.
    pub fn ensure_connection(&self, endpoint: &str) -> Completion {
        self.request(endpoint, true)
    }

    pub fn pre_connect_configured(&self, provider: &dyn EndpointProvider) -> Completion {
        self.pre_connect(&provider.endpoint())
    }

    pub fn ensure_configured(&self, provider: &dyn EndpointProvider) -> Completion {
        self.ensure_connection(&provider.endpoint())
    }

    fn request(&self, endpoint: &str, replace: bool) -> Completion {
        if let Err(e) = validate_endpoint(endpoint) {
            return Completion::ready(Err(e));
        }
        let (tx, completion) = Completion::pending();
        let mut switched = false;

        {
            let mut inner = self.lock();
            let same_endpoint = inner.endpoint.as_deref() == Some(endpoint);

            match inner.state {
                ConnectionState::Connected if same_endpoint => {
                    let _ = tx.send(Ok(()));
                    return completion;
                }
                ConnectionState::Connecting if same_endpoint => {
                    debug!(endpoint, "Joining in-flight connect");
                    inner.waiters.push(tx);
                    return completion;
                }
                ConnectionState::Connected | ConnectionState::Connecting => {
                    let active = inner.endpoint.clone().unwrap_or_default();
                    if !replace {
                        let _ = tx.send(Err(ConnectionError::EndpointMismatch {
                            active,
                            requested: endpoint.to_string(),
                        }));
                        return completion;
                    }
                    info!(from = %active, to = endpoint, "Switching endpoint");
                    self.teardown(
                        &mut inner,
                        ConnectionError::TransportClosed("endpoint changed".to_string()),
                    );
                    switched = true;
                }
                ConnectionState::Error => {
                    self.transition(&mut inner, ConnectionState::Disconnected, None);
                }
                ConnectionState::Disconnected => {}
            }

            inner.generation += 1;
            let generation = inner.generation;
            inner.endpoint = Some(endpoint.to_string());
            inner.last_error = None;
            inner.created_at = Some(Utc::now());
            inner.ready_at = None;
            inner.waiters.push(tx);
            self.transition(&mut inner, ConnectionState::Connecting, None);

            tokio::spawn(self.clone().establish(endpoint.to_string(), generation));
        }

        if switched {
            self.shared.router.on_connection_lost("endpoint changed");
        }
        completion
    }

    async fn establish(self, endpoint: String, generation: u64) {
        let timeout = self.shared.options.connect_timeout;
        info!(%endpoint, "Connecting");

        let outcome = match tokio::time::timeout(timeout, connect_async(endpoint.as_str())).await {
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(e)) => Err(ConnectionError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(ConnectionError::ConnectTimeout {
                endpoint: endpoint.clone(),
                after_ms: timeout.as_millis() as u64,
            }),
        };

        let mut inner = self.lock();
        if inner.generation != generation {
            debug!(%endpoint, "Discarding superseded connect attempt");
            return;
        }

        let waiters = std::mem::take(&mut inner.waiters);
        let result = match outcome {
            Ok(stream) => {
                let (sink, reader) = stream.split();
                let (writer_tx, writer_rx) = mpsc::unbounded_channel();
                tokio::spawn(write_loop(self.clone(), sink, writer_rx, generation));

                inner.writer = Some(writer_tx);
                inner.reader_task = Some(tokio::spawn(self.clone().read_loop(reader, generation)));
                inner.ready_at = Some(Utc::now());
                self.transition(&mut inner, ConnectionState::Connected, None);
                info!(%endpoint, "Connection ready");
                Ok(())
            }
            Err(e) => {
                error!("Connect failed: {}", e);
                self.transition(&mut inner, ConnectionState::Error, Some(e.clone()));
                Err(e)
            }
        };
        drop(inner);

        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Tear down the transport. No-op when already disconnected.
    pub fn disconnect(&self) {
        {
            let mut inner = self.lock();
            if inner.state == ConnectionState::Disconnected {
                return;
            }
            info!(endpoint = ?inner.endpoint, "Disconnecting");
            self.teardown(
                &mut inner,
                ConnectionError::TransportClosed("disconnected".to_string()),
            );
        }
        self.shared.router.on_connection_lost("disconnected");
    }

    fn teardown(&self, inner: &mut Inner, reason: ConnectionError) {
        inner.generation += 1;
        // dropping the writer channel makes the write loop close the socket
        inner.writer = None;
        if let Some(task) = inner.reader_task.take() {
            task.abort();
        }
        inner.ready_at = None;
        for waiter in inner.waiters.drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
        self.transition(inner, ConnectionState::Disconnected, None);
    }

    /// Queue a frame for the transport. Fails with `NotReady` unless connected.
    pub fn send(&self, message: Message) -> Completion {
        let inner = self.lock();
        if inner.state != ConnectionState::Connected {
            return Completion::ready(Err(ConnectionError::NotReady));
        }
        let Some(writer) = inner.writer.as_ref() else {
            return Completion::ready(Err(ConnectionError::NotReady));
        };

        let (done, completion) = Completion::pending();
        let outgoing = Outgoing {
            message,
            done: Some(done),
        };
        if writer.send(outgoing).is_err() {
            return Completion::ready(Err(ConnectionError::TransportClosed(
                "writer stopped".to_string(),
            )));
        }
        completion
    }

    /// Whether inbound frames are being forwarded to the router.
    ///
    /// Every successful connect starts the receive loop itself; it ends with
    /// the transport and is not restarted. Returns `false` when not connected.
    pub fn start_receive_loop(&self) -> bool {
        let inner = self.lock();
        inner.state == ConnectionState::Connected
            && inner.reader_task.as_ref().is_some_and(|task| !task.is_finished())
    }

    async fn read_loop(self, mut reader: WsReader, generation: u64) {
        let router = self.shared.router.clone();

        let outcome: Result<String, ConnectionError> = loop {
            match reader.next().await {
                Some(Ok(Message::Text(text))) => self.after_dispatch(router.dispatch(text.as_str())),
                Some(Ok(Message::Binary(bytes))) => self.after_dispatch(router.dispatch_bytes(&bytes)),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "closed by server".to_string());
                    break Ok(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(ConnectionError::TransportClosed(e.to_string())),
                None => break Ok("stream ended".to_string()),
            }
        };

        self.transport_lost(generation, outcome, false);
    }

    /// Retire the transport of `generation` after its reader or writer stopped.
    fn transport_lost(&self, generation: u64, outcome: Result<String, ConnectionError>, stop_reader: bool) {
        let reason = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            inner.generation += 1;
            inner.writer = None;
            if let Some(task) = inner.reader_task.take() {
                if stop_reader {
                    task.abort();
                }
            }
            inner.ready_at = None;
            match outcome {
                Ok(reason) => {
                    info!("Transport closed: {}", reason);
                    self.transition(&mut inner, ConnectionState::Disconnected, None);
                    reason
                }
                Err(e) => {
                    warn!("Transport failed: {}", e);
                    let reason = e.to_string();
                    self.transition(&mut inner, ConnectionState::Error, Some(e));
                    reason
                }
            }
        };
        self.shared.router.on_connection_lost(&reason);
    }

    fn after_dispatch(&self, result: Result<DispatchOutcome, ProtocolError>) {
        match result {
            Ok(DispatchOutcome::Ping) => match encode_pong() {
                // the reply is fire and forget, a dead writer is seen by the write loop
                Ok(pong) => {
                    let _ = self.send(pong);
                }
                Err(e) => warn!("{}", e),
            },
            Ok(_) => {}
            Err(ProtocolError::UnexpectedSessionId { received }) => {
                debug!(session_id = %received, "Dropped frame for inactive session");
            }
            Err(e) => warn!("{}", e),
        }
    }

    /// Register a listener, replacing any listener with the same id.
    pub fn add_state_listener<F>(&self, id: impl Into<String>, listener: F)
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.lock().listeners.insert(id.into(), Arc::new(listener));
    }

    /// Returns whether a listener was removed. Unknown ids are ignored.
    pub fn remove_state_listener(&self, id: &str) -> bool {
        self.lock().listeners.remove(id).is_some()
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState, error: Option<ConnectionError>) {
        let previous = inner.state;
        if previous == next && error.is_none() {
            return;
        }
        inner.state = next;
        if let Some(e) = &error {
            inner.last_error = Some(e.clone());
        }
        debug!(from = %previous, to = %next, "Connection state changed");

        let change = StateChange {
            endpoint: inner.endpoint.clone(),
            previous,
            current: next,
            error,
            at: Utc::now(),
        };
        let listeners: Vec<Listener> = inner.listeners.values().cloned().collect();
        if !listeners.is_empty() {
            let _ = self.shared.notify_tx.send((change, listeners));
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ConnectionManager")
            .field("endpoint", &inner.endpoint)
            .field("state", &inner.state)
            .finish()
    }
}

/// Deliver transitions in the order they happened.
async fn notify_listeners(mut rx: mpsc::UnboundedReceiver<(StateChange, Vec<Listener>)>) {
    while let Some((change, listeners)) = rx.recv().await {
        for listener in listeners {
            listener(&change);
        }
    }
}

/// Runs until the manager drops the channel or a write fails. A failed
/// write retires the transport so the pool never hands out a dead writer.
async fn write_loop(
    manager: ConnectionManager,
    mut sink: WsWriter,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    generation: u64,
) {
    let mut ping = manager.shared.options.keepalive.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });

    loop {
        let next = tokio::select! {
            next = rx.recv() => next,
            _ = async {
                match ping.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {
                if let Err(e) = sink.send(Message::Ping(Default::default())).await {
                    debug!("Keep-alive ping failed: {}", e);
                    let error = ConnectionError::TransportClosed(e.to_string());
                    manager.transport_lost(generation, Err(error), true);
                    break;
                }
                continue;
            }
        };

        let Some(Outgoing { message, done }) = next else {
            break;
        };
        let result = sink
            .send(message)
            .await
            .map_err(|e| ConnectionError::TransportClosed(e.to_string()));
        if let Some(done) = done {
            let _ = done.send(result.clone());
        }
        if let Err(e) = result {
            warn!("Write failed: {}", e);
            manager.transport_lost(generation, Err(e), true);
            break;
        }
    }

    let _ = sink.close().await;
}
