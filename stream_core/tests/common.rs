//! In-process speech backend for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use stream_core::StreamConfig;
use tokio::sync::broadcast;

/// 100ms of 16 kHz mono 16-bit audio
pub const FRAME_BYTES: usize = 3_200;

#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Audio frames rendered for each `text` increment.
    pub chunks_per_text: usize,
    pub chunk_bytes: usize,
    /// Pause between rendered frames; zero sends them in one burst.
    pub chunk_interval: Duration,
    pub ack_start: bool,
    /// Garbage frames sent right after the start ack.
    pub malformed_after_start: usize,
    /// Only the first N sessions get garbage frames.
    pub malformed_sessions: usize,
    /// Delay before answering the WebSocket upgrade.
    pub accept_delay: Duration,
    /// Send an application-level ping right after the welcome.
    pub ping_after_welcome: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            chunks_per_text: 3,
            chunk_bytes: FRAME_BYTES,
            chunk_interval: Duration::ZERO,
            ack_start: true,
            malformed_after_start: 0,
            malformed_sessions: usize::MAX,
            accept_delay: Duration::ZERO,
            ping_after_welcome: false,
        }
    }
}

/// A control frame the backend received.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedControl {
    pub session_id: Option<String>,
    pub action: String,
}

#[derive(Clone)]
struct MockState {
    options: MockOptions,
    connections: Arc<AtomicUsize>,
    starts: Arc<AtomicUsize>,
    uploaded_bytes: Arc<AtomicUsize>,
    controls: Arc<Mutex<Vec<ReceivedControl>>>,
    kill: broadcast::Sender<()>,
}

pub struct MockBackend {
    pub addr: SocketAddr,
    state: MockState,
}

impl MockBackend {
    pub async fn spawn(options: MockOptions) -> Self {
        let (kill, _) = broadcast::channel(4);
        let state = MockState {
            options,
            connections: Arc::new(AtomicUsize::new(0)),
            starts: Arc::new(AtomicUsize::new(0)),
            uploaded_bytes: Arc::new(AtomicUsize::new(0)),
            controls: Arc::new(Mutex::new(Vec::new())),
            kill,
        };

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Client config pointed at this backend with short timings.
    pub fn config(&self) -> StreamConfig {
        StreamConfig {
            endpoint: self.endpoint(),
            connect_timeout_secs: 5,
            open_timeout_secs: 5,
            keepalive_secs: 0,
            lookahead_ms: 200,
            ..StreamConfig::default()
        }
    }

    /// Accepted WebSocket transports so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn uploaded_bytes(&self) -> usize {
        self.state.uploaded_bytes.load(Ordering::SeqCst)
    }

    pub fn controls(&self) -> Vec<ReceivedControl> {
        self.state.controls.lock().unwrap().clone()
    }

    pub fn count_action(&self, session_id: &str, action: &str) -> usize {
        self.controls()
            .iter()
            .filter(|c| c.action == action && c.session_id.as_deref() == Some(session_id))
            .count()
    }

    /// Close every open transport from the server side.
    pub fn drop_connections(&self) {
        let _ = self.state.kill.send(());
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<MockState>) -> impl IntoResponse {
    if !state.options.accept_delay.is_zero() {
        tokio::time::sleep(state.options.accept_delay).await;
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_json(socket: &mut WebSocket, value: Value) -> bool {
    socket.send(Message::Text(value.to_string().into())).await.is_ok()
}

fn audio_frame(session_id: &str, sequence: u64, payload: &str, last: bool) -> Value {
    json!({
        "type": "audio",
        "session_id": session_id,
        "sequence": sequence,
        "payload": payload,
        "visemes": [{ "viseme": "aa", "offset_ms": 0, "duration_ms": 60 }],
        "last": last,
    })
}

async fn handle_socket(mut socket: WebSocket, state: MockState) {
    let mut kill = state.kill.subscribe();
    state.connections.fetch_add(1, Ordering::SeqCst);
    let options = state.options.clone();

    send_json(
        &mut socket,
        json!({ "type": "control", "payload": { "action": "welcome", "client_id": "mock" } }),
    )
    .await;
    if options.ping_after_welcome {
        send_json(&mut socket, json!({ "type": "control", "payload": { "action": "ping" } })).await;
    }

    let mut sequence: u64 = 0;
    let silence = general_purpose::STANDARD.encode(vec![0u8; options.chunk_bytes]);

    loop {
        let message = tokio::select! {
            message = socket.recv() => message,
            _ = kill.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        };
        let Some(Ok(message)) = message else { break };
        let Message::Text(text) = message else { continue };
        let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else { continue };

        let session_id = frame["session_id"].as_str().map(str::to_string);
        match frame["type"].as_str() {
            Some("control") => {
                let action = frame["payload"]["action"].as_str().unwrap_or_default().to_string();
                state.controls.lock().unwrap().push(ReceivedControl {
                    session_id: session_id.clone(),
                    action: action.clone(),
                });
                let Some(id) = session_id else { continue };

                match action.as_str() {
                    "start" => {
                        sequence = 0;
                        let nth = state.starts.fetch_add(1, Ordering::SeqCst);
                        if options.ack_start {
                            send_json(
                                &mut socket,
                                json!({ "type": "control", "session_id": id, "payload": { "action": "ack", "of": "start" } }),
                            )
                            .await;
                        }
                        if nth < options.malformed_sessions {
                            for _ in 0..options.malformed_after_start {
                                let _ = socket.send(Message::Text("{not json".into())).await;
                            }
                        }
                    }
                    "text" => {
                        for _ in 0..options.chunks_per_text {
                            send_json(&mut socket, audio_frame(&id, sequence, &silence, false)).await;
                            sequence += 1;
                            if !options.chunk_interval.is_zero() {
                                tokio::time::sleep(options.chunk_interval).await;
                            }
                        }
                    }
                    "text_end" => {
                        send_json(&mut socket, json!({ "type": "end", "session_id": id, "sequence": sequence })).await;
                    }
                    _ => {}
                }
            }
            Some("audio") => {
                let Some(id) = session_id else { continue };
                let payload = frame["payload"].as_str().unwrap_or_default().to_string();
                let bytes = general_purpose::STANDARD.decode(&payload).map(|b| b.len()).unwrap_or(0);
                state.uploaded_bytes.fetch_add(bytes, Ordering::SeqCst);

                let last = frame["last"].as_bool().unwrap_or(false);
                send_json(&mut socket, audio_frame(&id, sequence, &payload, last)).await;
                sequence += 1;
            }
            _ => {}
        }
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
