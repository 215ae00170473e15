//! Composition root: one connection, one router, one active session at a time.
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::audio::AudioFormat;
use crate::clock::PlaybackClock;
use crate::config::{EndpointProvider, StreamConfig};
use crate::connection::{Completion, ConnectionManager, ConnectionOptions};
use crate::error::{FailureReason, SessionError};
use crate::metrics::LatencyMetrics;
use crate::protocol::{ControlAction, SessionId};
use crate::router::MessageRouter;
use crate::session::{run_pacing, run_upload, send_frame, SessionShared, SessionSource, StreamingSession};
use crate::sink::PlaybackSink;
use crate::timing::Milestone;

pub struct SpeechStreamer {
    connection: ConnectionManager,
    router: Arc<MessageRouter>,
    endpoints: Arc<dyn EndpointProvider>,
    config: StreamConfig,
    format: AudioFormat,
    metrics: LatencyMetrics,
}

impl SpeechStreamer {
    /// Endpoint comes from `config`. Must be called from within a Tokio runtime.
    pub fn new(config: StreamConfig) -> Self {
        let endpoints = Arc::new(config.clone());
        Self::with_endpoint_provider(config, endpoints)
    }

    pub fn with_endpoint_provider(config: StreamConfig, endpoints: Arc<dyn EndpointProvider>) -> Self {
        let router = Arc::new(MessageRouter::new());
        let connection = ConnectionManager::new(router.clone(), ConnectionOptions::from_config(&config));
        Self {
            connection,
            router,
            endpoints,
            config,
            format: AudioFormat::default(),
            metrics: LatencyMetrics::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn metrics(&self) -> &LatencyMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Warm the transport before the first request.
    pub fn pre_connect(&self) -> Completion {
        self.connection.pre_connect_configured(self.endpoints.as_ref())
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.router.active_session()
    }

    /// Cancel the active session, if any.
    pub fn stop(&self) -> bool {
        self.router.cancel_active()
    }

    pub async fn speak_file<S: PlaybackSink>(
        &self,
        path: impl Into<PathBuf>,
        sink: S,
    ) -> Result<StreamingSession, SessionError> {
        self.open(SessionSource::AssetFile(path.into()), sink).await
    }

    pub async fn speak_text<S: PlaybackSink>(
        &self,
        text: impl Into<String>,
        sink: S,
    ) -> Result<StreamingSession, SessionError> {
        self.open(SessionSource::Text(text.into()), sink).await
    }

    pub async fn speak_stream<S: PlaybackSink>(
        &self,
        increments: mpsc::Receiver<String>,
        sink: S,
    ) -> Result<StreamingSession, SessionError> {
        self.open(SessionSource::TextStream(increments), sink).await
    }

    /// Open a session, cancelling the active one.
    ///
    /// Resolves once the start frame went out; audio then flows into `sink`
    /// on a separate pacing task. An invalid source fails before the active
    /// session is touched.
    pub async fn open<S: PlaybackSink>(
        &self,
        source: SessionSource,
        sink: S,
    ) -> Result<StreamingSession, SessionError> {
        let mode = source.mode();
        let upload = source.prepare()?;

        let live_ceiling = self.config.live_buffer_ceiling_bytes(self.format);
        let ceiling = match upload.asset_len() {
            // the whole asset fits, replay never drops
            Some(asset) => live_ceiling.max(asset),
            None => live_ceiling,
        };
        let clock = PlaybackClock::new(self.format, self.config.lookahead(), Some(ceiling));
        let (clock_tx, clock_rx) = mpsc::unbounded_channel();

        let (shared, events) = SessionShared::new(
            mode,
            self.connection.clone(),
            clock_tx,
            self.config.malformed_threshold,
            self.metrics.clone(),
        );
        let session = StreamingSession::new(shared.clone(), self.router.clone(), events);
        shared.mark(Milestone::RequestStart);

        if let Some(previous) = self.router.replace_active(shared.clone()) {
            info!(previous = %previous, session_id = %shared.id(), "Replaced active session");
        }
        tokio::spawn(run_pacing(
            self.router.clone(),
            shared.clone(),
            clock,
            clock_rx,
            Box::new(sink),
        ));

        let open_timeout = self.config.open_timeout();
        let ready = tokio::time::timeout(open_timeout, self.connection.ensure_configured(self.endpoints.as_ref())).await;
        match ready {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(session_id = %shared.id(), "Connection failed: {}", e);
                self.router.fail(&shared, FailureReason::ConnectFailed(e.to_string()));
                return Err(e.into());
            }
            Err(_) => {
                warn!(session_id = %shared.id(), "Connection not ready within {:?}", open_timeout);
                self.router.fail(
                    &shared,
                    FailureReason::ConnectFailed(format!("not ready within {open_timeout:?}")),
                );
                return Err(SessionError::Timeout(open_timeout));
            }
        }
        shared.mark(Milestone::ConnectionReady);

        if !self.router.attach(&shared) {
            return Err(SessionError::Cancelled);
        }

        let start = ControlAction::Start {
            mode,
            voice_type: self.config.voice_type.clone(),
            encoding: "pcm_s16le".to_string(),
            sample_rate: self.format.sample_rate,
        };
        shared.mark(Milestone::SessionStart);
        let frame = self.router.encode_control(shared.id(), shared.next_outbound_sequence(), start);
        if let Err(e) = send_frame(&self.connection, frame).await {
            self.router.fail(&shared, FailureReason::SendFailed(e.clone()));
            return Err(SessionError::Failed(FailureReason::SendFailed(e)));
        }
        info!(session_id = %shared.id(), ?mode, "Session started");

        tokio::spawn(run_upload(
            self.router.clone(),
            shared,
            upload,
            self.config.frame_bytes(self.format),
        ));
        Ok(session)
    }
}
