//! Real-time streaming client for a speech and lip-sync backend.
//!
//! [`SpeechStreamer`] wires a pooled [`ConnectionManager`] to a
//! [`MessageRouter`] and opens one [`StreamingSession`] at a time. Received
//! audio is paced to real time by a [`PlaybackClock`] and handed to a
//! [`PlaybackSink`].

pub mod audio;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod session;
pub mod sink;
pub mod streamer;
pub mod timing;
pub mod validation;

pub use audio::{load_asset, AudioFormat};
pub use clock::{ClockEvent, PacedFrame, PlaybackClock};
pub use config::{EndpointProvider, StreamConfig};
pub use connection::{
    Completion, ConnectionManager, ConnectionOptions, ConnectionSnapshot, ConnectionState,
    StateChange,
};
pub use error::{ConnectionError, FailureReason, ProtocolError, SessionError};
pub use metrics::{LatencyMetrics, LatencySnapshot};
pub use protocol::{AudioChunk, SessionId, SessionMode, VisemeMark};
pub use router::{DispatchOutcome, MessageRouter};
pub use session::{
    DropReason, SessionEvent, SessionReport, SessionSource, SessionState, StreamingSession,
};
pub use sink::{ChannelSink, NullSink, PlaybackSink};
pub use streamer::SpeechStreamer;
pub use timing::{LatencyBreakdown, Milestone, TimingMarks};
