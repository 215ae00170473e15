// Rendering side of the pipeline

use std::time::Duration;

use tokio::sync::mpsc;

use crate::clock::PacedFrame;

/// Consumer of paced audio. Frames arrive in order and at playback speed.
pub trait PlaybackSink: Send + 'static {
    fn play(&mut self, frame: PacedFrame);

    /// The sink has played everything it was given and the stream is still open.
    fn underrun(&mut self, _position: Duration) {}

    /// No more frames will arrive for this session.
    fn finish(&mut self) {}
}

/// Forwards frames to a channel, for callers that render on their own task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PacedFrame>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PacedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PlaybackSink for ChannelSink {
    fn play(&mut self, frame: PacedFrame) {
        // receiver gone means nobody is listening any more
        let _ = self.tx.send(frame);
    }
}

/// Discards audio. Used when only the latency report matters.
#[derive(Debug, Default)]
pub struct NullSink {
    pub frames: usize,
    pub bytes: usize,
}

impl PlaybackSink for NullSink {
    fn play(&mut self, frame: PacedFrame) {
        self.frames += 1;
        self.bytes += frame.pcm.len();
    }
}

impl<S: PlaybackSink + ?Sized> PlaybackSink for Box<S> {
    fn play(&mut self, frame: PacedFrame) {
        (**self).play(frame)
    }

    fn underrun(&mut self, position: Duration) {
        (**self).underrun(position)
    }

    fn finish(&mut self) {
        (**self).finish()
    }
}
