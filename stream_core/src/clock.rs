//! Real-time pacing of received audio.
//!
//! The clock keeps a virtual playhead for the rendering sink: audio released
//! so far has a known duration, and the sink is assumed to consume it in real
//! time from the moment the first frame was handed over. A frame is released
//! only while the released audio is less than `lookahead` ahead of the
//! playhead, so the sink never gets audio faster than it can play and never
//! waits while data is buffered.
use std::collections::VecDeque;
use std::time::Duration;

use async_stream::stream;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};

use crate::audio::AudioFormat;
use crate::protocol::{AudioChunk, SessionId, VisemeMark};

/// A frame handed to the rendering sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PacedFrame {
    pub session_id: SessionId,
    pub sequence: u64,
    pub pcm: Vec<u8>,
    pub visemes: Vec<VisemeMark>,
    /// Offset of this frame from the start of the stream.
    pub position: Duration,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    /// The oldest unplayed chunk was dropped to stay under the ceiling.
    Overflow { sequence: u64, bytes: usize },
    /// The sink ran out of audio while the stream was still open.
    Underrun { position: Duration },
}

#[derive(Debug)]
pub enum ClockInput {
    Chunk(AudioChunk),
    /// No more chunks will arrive; drain what is buffered and stop.
    Finish,
    /// Discard everything buffered and stop.
    Flush,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClockOutput {
    Frame(PacedFrame),
    Event(ClockEvent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    Frame(PacedFrame),
    /// Buffered audio exists but the sink is far enough ahead.
    WaitUntil(Instant),
    /// Nothing buffered. Carries the instant the sink runs dry, once playback started.
    Starved(Option<Instant>),
    Done,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockStats {
    pub accepted_bytes: usize,
    pub released_bytes: usize,
    pub dropped_bytes: usize,
    pub dropped_chunks: usize,
    pub underruns: usize,
}

#[derive(Debug)]
pub struct PlaybackClock {
    format: AudioFormat,
    lookahead: Duration,
    ceiling_bytes: Option<usize>,
    queue: VecDeque<AudioChunk>,
    buffered_bytes: usize,
    anchor: Option<Instant>,
    released: Duration,
    // time the sink spent starved, shifts the playhead
    stalled: Duration,
    finished: bool,
    underrun_reported: bool,
    stats: ClockStats,
}

impl PlaybackClock {
    /// `ceiling_bytes = None` never drops (asset replay sizes it to the whole asset).
    pub fn new(format: AudioFormat, lookahead: Duration, ceiling_bytes: Option<usize>) -> Self {
        Self {
            format,
            lookahead,
            ceiling_bytes,
            queue: VecDeque::new(),
            buffered_bytes: 0,
            anchor: None,
            released: Duration::ZERO,
            stalled: Duration::ZERO,
            finished: false,
            underrun_reported: false,
            stats: ClockStats::default(),
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn stats(&self) -> ClockStats {
        self.stats
    }

    /// Append a chunk to the pacing buffer, dropping the oldest chunks if the
    /// ceiling is exceeded. The newest chunk is always kept.
    pub fn accept(&mut self, chunk: AudioChunk) -> Vec<ClockEvent> {
        if self.finished {
            return Vec::new();
        }
        let len = chunk.payload.len();
        self.stats.accepted_bytes += len;
        self.buffered_bytes += len;
        self.queue.push_back(chunk);

        let mut events = Vec::new();
        if let Some(ceiling) = self.ceiling_bytes {
            while self.buffered_bytes > ceiling && self.queue.len() > 1 {
                if let Some(oldest) = self.queue.pop_front() {
                    let bytes = oldest.payload.len();
                    self.buffered_bytes -= bytes;
                    self.stats.dropped_bytes += bytes;
                    self.stats.dropped_chunks += 1;
                    events.push(ClockEvent::Overflow {
                        sequence: oldest.sequence,
                        bytes,
                    });
                }
            }
        }
        events
    }

    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn flush(&mut self) {
        self.queue.clear();
        self.buffered_bytes = 0;
        self.finished = true;
    }

    fn playhead_end(&self) -> Option<Instant> {
        self.anchor.map(|a| a + self.released + self.stalled)
    }

    /// Decide what to do at `now`.
    pub fn poll_release(&mut self, now: Instant) -> Release {
        if self.queue.is_empty() {
            if self.finished {
                return Release::Done;
            }
            return Release::Starved(self.playhead_end());
        }

        match self.playhead_end() {
            Some(end) if end > now + self.lookahead => {
                return Release::WaitUntil(end - self.lookahead);
            }
            // the sink drained everything; restart the playhead from now
            Some(end) if end < now => self.stalled += now - end,
            Some(_) => {}
            None => self.anchor = Some(now),
        }

        let Some(chunk) = self.queue.pop_front() else {
            return Release::Starved(self.playhead_end());
        };
        let len = chunk.payload.len();
        let duration = self.format.duration_of(len);
        let frame = PacedFrame {
            session_id: chunk.session_id,
            sequence: chunk.sequence,
            pcm: chunk.payload,
            visemes: chunk.visemes,
            position: self.released,
            duration,
        };
        self.buffered_bytes -= len;
        self.released += duration;
        self.stats.released_bytes += len;
        self.underrun_reported = false;
        Release::Frame(frame)
    }

    /// Report an underrun once per starvation episode.
    pub fn mark_underrun(&mut self, now: Instant) -> Option<ClockEvent> {
        if self.underrun_reported || self.finished || !self.queue.is_empty() {
            return None;
        }
        match self.playhead_end() {
            Some(end) if end <= now => {
                self.underrun_reported = true;
                self.stats.underruns += 1;
                Some(ClockEvent::Underrun {
                    position: self.released,
                })
            }
            _ => None,
        }
    }

    fn apply(&mut self, input: ClockInput) -> Vec<ClockEvent> {
        match input {
            ClockInput::Chunk(chunk) => self.accept(chunk),
            ClockInput::Finish => {
                self.finish();
                Vec::new()
            }
            ClockInput::Flush => {
                self.flush();
                Vec::new()
            }
        }
    }

    /// Turn the clock into a paced sequence of frames and events.
    ///
    /// The sequence is finite: it ends once the clock is finished (or flushed)
    /// and the buffer is empty, or when `input` closes. It consumes the clock,
    /// so it cannot be restarted.
    pub fn drain(
        mut self,
        mut input: mpsc::UnboundedReceiver<ClockInput>,
    ) -> impl Stream<Item = ClockOutput> + Send {
        stream! {
            let mut input_open = true;
            loop {
                while input_open {
                    match input.try_recv() {
                        Ok(next) => {
                            for event in self.apply(next) {
                                yield ClockOutput::Event(event);
                            }
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            input_open = false;
                            self.finish();
                        }
                    }
                }

                let next = match self.poll_release(Instant::now()) {
                    Release::Frame(frame) => {
                        yield ClockOutput::Frame(frame);
                        continue;
                    }
                    Release::Done => break,
                    Release::WaitUntil(deadline) => {
                        if !input_open {
                            sleep_until(deadline).await;
                            continue;
                        }
                        tokio::select! {
                            _ = sleep_until(deadline) => continue,
                            next = input.recv() => next,
                        }
                    }
                    Release::Starved(dry_at) => {
                        if !input_open {
                            break;
                        }
                        if let Some(event) = self.mark_underrun(Instant::now()) {
                            yield ClockOutput::Event(event);
                        }
                        match dry_at.filter(|_| !self.underrun_reported) {
                            Some(dry_at) => tokio::select! {
                                _ = sleep_until(dry_at) => continue,
                                next = input.recv() => next,
                            },
                            None => input.recv().await,
                        }
                    }
                };

                match next {
                    Some(next) => {
                        for event in self.apply(next) {
                            yield ClockOutput::Event(event);
                        }
                    }
                    None => {
                        input_open = false;
                        self.finish();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn chunk(id: SessionId, sequence: u64, bytes: usize) -> AudioChunk {
        AudioChunk {
            session_id: id,
            sequence,
            payload: vec![0u8; bytes],
            visemes: Vec::new(),
            timestamp_ms: None,
            end_of_stream: false,
        }
    }

    // 100ms of 16kHz mono 16-bit audio
    const FRAME: usize = 3_200;

    #[tokio::test(start_paused = true)]
    async fn test_releases_within_lookahead_then_waits() {
        let id = SessionId::new();
        let mut clock = PlaybackClock::new(AudioFormat::default(), Duration::from_millis(250), None);
        for seq in 0..5 {
            clock.accept(chunk(id, seq, FRAME));
        }

        let t0 = Instant::now();
        // 0..300ms can be released immediately: each release keeps the sink
        // at most 250ms ahead
        let mut released = 0;
        while let Release::Frame(_) = clock.poll_release(t0) {
            released += 1;
        }
        assert_eq!(released, 3);
        assert_eq!(clock.poll_release(t0), Release::WaitUntil(t0 + Duration::from_millis(50)));

        let later = t0 + Duration::from_millis(50);
        match clock.poll_release(later) {
            Release::Frame(frame) => {
                assert_eq!(frame.sequence, 3);
                assert_eq!(frame.position, Duration::from_millis(300));
            }
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_ceiling_drops_oldest() {
        let id = SessionId::new();
        let mut clock = PlaybackClock::new(AudioFormat::default(), Duration::from_millis(250), Some(2 * FRAME));
        assert!(clock.accept(chunk(id, 0, FRAME)).is_empty());
        assert!(clock.accept(chunk(id, 1, FRAME)).is_empty());
        let events = clock.accept(chunk(id, 2, FRAME));
        assert_eq!(events, vec![ClockEvent::Overflow { sequence: 0, bytes: FRAME }]);
        assert_eq!(clock.buffered_bytes(), 2 * FRAME);
        assert_eq!(clock.stats().dropped_chunks, 1);
    }

    #[test]
    fn test_oversized_chunk_is_kept() {
        let id = SessionId::new();
        let mut clock = PlaybackClock::new(AudioFormat::default(), Duration::from_millis(250), Some(FRAME));
        assert!(clock.accept(chunk(id, 0, 4 * FRAME)).is_empty());
        assert_eq!(clock.buffered_bytes(), 4 * FRAME);
    }

    #[test]
    fn test_flush_discards_and_finishes() {
        let id = SessionId::new();
        let mut clock = PlaybackClock::new(AudioFormat::default(), Duration::from_millis(250), None);
        clock.accept(chunk(id, 0, FRAME));
        clock.flush();
        assert_eq!(clock.buffered_bytes(), 0);
        assert_eq!(clock.poll_release(Instant::now()), Release::Done);
        assert!(clock.accept(chunk(id, 1, FRAME)).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_paces_to_real_time() {
        let id = SessionId::new();
        let clock = PlaybackClock::new(AudioFormat::default(), Duration::from_millis(200), None);
        let (tx, rx) = mpsc::unbounded_channel();
        for seq in 0..10 {
            tx.send(ClockInput::Chunk(chunk(id, seq, FRAME))).unwrap();
        }
        tx.send(ClockInput::Finish).unwrap();

        let start = Instant::now();
        let outputs: Vec<ClockOutput> = clock.drain(rx).collect().await;
        let frames: Vec<&PacedFrame> = outputs
            .iter()
            .filter_map(|o| match o {
                ClockOutput::Frame(f) => Some(f),
                _ => None,
            })
            .collect();

        assert_eq!(frames.len(), 10);
        assert!(frames.windows(2).all(|w| w[0].sequence < w[1].sequence));
        let total: usize = frames.iter().map(|f| f.pcm.len()).sum();
        assert_eq!(total, 10 * FRAME);
        // 1s of audio with a 200ms lookahead: the last frame goes out at 700ms
        assert_eq!(start.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_reports_underrun_once() {
        let id = SessionId::new();
        let clock = PlaybackClock::new(AudioFormat::default(), Duration::from_millis(200), None);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(ClockInput::Chunk(chunk(id, 0, FRAME))).unwrap();

        let feeder = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            tx.send(ClockInput::Chunk(chunk(id, 1, FRAME))).unwrap();
            tx.send(ClockInput::Finish).unwrap();
        });

        let outputs: Vec<ClockOutput> = clock.drain(rx).collect().await;
        feeder.await.unwrap();

        let underruns: Vec<&ClockOutput> = outputs
            .iter()
            .filter(|o| matches!(o, ClockOutput::Event(ClockEvent::Underrun { .. })))
            .collect();
        assert_eq!(underruns.len(), 1);
        assert_eq!(
            underruns[0],
            &ClockOutput::Event(ClockEvent::Underrun {
                position: Duration::from_millis(100)
            })
        );
        let frames = outputs
            .iter()
            .filter(|o| matches!(o, ClockOutput::Frame(_)))
            .count();
        assert_eq!(frames, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_ends_when_input_closes() {
        let clock = PlaybackClock::new(AudioFormat::default(), Duration::from_millis(200), None);
        let (tx, rx) = mpsc::unbounded_channel::<ClockInput>();
        drop(tx);
        let outputs: Vec<ClockOutput> = clock.drain(rx).collect().await;
        assert!(outputs.is_empty());
    }
}
