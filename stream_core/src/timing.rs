//! Latency milestones of a single session.
//!
//! Marks are observability only. Each one can be set once, and a later
//! milestone is never recorded earlier than the milestones before it.
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Milestone {
    RequestStart,
    ConnectionReady,
    SessionStart,
    FirstAudio,
}

impl Milestone {
    fn index(self) -> usize {
        match self {
            Milestone::RequestStart => 0,
            Milestone::ConnectionReady => 1,
            Milestone::SessionStart => 2,
            Milestone::FirstAudio => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimingMarks {
    marks: [Option<Instant>; 4],
}

impl TimingMarks {
    /// Record a milestone. Returns `false` if it was already set.
    pub fn mark(&mut self, milestone: Milestone, at: Instant) -> bool {
        let idx = milestone.index();
        if self.marks[idx].is_some() {
            return false;
        }
        let floor = self.marks[..idx].iter().flatten().max().copied();
        let at = match floor {
            Some(floor) if floor > at => floor,
            _ => at,
        };
        self.marks[idx] = Some(at);
        true
    }

    pub fn get(&self, milestone: Milestone) -> Option<Instant> {
        self.marks[milestone.index()]
    }

    fn between(&self, from: Milestone, to: Milestone) -> Option<Duration> {
        Some(self.get(to)?.duration_since(self.get(from)?))
    }

    pub fn breakdown(&self) -> LatencyBreakdown {
        let ms = |d: Option<Duration>| d.map(|d| d.as_millis() as u64);
        LatencyBreakdown {
            connect_ms: ms(self.between(Milestone::RequestStart, Milestone::ConnectionReady)),
            handshake_ms: ms(self.between(Milestone::ConnectionReady, Milestone::SessionStart)),
            first_audio_ms: ms(self.between(Milestone::SessionStart, Milestone::FirstAudio)),
            total_to_first_audio_ms: ms(self.between(Milestone::RequestStart, Milestone::FirstAudio)),
        }
    }
}

/// Milestone deltas in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencyBreakdown {
    pub connect_ms: Option<u64>,
    pub handshake_ms: Option<u64>,
    pub first_audio_ms: Option<u64>,
    pub total_to_first_audio_ms: Option<u64>,
}
