// Latency metrics shared across sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Number of first-audio samples kept for percentiles.
const SAMPLE_WINDOW: usize = 1000;

/// Session outcome counters and first-audio latency, shared by clones.
#[derive(Debug, Clone)]
pub struct LatencyMetrics {
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
    rendered_bytes: Arc<AtomicU64>,
    first_audio_count: Arc<AtomicU64>,
    total_first_audio_ms: Arc<AtomicU64>,
    min_first_audio_ms: Arc<AtomicU64>,
    max_first_audio_ms: Arc<AtomicU64>,
    samples: Arc<Mutex<Vec<u64>>>,
}

/// Terminal outcome of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    Cancelled,
}

impl LatencyMetrics {
    pub fn new() -> Self {
        Self {
            completed: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(AtomicU64::new(0)),
            cancelled: Arc::new(AtomicU64::new(0)),
            rendered_bytes: Arc::new(AtomicU64::new(0)),
            first_audio_count: Arc::new(AtomicU64::new(0)),
            total_first_audio_ms: Arc::new(AtomicU64::new(0)),
            min_first_audio_ms: Arc::new(AtomicU64::new(u64::MAX)),
            max_first_audio_ms: Arc::new(AtomicU64::new(0)),
            samples: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a session that reached a terminal state.
    pub fn record_session(&self, outcome: Outcome, first_audio_ms: Option<u64>, rendered_bytes: usize) {
        let counter = match outcome {
            Outcome::Completed => &self.completed,
            Outcome::Failed => &self.failed,
            Outcome::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.rendered_bytes.fetch_add(rendered_bytes as u64, Ordering::Relaxed);

        if let Some(latency_ms) = first_audio_ms {
            self.record_first_audio(latency_ms);
        }
    }

    fn record_first_audio(&self, latency_ms: u64) {
        self.first_audio_count.fetch_add(1, Ordering::Relaxed);
        self.total_first_audio_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.min_first_audio_ms.fetch_min(latency_ms, Ordering::Relaxed);
        self.max_first_audio_ms.fetch_max(latency_ms, Ordering::Relaxed);

        let mut samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        samples.push(latency_ms);
        if samples.len() > SAMPLE_WINDOW {
            samples.remove(0);
        }
    }

    pub fn avg_first_audio_ms(&self) -> f64 {
        let count = self.first_audio_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.total_first_audio_ms.load(Ordering::Relaxed) as f64 / count as f64
    }

    fn percentile(&self, p: u8) -> u64 {
        let samples = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.is_empty() {
            return 0;
        }
        let mut sorted = samples.clone();
        sorted.sort_unstable();
        let index = (sorted.len() * p as usize / 100).min(sorted.len() - 1);
        sorted[index]
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        let min = self.min_first_audio_ms.load(Ordering::Relaxed);
        LatencySnapshot {
            timestamp: Utc::now(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            rendered_bytes: self.rendered_bytes.load(Ordering::Relaxed),
            first_audio: FirstAudioStats {
                count: self.first_audio_count.load(Ordering::Relaxed),
                avg_ms: self.avg_first_audio_ms(),
                min_ms: if min == u64::MAX { 0 } else { min },
                max_ms: self.max_first_audio_ms.load(Ordering::Relaxed),
                p50_ms: self.percentile(50),
                p95_ms: self.percentile(95),
                p99_ms: self.percentile(99),
            },
        }
    }
}

impl Default for LatencyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencySnapshot {
    pub timestamp: DateTime<Utc>,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rendered_bytes: u64,
    pub first_audio: FirstAudioStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct FirstAudioStats {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_snapshot() {
        let snapshot = LatencyMetrics::new().snapshot();
        assert_eq!(snapshot.completed, 0);
        assert_eq!(snapshot.first_audio.min_ms, 0);
        assert_eq!(snapshot.first_audio.p99_ms, 0);
        assert_eq!(snapshot.first_audio.avg_ms, 0.0);
    }

    #[test]
    fn test_records_outcomes_and_latency() {
        let metrics = LatencyMetrics::new();
        let shared = metrics.clone();
        for latency in 1..=100 {
            shared.record_session(Outcome::Completed, Some(latency), 10);
        }
        metrics.record_session(Outcome::Cancelled, None, 0);
        metrics.record_session(Outcome::Failed, None, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.completed, 100);
        assert_eq!(snapshot.cancelled, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.rendered_bytes, 1000);
        assert_eq!(snapshot.first_audio.min_ms, 1);
        assert_eq!(snapshot.first_audio.max_ms, 100);
        assert_eq!(snapshot.first_audio.p50_ms, 51);
        assert_eq!(snapshot.first_audio.p95_ms, 96);
        assert_eq!(snapshot.first_audio.avg_ms, 50.5);
    }

    #[test]
    fn test_sample_window_is_bounded() {
        let metrics = LatencyMetrics::new();
        for _ in 0..(SAMPLE_WINDOW + 50) {
            metrics.record_session(Outcome::Completed, Some(5), 0);
        }
        assert_eq!(metrics.samples.lock().unwrap().len(), SAMPLE_WINDOW);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = LatencyMetrics::new();
        metrics.record_session(Outcome::Completed, Some(42), 3200);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["first_audio"]["max_ms"], 42);
        assert!(json["timestamp"].is_string());
    }
}
