// Configuration for the streaming client

use std::time::Duration;

use crate::audio::AudioFormat;

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub endpoint: String,
    pub connect_timeout_secs: u64,
    pub open_timeout_secs: u64,
    pub keepalive_secs: u64,
    pub lookahead_ms: u64,
    pub live_buffer_ceiling_ms: u64,
    pub frame_ms: u64,
    pub voice_type: String,
    pub malformed_threshold: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8765/ws".to_string(),
            connect_timeout_secs: 10,
            open_timeout_secs: 15,
            keepalive_secs: 30,
            lookahead_ms: 300,
            live_buffer_ceiling_ms: 5_000,
            frame_ms: 100,
            voice_type: "default".to_string(),
            malformed_threshold: 3,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl StreamConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let endpoint = std::env::var("STREAM_ENDPOINT")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.endpoint);

        let voice_type = std::env::var("VOICE_TYPE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.voice_type);

        Self {
            endpoint,
            connect_timeout_secs: env_or("CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs),
            open_timeout_secs: env_or("OPEN_TIMEOUT_SECS", defaults.open_timeout_secs),
            keepalive_secs: env_or("KEEPALIVE_SECS", defaults.keepalive_secs),
            lookahead_ms: env_or("LOOKAHEAD_MS", defaults.lookahead_ms),
            live_buffer_ceiling_ms: env_or("LIVE_BUFFER_CEILING_MS", defaults.live_buffer_ceiling_ms),
            frame_ms: env_or("FRAME_MS", defaults.frame_ms).max(1),
            voice_type,
            malformed_threshold: env_or("MALFORMED_THRESHOLD", defaults.malformed_threshold).max(1),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    /// `None` when keep-alive pings are disabled.
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs))
    }

    pub fn lookahead(&self) -> Duration {
        Duration::from_millis(self.lookahead_ms)
    }

    pub fn live_buffer_ceiling_bytes(&self, format: AudioFormat) -> usize {
        format.bytes_for(Duration::from_millis(self.live_buffer_ceiling_ms))
    }

    pub fn frame_bytes(&self, format: AudioFormat) -> usize {
        format.bytes_for(Duration::from_millis(self.frame_ms)).max(format.block_align())
    }
}

/// Supplies the backend endpoint. Read once per connect attempt.
pub trait EndpointProvider: Send + Sync {
    fn endpoint(&self) -> String;
}

impl EndpointProvider for StreamConfig {
    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

impl<F> EndpointProvider for F
where
    F: Fn() -> String + Send + Sync,
{
    fn endpoint(&self) -> String {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.keepalive(), Some(Duration::from_secs(30)));
        assert_eq!(config.lookahead(), Duration::from_millis(300));
        assert_eq!(config.malformed_threshold, 3);
    }

    #[test]
    fn test_byte_sizes_follow_format() {
        let config = StreamConfig::default();
        let format = AudioFormat::default();
        // 100ms of 16kHz mono 16-bit audio
        assert_eq!(config.frame_bytes(format), 3_200);
        assert_eq!(config.live_buffer_ceiling_bytes(format), 160_000);
    }

    #[test]
    fn test_keepalive_can_be_disabled() {
        let config = StreamConfig {
            keepalive_secs: 0,
            ..StreamConfig::default()
        };
        assert_eq!(config.keepalive(), None);
    }

    #[test]
    fn test_closure_endpoint_provider() {
        let provider = || "ws://example.test/ws".to_string();
        assert_eq!(EndpointProvider::endpoint(&provider), "ws://example.test/ws");
    }
}
