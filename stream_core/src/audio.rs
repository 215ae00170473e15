//! PCM format helpers and asset loading.
//!
//! The backend works with 1 channel, 16-bit, 16 kHz PCM. Assets are either WAV
//! files in exactly that format or headerless `.pcm` dumps of it.
use std::{fs, path::Path, time::Duration};

use anyhow::Context;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

impl AudioFormat {
    pub fn block_align(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.block_align()
    }

    /// Playback duration of `bytes` of PCM.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let bps = self.bytes_per_second().max(1) as u64;
        Duration::from_micros(bytes as u64 * 1_000_000 / bps)
    }

    /// Byte count for `duration`, rounded down to whole sample frames.
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let raw = (self.bytes_per_second() as u128 * duration.as_micros() / 1_000_000) as usize;
        raw - raw % self.block_align().max(1)
    }
}

/// Load an asset from disk as raw little-endian PCM.
pub fn load_asset<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, SessionError> {
    let path = path.as_ref();
    let is_raw_pcm = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("pcm"))
        .unwrap_or(false);

    let result = if is_raw_pcm {
        read_raw_pcm(path)
    } else {
        read_wav(path, AudioFormat::default())
    };
    result.map_err(|e| SessionError::InvalidAsset(format!("{e:#}")))
}

fn read_raw_pcm(path: &Path) -> anyhow::Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if bytes.is_empty() {
        anyhow::bail!("{} is empty", path.display());
    }
    if bytes.len() % AudioFormat::default().block_align() != 0 {
        anyhow::bail!("{} is not whole 16-bit samples", path.display());
    }
    Ok(bytes)
}

fn read_wav(path: &Path, expected: AudioFormat) -> anyhow::Result<Vec<u8>> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();

    if spec.channels != expected.channels
        || spec.sample_rate != expected.sample_rate
        || spec.bits_per_sample != expected.bits_per_sample
        || spec.sample_format != hound::SampleFormat::Int
    {
        anyhow::bail!(
            "unsupported wav format: {} channel(s), {} Hz, {} bit (expected {} channel, {} Hz, {} bit integer)",
            spec.channels,
            spec.sample_rate,
            spec.bits_per_sample,
            expected.channels,
            expected.sample_rate,
            expected.bits_per_sample
        );
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        let sample = sample.with_context(|| format!("corrupt sample data in {}", path.display()))?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    if pcm.is_empty() {
        anyhow::bail!("{} contains no audio", path.display());
    }
    Ok(pcm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, spec: hound::WavSpec, samples: usize) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..samples {
            writer.write_sample((i % 128) as i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_durations() {
        let format = AudioFormat::default();
        assert_eq!(format.bytes_per_second(), 32_000);
        assert_eq!(format.duration_of(32_000), Duration::from_secs(1));
        assert_eq!(format.duration_of(3_200), Duration::from_millis(100));
        assert_eq!(format.bytes_for(Duration::from_millis(250)), 8_000);
    }

    #[test]
    fn test_load_wav_asset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, 1_600);

        let pcm = load_asset(&path).unwrap();
        assert_eq!(pcm.len(), 3_200);
        assert_eq!(&pcm[2..4], &1i16.to_le_bytes());
    }

    #[test]
    fn test_rejects_wrong_sample_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22_050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, 100);

        let err = load_asset(&path).unwrap_err();
        match err {
            SessionError::InvalidAsset(msg) => assert!(msg.contains("22050")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_raw_pcm_asset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speech.pcm");
        fs::write(&path, vec![0u8; 640]).unwrap();
        assert_eq!(load_asset(&path).unwrap().len(), 640);

        fs::write(&path, vec![0u8; 3]).unwrap();
        assert!(load_asset(&path).is_err());
    }

    #[test]
    fn test_missing_asset() {
        assert!(matches!(
            load_asset("/definitely/not/here.wav"),
            Err(SessionError::InvalidAsset(_))
        ));
    }
}
