// WAV output for paced audio

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use stream_core::{AudioFormat, PacedFrame, PlaybackSink};
use tracing::{debug, error, info};

/// Writes every rendered frame to a 16-bit PCM WAV file.
pub struct WavFileSink {
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    samples: u64,
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, format: AudioFormat) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        Ok(Self {
            path,
            writer: Some(writer),
            samples: 0,
        })
    }

    fn close(&mut self) {
        if let Some(writer) = self.writer.take() {
            match writer.finalize() {
                Ok(()) => info!("Wrote {} samples to {}", self.samples, self.path.display()),
                Err(e) => error!("Failed to finalize {}: {}", self.path.display(), e),
            }
        }
    }
}

impl PlaybackSink for WavFileSink {
    fn play(&mut self, frame: PacedFrame) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        for sample in frame.pcm.chunks_exact(2) {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            if let Err(e) = writer.write_sample(value) {
                error!("Failed to write {}: {}", self.path.display(), e);
                self.writer = None;
                return;
            }
            self.samples += 1;
        }
    }

    fn underrun(&mut self, position: Duration) {
        debug!(position_ms = position.as_millis() as u64, "Output starved");
    }

    fn finish(&mut self) {
        self.close();
    }
}

impl Drop for WavFileSink {
    fn drop(&mut self) {
        self.close();
    }
}
