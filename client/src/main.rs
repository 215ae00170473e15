mod sink;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stream_core::validation::validate_endpoint;
use stream_core::{
    AudioFormat, NullSink, PlaybackSink, SessionEvent, SessionSource, SpeechStreamer, StreamConfig,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::sink::WavFileSink;

#[derive(Parser)]
#[command(name = "speak-client", about = "Stream speech from the backend and render it in real time")]
struct Cli {
    /// Backend WebSocket URL (overrides STREAM_ENDPOINT)
    #[arg(long)]
    endpoint: Option<String>,

    /// Write the rendered audio to this WAV file
    #[arg(long, short)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay a 16 kHz mono WAV or raw PCM asset
    File { path: PathBuf },
    /// Speak one utterance
    Text { text: String },
    /// Speak stdin line by line until EOF
    Stdin,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let _ = dotenv::dotenv();

    async_main(Cli::parse()).await
}

async fn async_main(cli: Cli) -> anyhow::Result<()> {
    let mut config = StreamConfig::from_env();
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    validate_endpoint(&config.endpoint)?;
    info!("Streaming from {}", config.endpoint);

    let streamer = SpeechStreamer::new(config);
    streamer.connection().add_state_listener("cli", |change| {
        match &change.error {
            Some(e) => warn!(from = %change.previous, to = %change.current, "Connection: {}", e),
            None => info!(from = %change.previous, to = %change.current, "Connection state changed"),
        }
    });

    if let Err(e) = streamer.pre_connect().await {
        warn!("Pre-connect failed, will retry on open: {}", e);
    }

    let source = match cli.command {
        Command::File { path } => SessionSource::AssetFile(path),
        Command::Text { text } => SessionSource::Text(text),
        Command::Stdin => SessionSource::TextStream(read_stdin_lines()),
    };

    let sink: Box<dyn PlaybackSink> = match &cli.out {
        Some(path) => Box::new(WavFileSink::create(path, AudioFormat::default())?),
        None => Box::new(NullSink::default()),
    };

    let mut session = streamer.open(source, sink).await?;
    info!(session_id = %session.id(), mode = ?session.mode(), "Session opened");

    while let Some(event) = session.next_event().await {
        match event {
            SessionEvent::StateChanged(state) => debug!("Session {}", state),
            SessionEvent::FirstAudio { latency } => {
                info!("First audio after {}ms", latency.as_millis())
            }
            SessionEvent::ChunkDropped { sequence, reason } => {
                warn!(sequence, ?reason, "Chunk dropped")
            }
            SessionEvent::Underrun { position } => {
                warn!("Playback underrun at {}ms", position.as_millis())
            }
            SessionEvent::MalformedFrame { consecutive } => {
                warn!(consecutive, "Malformed frame from backend")
            }
        }
    }

    let outcome = session.wait().await;
    let summary = serde_json::json!({
        "session": session.report(),
        "metrics": streamer.metrics().snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    streamer.connection().disconnect();

    match outcome {
        Ok(_) => Ok(()),
        Err(e) => {
            error!("Session ended without completing: {}", e);
            Err(e.into())
        }
    }
}

/// Forward non-empty stdin lines as text increments. EOF closes the channel.
fn read_stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    });
    rx
}
