//! CLI binary for fae-lipsync.
//!
//! Weights and timelines are written to stdout as JSON; all tracing output
//! goes to stderr.

use clap::{Parser, Subcommand};
use fae_lipsync::audio::{AudioBackend, AudioSource, SimulatedAudio};
use fae_lipsync::viseme::ShapeTable;
use fae_lipsync::{
    HttpPhonemeService, LipSync, LipSyncConfig, LipSyncEvent, TimelineBuilder, TimelineInput,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Drive avatar lip-sync from phoneme timing.
#[derive(Parser)]
#[command(name = "fae-lipsync", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Build a timeline from bare phonemes and print it as JSON.
    Timeline {
        /// Space-separated ARPABET phonemes, e.g. "HH AE1 L OW0".
        #[arg(short, long)]
        phonemes: String,
    },

    /// Speak text through the phonemize service and print per-frame weights.
    Speak {
        /// Text to speak.
        #[arg(short, long)]
        text: String,

        /// Frames per second.
        #[arg(long, default_value_t = 60)]
        fps: u32,

        /// Simulated audio length in seconds (unknown if omitted).
        #[arg(long)]
        audio_secs: Option<f64>,
    },

    /// Recognise visemes in a recorded clip and print per-frame weights.
    Listen {
        /// Audio file to upload (WAV or MP3).
        #[arg(short, long)]
        file: PathBuf,

        /// Frames per second.
        #[arg(long, default_value_t = 60)]
        fps: u32,

        /// Clip length in seconds, used for the simulated playback clock.
        #[arg(long)]
        audio_secs: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fae_lipsync=info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match cli.config {
        Some(ref path) => LipSyncConfig::from_file(path)?,
        None => {
            let path = LipSyncConfig::default_config_path();
            if path.exists() {
                LipSyncConfig::from_file(&path)?
            } else {
                LipSyncConfig::default()
            }
        }
    };

    match cli.command {
        Command::Timeline { phonemes } => print_timeline(&config, &phonemes),
        Command::Speak {
            text,
            fps,
            audio_secs,
        } => run_speak(config, &text, fps, audio_secs).await,
        Command::Listen {
            file,
            fps,
            audio_secs,
        } => run_listen(config, file, fps, audio_secs).await,
    }
}

fn print_timeline(config: &LipSyncConfig, phonemes: &str) -> anyhow::Result<()> {
    let table =
        ShapeTable::builtin().with_overrides(&config.shapes.phonemes, &config.shapes.groups);
    let builder = TimelineBuilder::new(table, config.timing.clone());
    let labels = phonemes.split_whitespace().map(str::to_owned).collect();
    let timeline = builder.build(&TimelineInput::select(None, None, Some(labels)));
    println!("{}", serde_json::to_string_pretty(&timeline)?);
    Ok(())
}

async fn run_speak(
    config: LipSyncConfig,
    text: &str,
    fps: u32,
    audio_secs: Option<f64>,
) -> anyhow::Result<()> {
    let service = HttpPhonemeService::new(&config.service)?;
    info!(endpoint = %service.endpoint(), "using phonemize service");
    let lipsync = LipSync::new(
        config,
        Arc::new(service),
        Arc::new(SimulatedAudio::new(audio_secs)),
    );
    let mut events = lipsync.subscribe();

    let speaker = lipsync.clone();
    let owned_text = text.to_owned();
    let speak = tokio::spawn(async move { speaker.speak(&owned_text).await });

    drive_frames(&lipsync, &mut events, fps).await;
    speak.await??;
    Ok(())
}

async fn run_listen(
    config: LipSyncConfig,
    file: PathBuf,
    fps: u32,
    audio_secs: Option<f64>,
) -> anyhow::Result<()> {
    let audio = tokio::fs::read(&file).await?;
    let file_name = file
        .file_name()
        .map_or_else(|| "speech.wav".to_owned(), |n| n.to_string_lossy().into_owned());
    let service = HttpPhonemeService::new(&config.service)?;
    info!(endpoint = %service.audio_endpoint(), bytes = audio.len(), "uploading recording");

    let backend = SimulatedAudio::new(audio_secs);
    let track = backend
        .load(AudioSource {
            url: file.display().to_string(),
            playback_rate: config.audio.playback_rate,
        })
        .await?;
    let lipsync = LipSync::new(config, Arc::new(service), Arc::new(backend));
    let mut events = lipsync.subscribe();

    let speaker = lipsync.clone();
    let speak =
        tokio::spawn(async move { speaker.speak_audio(audio, &file_name, track).await });

    drive_frames(&lipsync, &mut events, fps).await;
    speak.await??;
    Ok(())
}

/// Print one JSON line of weights per frame until the utterance ends.
async fn drive_frames(
    lipsync: &LipSync,
    events: &mut broadcast::Receiver<LipSyncEvent>,
    fps: u32,
) {
    let frame_secs = 1.0 / f64::from(fps.max(1));
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(frame_secs));
    let started = tokio::time::Instant::now();
    let mut ended = false;

    while !ended {
        tokio::select! {
            _ = ticker.tick() => {
                let weights = lipsync.frame(frame_secs);
                let line = serde_json::json!({
                    "t": started.elapsed().as_secs_f64(),
                    "weights": weights,
                });
                println!("{line}");
            }
            event = events.recv() => match event {
                Ok(LipSyncEvent::Ended { reason, .. }) => {
                    info!(?reason, "utterance ended");
                    ended = true;
                }
                Ok(LipSyncEvent::Started { source, .. }) => info!(?source, "utterance started"),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => ended = true,
            },
            _ = tokio::signal::ctrl_c() => {
                lipsync.stop();
                ended = true;
            }
        }
    }
}
