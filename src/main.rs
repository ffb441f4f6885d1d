//! audio-ingestd — multi-stream audio ingestion daemon.
//!
//! Loads a TOML source list, spawns one decoder supervisor per configured
//! RTSP source via the [`Manager`](audio_ingest::Manager), and runs until a
//! shutdown signal is received. The analysis/capture rings and audio-level
//! channel are owned entirely by the core; this binary only wires
//! configuration, logging, and the process lifecycle around it.

use anyhow::Result;
use audio_ingest::config::Config;
use audio_ingest::level::AudioLevelData;
use audio_ingest::telemetry::{LoggingTelemetrySink, TelemetrySink};
use audio_ingest::{AnalysisChunk, Manager};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "audio-ingestd")]
#[command(about = "Multi-stream audio ingestion daemon: RTSP decoder supervision and ring buffers")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "audio-ingest.toml")]
    config: PathBuf,

    /// Decoder command override (default: the config file's [decoder].command, or "ffmpeg").
    #[arg(long, env = "AUDIO_INGEST_DECODER")]
    decoder: Option<String>,

    /// Sample rate override in Hz.
    #[arg(long, env = "AUDIO_INGEST_SAMPLE_RATE")]
    sample_rate: Option<u32>,
}

async fn drain_level_events(mut rx: tokio::sync::mpsc::Receiver<AudioLevelData>) {
    while let Some(event) = rx.recv().await {
        tracing::trace!(
            source = %event.source,
            level = event.level,
            clipping = event.clipping,
            "audio level"
        );
    }
}

/// Stand-in for the external detector this binary doesn't ship: drains the
/// analysis-chunk channel so the per-source monitor tasks never block. A
/// real deployment replaces this with the bird-detection model's consumer.
async fn drain_analysis_chunks(mut rx: tokio::sync::mpsc::Receiver<AnalysisChunk>) {
    while let Some(chunk) = rx.recv().await {
        tracing::trace!(source = %chunk.source, bytes = chunk.bytes.len(), "analysis chunk ready");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audio_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!("starting audio-ingestd");

    let args = Args::parse();
    info!(config = %args.config.display(), "loading configuration");

    let config = Config::load(&args.config, args.decoder, args.sample_rate).await?;
    info!(sources = config.sources.len(), sample_rate = config.settings.sample_rate, "configuration loaded");

    let (level_tx, level_rx) = tokio::sync::mpsc::channel(config.settings.level_channel_capacity);
    let level_task = tokio::spawn(drain_level_events(level_rx));

    let (chunk_tx, chunk_rx) = tokio::sync::mpsc::channel(config.settings.chunk_channel_capacity);
    let chunk_task = tokio::spawn(drain_analysis_chunks(chunk_rx));

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(LoggingTelemetrySink);
    let manager = Manager::new(config.settings, config.decoder_command, telemetry, level_tx, chunk_tx);

    manager.reconcile(&config.sources).await?;
    info!("fleet reconciled, running until shutdown signal");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping all sources");

    manager.shutdown().await;
    level_task.abort();
    if let Err(e) = level_task.await {
        if !e.is_cancelled() {
            warn!(error = %e, "level-drain task join failed");
        }
    }
    chunk_task.abort();
    if let Err(e) = chunk_task.await {
        if !e.is_cancelled() {
            warn!(error = %e, "chunk-drain task join failed");
        }
    }

    info!("audio-ingestd shut down cleanly");
    Ok(())
}
