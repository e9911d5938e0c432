use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use emotion_fusion::snapshot::HIGH_EMOTION_THRESHOLD;
use emotion_fusion::{synthetic, Config, Modality, Pipeline, Snapshot};

/// Run the emotion fusion pipeline on synthetic camera and microphone input
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file (defaults to ~/.emotionfusion/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Broadcast period in milliseconds
    #[arg(long)]
    period_ms: Option<u64>,

    /// Smoothing factor in (0, 1]
    #[arg(long)]
    alpha: Option<f64>,

    /// Relative weight of the video modality
    #[arg(long)]
    video_weight: Option<f64>,

    /// Relative weight of the audio modality
    #[arg(long)]
    audio_weight: Option<f64>,

    /// Start with the video modality disabled
    #[arg(long)]
    no_video: bool,

    /// Start with the audio modality disabled
    #[arg(long)]
    no_audio: bool,

    /// JSON formula table replacing the reference derivations
    #[arg(long)]
    formulas: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Print a one-line summary per snapshot instead of JSON
    #[arg(long)]
    summary: bool,

    /// Write the effective config to the config file and exit
    #[arg(long)]
    save_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    /// Command-line values take precedence over the config file
    fn apply(&self, config: &mut Config) {
        if let Some(period_ms) = self.period_ms {
            config.update_period_ms = period_ms;
        }
        if let Some(alpha) = self.alpha {
            config.smoothing_alpha = alpha;
        }
        if let Some(weight) = self.video_weight {
            config.video_weight = weight;
        }
        if let Some(weight) = self.audio_weight {
            config.audio_weight = weight;
        }
        if self.no_video {
            config.video_enabled = false;
        }
        if self.no_audio {
            config.audio_enabled = false;
        }
        if let Some(path) = &self.formulas {
            config.formula_path = Some(path.clone());
        }
    }
}

fn summarize(snapshot: &Snapshot) -> String {
    let dominant = snapshot
        .dominant()
        .map(|(name, score)| format!("{} {:.2}", name, score))
        .unwrap_or_else(|| "none".to_string());
    let high: Vec<String> = snapshot
        .high_emotions(HIGH_EMOTION_THRESHOLD)
        .iter()
        .map(|(name, score)| format!("{}={:.2}", name, score))
        .collect();
    format!(
        "#{:<5} dominant: {:<20} high: [{}]{}",
        snapshot.sequence_number,
        dominant,
        high.join(", "),
        if snapshot.degraded { " (degraded)" } else { "" }
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => Config::config_path()?,
    };
    let mut config = Config::load(&config_path)?;
    args.apply(&mut config);

    if args.save_config {
        config.save(&config_path)?;
        info!("Config saved to {:?}", config_path);
        return Ok(());
    }

    let pipeline_config = config.to_pipeline_config()?;
    let inputs = synthetic::inputs(
        config.video_fps,
        config.audio_sample_rate,
        Duration::from_millis(config.audio_chunk_ms as u64),
    );
    let pipeline = Pipeline::new(pipeline_config, inputs).context("Failed to create pipeline")?;

    info!("Emotion fusion starting...");
    info!("Pipeline: {}", pipeline.id());
    info!(
        "Period: {} ms, alpha: {}, weights: video={} audio={}",
        config.update_period_ms, config.smoothing_alpha, config.video_weight, config.audio_weight
    );
    for modality in Modality::ALL {
        if !pipeline.is_modality_enabled(modality) {
            info!("{} modality disabled", modality);
        }
    }

    let mut subscription = pipeline.subscribe("stdout");
    pipeline.start().context("Failed to start pipeline")?;

    let deadline = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    info!("Press Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, stopping...");
                break;
            }
            _ = &mut deadline => {
                info!("Duration elapsed, stopping...");
                break;
            }
            received = subscription.recv() => match received {
                Some(snapshot) => {
                    if args.summary {
                        println!("{}", summarize(&snapshot));
                    } else {
                        println!("{}", serde_json::to_string(&snapshot)?);
                    }
                }
                None => {
                    warn!("Snapshot channel closed");
                    break;
                }
            },
        }
    }

    // Stop joins worker threads
    let report = tokio::task::block_in_place(|| pipeline.stop());
    let status = pipeline.status();

    info!("Pipeline stopped");
    info!("  Snapshots: {}", report.ticks);
    info!("  Skipped ticks: {}", status.skipped_ticks);
    if let Some(video) = &report.video {
        info!(
            "  Video: {} samples, {} failures, {} frames skipped",
            video.samples_published, video.failures, video.skipped_items
        );
    }
    if let Some(audio) = &report.audio {
        info!(
            "  Audio: {} samples, {} failures",
            audio.samples_published, audio.failures
        );
    }
    if !report.is_clean() {
        warn!("  Timed out: {}", report.timed_out.join(", "));
    }

    Ok(())
}
