use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pothole_track::config::Config;
use pothole_track::dataset::split_dataset;
use pothole_track::pipeline::{run_detection, run_detection_cv, BatchReport};
use pothole_track::training::{
    install_interrupt_handler, select_device, train, SystemRunner, TrainOutcome, TrainingPlan,
};

#[derive(Parser)]
#[command(
    name = "pothole-track",
    about = "Train, detect and track potholes in road videos",
    version
)]
struct Cli {
    /// YAML configuration file; built-in defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Write a JSON summary of a batch run here
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct VideoArgs {
    /// TorchScript weights
    #[arg(short, long)]
    model: Option<PathBuf>,

    #[arg(short, long)]
    input_dir: Option<PathBuf>,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Detection confidence threshold
    #[arg(long)]
    conf: Option<f32>,
}

#[derive(Subcommand)]
enum Command {
    /// Train YOLO11m on the pothole dataset and export the best weights
    Train {
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(long)]
        epochs: Option<u32>,
    },
    /// Move a random share of training images into the validation set
    Split {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        ratio: Option<f64>,
        /// Fixed RNG seed for a reproducible split
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Detect on every frame and track with BoT-SORT
    Detect(VideoArgs),
    /// Detect every N frames and follow objects with CSRT trackers
    DetectCv {
        #[command(flatten)]
        video: VideoArgs,
        /// Frames between detector runs
        #[arg(long)]
        interval: Option<u32>,
    },
}

fn apply_video_args(cfg: &mut Config, args: VideoArgs) {
    if let Some(model) = args.model {
        cfg.model.path = model;
    }
    if let Some(dir) = args.input_dir {
        cfg.output.input_dir = dir;
    }
    if let Some(dir) = args.output_dir {
        cfg.output.output_dir = dir;
    }
    if let Some(conf) = args.conf {
        cfg.detection.conf_threshold = conf;
    }
}

fn finish(report: BatchReport, path: Option<PathBuf>) -> Result<()> {
    info!(
        "{} videos processed, {} failed",
        report.processed.len(),
        report.failed.len()
    );
    if let Some(path) = path {
        report.save_json(&path)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pothole_track=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Command::Train { data, epochs } => {
            if let Some(data) = data {
                cfg.training.data = data;
            }
            if let Some(epochs) = epochs {
                cfg.training.epochs = epochs;
            }
            let interrupted = install_interrupt_handler(cfg.training.stop_file.clone())
                .context("installing Ctrl-C handler")?;
            let plan = TrainingPlan::new(cfg.training.clone(), select_device());
            match train(&plan, &mut SystemRunner, &interrupted)? {
                TrainOutcome::Completed => info!("Training completed successfully!"),
                TrainOutcome::Interrupted => info!("Training stopped by user"),
            }
        }
        Command::Split { root, ratio, seed } => {
            let root = root.unwrap_or_else(|| cfg.dataset.root.clone());
            let ratio = ratio.unwrap_or(cfg.dataset.split_ratio);
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let report = split_dataset(&root, ratio, &mut rng)?;
            info!(
                "Dataset split complete! {} moved, {} skipped",
                report.moved.len(),
                report.skipped.len()
            );
        }
        Command::Detect(args) => {
            apply_video_args(&mut cfg, args);
            cfg.validate()?;
            finish(run_detection(&cfg)?, cli.report)?;
        }
        Command::DetectCv { video, interval } => {
            apply_video_args(&mut cfg, video);
            if let Some(interval) = interval {
                cfg.periodic.detection_interval = interval;
            }
            cfg.validate()?;
            finish(run_detection_cv(&cfg)?, cli.report)?;
        }
    }
    Ok(())
}
