use anyhow::Result;
use opencv::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use crate::config::Config;
use crate::detection::Detector;
use crate::periodic::cv_track_video;
use crate::tracker::BotSort;
use crate::video::{create_writer, find_video_files, video_file_name, video_stem, VideoReader};
use crate::visualization::draw_track;

/// `<output_dir>/<stem>/<file name>`
pub fn track_output_path(output_dir: &Path, video: &Path) -> PathBuf {
    output_dir.join(video_stem(video)).join(video_file_name(video))
}

/// Detector on every frame, BoT-SORT for identities.
pub fn track_video(detector: &Detector, cfg: &Config, video: &Path) -> Result<PathBuf> {
    let mut reader = VideoReader::open(video)?;
    let fps = reader.output_fps();
    let output_path = track_output_path(&cfg.output.output_dir, video);
    let mut writer = create_writer(&output_path, fps, reader.width, reader.height)?;
    let mut tracker = BotSort::new(&cfg.tracker, fps)?;

    let mut frame_count: u64 = 0;
    while let Some(frame) = reader.read_frame()? {
        let detections = detector.detect(&frame)?;
        let tracks = tracker.update(&detections, &frame)?;

        let mut annotated = frame.clone();
        for track in &tracks {
            draw_track(&mut annotated, track, detector.class_name(track.class_id))?;
        }
        writer.write(&annotated)?;

        frame_count += 1;
        if frame_count % u64::from(cfg.periodic.progress_every.max(1)) == 0 {
            info!("Processed {}/{} frames", frame_count, reader.total_frames);
        }
    }

    reader.release()?;
    writer.release()?;
    info!(
        "Processed video with tracking saved to {}",
        output_path.display()
    );
    Ok(output_path)
}

/// Per-video outcome of a batch run.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub processed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    /// Pretty JSON summary of the run.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Batch report saved to {}", path.display());
        Ok(())
    }
}

/// Run `process` on every video, logging and skipping the ones that fail.
pub fn process_all<F>(videos: &[PathBuf], mut process: F) -> BatchReport
where
    F: FnMut(&Path) -> Result<PathBuf>,
{
    let mut report = BatchReport::default();
    for video in videos {
        info!("Processing video: {}", video.display());
        match process(video) {
            Ok(out) => report.processed.push(out),
            Err(e) => {
                error!("Error processing {}: {:#}", video.display(), e);
                report.failed.push((video.clone(), format!("{:#}", e)));
            }
        }
    }
    report
}

fn prepare(cfg: &Config) -> Result<(Vec<PathBuf>, Detector)> {
    let videos = find_video_files(&cfg.output.input_dir, &cfg.output.video_extensions)?;
    fs::create_dir_all(&cfg.output.output_dir)?;
    let detector = Detector::from_config(cfg)?;
    Ok((videos, detector))
}

/// Full-frame detection plus BoT-SORT over every video in the input dir.
pub fn run_detection(cfg: &Config) -> Result<BatchReport> {
    let (videos, detector) = prepare(cfg)?;
    let report = process_all(&videos, |v| track_video(&detector, cfg, v));
    info!("Detection and tracking completed");
    Ok(report)
}

/// Periodic detection plus CSRT trackers over every video in the input dir.
pub fn run_detection_cv(cfg: &Config) -> Result<BatchReport> {
    let (videos, detector) = prepare(cfg)?;
    let report = process_all(&videos, |v| cv_track_video(&detector, cfg, v));
    info!("Detection and tracking completed using OpenCV");
    Ok(report)
}
