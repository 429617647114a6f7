use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::PotholeError;

/// Top level settings. Every section falls back to its defaults, so a partial
/// YAML file only needs the keys it overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub detection: DetectionConfig,
    pub tracker: TrackerConfig,
    pub periodic: PeriodicConfig,
    pub training: TrainingConfig,
    pub dataset: DatasetConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// TorchScript export of the trained weights.
    pub path: PathBuf,
    /// "auto", "cpu" or "cuda".
    pub device: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(
                "pothole_detection/yolo11m_pothole_improved/weights/best.torchscript",
            ),
            device: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub conf_threshold: f32,
    pub nms_threshold: f32,
    pub input_size: i64,
    pub class_names: Vec<String>,
    /// Boxes kept per frame after NMS.
    pub max_det: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.25,
            nms_threshold: 0.7,
            input_size: 800,
            class_names: vec!["pothole".to_string()],
            max_det: 300,
        }
    }
}

/// BoT-SORT association settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub track_high_thresh: f32,
    pub track_low_thresh: f32,
    pub new_track_thresh: f32,
    pub track_buffer: usize,
    pub match_thresh: f32,
    pub fuse_score: bool,
    pub gmc: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_high_thresh: 0.25,
            track_low_thresh: 0.1,
            new_track_thresh: 0.25,
            track_buffer: 30,
            match_thresh: 0.8,
            fuse_score: true,
            gmc: true,
        }
    }
}

/// Settings for the detector-plus-CSRT loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodicConfig {
    pub detection_interval: u32,
    pub trail_length: usize,
    pub progress_every: u32,
}

impl Default for PeriodicConfig {
    fn default() -> Self {
        Self {
            detection_interval: 1,
            trail_length: 30,
            progress_every: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Ultralytics CLI executable.
    pub yolo_bin: String,
    pub data: PathBuf,
    pub base_model: String,
    pub epochs: u32,
    pub imgsz: u32,
    pub batch: u32,
    pub patience: u32,
    pub project: String,
    pub name: String,
    pub exist_ok: bool,
    pub verbose: bool,
    pub cache: String,
    pub workers: u32,
    pub single_cls: bool,
    pub rect: bool,
    /// Directory holding the `train/` and `valid/` label caches.
    pub dataset_root: PathBuf,
    pub stop_file: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            yolo_bin: "yolo".to_string(),
            data: PathBuf::from("data_config.yaml"),
            base_model: "yolo11m.pt".to_string(),
            epochs: 50,
            imgsz: 800,
            batch: 6,
            patience: 50,
            project: "pothole_detection".to_string(),
            name: "yolo11m_pothole_improved".to_string(),
            exist_ok: true,
            verbose: true,
            cache: "disk".to_string(),
            workers: 2,
            single_cls: false,
            rect: false,
            dataset_root: PathBuf::from("."),
            stop_file: PathBuf::from("stop"),
        }
    }
}

impl TrainingConfig {
    /// Where Ultralytics leaves the best checkpoint of this run.
    pub fn best_weights(&self) -> PathBuf {
        Path::new(&self.project)
            .join(&self.name)
            .join("weights")
            .join("best.pt")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub root: PathBuf,
    pub split_ratio: f64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            split_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub video_extensions: Vec<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("output_videos"),
            video_extensions: vec!["mp4".into(), "avi".into(), "mov".into()],
        }
    }
}

impl Config {
    /// Load from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path.as_ref())?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), PotholeError> {
        if self.periodic.detection_interval == 0 {
            return Err(PotholeError::InvalidInterval);
        }
        if !(0.0..=1.0).contains(&self.dataset.split_ratio) {
            return Err(PotholeError::InvalidRatio(self.dataset.split_ratio));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_training_script() {
        let cfg = Config::default();
        assert_eq!(cfg.training.epochs, 50);
        assert_eq!(cfg.training.imgsz, 800);
        assert_eq!(cfg.training.batch, 6);
        assert_eq!(cfg.training.workers, 2);
        assert_eq!(cfg.detection.conf_threshold, 0.25);
        assert_eq!(cfg.detection.max_det, 300);
        assert_eq!(cfg.periodic.trail_length, 30);
        assert_eq!(
            cfg.training.best_weights(),
            PathBuf::from("pothole_detection/yolo11m_pothole_improved/weights/best.pt")
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "periodic:\n  detection_interval: 5\noutput:\n  output_dir: out\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.periodic.detection_interval, 5);
        assert_eq!(cfg.periodic.trail_length, 30);
        assert_eq!(cfg.output.output_dir, PathBuf::from("out"));
        assert_eq!(cfg.output.video_extensions.len(), 3);
        assert_eq!(cfg.tracker.track_buffer, 30);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut cfg = Config::default();
        cfg.periodic.detection_interval = 0;
        assert!(matches!(cfg.validate(), Err(PotholeError::InvalidInterval)));
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let mut cfg = Config::default();
        cfg.dataset.split_ratio = 1.5;
        assert!(matches!(cfg.validate(), Err(PotholeError::InvalidRatio(_))));
    }
}
