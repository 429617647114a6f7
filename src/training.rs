use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::TrainingConfig;
use crate::error::{PotholeError, Result};

/// Label caches Ultralytics writes next to the split folders.
pub const LABEL_CACHES: [&str; 2] = ["train/labels.cache", "valid/labels.cache"];
pub const STOP_MESSAGE: &str = "Stop training";

/// Runs an external program to completion. Training and export go through
/// the Ultralytics `yolo` command line.
pub trait CommandRunner {
    fn run(&mut self, program: &str, args: &[String]) -> Result<()>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&mut self, program: &str, args: &[String]) -> Result<()> {
        info!("Running: {} {}", program, args.join(" "));
        let status = Command::new(program).args(args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(PotholeError::CommandFailed {
                program: program.to_string(),
                status: status.to_string(),
            })
        }
    }
}

/// `0` for the first CUDA device when libtorch sees one, `cpu` otherwise.
pub fn select_device() -> String {
    let device = if tch::Cuda::is_available() { "0" } else { "cpu" };
    info!("Using device: {}", if device == "cpu" { "cpu" } else { "cuda:0" });
    device.to_string()
}

/// Remove stale label caches so a re-split dataset is rescanned.
pub fn clear_label_caches(root: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for rel in LABEL_CACHES {
        let path = root.join(rel);
        if path.exists() {
            fs::remove_file(&path)?;
            info!("Removed stale cache {}", path.display());
            removed.push(path);
        }
    }
    Ok(removed)
}

/// Ask a running trainer to stop after the current batch.
pub fn write_stop_file(path: &Path) -> std::io::Result<()> {
    fs::write(path, STOP_MESSAGE)
}

/// On Ctrl-C, drop the stop file and raise the returned flag so `train`
/// winds down without starting another step. A second Ctrl-C exits at once.
pub fn install_interrupt_handler(
    stop_file: PathBuf,
) -> std::result::Result<Arc<AtomicBool>, ctrlc::Error> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            std::process::exit(0);
        }
        info!("Training interrupted. Saving progress...");
        match write_stop_file(&stop_file) {
            Ok(()) => info!(
                "Created stop file {}. Training will stop after the current batch.",
                stop_file.display()
            ),
            Err(e) => error!("Could not write {}: {}", stop_file.display(), e),
        }
    })?;
    Ok(interrupted)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Completed,
    /// Stopped by Ctrl-C. Not an error.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportStep {
    pub format: &'static str,
    pub imgsz: Option<u32>,
    /// Optional exports only warn when they fail.
    pub required: bool,
}

#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub cfg: TrainingConfig,
    pub device: String,
}

impl TrainingPlan {
    pub fn new(cfg: TrainingConfig, device: String) -> Self {
        Self { cfg, device }
    }

    pub fn train_args(&self) -> Vec<String> {
        let c = &self.cfg;
        vec![
            "detect".to_string(),
            "train".to_string(),
            format!("data={}", c.data.display()),
            format!("model={}", c.base_model),
            format!("epochs={}", c.epochs),
            format!("imgsz={}", c.imgsz),
            format!("batch={}", c.batch),
            format!("patience={}", c.patience),
            format!("device={}", self.device),
            format!("project={}", c.project),
            format!("name={}", c.name),
            format!("exist_ok={}", py_bool(c.exist_ok)),
            format!("verbose={}", py_bool(c.verbose)),
            format!("cache={}", c.cache),
            format!("workers={}", c.workers),
            format!("single_cls={}", py_bool(c.single_cls)),
            format!("rect={}", py_bool(c.rect)),
        ]
    }

    pub fn export_steps(&self) -> Vec<ExportStep> {
        let imgsz = Some(self.cfg.imgsz);
        vec![
            ExportStep { format: "onnx", imgsz: None, required: true },
            ExportStep { format: "torchscript", imgsz, required: true },
            ExportStep { format: "engine", imgsz, required: false },
            ExportStep { format: "openvino", imgsz, required: false },
        ]
    }

    pub fn export_args(&self, step: &ExportStep) -> Vec<String> {
        let mut args = vec![
            "export".to_string(),
            format!("model={}", self.cfg.best_weights().display()),
            format!("format={}", step.format),
        ];
        if let Some(imgsz) = step.imgsz {
            args.push(format!("imgsz={}", imgsz));
        }
        args
    }
}

fn py_bool(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

// The child shares our process group, so after Ctrl-C its own exit status
// is meaningless; the flag wins over whatever it returned.
fn stop_requested(interrupted: &AtomicBool) -> bool {
    let stop = interrupted.load(Ordering::SeqCst);
    if stop {
        info!("Stop requested, skipping remaining steps");
    }
    stop
}

fn train_and_export<R: CommandRunner>(
    plan: &TrainingPlan,
    runner: &mut R,
    interrupted: &AtomicBool,
) -> Result<TrainOutcome> {
    clear_label_caches(&plan.cfg.dataset_root)?;
    let trained = runner.run(&plan.cfg.yolo_bin, &plan.train_args());
    if stop_requested(interrupted) {
        return Ok(TrainOutcome::Interrupted);
    }
    trained?;

    for step in plan.export_steps() {
        info!("Exporting model to {} format...", step.format);
        let exported = runner.run(&plan.cfg.yolo_bin, &plan.export_args(&step));
        if stop_requested(interrupted) {
            return Ok(TrainOutcome::Interrupted);
        }
        match exported {
            Ok(()) => {}
            Err(e) if !step.required => warn!("{} export failed: {}", step.format, e),
            Err(e) => {
                error!("{} export failed", step.format);
                return Err(e);
            }
        }
    }
    Ok(TrainOutcome::Completed)
}

/// Clear caches, train, then export. Training errors propagate; the
/// completion message is logged either way.
pub fn train<R: CommandRunner>(
    plan: &TrainingPlan,
    runner: &mut R,
    interrupted: &AtomicBool,
) -> Result<TrainOutcome> {
    let result = train_and_export(plan, runner, interrupted);
    if let Err(e) = &result {
        error!("Training error: {}", e);
    }
    info!("Training process completed.");
    result
}
