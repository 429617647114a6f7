use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PotholeError {
    #[error("could not open video {0}")]
    VideoOpen(PathBuf),

    #[error("could not open video writer for {0}")]
    WriterOpen(PathBuf),

    #[error("unexpected model output shape {0:?}, expected [1, 4 + classes, anchors]")]
    ModelOutput(Vec<i64>),

    #[error("split ratio must be within [0, 1], got {0}")]
    InvalidRatio(f64),

    #[error("detection interval must be at least 1")]
    InvalidInterval,

    #[error("missing directory {0}")]
    MissingDirectory(PathBuf),

    #[error("`{program}` exited with {status}")]
    CommandFailed { program: String, status: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    OpenCv(#[from] opencv::Error),

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, PotholeError>;
