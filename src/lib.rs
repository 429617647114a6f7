pub mod config;
pub mod dataset;
pub mod detection;
pub mod error;
pub mod kalman_filter;
pub mod matching;
pub mod periodic;
pub mod pipeline;
pub mod tracker;
pub mod training;
pub mod utils;
pub mod video;
pub mod visualization;

// Re-export main types
pub use crate::config::Config;
pub use crate::detection::{Detection, Detector};
pub use crate::error::PotholeError;
pub use crate::periodic::PeriodicTracker;
pub use crate::tracker::{BotSort, STrack};
