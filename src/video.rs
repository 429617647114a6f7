use anyhow::Result;
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use walkdir::WalkDir;

use crate::error::PotholeError;

/// Video files directly inside `dir` whose extension is in `extensions`
/// (case-insensitive), sorted by path.
pub fn find_video_files(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(PotholeError::MissingDirectory(dir.to_path_buf()).into());
    }

    let mut videos: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
                .unwrap_or(false)
        })
        .collect();
    videos.sort();

    info!("Found {} video files", videos.len());
    Ok(videos)
}

/// File name without extension, used for per-video output folders.
pub fn video_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
}

pub fn video_file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video.mp4".to_string())
}

/// Rate assumed when the container reports none.
pub const DEFAULT_FPS: f64 = 30.0;

/// `fps` if the container reported a usable rate, `DEFAULT_FPS` otherwise.
pub fn effective_fps(fps: f64) -> f64 {
    if fps.is_finite() && fps > 0.0 {
        fps
    } else {
        DEFAULT_FPS
    }
}

pub struct VideoReader {
    cap: VideoCapture,
    pub fps: f64,
    pub total_frames: i32,
    pub width: i32,
    pub height: i32,
}

impl VideoReader {
    pub fn open(path: &Path) -> Result<Self> {
        let cap = VideoCapture::from_file(&path.to_string_lossy(), videoio::CAP_ANY)?;
        if !cap.is_opened()? {
            return Err(PotholeError::VideoOpen(path.to_path_buf()).into());
        }

        let fps = cap.get(videoio::CAP_PROP_FPS)?;
        let total_frames = cap.get(videoio::CAP_PROP_FRAME_COUNT)? as i32;
        let width = cap.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32;
        let height = cap.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32;

        info!(
            "Video properties: {}x{} @ {:.1} FPS, {} frames",
            width, height, fps, total_frames
        );

        Ok(VideoReader {
            cap,
            fps,
            total_frames,
            width,
            height,
        })
    }

    /// Next frame, or `None` at end of stream.
    pub fn read_frame(&mut self) -> Result<Option<Mat>> {
        let mut frame = Mat::default();
        if !self.cap.read(&mut frame)? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Rate to write output and size tracker budgets with.
    pub fn output_fps(&self) -> f64 {
        effective_fps(self.fps)
    }

    pub fn release(&mut self) -> Result<()> {
        self.cap.release()?;
        Ok(())
    }
}

/// `mp4v` writer at the source rate and size.
pub fn create_writer(path: &Path, fps: f64, width: i32, height: i32) -> Result<VideoWriter> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
    let writer = VideoWriter::new(
        &path.to_string_lossy(),
        fourcc,
        fps,
        Size::new(width, height),
        true,
    )?;
    if !writer.is_opened()? {
        return Err(PotholeError::WriterOpen(path.to_path_buf()).into());
    }
    Ok(writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn exts() -> Vec<String> {
        vec!["mp4".into(), "avi".into(), "mov".into()]
    }

    #[test]
    fn test_find_video_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.mp4", "a.MOV", "c.avi", "notes.txt", "d.mkv"] {
            File::create(dir.path().join(name)).unwrap();
        }
        fs::create_dir(dir.path().join("nested")).unwrap();
        File::create(dir.path().join("nested").join("e.mp4")).unwrap();

        let found = find_video_files(dir.path(), &exts()).unwrap();
        let names: Vec<String> = found.iter().map(|p| video_file_name(p)).collect();
        assert_eq!(names, vec!["a.MOV", "b.mp4", "c.avi"]);
    }

    #[test]
    fn test_find_video_files_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_video_files(&dir.path().join("nope"), &exts()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PotholeError>(),
            Some(PotholeError::MissingDirectory(_))
        ));
    }

    #[test]
    fn test_stem_and_name() {
        let p = Path::new("clips/road_01.mp4");
        assert_eq!(video_stem(p), "road_01");
        assert_eq!(video_file_name(p), "road_01.mp4");
    }

    #[test]
    fn test_effective_fps_falls_back() {
        assert_eq!(effective_fps(25.0), 25.0);
        assert_eq!(effective_fps(0.0), DEFAULT_FPS);
        assert_eq!(effective_fps(-1.0), DEFAULT_FPS);
        assert_eq!(effective_fps(f64::NAN), DEFAULT_FPS);
    }

    #[test]
    fn test_open_missing_video_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(VideoReader::open(&dir.path().join("missing.mp4")).is_err());
    }
}
