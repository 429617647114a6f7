use anyhow::{Context, Result};
use opencv::{
    core::{Mat, Point, Ptr, Rect},
    prelude::*,
    tracking::TrackerCSRT,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{Config, PeriodicConfig};
use crate::detection::{Detection, Detector};
use crate::video::{create_writer, video_file_name, video_stem, VideoReader};
use crate::visualization::{draw_frame_counter, draw_labeled_box, draw_trail, GREEN, YELLOW};

/// A single-object tracker already initialised on its target.
pub trait ObjectTracker {
    /// New box on `frame`, or `None` once the target is lost.
    fn update(&mut self, frame: &Mat) -> Result<Option<Rect>>;
}

pub trait TrackerFactory {
    fn create(&self, frame: &Mat, rect: Rect) -> Result<Box<dyn ObjectTracker>>;
}

pub struct CsrtTracker {
    inner: Ptr<TrackerCSRT>,
}

impl ObjectTracker for CsrtTracker {
    fn update(&mut self, frame: &Mat) -> Result<Option<Rect>> {
        let mut rect = Rect::default();
        let found = self.inner.update(frame, &mut rect)?;
        Ok(found.then_some(rect))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CsrtFactory;

impl TrackerFactory for CsrtFactory {
    fn create(&self, frame: &Mat, rect: Rect) -> Result<Box<dyn ObjectTracker>> {
        let mut inner = TrackerCSRT::create_def().context("Failed to create CSRT tracker")?;
        inner.init(frame, rect)?;
        Ok(Box::new(CsrtTracker { inner }))
    }
}

/// A detector box ready to seed a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct Seed {
    pub rect: Rect,
    pub class_name: String,
    pub confidence: f32,
}

impl Seed {
    pub fn from_detection(det: &Detection, class_name: &str) -> Self {
        let (x1, y1, x2, y2) = det.xyxy_i32();
        Seed {
            rect: Rect::new(x1, y1, x2 - x1, y2 - y1),
            class_name: class_name.to_string(),
            confidence: det.confidence,
        }
    }
}

/// One object as drawn on the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedObject {
    pub id: u64,
    pub rect: Rect,
    pub class_name: String,
    pub confidence: f32,
    pub trail: Vec<Point>,
}

struct LiveTracker {
    tracker: Box<dyn ObjectTracker>,
    class_name: String,
    confidence: f32,
}

fn center(rect: Rect) -> Point {
    Point::new(
        rect.x + rect.width.div_euclid(2),
        rect.y + rect.height.div_euclid(2),
    )
}

/// Every `detection_interval` frames the detector runs and each box seeds a
/// fresh single-object tracker under a new id. In between, trackers follow
/// their object on their own and are dropped once they lose it. Ids are never
/// reused.
pub struct PeriodicTracker<F: TrackerFactory> {
    factory: F,
    detection_interval: u64,
    trail_length: usize,
    next_object_id: u64,
    trackers: BTreeMap<u64, LiveTracker>,
    history: HashMap<u64, VecDeque<Point>>,
}

impl<F: TrackerFactory> PeriodicTracker<F> {
    pub fn new(factory: F, cfg: &PeriodicConfig) -> Self {
        PeriodicTracker {
            factory,
            detection_interval: u64::from(cfg.detection_interval.max(1)),
            trail_length: cfg.trail_length.max(1),
            next_object_id: 0,
            trackers: BTreeMap::new(),
            history: HashMap::new(),
        }
    }

    pub fn live_ids(&self) -> Vec<u64> {
        self.trackers.keys().copied().collect()
    }

    /// Ids handed out so far.
    pub fn issued_ids(&self) -> u64 {
        self.next_object_id
    }

    pub fn is_detection_frame(&self, frame_index: u64) -> bool {
        frame_index % self.detection_interval == 0
    }

    fn push_point(&mut self, id: u64, point: Point) {
        let trail = self.history.entry(id).or_default();
        trail.push_back(point);
        while trail.len() > self.trail_length {
            trail.pop_front();
        }
    }

    /// Discard every tracker and seed new ones from `seeds`.
    fn reseed(&mut self, frame: &Mat, seeds: Vec<Seed>) -> Result<()> {
        self.trackers.clear();
        self.history.clear();

        for seed in seeds {
            if seed.rect.width <= 0 || seed.rect.height <= 0 {
                debug!("skipping degenerate box {:?}", seed.rect);
                continue;
            }
            let tracker = self.factory.create(frame, seed.rect)?;
            let id = self.next_object_id;
            self.next_object_id += 1;

            self.trackers.insert(
                id,
                LiveTracker {
                    tracker,
                    class_name: seed.class_name,
                    confidence: seed.confidence,
                },
            );
            self.push_point(id, center(seed.rect));
        }
        Ok(())
    }

    /// Advance one frame. `detect` is only called on detection frames and
    /// must not see any annotations.
    pub fn step<D>(&mut self, frame: &Mat, frame_index: u64, detect: D) -> Result<Vec<TrackedObject>>
    where
        D: FnOnce(&Mat) -> Result<Vec<Seed>>,
    {
        if self.is_detection_frame(frame_index) {
            let seeds = detect(frame)?;
            self.reseed(frame, seeds)?;
        }

        let mut visible = Vec::with_capacity(self.trackers.len());
        let mut lost = Vec::new();
        let mut moved = Vec::new();

        for (&id, live) in self.trackers.iter_mut() {
            match live.tracker.update(frame)? {
                Some(rect) => {
                    moved.push((id, center(rect)));
                    visible.push(TrackedObject {
                        id,
                        rect,
                        class_name: live.class_name.clone(),
                        confidence: live.confidence,
                        trail: Vec::new(),
                    });
                }
                None => lost.push(id),
            }
        }

        for (id, point) in moved {
            self.push_point(id, point);
        }
        for id in lost {
            self.trackers.remove(&id);
            self.history.remove(&id);
        }
        for obj in visible.iter_mut() {
            if let Some(trail) = self.history.get(&obj.id) {
                obj.trail = trail.iter().copied().collect();
            }
        }
        Ok(visible)
    }
}

/// Draw boxes, labels, trails and the frame counter.
pub fn annotate_frame(
    frame: &mut Mat,
    objects: &[TrackedObject],
    frame_index: u64,
    total_frames: i32,
) -> Result<()> {
    for obj in objects {
        let label = format!("{} #{}", obj.class_name, obj.id);
        draw_labeled_box(frame, obj.rect, &label, GREEN)?;
        draw_trail(frame, &obj.trail, YELLOW)?;
    }
    draw_frame_counter(frame, frame_index, total_frames)?;
    Ok(())
}

/// `<output_dir>/tracked_<file name>`
pub fn tracked_output_path(output_dir: &Path, video: &Path) -> PathBuf {
    output_dir.join(format!("tracked_{}", video_file_name(video)))
}

/// Run the periodic tracker over one video and write the annotated copy.
/// `detect` sees the raw frame on every detection frame.
pub fn track_video_periodic<F, D>(factory: F, mut detect: D, cfg: &Config, video: &Path) -> Result<PathBuf>
where
    F: TrackerFactory,
    D: FnMut(&Mat) -> Result<Vec<Seed>>,
{
    let output_dir = &cfg.output.output_dir;
    fs::create_dir_all(output_dir.join(video_stem(video)))?;

    let mut reader = VideoReader::open(video)?;
    let output_path = tracked_output_path(output_dir, video);
    let mut writer = create_writer(&output_path, reader.output_fps(), reader.width, reader.height)?;

    let mut tracker = PeriodicTracker::new(factory, &cfg.periodic);
    let progress_every = u64::from(cfg.periodic.progress_every.max(1));
    let mut frame_count: u64 = 0;

    while let Some(frame) = reader.read_frame()? {
        let objects = tracker.step(&frame, frame_count, &mut detect)?;

        let mut annotated = frame.clone();
        annotate_frame(&mut annotated, &objects, frame_count, reader.total_frames)?;
        writer.write(&annotated)?;

        frame_count += 1;
        if frame_count % progress_every == 0 {
            info!("Processed {}/{} frames", frame_count, reader.total_frames);
        }
    }

    reader.release()?;
    writer.release()?;
    info!(
        "Tracking completed ({} objects seen). Output saved to {}",
        tracker.issued_ids(),
        output_path.display()
    );
    Ok(output_path)
}

/// Periodic detection with the TorchScript detector and CSRT trackers.
pub fn cv_track_video(detector: &Detector, cfg: &Config, video: &Path) -> Result<PathBuf> {
    track_video_periodic(
        CsrtFactory,
        |frame| {
            Ok(detector
                .detect(frame)?
                .iter()
                .map(|d| Seed::from_detection(d, detector.class_name(d.class_id)))
                .collect())
        },
        cfg,
        video,
    )
}
