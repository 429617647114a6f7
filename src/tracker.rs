use anyhow::Result;
use nalgebra::SVector;
use opencv::{
    calib3d,
    core::{self, Mat, Point2f, Size, TermCriteria, Vector},
    imgproc,
    prelude::*,
    video,
};
use tracing::debug;

use crate::config::TrackerConfig;
use crate::detection::Detection;
use crate::kalman_filter::{KalmanFilter, StateCov, StateMean};
use crate::matching::{fuse_score, iou_distance, linear_assignment};

/// Second association runs at a fixed IoU gate, as in ByteTrack.
const LOW_SCORE_MATCH_THRESH: f32 = 0.5;
const UNCONFIRMED_MATCH_THRESH: f32 = 0.7;
const DUPLICATE_IOU_DIST: f32 = 0.15;
const CLASS_HISTORY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    New,
    Tracked,
    Lost,
    Removed,
}

/// Single tracked object.
#[derive(Debug, Clone)]
pub struct STrack {
    /// Track state vector (x,y,w,h,vx,vy,vw,vh)
    mean: StateMean,
    covariance: StateCov,
    /// Bounding box in (tlwh) format
    pub tlwh: SVector<f32, 4>,
    /// Score of the last associated detection
    pub score: f32,
    pub track_id: u32,
    pub state: TrackState,
    is_activated: bool,
    /// Last frame this track was associated
    frame_id: u32,
    start_frame: u32,
    tracklet_len: u32,
    /// Majority vote over `class_hist`
    pub class_id: i32,
    class_hist: Vec<i32>,
}

impl STrack {
    /// Create a tentative track from a detection.
    pub fn new(det: &Detection, kalman: &KalmanFilter) -> Self {
        let (mean, covariance) = kalman.initiate(&det.tlwh);
        STrack {
            mean,
            covariance,
            tlwh: det.tlwh,
            score: det.confidence,
            track_id: 0,
            state: TrackState::New,
            is_activated: false,
            frame_id: 0,
            start_frame: 0,
            tracklet_len: 0,
            class_id: det.class_id,
            class_hist: vec![det.class_id],
        }
    }

    fn sync_tlwh(&mut self) {
        self.tlwh = self.mean.fixed_rows::<4>(0).clone_owned();
    }

    pub fn predict(&mut self, kalman: &KalmanFilter) {
        if self.state != TrackState::Tracked {
            // lost tracks keep their size
            self.mean[6] = 0.0;
            self.mean[7] = 0.0;
        }
        let (mean, covariance) = kalman.predict(&self.mean, &self.covariance);
        self.mean = mean;
        self.covariance = covariance;
        self.sync_tlwh();
    }

    fn vote_class(&mut self, class_id: i32) {
        self.class_hist.push(class_id);
        if self.class_hist.len() > CLASS_HISTORY {
            self.class_hist.remove(0);
        }
        let mut counts = std::collections::HashMap::new();
        for &c in &self.class_hist {
            *counts.entry(c).or_insert(0usize) += 1;
        }
        self.class_id = counts
            .into_iter()
            .max_by_key(|&(c, n)| (n, c == class_id))
            .map(|(c, _)| c)
            .unwrap_or(class_id);
    }

    /// Associate a detection with a currently tracked object.
    pub fn update(&mut self, det: &Detection, kalman: &KalmanFilter, frame_id: u32) {
        let (mean, covariance) = kalman.update(&self.mean, &self.covariance, &det.tlwh);
        self.mean = mean;
        self.covariance = covariance;
        self.sync_tlwh();
        self.frame_id = frame_id;
        self.tracklet_len += 1;
        self.state = TrackState::Tracked;
        self.is_activated = true;
        self.score = det.confidence;
        self.vote_class(det.class_id);
    }

    /// Start a new tracklet. Only tracks born on the first frame are
    /// confirmed immediately.
    pub fn activate(&mut self, kalman: &KalmanFilter, frame_id: u32, track_id: u32) {
        let (mean, covariance) = kalman.initiate(&self.tlwh);
        self.mean = mean;
        self.covariance = covariance;
        self.track_id = track_id;
        self.tracklet_len = 0;
        self.state = TrackState::Tracked;
        self.is_activated = frame_id == 1;
        self.frame_id = frame_id;
        self.start_frame = frame_id;
    }

    /// Bring a lost track back with a new detection.
    pub fn re_activate(&mut self, det: &Detection, kalman: &KalmanFilter, frame_id: u32) {
        let (mean, covariance) = kalman.update(&self.mean, &self.covariance, &det.tlwh);
        self.mean = mean;
        self.covariance = covariance;
        self.sync_tlwh();
        self.tracklet_len = 0;
        self.state = TrackState::Tracked;
        self.is_activated = true;
        self.frame_id = frame_id;
        self.score = det.confidence;
        self.vote_class(det.class_id);
    }

    pub fn mark_lost(&mut self) {
        self.state = TrackState::Lost;
    }

    pub fn mark_removed(&mut self) {
        self.state = TrackState::Removed;
    }

    pub fn is_activated(&self) -> bool {
        self.is_activated
    }

    pub fn tlwh(&self) -> &SVector<f32, 4> {
        &self.tlwh
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    pub fn end_frame(&self) -> u32 {
        self.frame_id
    }

    fn age(&self) -> u32 {
        self.frame_id - self.start_frame
    }
}

/// Global motion compensation from sparse optical flow between frames.
pub struct GMC {
    prev_frame: Option<Mat>,
    prev_pts: Vector<Point2f>,
    max_corners: i32,
    quality_level: f64,
    min_distance: f64,
    block_size: i32,
    win_size: i32,
    max_level: i32,
    criteria: TermCriteria,
}

impl GMC {
    pub fn new() -> Result<Self> {
        Ok(GMC {
            prev_frame: None,
            prev_pts: Vector::new(),
            max_corners: 1000,
            quality_level: 0.01,
            min_distance: 1.0,
            block_size: 3,
            win_size: 15,
            max_level: 3,
            criteria: TermCriteria::new(
                core::TermCriteria_Type::COUNT as i32 | core::TermCriteria_Type::EPS as i32,
                30,
                0.01,
            )?,
        })
    }

    fn corners(&self, gray: &Mat) -> Result<Vector<Point2f>> {
        let mut corners = Vector::<Point2f>::new();
        imgproc::good_features_to_track(
            gray,
            &mut corners,
            self.max_corners,
            self.quality_level,
            self.min_distance,
            &Mat::default(),
            self.block_size,
            false,
            0.04,
        )?;
        Ok(corners)
    }

    /// Homography from the previous frame to `frame`, or `None` on the first
    /// frame or when too few points survive.
    pub fn apply(&mut self, frame: &Mat) -> Result<Option<Mat>> {
        let mut gray = Mat::default();
        imgproc::cvt_color(frame, &mut gray, imgproc::COLOR_BGR2GRAY, 0)?;
        let curr_corners = self.corners(&gray)?;

        let prev_frame = match self.prev_frame.replace(gray.clone()) {
            Some(prev) if !self.prev_pts.is_empty() => prev,
            _ => {
                self.prev_pts = curr_corners;
                return Ok(None);
            }
        };

        let mut curr_pts = Vector::<Point2f>::new();
        let mut status = Vector::<u8>::new();
        let mut err = Vector::<f32>::new();
        video::calc_optical_flow_pyr_lk(
            &prev_frame,
            &gray,
            &self.prev_pts,
            &mut curr_pts,
            &mut status,
            &mut err,
            Size::new(self.win_size, self.win_size),
            self.max_level,
            self.criteria,
            0,
            1e-4,
        )?;

        let mut prev_good = Vector::<Point2f>::new();
        let mut curr_good = Vector::<Point2f>::new();
        for (i, ok) in status.iter().enumerate() {
            if ok != 0 {
                prev_good.push(self.prev_pts.get(i)?);
                curr_good.push(curr_pts.get(i)?);
            }
        }
        self.prev_pts = curr_corners;

        if prev_good.len() < 4 {
            return Ok(None);
        }
        let homography = calib3d::find_homography(
            &prev_good,
            &curr_good,
            &mut Mat::default(),
            calib3d::RANSAC,
            3.0,
        )?;
        Ok((!homography.empty()).then_some(homography))
    }

    /// Move a track's predicted box by the camera motion.
    pub fn apply_to_track(track: &mut STrack, homography: &Mat) -> Result<()> {
        let mut pts = Vector::<Point2f>::new();
        pts.push(Point2f::new(track.mean[0], track.mean[1]));
        pts.push(Point2f::new(
            track.mean[0] + track.mean[2],
            track.mean[1] + track.mean[3],
        ));
        let mut dst = Vector::<Point2f>::new();
        core::perspective_transform(&pts, &mut dst, homography)?;

        let p1 = dst.get(0)?;
        let p2 = dst.get(1)?;
        track.mean[0] = p1.x;
        track.mean[1] = p1.y;
        track.mean[2] = p2.x - p1.x;
        track.mean[3] = p2.y - p1.y;
        track.sync_tlwh();
        Ok(())
    }
}

/// BoT-SORT style multi-object tracker: Kalman motion, camera motion
/// compensation, and two-stage (high then low score) IoU association.
pub struct BotSort {
    kalman: KalmanFilter,
    gmc: Option<GMC>,
    tracked_stracks: Vec<STrack>,
    lost_stracks: Vec<STrack>,
    frame_id: u32,
    track_id_count: u32,
    cfg: TrackerConfig,
    max_time_lost: u32,
}

impl BotSort {
    pub fn new(cfg: &TrackerConfig, frame_rate: f64) -> Result<Self> {
        let gmc = if cfg.gmc { Some(GMC::new()?) } else { None };
        let max_time_lost = ((frame_rate / 30.0) * cfg.track_buffer as f64) as u32;
        Ok(BotSort {
            kalman: KalmanFilter::new(),
            gmc,
            tracked_stracks: Vec::new(),
            lost_stracks: Vec::new(),
            frame_id: 0,
            track_id_count: 0,
            cfg: cfg.clone(),
            max_time_lost,
        })
    }

    pub fn tracked(&self) -> &[STrack] {
        &self.tracked_stracks
    }

    pub fn lost(&self) -> &[STrack] {
        &self.lost_stracks
    }

    fn next_id(&mut self) -> u32 {
        self.track_id_count += 1;
        self.track_id_count
    }

    fn association_cost(&self, tracks: &[&STrack], dets: &[&Detection]) -> ndarray::Array2<f32> {
        let t_boxes: Vec<_> = tracks.iter().map(|t| t.tlwh).collect();
        let d_boxes: Vec<_> = dets.iter().map(|d| d.tlwh).collect();
        let mut cost = iou_distance(&t_boxes, &d_boxes);
        if self.cfg.fuse_score {
            let scores: Vec<f32> = dets.iter().map(|d| d.confidence).collect();
            fuse_score(&mut cost, &scores);
        }
        cost
    }

    /// Feed one frame of detections and return the confirmed, currently
    /// tracked objects.
    pub fn update(&mut self, dets: &[Detection], frame: &Mat) -> Result<Vec<STrack>> {
        self.frame_id += 1;
        let frame_id = self.frame_id;

        let high: Vec<&Detection> = dets
            .iter()
            .filter(|d| d.confidence >= self.cfg.track_high_thresh)
            .collect();
        let low: Vec<&Detection> = dets
            .iter()
            .filter(|d| {
                d.confidence > self.cfg.track_low_thresh && d.confidence < self.cfg.track_high_thresh
            })
            .collect();

        let (mut pool, mut unconfirmed): (Vec<STrack>, Vec<STrack>) =
            std::mem::take(&mut self.tracked_stracks)
                .into_iter()
                .partition(|t| t.is_activated());
        pool.append(&mut self.lost_stracks);

        for track in pool.iter_mut() {
            track.predict(&self.kalman);
        }

        if let Some(gmc) = self.gmc.as_mut() {
            if let Some(h) = gmc.apply(frame)? {
                for track in pool.iter_mut().chain(unconfirmed.iter_mut()) {
                    GMC::apply_to_track(track, &h)?;
                }
            }
        }

        // First association: high score detections against tracked + lost
        let cost = {
            let refs: Vec<&STrack> = pool.iter().collect();
            self.association_cost(&refs, &high)
        };
        let first = linear_assignment(&cost, self.cfg.match_thresh);
        for &(ti, di) in &first.matches {
            let track = &mut pool[ti];
            if track.state == TrackState::Tracked {
                track.update(high[di], &self.kalman, frame_id);
            } else {
                track.re_activate(high[di], &self.kalman, frame_id);
            }
        }

        // Second association: low score detections against still-tracked leftovers
        let r_tracked: Vec<usize> = first
            .unmatched_tracks
            .iter()
            .copied()
            .filter(|&i| pool[i].state == TrackState::Tracked)
            .collect();
        let cost = {
            let refs: Vec<&STrack> = r_tracked.iter().map(|&i| &pool[i]).collect();
            let t_boxes: Vec<_> = refs.iter().map(|t| t.tlwh).collect();
            let d_boxes: Vec<_> = low.iter().map(|d| d.tlwh).collect();
            iou_distance(&t_boxes, &d_boxes)
        };
        let second = linear_assignment(&cost, LOW_SCORE_MATCH_THRESH);
        for &(ri, di) in &second.matches {
            pool[r_tracked[ri]].update(low[di], &self.kalman, frame_id);
        }
        for &ri in &second.unmatched_tracks {
            pool[r_tracked[ri]].mark_lost();
        }

        // Tentative tracks get one more chance with the remaining high detections
        let leftover: Vec<&Detection> = first.unmatched_detections.iter().map(|&i| high[i]).collect();
        let cost = {
            let refs: Vec<&STrack> = unconfirmed.iter().collect();
            self.association_cost(&refs, &leftover)
        };
        let third = linear_assignment(&cost, UNCONFIRMED_MATCH_THRESH);
        for &(ti, di) in &third.matches {
            unconfirmed[ti].update(leftover[di], &self.kalman, frame_id);
        }
        for &ti in &third.unmatched_tracks {
            unconfirmed[ti].mark_removed();
        }

        let mut born = Vec::new();
        for &di in &third.unmatched_detections {
            let det = leftover[di];
            if det.confidence < self.cfg.new_track_thresh {
                continue;
            }
            let mut track = STrack::new(det, &self.kalman);
            let id = self.next_id();
            track.activate(&self.kalman, frame_id, id);
            born.push(track);
        }

        let mut tracked = Vec::new();
        let mut lost = Vec::new();
        for mut track in pool.into_iter().chain(unconfirmed).chain(born) {
            match track.state {
                TrackState::Tracked => tracked.push(track),
                TrackState::Lost if frame_id - track.end_frame() > self.max_time_lost => {
                    track.mark_removed();
                    debug!("track {} removed after {} frames lost", track.track_id, self.max_time_lost);
                }
                TrackState::Lost => lost.push(track),
                TrackState::New | TrackState::Removed => {}
            }
        }

        let (tracked, lost) = remove_duplicate_stracks(tracked, lost);
        self.tracked_stracks = tracked;
        self.lost_stracks = lost;

        Ok(self
            .tracked_stracks
            .iter()
            .filter(|t| t.is_activated())
            .cloned()
            .collect())
    }
}

/// Drop tracked/lost pairs that overlap almost entirely, keeping the older one.
fn remove_duplicate_stracks(a: Vec<STrack>, b: Vec<STrack>) -> (Vec<STrack>, Vec<STrack>) {
    let a_boxes: Vec<_> = a.iter().map(|t| t.tlwh).collect();
    let b_boxes: Vec<_> = b.iter().map(|t| t.tlwh).collect();
    let dist = iou_distance(&a_boxes, &b_boxes);

    let mut drop_a = vec![false; a.len()];
    let mut drop_b = vec![false; b.len()];
    for ((i, j), &d) in dist.indexed_iter() {
        if d < DUPLICATE_IOU_DIST {
            if a[i].age() > b[j].age() {
                drop_b[j] = true;
            } else {
                drop_a[i] = true;
            }
        }
    }

    let keep = |v: Vec<STrack>, drop: Vec<bool>| {
        v.into_iter()
            .zip(drop)
            .filter_map(|(t, d)| (!d).then_some(t))
            .collect::<Vec<_>>()
    };
    (keep(a, drop_a), keep(b, drop_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use opencv::core::{Rect_, Scalar, CV_8UC3};

    fn det(x: f32, y: f32, score: f32) -> Detection {
        Detection::new(SVector::<f32, 4>::new(x, y, 50.0, 50.0), score, 0)
    }

    fn tracker() -> BotSort {
        let cfg = TrackerConfig {
            gmc: false,
            ..TrackerConfig::default()
        };
        BotSort::new(&cfg, 30.0).unwrap()
    }

    #[test]
    fn test_strack_lifecycle() {
        let kf = KalmanFilter::new();
        let mut track = STrack::new(&det(100.0, 100.0, 0.9), &kf);
        assert_eq!(track.state, TrackState::New);

        track.activate(&kf, 1, 1);
        assert_eq!(track.state, TrackState::Tracked);
        assert!(track.is_activated());

        track.mark_lost();
        assert_eq!(track.state, TrackState::Lost);

        track.re_activate(&det(110.0, 105.0, 0.95), &kf, 2);
        assert_eq!(track.state, TrackState::Tracked);
        assert_eq!(track.end_frame(), 2);
    }

    #[test]
    fn test_class_vote_keeps_majority() {
        let kf = KalmanFilter::new();
        let mut track = STrack::new(&det(0.0, 0.0, 0.9), &kf);
        track.activate(&kf, 1, 1);
        let mut other = det(0.0, 0.0, 0.9);
        other.class_id = 3;
        track.update(&det(0.0, 0.0, 0.9), &kf, 2);
        track.update(&other, &kf, 3);
        assert_eq!(track.class_id, 0);
    }

    #[test]
    fn test_ids_persist_across_frames() {
        let mut t = tracker();
        let frame = Mat::default();

        let out = t.update(&[det(100.0, 100.0, 0.9), det(300.0, 300.0, 0.8)], &frame).unwrap();
        assert_eq!(out.len(), 2);
        let mut ids: Vec<u32> = out.iter().map(|s| s.track_id()).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);

        let out = t.update(&[det(104.0, 102.0, 0.85), det(303.0, 298.0, 0.75)], &frame).unwrap();
        assert_eq!(out.len(), 2);
        let near_first = out.iter().find(|s| s.tlwh[0] < 200.0).unwrap();
        assert_eq!(near_first.track_id(), 1);
        assert!(t.lost().is_empty());
    }

    #[test]
    fn test_new_tracks_after_first_frame_are_tentative() {
        let mut t = tracker();
        let frame = Mat::default();
        t.update(&[], &frame).unwrap();

        let out = t.update(&[det(50.0, 50.0, 0.9)], &frame).unwrap();
        assert!(out.is_empty());
        assert_eq!(t.tracked().len(), 1);

        let out = t.update(&[det(51.0, 50.0, 0.9)], &frame).unwrap();
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_low_score_detection_keeps_track_alive() {
        let mut t = tracker();
        let frame = Mat::default();
        t.update(&[det(100.0, 100.0, 0.9)], &frame).unwrap();
        let out = t.update(&[det(101.0, 100.0, 0.15)], &frame).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id(), 1);
    }

    #[test]
    fn test_lost_track_recovered_then_expired() {
        let mut t = tracker();
        let frame = Mat::default();
        t.update(&[det(100.0, 100.0, 0.9)], &frame).unwrap();
        t.update(&[], &frame).unwrap();
        assert_eq!(t.lost().len(), 1);

        let out = t.update(&[det(100.0, 100.0, 0.9)], &frame).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].track_id(), 1);

        for _ in 0..=31 {
            t.update(&[], &frame).unwrap();
        }
        assert!(t.lost().is_empty());
        assert!(t.tracked().is_empty());
    }

    #[test]
    fn test_gmc_first_frame_returns_none() {
        let mut gmc = GMC::new().unwrap();
        let frame =
            Mat::new_size_with_default(Size::new(640, 480), CV_8UC3, Scalar::all(0.0)).unwrap();
        assert!(gmc.apply(&frame).unwrap().is_none());
    }

    #[test]
    fn test_gmc_track_compensation() {
        let mut gmc = GMC::new().unwrap();
        let mut frame1 = Mat::new_size_with_default(
            Size::new(640, 480),
            CV_8UC3,
            Scalar::new(255.0, 255.0, 255.0, 0.0),
        )
        .unwrap();
        let mut frame2 = frame1.clone();
        for (frame, dx, dy) in [(&mut frame1, 0, 0), (&mut frame2, 20, 10)] {
            for i in 0..4 {
                for j in 0..3 {
                    imgproc::rectangle(
                        frame,
                        Rect_::new(60 + i * 130 + dx, 60 + j * 120 + dy, 50, 50),
                        Scalar::new(0.0, 0.0, 0.0, 0.0),
                        -1,
                        imgproc::LINE_8,
                        0,
                    )
                    .unwrap();
                }
            }
        }

        gmc.apply(&frame1).unwrap();
        let kf = KalmanFilter::new();
        let mut track = STrack::new(&det(100.0, 100.0, 1.0), &kf);
        let homography = gmc.apply(&frame2).unwrap().unwrap();
        GMC::apply_to_track(&mut track, &homography).unwrap();

        assert_relative_eq!(track.tlwh[0], 120.0, epsilon = 5.0);
        assert_relative_eq!(track.tlwh[1], 110.0, epsilon = 5.0);
    }
}
