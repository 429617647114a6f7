use opencv::{
    core::{Point, Rect, Scalar, Vector},
    imgproc,
    prelude::*,
};

use crate::tracker::STrack;
use crate::utils::{draw_box, put_text};

pub const GREEN: Scalar = Scalar::new(0.0, 255.0, 0.0, 0.0);
pub const YELLOW: Scalar = Scalar::new(0.0, 255.0, 255.0, 0.0);
pub const RED: Scalar = Scalar::new(0.0, 0.0, 255.0, 0.0);

const PALETTE: &[Scalar] = &[
    Scalar::new(56.0, 56.0, 255.0, 0.0),
    Scalar::new(151.0, 157.0, 255.0, 0.0),
    Scalar::new(31.0, 112.0, 255.0, 0.0),
    Scalar::new(29.0, 178.0, 255.0, 0.0),
    Scalar::new(49.0, 210.0, 207.0, 0.0),
    Scalar::new(10.0, 249.0, 72.0, 0.0),
];

pub fn id_color(id: u32) -> Scalar {
    PALETTE[id as usize % PALETTE.len()]
}

/// Box with a label 10px above its top-left corner.
pub fn draw_labeled_box(frame: &mut Mat, rect: Rect, label: &str, color: Scalar) -> opencv::Result<()> {
    draw_box(frame, rect, color, 2)?;
    put_text(frame, label, (rect.x, rect.y - 10), color, 0.5, 2)
}

/// Open polyline through the trail points.
pub fn draw_trail(frame: &mut Mat, trail: &[Point], color: Scalar) -> opencv::Result<()> {
    if trail.len() < 2 {
        return Ok(());
    }
    let mut polys = Vector::<Vector<Point>>::new();
    polys.push(Vector::from_slice(trail));
    imgproc::polylines(frame, &polys, false, color, 2, imgproc::LINE_8, 0)
}

pub fn draw_frame_counter(frame: &mut Mat, frame_id: u64, total_frames: i32) -> opencv::Result<()> {
    put_text(
        frame,
        &format!("Frame: {}/{}", frame_id, total_frames),
        (10, 30),
        RED,
        0.6,
        2,
    )
}

pub fn draw_track(frame: &mut Mat, track: &STrack, class_name: &str) -> opencv::Result<()> {
    let tlwh = track.tlwh();
    let rect = Rect::new(
        tlwh[0] as i32,
        tlwh[1] as i32,
        tlwh[2] as i32,
        tlwh[3] as i32,
    );
    let label = format!("id:{} {} {:.2}", track.track_id(), class_name, track.score);
    draw_labeled_box(frame, rect, &label, id_color(track.track_id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Size, CV_8UC3};

    fn blank() -> Mat {
        Mat::new_size_with_default(Size::new(200, 100), CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    #[test]
    fn test_draw_labeled_box_paints_border() {
        let mut frame = blank();
        draw_labeled_box(&mut frame, Rect::new(50, 40, 30, 30), "pothole #0", GREEN).unwrap();
        let px = frame.at_2d::<opencv::core::Vec3b>(40, 60).unwrap();
        assert_eq!(px[1], 255);
    }

    #[test]
    fn test_draw_trail_ignores_single_point() {
        let mut frame = blank();
        draw_trail(&mut frame, &[Point::new(5, 5)], YELLOW).unwrap();
        let px = frame.at_2d::<opencv::core::Vec3b>(5, 5).unwrap();
        assert_eq!(px[0], 0);
    }
}
