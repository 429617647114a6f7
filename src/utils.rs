use nalgebra::SVector;
use opencv::{
    core::{Point, Rect, Scalar},
    imgproc,
    prelude::*,
};

/// Perform non-max suppression on boxes & scores, return indices to keep.
/// Boxes are `[x, y, w, h]`.
pub fn nms(boxes: &[[f32; 4]], scores: &[f32], iou_thresh: f32) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..boxes.len()).collect();
    idxs.sort_unstable_by(|&i, &j| scores[j].total_cmp(&scores[i]));
    let mut keep = Vec::new();
    while let Some(&i) = idxs.first() {
        keep.push(i);
        idxs = idxs
            .into_iter()
            .skip(1)
            .filter(|&j| compute_iou_array(&boxes[i], &boxes[j]) < iou_thresh)
            .collect();
    }
    keep
}

pub fn draw_box(img: &mut Mat, rect: Rect, color: Scalar, thickness: i32) -> opencv::Result<()> {
    imgproc::rectangle(img, rect, color, thickness, imgproc::LINE_8, 0)
}

pub fn put_text(
    img: &mut Mat,
    text: &str,
    org: (i32, i32),
    color: Scalar,
    font_scale: f64,
    thickness: i32,
) -> opencv::Result<()> {
    imgproc::put_text(
        img,
        text,
        Point::new(org.0, org.1),
        imgproc::FONT_HERSHEY_SIMPLEX,
        font_scale,
        color,
        thickness,
        imgproc::LINE_8,
        false,
    )
}

/// Compute IoU between two bounding boxes as arrays: [x1, y1, w, h]
pub fn compute_iou_array(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    compute_iou_tlbr(
        [a[0], a[1], a[0] + a[2], a[1] + a[3]],
        [b[0], b[1], b[0] + b[2], b[1] + b[3]],
    )
}

/// Compute IoU between two tlwh boxes.
pub fn compute_iou(a: &SVector<f32, 4>, b: &SVector<f32, 4>) -> f32 {
    compute_iou_array(&[a[0], a[1], a[2], a[3]], &[b[0], b[1], b[2], b[3]])
}

fn compute_iou_tlbr(a: [f32; 4], b: [f32; 4]) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let a_area = (a[2] - a[0]) * (a[3] - a[1]);
    let b_area = (b[2] - b[0]) * (b[3] - b[1]);

    let union = a_area + b_area - inter_area;
    if union <= 0.0 {
        return 0.0;
    }
    inter_area / union
}
