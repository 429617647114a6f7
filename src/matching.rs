use nalgebra::SVector;
use ndarray::Array2;

use crate::utils::compute_iou;

/// `1 - IoU` for every (track, detection) pair of tlwh boxes.
pub fn iou_distance(track_boxes: &[SVector<f32, 4>], det_boxes: &[SVector<f32, 4>]) -> Array2<f32> {
    let mut dists = Array2::zeros((track_boxes.len(), det_boxes.len()));
    for (i, t) in track_boxes.iter().enumerate() {
        for (j, d) in det_boxes.iter().enumerate() {
            dists[[i, j]] = 1.0 - compute_iou(t, d);
        }
    }
    dists
}

/// Weight IoU similarity by detection confidence.
pub fn fuse_score(cost_matrix: &mut Array2<f32>, scores: &[f32]) {
    for ((_, j), cost) in cost_matrix.indexed_iter_mut() {
        let iou_sim = 1.0 - *cost;
        *cost = 1.0 - iou_sim * scores[j];
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssignmentResult {
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

/// Minimum-cost assignment; pairs costing more than `thresh` are left unmatched.
pub fn linear_assignment(cost_matrix: &Array2<f32>, thresh: f32) -> AssignmentResult {
    let (num_rows, num_cols) = cost_matrix.dim();

    if num_rows == 0 || num_cols == 0 {
        return AssignmentResult {
            matches: vec![],
            unmatched_tracks: (0..num_rows).collect(),
            unmatched_detections: (0..num_cols).collect(),
        };
    }

    // lapjv wants a square matrix
    let size = num_rows.max(num_cols);
    let mut padded = Array2::<f64>::from_elem((size, size), 1e6);
    for ((i, j), &c) in cost_matrix.indexed_iter() {
        padded[[i, j]] = c as f64;
    }

    let mut result = AssignmentResult::default();
    let mut det_unmatched = vec![true; num_cols];

    match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => {
            for (row, &col) in row_to_col.iter().enumerate().take(num_rows) {
                if col < num_cols && cost_matrix[[row, col]] <= thresh {
                    result.matches.push((row, col));
                    det_unmatched[col] = false;
                } else {
                    result.unmatched_tracks.push(row);
                }
            }
        }
        Err(_) => result.unmatched_tracks = (0..num_rows).collect(),
    }

    result.unmatched_detections = det_unmatched
        .iter()
        .enumerate()
        .filter_map(|(j, &u)| u.then_some(j))
        .collect();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn bx(x: f32, y: f32) -> SVector<f32, 4> {
        SVector::<f32, 4>::new(x, y, 10.0, 10.0)
    }

    #[test]
    fn test_iou_distance_shape_and_values() {
        let d = iou_distance(&[bx(0.0, 0.0), bx(100.0, 100.0)], &[bx(0.0, 0.0)]);
        assert_eq!(d.dim(), (2, 1));
        assert!(d[[0, 0]].abs() < 1e-6);
        assert_eq!(d[[1, 0]], 1.0);
    }

    #[test]
    fn test_assignment_prefers_global_optimum() {
        // greedy row-by-row would take (0,0) and force (1,1) at 0.9
        let cost = array![[0.1, 0.2], [0.15, 0.9]];
        let r = linear_assignment(&cost, 0.8);
        assert_eq!(r.matches, vec![(0, 1), (1, 0)]);
        assert!(r.unmatched_tracks.is_empty());
        assert!(r.unmatched_detections.is_empty());
    }

    #[test]
    fn test_assignment_respects_threshold_and_rectangular() {
        let cost = array![[0.9, 0.3, 0.95]];
        let r = linear_assignment(&cost, 0.5);
        assert_eq!(r.matches, vec![(0, 1)]);
        assert_eq!(r.unmatched_detections, vec![0, 2]);
    }

    #[test]
    fn test_assignment_empty() {
        let cost = Array2::<f32>::zeros((0, 3));
        let r = linear_assignment(&cost, 0.5);
        assert!(r.matches.is_empty());
        assert_eq!(r.unmatched_detections, vec![0, 1, 2]);
    }

    #[test]
    fn test_fuse_score() {
        let mut cost = array![[0.2_f32]];
        fuse_score(&mut cost, &[0.5]);
        assert!((cost[[0, 0]] - 0.6).abs() < 1e-6);
    }
}
