use nalgebra::{Matrix4, SMatrix, SVector};

pub type StateMean = SVector<f32, 8>;
pub type StateCov = SMatrix<f32, 8, 8>;

/// Constant-velocity Kalman filter over a box (x, y, w, h) and its velocities.
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: SMatrix<f32, 8, 8>,
    update_mat: SMatrix<f32, 4, 8>,
    std_weight_position: f32,
    std_weight_velocity: f32,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    pub fn new() -> Self {
        let ndim = 4;
        let dt = 1.0;
        let mut motion_mat = SMatrix::<f32, 8, 8>::identity();
        for i in 0..ndim {
            motion_mat[(i, ndim + i)] = dt;
        }
        KalmanFilter {
            motion_mat,
            update_mat: SMatrix::<f32, 4, 8>::identity(),
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }

    /// Create track state from an unassociated measurement.
    pub fn initiate(&self, measurement: &SVector<f32, 4>) -> (StateMean, StateCov) {
        let mut mean = StateMean::zeros();
        mean.fixed_rows_mut::<4>(0).copy_from(measurement);
        let (w, h) = (measurement[2], measurement[3]);
        let std = StateMean::from_iterator([
            2.0 * self.std_weight_position * w,
            2.0 * self.std_weight_position * h,
            2.0 * self.std_weight_position * w,
            2.0 * self.std_weight_position * h,
            10.0 * self.std_weight_velocity * w,
            10.0 * self.std_weight_velocity * h,
            10.0 * self.std_weight_velocity * w,
            10.0 * self.std_weight_velocity * h,
        ]);
        (mean, StateCov::from_diagonal(&std.component_mul(&std)))
    }

    /// x' = F x, P' = F P F^T + Q
    pub fn predict(&self, mean: &StateMean, covariance: &StateCov) -> (StateMean, StateCov) {
        let (w, h) = (mean[2], mean[3]);
        let std = StateMean::from_iterator([
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_velocity * w,
            self.std_weight_velocity * h,
            self.std_weight_velocity * w,
            self.std_weight_velocity * h,
        ]);
        let q = StateCov::from_diagonal(&std.component_mul(&std));

        let new_mean = self.motion_mat * mean;
        let new_cov = self.motion_mat * covariance * self.motion_mat.transpose() + q;
        (new_mean, new_cov)
    }

    /// z = H x, S = H P H^T + R
    pub fn project(&self, mean: &StateMean, covariance: &StateCov) -> (SVector<f32, 4>, Matrix4<f32>) {
        let (w, h) = (mean[2], mean[3]);
        let std = SVector::<f32, 4>::new(
            self.std_weight_position * w,
            self.std_weight_position * h,
            self.std_weight_position * w,
            self.std_weight_position * h,
        );
        let r = Matrix4::from_diagonal(&std.component_mul(&std));
        let z = self.update_mat * mean;
        let s = self.update_mat * covariance * self.update_mat.transpose() + r;
        (z, s)
    }

    /// Kalman correction step.
    pub fn update(
        &self,
        mean: &StateMean,
        covariance: &StateCov,
        measurement: &SVector<f32, 4>,
    ) -> (StateMean, StateCov) {
        let (projected_mean, projected_cov) = self.project(mean, covariance);
        let pht: SMatrix<f32, 8, 4> = covariance * self.update_mat.transpose();

        let s_reg = projected_cov + Matrix4::identity() * 1e-8;
        // K = P H^T S^-1, solved as S K^T = (P H^T)^T
        let gain: SMatrix<f32, 8, 4> = match s_reg.lu().solve(&pht.transpose()) {
            Some(k_t) => k_t.transpose(),
            None => pht * (projected_cov + Matrix4::identity() * 1e-4)
                .try_inverse()
                .unwrap_or_else(|| Matrix4::identity() * 0.01),
        };

        let innovation = measurement - projected_mean;
        let new_mean = mean + gain * innovation;

        // Joseph form
        let i_kh = StateCov::identity() - gain * self.update_mat;
        let r = projected_cov - self.update_mat * covariance * self.update_mat.transpose();
        let new_cov = i_kh * covariance * i_kh.transpose() + gain * r * gain.transpose();
        (new_mean, new_cov)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_initiate_zero_velocity() {
        let kf = KalmanFilter::new();
        let (mean, cov) = kf.initiate(&SVector::<f32, 4>::new(100.0, 100.0, 50.0, 50.0));
        assert_eq!(mean[0], 100.0);
        assert_eq!(mean[4], 0.0);
        for i in 0..8 {
            assert!(cov[(i, i)] > 0.0);
        }
        assert_eq!(cov[(0, 1)], 0.0);
    }

    #[test]
    fn test_predict_moves_with_velocity() {
        let kf = KalmanFilter::new();
        let (mut mean, cov) = kf.initiate(&SVector::<f32, 4>::new(100.0, 100.0, 50.0, 50.0));
        mean[4] = 10.0;
        mean[5] = 5.0;
        let (pred, pred_cov) = kf.predict(&mean, &cov);
        assert_relative_eq!(pred[0], 110.0);
        assert_relative_eq!(pred[1], 105.0);
        assert_relative_eq!(pred[2], 50.0);
        assert!(pred_cov[(0, 0)] > cov[(0, 0)]);
    }

    #[test]
    fn test_update_moves_towards_measurement() {
        let kf = KalmanFilter::new();
        let (mean, cov) = kf.initiate(&SVector::<f32, 4>::new(100.0, 100.0, 50.0, 50.0));
        let z = SVector::<f32, 4>::new(110.0, 105.0, 50.0, 50.0);
        let (new_mean, new_cov) = kf.update(&mean, &cov, &z);
        assert!(new_mean[0] > 100.0 && new_mean[0] < 110.0);
        assert!(new_mean[1] > 100.0 && new_mean[1] < 105.0);
        assert!(new_cov[(0, 0)] < cov[(0, 0)]);
    }
}

