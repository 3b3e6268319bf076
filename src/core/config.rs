//! Runtime configuration of the state vector.
//!
//! The original formulation bakes these choices in at compile time; here
//! they are validated runtime fields (the dispatch cost vanishes next to
//! the sparse algebra), and the derived predicates gate the same code
//! paths.

use crate::error::{BaError, BaResult};

/// Which variables enter the state vector.
///
/// - `lm_dim`: 0 disables landmarks, 1 parameterizes them as inverse-depth
///   rays in their reference sensor frame, 3 as world XYZ.
/// - `pose_dim`: 6 is SE(3) only; 9 adds the world-frame velocity; 15 adds
///   gyroscope and accelerometer biases.
/// - The calibration flags select which blocks enter the global
///   calibration vector: gravity direction (2), camera intrinsics (N, from
///   the rig), and the sensor-to-body transform T_vs (6), laid out in that
///   order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateConfig {
    pub lm_dim: usize,
    pub pose_dim: usize,
    pub gravity_in_calib: bool,
    pub cam_params_in_calib: bool,
    pub tvs_in_calib: bool,
}

impl StateConfig {
    /// Visual-only configuration: landmarks + SE(3) poses, no calibration.
    pub fn visual(lm_dim: usize) -> BaResult<Self> {
        Self::new(lm_dim, 6)
    }

    /// Visual-inertial configuration: landmarks + full 15-dof pose states.
    pub fn visual_inertial(lm_dim: usize) -> BaResult<Self> {
        Self::new(lm_dim, 15)
    }

    pub fn new(lm_dim: usize, pose_dim: usize) -> BaResult<Self> {
        if !matches!(lm_dim, 0 | 1 | 3) {
            return Err(BaError::InvalidInput(format!(
                "lm_dim must be 0, 1 or 3, got {lm_dim}"
            )));
        }
        if !matches!(pose_dim, 6 | 9 | 15) {
            return Err(BaError::InvalidInput(format!(
                "pose_dim must be 6, 9 or 15, got {pose_dim}"
            )));
        }
        Ok(Self {
            lm_dim,
            pose_dim,
            gravity_in_calib: false,
            cam_params_in_calib: false,
            tvs_in_calib: false,
        })
    }

    pub fn with_gravity_in_calib(mut self) -> Self {
        self.gravity_in_calib = true;
        self
    }

    pub fn with_cam_params_in_calib(mut self) -> Self {
        self.cam_params_in_calib = true;
        self
    }

    pub fn with_tvs_in_calib(mut self) -> Self {
        self.tvs_in_calib = true;
        self
    }

    /// Velocity is part of the pose state.
    pub fn vel_in_state(&self) -> bool {
        self.pose_dim >= 9
    }

    /// Biases are part of the pose state.
    pub fn bias_in_state(&self) -> bool {
        self.pose_dim >= 15
    }

    /// The pose sub-dimension reprojection residuals see (they have no
    /// dependence on velocity or bias).
    pub fn pr_pose_dim(&self) -> usize {
        self.pose_dim.min(6)
    }

    /// Size of an inertial residual.
    pub fn imu_res_size(&self) -> usize {
        9 + if self.bias_in_state() { 6 } else { 0 }
    }

    /// Whether any projection-residual calibration Jacobian is used.
    pub fn jkpr_used(&self) -> bool {
        self.cam_params_in_calib || self.tvs_in_calib
    }

    /// Total calibration dimension given the rig's intrinsic count.
    pub fn calib_dim(&self, num_cam_params: usize) -> usize {
        (if self.gravity_in_calib { 2 } else { 0 })
            + (if self.cam_params_in_calib {
                num_cam_params
            } else {
                0
            })
            + (if self.tvs_in_calib { 6 } else { 0 })
    }

    /// Offset of the intrinsic block within the calibration vector.
    pub fn cam_params_offset(&self) -> usize {
        if self.gravity_in_calib {
            2
        } else {
            0
        }
    }

    /// Offset of the T_vs block within the calibration vector.
    pub fn tvs_offset(&self, num_cam_params: usize) -> usize {
        self.cam_params_offset()
            + if self.cam_params_in_calib {
                num_cam_params
            } else {
                0
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(StateConfig::new(2, 6).is_err());
        assert!(StateConfig::new(1, 12).is_err());
        assert!(StateConfig::new(3, 6).is_ok());
    }

    #[test]
    fn test_derived_predicates() {
        let c = StateConfig::new(1, 15).unwrap();
        assert!(c.vel_in_state());
        assert!(c.bias_in_state());
        assert_eq!(c.pr_pose_dim(), 6);
        assert_eq!(c.imu_res_size(), 15);

        let c = StateConfig::new(3, 6).unwrap();
        assert!(!c.vel_in_state());
        assert_eq!(c.imu_res_size(), 9);
    }

    #[test]
    fn test_calib_layout() {
        let c = StateConfig::new(1, 15)
            .unwrap()
            .with_gravity_in_calib()
            .with_cam_params_in_calib()
            .with_tvs_in_calib();
        assert_eq!(c.calib_dim(4), 12);
        assert_eq!(c.cam_params_offset(), 2);
        assert_eq!(c.tvs_offset(4), 6);

        let c = StateConfig::new(1, 6).unwrap().with_cam_params_in_calib();
        assert_eq!(c.calib_dim(5), 5);
        assert_eq!(c.cam_params_offset(), 0);
    }
}
