//! Pose, landmark, and the stacked update vector.
//!
//! Poses and landmarks reference each other only through integer ids, and
//! residuals reference both by id; ownership is a flat arena with no
//! cycles.

use nalgebra::{DMatrix, DVector, Isometry3, Vector2, Vector3, Vector4, Vector6};

use crate::camera::Rig;

/// A body pose with its optional inertial state.
#[derive(Debug, Clone)]
pub struct Pose {
    pub id: usize,
    /// Dense index within the active set, valid only when `is_active`.
    pub opt_id: usize,
    pub is_active: bool,
    /// Body-to-world transform
    pub t_wp: Isometry3<f64>,
    /// World-frame velocity
    pub v_w: Vector3<f64>,
    /// Biases stacked as `[b_g, b_a]`
    pub b: Vector6<f64>,
    /// Per-pose camera intrinsics (empty unless per-pose intrinsics are on)
    pub cam_params: DVector<f64>,
    /// Cached world-to-sensor transforms, one per rig camera; cleared on
    /// every state update
    pub t_sw: Vec<Isometry3<f64>>,
    /// Per-parameter optimization mask; a false bit freezes the parameter
    pub param_mask: Vec<bool>,
    pub is_param_mask_used: bool,
    pub proj_residuals: Vec<usize>,
    pub binary_residuals: Vec<usize>,
    pub unary_residuals: Vec<usize>,
    pub inertial_residuals: Vec<usize>,
}

impl Pose {
    pub fn new(id: usize, t_wp: Isometry3<f64>, is_active: bool, pose_dim: usize) -> Self {
        Self {
            id,
            opt_id: 0,
            is_active,
            t_wp,
            v_w: Vector3::zeros(),
            b: Vector6::zeros(),
            cam_params: DVector::zeros(0),
            t_sw: Vec::new(),
            param_mask: vec![true; pose_dim],
            is_param_mask_used: false,
            proj_residuals: Vec::new(),
            binary_residuals: Vec::new(),
            unary_residuals: Vec::new(),
            inertial_residuals: Vec::new(),
        }
    }

    /// World-to-sensor transform for camera `cam_id`, from the cache when
    /// warm.
    pub fn tsw(&self, cam_id: usize, rig: &Rig) -> Isometry3<f64> {
        if cam_id < self.t_sw.len() {
            self.t_sw[cam_id]
        } else {
            (self.t_wp * rig.t_vs(cam_id)).inverse()
        }
    }

    /// Fill the per-camera cache.
    pub fn warm_tsw_cache(&mut self, rig: &Rig) {
        if self.t_sw.len() == rig.num_cams() {
            return;
        }
        self.t_sw.clear();
        for cam_id in 0..rig.num_cams() {
            self.t_sw.push((self.t_wp * rig.t_vs(cam_id)).inverse());
        }
    }

    /// Drop the cached transforms; they are recomputed lazily.
    pub fn invalidate_tsw_cache(&mut self) {
        self.t_sw.clear();
    }
}

/// A 3D landmark, parameterized in the world frame and (for inverse-depth
/// problems) in its reference sensor frame.
#[derive(Debug, Clone)]
pub struct Landmark {
    /// Dense index within the active set, valid only when `is_active`.
    pub opt_id: usize,
    pub is_active: bool,
    /// Cleared when an update would push the inverse depth negative
    pub is_reliable: bool,
    pub ref_pose_id: usize,
    pub ref_cam_id: usize,
    /// Reference observation used to re-anchor the ray under intrinsic
    /// updates
    pub z_ref: Vector2<f64>,
    /// Homogeneous world point
    pub x_w: Vector4<f64>,
    /// Homogeneous point in the reference sensor frame; the first three
    /// components form a unit ray while inverse-depth mode is active
    pub x_s: Vector4<f64>,
    /// Landmark block of the Hessian, `lm_dim x lm_dim`
    pub jtj: DMatrix<f64>,
    pub num_outlier_residuals: usize,
    pub proj_residuals: Vec<usize>,
}

impl Landmark {
    pub fn new(
        x_w: Vector4<f64>,
        ref_pose_id: usize,
        ref_cam_id: usize,
        z_ref: Vector2<f64>,
        is_active: bool,
        lm_dim: usize,
    ) -> Self {
        Self {
            opt_id: 0,
            is_active,
            is_reliable: true,
            ref_pose_id,
            ref_cam_id,
            z_ref,
            x_w,
            x_s: Vector4::zeros(),
            jtj: DMatrix::zeros(lm_dim, lm_dim),
            num_outlier_residuals: 0,
            proj_residuals: Vec::new(),
        }
    }
}

/// Stacked tangent-space update: pose block, calibration block, landmark
/// block.
#[derive(Debug, Clone)]
pub struct Delta {
    pub delta_p: DVector<f64>,
    pub delta_k: DVector<f64>,
    pub delta_l: DVector<f64>,
}

impl Default for Delta {
    fn default() -> Self {
        Self::zeros(0, 0, 0)
    }
}

impl Delta {
    pub fn zeros(num_pose_params: usize, calib_dim: usize, num_lm_params: usize) -> Self {
        Self {
            delta_p: DVector::zeros(num_pose_params),
            delta_k: DVector::zeros(calib_dim),
            delta_l: DVector::zeros(num_lm_params),
        }
    }

    /// Euclidean norm over all three blocks.
    pub fn norm(&self) -> f64 {
        (self.delta_p.norm_squared() + self.delta_k.norm_squared() + self.delta_l.norm_squared())
            .sqrt()
    }
}
