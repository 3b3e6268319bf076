//! The four residual families.
//!
//! Each residual owns its measurement, its current linearization (residual
//! vector + Jacobian blocks), and its robust-norm bookkeeping. Residuals
//! reference poses and landmarks by id only.

use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix2x6, Matrix6, SMatrix, Vector2, Vector6,
};

use crate::camera::IntrinsicJacobian;
use crate::imu::{ImuMeasurement, ImuPose};

/// Gravity Jacobian block of an inertial residual (pose + velocity rows).
pub type GravityJacobian = SMatrix<f64, 9, 2>;

/// A single 2D observation of a landmark from a pose/camera pair.
#[derive(Debug, Clone)]
pub struct ProjectionResidual {
    pub residual_id: usize,
    pub landmark_id: usize,
    pub meas_pose_id: usize,
    pub ref_pose_id: usize,
    pub cam_id: usize,
    /// Measured pixel position
    pub z: Vector2<f64>,
    pub weight: f64,
    pub orig_weight: f64,
    pub is_conditioning: bool,
    pub residual: Vector2<f64>,
    pub mahalanobis_distance: f64,
    pub dz_dx_meas: Matrix2x6<f64>,
    pub dz_dx_ref: Matrix2x6<f64>,
    /// `2 x lm_dim`
    pub dz_dlm: DMatrix<f64>,
    pub dz_dcam_params: IntrinsicJacobian,
    pub dz_dtvs: Matrix2x6<f64>,
    /// Offset of this residual within the stacked residual vector
    pub residual_offset: usize,
}

impl ProjectionResidual {
    pub const RES_SIZE: usize = 2;
}

/// A relative SE(3) constraint between two poses.
#[derive(Debug, Clone)]
pub struct BinaryResidual {
    pub residual_id: usize,
    pub x1_id: usize,
    pub x2_id: usize,
    /// Measured transform from pose 1 to pose 2
    pub t_12: Isometry3<f64>,
    pub cov_inv: Matrix6<f64>,
    pub cov_inv_sqrt: Matrix6<f64>,
    pub use_rotation: bool,
    pub weight: f64,
    pub orig_weight: f64,
    pub residual: Vector6<f64>,
    pub mahalanobis_distance: f64,
    pub dz_dx1: Matrix6<f64>,
    pub dz_dx2: Matrix6<f64>,
    pub residual_offset: usize,
}

impl BinaryResidual {
    pub const RES_SIZE: usize = 6;
}

/// An absolute SE(3) prior on one pose.
#[derive(Debug, Clone)]
pub struct UnaryResidual {
    pub residual_id: usize,
    pub pose_id: usize,
    /// Target body-to-world transform
    pub t_wp: Isometry3<f64>,
    /// Inverse covariance as supplied by the caller
    pub orig_cov_inv: Matrix6<f64>,
    /// Inverse covariance with the robust weight folded in
    pub cov_inv: Matrix6<f64>,
    pub cov_inv_sqrt: Matrix6<f64>,
    pub use_rotation: bool,
    pub residual: Vector6<f64>,
    pub mahalanobis_distance: f64,
    pub dz_dx: Matrix6<f64>,
    pub residual_offset: usize,
}

impl UnaryResidual {
    pub const RES_SIZE: usize = 6;
}

/// A preintegrated IMU constraint between two consecutive poses.
///
/// The residual size is 9 (pose + velocity) or 15 (plus the bias random
/// walk) depending on whether biases are in the state.
#[derive(Debug, Clone)]
pub struct ImuResidual {
    pub residual_id: usize,
    pub pose1_id: usize,
    pub pose2_id: usize,
    pub measurements: Vec<ImuMeasurement>,
    /// Integrated trajectory from the last evaluation
    pub poses: Vec<ImuPose>,
    /// Inverse covariance as supplied by the caller, `res_size x res_size`
    pub orig_cov_inv: DMatrix<f64>,
    /// Inverse covariance with the robust weight folded in
    pub cov_inv: DMatrix<f64>,
    pub cov_inv_sqrt: DMatrix<f64>,
    /// `res_size`
    pub residual: DVector<f64>,
    pub mahalanobis_distance: f64,
    /// `res_size x pose_dim`
    pub dz_dx1: DMatrix<f64>,
    /// `res_size x pose_dim`
    pub dz_dx2: DMatrix<f64>,
    pub dz_dg: GravityJacobian,
    pub residual_offset: usize,
}
