//! Solver options.

/// Configuration of the solve strategy, robust norms, regularization, and
/// stopping criteria.
#[derive(Debug, Clone)]
pub struct BaOptions {
    /// Use Powell's dogleg trust-region method instead of pure Gauss-Newton
    pub use_dogleg: bool,
    /// Factor the sparse view of the reduced system instead of the dense
    /// matrix
    pub use_sparse_solver: bool,
    /// Only fill the upper triangle of symmetric products
    pub use_triangular_matrices: bool,
    /// Huber reweighting for projection residuals
    pub use_robust_norm_for_proj_residuals: bool,
    /// Huber reweighting for inertial residuals (conditioning edges are
    /// never down-weighted)
    pub use_robust_norm_for_inertial_residuals: bool,
    /// Swap camera intrinsics per pose during residual evaluation
    pub use_per_pose_cam_params: bool,
    /// Mask root-pose gauge freedoms when every pose is active and no
    /// unary prior fixes the gauge
    pub enable_auto_regularization: bool,
    /// Also mask the root pose's biases in batch mode
    pub regularize_biases_in_batch: bool,
    /// Pixel threshold above which a projection residual counts as an
    /// outlier on its landmark
    pub projection_outlier_threshold: f64,
    /// Relative cost-change stopping criterion
    pub error_change_threshold: f64,
    /// Update-norm stopping criterion
    pub param_change_threshold: f64,
    /// Cap on trust-region adjustments inside one dogleg step
    pub dogleg_max_inner_iterations: usize,
    /// Extract the calibration block of the inverse reduced system
    pub calculate_calibration_marginals: bool,
    /// Dump the reduced system and projection Jacobians as CSV
    pub write_reduced_camera_matrix: bool,
    /// When false, compute the update but leave the state untouched
    pub apply_results: bool,
}

impl Default for BaOptions {
    fn default() -> Self {
        Self {
            use_dogleg: true,
            use_sparse_solver: false,
            use_triangular_matrices: false,
            use_robust_norm_for_proj_residuals: false,
            use_robust_norm_for_inertial_residuals: false,
            use_per_pose_cam_params: false,
            enable_auto_regularization: true,
            regularize_biases_in_batch: false,
            projection_outlier_threshold: 2.0,
            error_change_threshold: 1e-3,
            param_change_threshold: 1e-5,
            dogleg_max_inner_iterations: 10,
            calculate_calibration_marginals: false,
            write_reduced_camera_matrix: false,
            apply_results: true,
        }
    }
}
