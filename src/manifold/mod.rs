//! Lie-group primitives used by the bundle adjuster.
//!
//! Two layers live here:
//! - [`so3`]: rotation helpers on SO(3) (hat/vee, exponential/logarithm,
//!   right/left Jacobians and their inverses)
//! - [`se3`]: the *decoupled* SE(3) retraction used for all pose updates,
//!   in which translation is additive in the world frame and rotation uses
//!   the SO(3) exponential, together with the analytic Jacobians of the
//!   decoupled logarithm needed by the pose residuals

use thiserror::Error;

pub mod se3;
pub mod so3;

pub use se3::{
    dlog_decoupled_dtarget, dlog_decoupled_dx, drelative_dx, exp_decoupled, log_decoupled,
};
pub use so3::{exp_so3, hat, left_jacobian_inv, log_so3, right_jacobian, right_jacobian_inv};

/// Manifold-specific error types
#[derive(Debug, Clone, Error)]
pub enum ManifoldError {
    /// Input vector or matrix has the wrong dimension
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Numerical instability detected (NaN or Inf)
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
}
