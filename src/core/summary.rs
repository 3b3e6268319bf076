//! Solve outcome reporting.

use nalgebra::DMatrix;
use std::fmt;

/// Outcome of a solve, in `Summary::result`.
///
/// Threshold outcomes are normal terminations; the error variants abort
/// the outer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolveResult {
    #[default]
    Success,
    /// The factorization refused the reduced system
    FactorizationError,
    /// The triangular solve produced a non-finite update
    SolverError,
    /// The cost went up and error increases were not allowed
    ErrorIncreased,
    ErrorChangeBelowThreshold,
    ParamChangeBelowThreshold,
}

impl SolveResult {
    /// Whether the last linear solve succeeded.
    pub fn is_good(&self) -> bool {
        !matches!(
            self,
            SolveResult::FactorizationError | SolveResult::SolverError
        )
    }
}

impl fmt::Display for SolveResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveResult::Success => write!(f, "Success"),
            SolveResult::FactorizationError => write!(f, "Factorization error"),
            SolveResult::SolverError => write!(f, "Solver error"),
            SolveResult::ErrorIncreased => write!(f, "Error increased"),
            SolveResult::ErrorChangeBelowThreshold => write!(f, "Error change below threshold"),
            SolveResult::ParamChangeBelowThreshold => write!(f, "Parameter change below threshold"),
        }
    }
}

/// Statistics of the last `solve` call.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub result: SolveResult,
    /// Total Mahalanobis cost before the last accepted update
    pub pre_solve_norm: f64,
    /// Total Mahalanobis cost after the last accepted update
    pub post_solve_norm: f64,
    /// Norm of the last applied update (pose + landmark blocks)
    pub delta_norm: f64,
    pub proj_error: f64,
    pub binary_error: f64,
    pub unary_error: f64,
    pub inertial_error: f64,
    /// Mahalanobis sum over conditioning projection residuals, unweighted
    pub cond_proj_error: f64,
    /// Mahalanobis sum over conditioning inertial residuals
    pub cond_inertial_error: f64,
    pub num_proj_residuals: usize,
    pub num_cond_proj_residuals: usize,
    pub num_inertial_residuals: usize,
    pub num_cond_inertial_residuals: usize,
    /// Calibration block of the inverse reduced system, when requested
    pub calibration_marginals: Option<DMatrix<f64>>,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Bundle adjustment summary ===")?;
        writeln!(f, "Result:           {}", self.result)?;
        writeln!(f, "Pre-solve norm:   {:.6e}", self.pre_solve_norm)?;
        writeln!(f, "Post-solve norm:  {:.6e}", self.post_solve_norm)?;
        writeln!(f, "Delta norm:       {:.6e}", self.delta_norm)?;
        writeln!(
            f,
            "Errors: proj {:.6e}, binary {:.6e}, unary {:.6e}, inertial {:.6e}",
            self.proj_error, self.binary_error, self.unary_error, self.inertial_error
        )?;
        writeln!(
            f,
            "Residuals: {} projection ({} conditioning), {} inertial ({} conditioning)",
            self.num_proj_residuals,
            self.num_cond_proj_residuals,
            self.num_inertial_residuals,
            self.num_cond_inertial_residuals
        )
    }
}
