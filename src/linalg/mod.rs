//! Linear algebra support: the block-sparse matrix used to assemble the
//! normal equations, and factorization of the reduced camera system.

use thiserror::Error;

pub mod block_sparse;
pub mod solvers;

pub use block_sparse::{BlockDiag, BlockMatrix};
pub use solvers::{factorize_reduced, matrix_sqrt, ReducedFactorization};

/// Result type for linear algebra operations
pub type LinAlgResult<T> = Result<T, LinAlgError>;

/// Linear-algebra specific error types
#[derive(Debug, Clone, Error)]
pub enum LinAlgError {
    /// Cholesky factorization of the reduced system was refused
    #[error("Factorization failed: {0}")]
    FactorizationFailed(String),

    /// The triangular solve produced a non-finite solution
    #[error("Solve failed: {0}")]
    SolveFailed(String),

    /// Matrix dimensions do not match the operation
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}
