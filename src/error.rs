//! Error types for the argus-ba library
//!
//! This module provides the main error and result types used throughout the
//! library. All errors use the `thiserror` crate for automatic trait
//! implementations.
//!
//! Note that solver *outcomes* (error increased, convergence thresholds
//! reached, factorization refused) are not errors: they are reported through
//! [`crate::core::Summary::result`].

use crate::{linalg, manifold};
use thiserror::Error;

/// Main result type used throughout the argus-ba library
pub type BaResult<T> = Result<T, BaError>;

/// Main error type for the argus-ba library
#[derive(Debug, Clone, Error)]
pub enum BaError {
    /// Linear algebra related errors
    #[error("Linear algebra error: {0}")]
    LinearAlgebra(String),

    /// Manifold operations errors
    #[error("Manifold error: {0}")]
    Manifold(String),

    /// Invalid input parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// IO related errors (debug matrix dumps)
    #[error("IO error: {0}")]
    Io(String),
}

// Conversions from standard library errors

impl From<std::io::Error> for BaError {
    fn from(err: std::io::Error) -> Self {
        BaError::Io(err.to_string())
    }
}

// Convert module-specific errors to BaError

impl From<linalg::LinAlgError> for BaError {
    fn from(err: linalg::LinAlgError) -> Self {
        BaError::LinearAlgebra(err.to_string())
    }
}

impl From<manifold::ManifoldError> for BaError {
    fn from(err: manifold::ManifoldError) -> Self {
        BaError::Manifold(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ba_error_display() {
        let error = BaError::LinearAlgebra("Matrix is singular".to_string());
        assert_eq!(
            error.to_string(),
            "Linear algebra error: Matrix is singular"
        );
    }

    #[test]
    fn test_ba_error_from_io() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let ba_error = BaError::from(io_error);

        match ba_error {
            BaError::Io(msg) => assert!(msg.contains("File not found")),
            _ => panic!("Expected IO error"),
        }
    }

    #[test]
    fn test_ba_result_err() {
        let result: BaResult<i32> = Err(BaError::InvalidInput("Test error".to_string()));
        assert!(result.is_err());
    }
}
