//! # Argus BA
//!
//! A Rust library for visual-inertial bundle adjustment: joint nonlinear
//! least-squares refinement of camera poses, 3D landmarks, inertial state
//! (velocities, biases), gravity direction, camera intrinsics, and
//! sensor-to-body extrinsics.
//!
//! ## Features
//!
//! - **Four residual families**: reprojection, binary pose-pose, unary pose
//!   priors, and IMU preintegration residuals, assembled into one sparse
//!   block system
//! - **Schur complement reduction**: landmarks are eliminated from the
//!   normal equations before factorization, then the reduced system is
//!   augmented with the global calibration variables
//! - **Trust region solver**: Powell's dogleg over the Gauss-Newton and
//!   steepest-descent directions, with rollback on error increase
//! - **Robust estimation**: Huber reweighting with per-family median scaling
//! - **Flexible state parameterization**: landmarks as world XYZ or
//!   inverse-depth rays, poses as SE(3) or SE(3)+velocity+biases, optional
//!   gravity / intrinsic / extrinsic calibration
//!
//! ## State configuration
//!
//! The variables entering the state vector are selected at construction
//! through [`core::StateConfig`]: landmark dimension (0, 1, or 3), pose
//! dimension (6, 9, or 15), and which calibration blocks (gravity, camera
//! intrinsics, T_vs) are optimized.

pub mod adjuster;
pub mod camera;
pub mod core;
pub mod error;
pub mod imu;
pub mod linalg;
pub mod logger;
pub mod manifold;

// Re-export the consumer-facing types
pub use crate::adjuster::BundleAdjuster;
pub use crate::core::{BaOptions, Delta, SolveResult, StateConfig, Summary};
pub use crate::error::{BaError, BaResult};
pub use crate::imu::ImuMeasurement;
pub use crate::logger::{init_logger, init_logger_with_level};
