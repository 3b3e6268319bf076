//! IMU data types, the two-parameter gravity direction, and preintegration.
//!
//! The gravity vector is parameterized by two rotation angles applied to
//! the nominal down vector:
//!
//! ```text
//! g_vec(g) = Ry(g[0]) * Rx(g[1]) * (0, 0, -G)
//! ```
//!
//! which keeps the magnitude fixed while the direction is optimized.

use nalgebra::{Isometry3, Matrix3x2, Vector2, Vector3, Vector6};

pub mod preintegration;

pub use preintegration::{ImuPose, Preintegration};

/// Standard gravity magnitude in m/s².
pub const GRAVITY_MAGNITUDE: f64 = 9.80665;

/// A single IMU measurement (gyroscope + accelerometer) in the body frame.
#[derive(Debug, Clone, Copy)]
pub struct ImuMeasurement {
    /// Timestamp in seconds
    pub time: f64,
    /// Angular velocity from the gyroscope (rad/s)
    pub w: Vector3<f64>,
    /// Linear acceleration from the accelerometer (m/s²), gravity included
    pub a: Vector3<f64>,
}

impl ImuMeasurement {
    pub fn new(time: f64, w: Vector3<f64>, a: Vector3<f64>) -> Self {
        Self { time, w, a }
    }
}

/// Shared inertial calibration state.
#[derive(Debug, Clone)]
pub struct ImuState {
    /// Two-angle gravity direction parameterization
    pub g: Vector2<f64>,
    /// Gravity vector in the world frame
    pub g_vec: Vector3<f64>,
    /// Sensor-to-body extrinsic transform
    pub t_vs: Isometry3<f64>,
    /// Gyroscope bias
    pub b_g: Vector3<f64>,
    /// Accelerometer bias
    pub b_a: Vector3<f64>,
}

impl Default for ImuState {
    fn default() -> Self {
        let g = Vector2::zeros();
        Self {
            g,
            g_vec: gravity_vector(&g),
            t_vs: Isometry3::identity(),
            b_g: Vector3::zeros(),
            b_a: Vector3::zeros(),
        }
    }
}

impl ImuState {
    /// Biases stacked as `[b_g, b_a]`, the layout used by the pose state.
    pub fn bias_vector(&self) -> Vector6<f64> {
        let mut b = Vector6::zeros();
        b.fixed_rows_mut::<3>(0).copy_from(&self.b_g);
        b.fixed_rows_mut::<3>(3).copy_from(&self.b_a);
        b
    }
}

/// Gravity vector from its two-angle parameterization.
pub fn gravity_vector(g: &Vector2<f64>) -> Vector3<f64> {
    let (s0, c0) = g[0].sin_cos();
    let (s1, c1) = g[1].sin_cos();
    GRAVITY_MAGNITUDE * Vector3::new(-s0 * c1, s1, -c0 * c1)
}

/// Derivative of [`gravity_vector`] with respect to the two angles.
pub fn dgravity_dparams(g: &Vector2<f64>) -> Matrix3x2<f64> {
    let (s0, c0) = g[0].sin_cos();
    let (s1, c1) = g[1].sin_cos();
    Matrix3x2::new(
        -GRAVITY_MAGNITUDE * c0 * c1,
        GRAVITY_MAGNITUDE * s0 * s1,
        0.0,
        GRAVITY_MAGNITUDE * c1,
        GRAVITY_MAGNITUDE * s0 * c1,
        GRAVITY_MAGNITUDE * c0 * s1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gravity_vector_nominal() {
        let g = gravity_vector(&Vector2::zeros());
        assert_relative_eq!(
            g,
            Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_gravity_vector_magnitude_invariant() {
        let g = gravity_vector(&Vector2::new(0.3, -0.8));
        assert_relative_eq!(g.norm(), GRAVITY_MAGNITUDE, epsilon = 1e-12);
    }

    #[test]
    fn test_dgravity_dparams_finite_difference() {
        let g0 = Vector2::new(0.2, -0.4);
        let analytic = dgravity_dparams(&g0);
        let eps = 1e-6;
        for i in 0..2 {
            let mut plus = g0;
            plus[i] += eps;
            let mut minus = g0;
            minus[i] -= eps;
            let numeric = (gravity_vector(&plus) - gravity_vector(&minus)) / (2.0 * eps);
            assert_relative_eq!(analytic.column(i).into_owned(), numeric, epsilon = 1e-6);
        }
    }
}
