//! SO(3) helpers: hat map, exponential/logarithm, and the right/left
//! Jacobians of the exponential together with their inverses.
//!
//! Rotations are represented as [`nalgebra::UnitQuaternion`]; the tangent
//! space is the axis-angle vector. The closed forms follow the usual
//! small-angle-safe expansions: below [`SMALL_ANGLE`] each series is
//! truncated at second order.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};

/// Angle threshold below which Taylor expansions replace the closed forms.
pub const SMALL_ANGLE: f64 = 1e-8;

/// Skew-symmetric (hat) matrix of a 3-vector: `hat(v) * x == v.cross(&x)`.
pub fn hat(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// SO(3) exponential map from an axis-angle vector.
pub fn exp_so3(phi: &Vector3<f64>) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(*phi)
}

/// SO(3) logarithm map to an axis-angle vector.
pub fn log_so3(r: &UnitQuaternion<f64>) -> Vector3<f64> {
    r.scaled_axis()
}

/// Right Jacobian of the SO(3) exponential.
///
/// `exp(phi + dphi) ≈ exp(phi) * exp(Jr(phi) * dphi)`
pub fn right_jacobian(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let phi_hat = hat(phi);
    if theta2 < SMALL_ANGLE * SMALL_ANGLE {
        return Matrix3::identity() - 0.5 * phi_hat + phi_hat * phi_hat / 6.0;
    }
    let theta = theta2.sqrt();
    Matrix3::identity() - ((1.0 - theta.cos()) / theta2) * phi_hat
        + ((theta - theta.sin()) / (theta2 * theta)) * (phi_hat * phi_hat)
}

/// Inverse of the right Jacobian of the SO(3) exponential.
pub fn right_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta2 = phi.norm_squared();
    let phi_hat = hat(phi);
    if theta2 < SMALL_ANGLE * SMALL_ANGLE {
        return Matrix3::identity() + 0.5 * phi_hat + phi_hat * phi_hat / 12.0;
    }
    let theta = theta2.sqrt();
    let coeff = 1.0 / theta2 - (1.0 + theta.cos()) / (2.0 * theta * theta.sin());
    Matrix3::identity() + 0.5 * phi_hat + coeff * (phi_hat * phi_hat)
}

/// Inverse of the left Jacobian, `Jl⁻¹(phi) = Jr⁻¹(-phi)`.
pub fn left_jacobian_inv(phi: &Vector3<f64>) -> Matrix3<f64> {
    right_jacobian_inv(&(-phi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_hat_cross_product() {
        let v = Vector3::new(0.3, -1.2, 0.7);
        let x = Vector3::new(-0.5, 0.1, 2.0);
        assert_relative_eq!(hat(&v) * x, v.cross(&x), epsilon = 1e-14);
    }

    #[test]
    fn test_exp_log_roundtrip() {
        let phi = Vector3::new(0.4, -0.2, 0.9);
        let r = exp_so3(&phi);
        assert_relative_eq!(log_so3(&r), phi, epsilon = 1e-12);
    }

    #[test]
    fn test_right_jacobian_inverse_consistency() {
        for phi in [
            Vector3::new(0.5, -0.3, 0.8),
            Vector3::new(1e-10, 2e-10, -1e-10),
            Vector3::new(-1.4, 0.1, 0.2),
        ] {
            let prod = right_jacobian(&phi) * right_jacobian_inv(&phi);
            assert_relative_eq!(prod, Matrix3::identity(), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_right_jacobian_finite_difference() {
        // exp(phi + eps*e_i) ~ exp(phi) * exp(Jr * eps*e_i)
        let phi = Vector3::new(0.3, 0.7, -0.5);
        let jr = right_jacobian(&phi);
        let eps = 1e-6;
        for i in 0..3 {
            let mut dphi = Vector3::zeros();
            dphi[i] = eps;
            let lhs = exp_so3(&(phi + dphi));
            let rhs = exp_so3(&phi) * exp_so3(&(jr * dphi));
            assert_relative_eq!(
                lhs.to_rotation_matrix().into_inner(),
                rhs.to_rotation_matrix().into_inner(),
                epsilon = 1e-10
            );
        }
    }
}
