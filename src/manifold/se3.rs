//! Decoupled SE(3) retraction and its Jacobians.
//!
//! All pose updates in the adjuster use the *decoupled* parameterization:
//! for a tangent vector `xi = [dt, dtheta]`, the translation is updated
//! additively in the world frame while the rotation is right-multiplied by
//! the SO(3) exponential:
//!
//! ```text
//! exp_decoupled(T, xi) = ( t + dt,  R * exp(dtheta) )
//! ```
//!
//! The matching logarithm of one pose relative to another is
//!
//! ```text
//! log_decoupled(A, B) = [ t_A - t_B,  log(R_B⁻¹ * R_A) ]
//! ```
//!
//! so `log_decoupled(exp_decoupled(B, xi), B) == xi` holds exactly, and
//! apply followed by rollback of the same tangent vector is the identity.
//!
//! The Jacobians below are derivatives with respect to a decoupled
//! perturbation of the argument pose(s), i.e. `d/dxi` of the residual as a
//! function of `exp_decoupled(T, xi)` evaluated at `xi = 0`.

use nalgebra::{Isometry3, Matrix3, Matrix6, Vector3, Vector6};

use super::so3::{exp_so3, hat, left_jacobian_inv, log_so3, right_jacobian_inv};

/// Decoupled retraction: world-frame additive translation, right-multiplied
/// rotation exponential.
pub fn exp_decoupled(t: &Isometry3<f64>, xi: &Vector6<f64>) -> Isometry3<f64> {
    let dt: Vector3<f64> = xi.fixed_rows::<3>(0).into();
    let dtheta: Vector3<f64> = xi.fixed_rows::<3>(3).into();
    Isometry3::from_parts(
        (t.translation.vector + dt).into(),
        t.rotation * exp_so3(&dtheta),
    )
}

/// Decoupled logarithm of `a` relative to `b`; zero when `a == b`.
pub fn log_decoupled(a: &Isometry3<f64>, b: &Isometry3<f64>) -> Vector6<f64> {
    let mut out = Vector6::zeros();
    out.fixed_rows_mut::<3>(0)
        .copy_from(&(a.translation.vector - b.translation.vector));
    out.fixed_rows_mut::<3>(3)
        .copy_from(&log_so3(&(b.rotation.inverse() * a.rotation)));
    out
}

/// Jacobian of `log_decoupled(T, target)` with respect to a decoupled
/// perturbation of `T`. Used by the unary pose residual.
pub fn dlog_decoupled_dx(t: &Isometry3<f64>, target: &Isometry3<f64>) -> Matrix6<f64> {
    let phi = log_so3(&(target.rotation.inverse() * t.rotation));
    let mut j = Matrix6::zeros();
    j.fixed_view_mut::<3, 3>(0, 0).copy_from(&Matrix3::identity());
    j.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&right_jacobian_inv(&phi));
    j
}

/// Jacobians of the relative-pose residual
/// `r = log_decoupled(T_w1⁻¹ * T_w2, t_12)` with respect to decoupled
/// perturbations of `T_w1` and `T_w2`. Used by the binary residual.
pub fn drelative_dx(
    t_w1: &Isometry3<f64>,
    t_w2: &Isometry3<f64>,
    t_12: &Isometry3<f64>,
) -> (Matrix6<f64>, Matrix6<f64>) {
    let t_12_est = t_w1.inverse() * t_w2;
    let r1_t = t_w1.rotation.to_rotation_matrix().into_inner().transpose();
    let r12_t = t_12_est
        .rotation
        .to_rotation_matrix()
        .into_inner()
        .transpose();
    let phi = log_so3(&(t_12.rotation.inverse() * t_12_est.rotation));
    let jr_inv = right_jacobian_inv(&phi);

    let mut dz_dx1 = Matrix6::zeros();
    dz_dx1.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-r1_t));
    dz_dx1
        .fixed_view_mut::<3, 3>(0, 3)
        .copy_from(&hat(&t_12_est.translation.vector));
    dz_dx1
        .fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(-jr_inv * r12_t));

    let mut dz_dx2 = Matrix6::zeros();
    dz_dx2.fixed_view_mut::<3, 3>(0, 0).copy_from(&r1_t);
    dz_dx2.fixed_view_mut::<3, 3>(3, 3).copy_from(&jr_inv);

    (dz_dx1, dz_dx2)
}

/// Jacobian of `log_decoupled(A, B)` with respect to a decoupled
/// perturbation of `B` (the *target* side). Used by the inertial residual,
/// whose pose error is taken against the second pose.
pub fn dlog_decoupled_dtarget(a: &Isometry3<f64>, b: &Isometry3<f64>) -> Matrix6<f64> {
    let phi = log_so3(&(b.rotation.inverse() * a.rotation));
    let mut j = Matrix6::zeros();
    j.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(-Matrix3::identity()));
    j.fixed_view_mut::<3, 3>(3, 3)
        .copy_from(&(-left_jacobian_inv(&phi)));
    j
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    fn test_pose(seed: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Vector3::new(0.3 * seed, -0.7, 1.1 + seed).into(),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.4, -0.2 * seed, 0.6)),
        )
    }

    fn numeric_jacobian<F>(f: F) -> Matrix6<f64>
    where
        F: Fn(&Vector6<f64>) -> Vector6<f64>,
    {
        let eps = 1e-7;
        let mut j = Matrix6::zeros();
        for i in 0..6 {
            let mut dp = Vector6::zeros();
            dp[i] = eps;
            let mut dm = Vector6::zeros();
            dm[i] = -eps;
            let col = (f(&dp) - f(&dm)) / (2.0 * eps);
            j.column_mut(i).copy_from(&col);
        }
        j
    }

    #[test]
    fn test_exp_log_decoupled_roundtrip() {
        let t = test_pose(1.0);
        let xi = Vector6::new(0.1, -0.2, 0.3, 0.05, -0.1, 0.2);
        let t2 = exp_decoupled(&t, &xi);
        assert_relative_eq!(log_decoupled(&t2, &t), xi, epsilon = 1e-12);
    }

    #[test]
    fn test_apply_rollback_identity() {
        let t = test_pose(0.5);
        let xi = Vector6::new(0.2, 0.1, -0.3, 0.15, 0.25, -0.05);
        let t2 = exp_decoupled(&exp_decoupled(&t, &xi), &(-xi));
        assert_relative_eq!(
            t2.translation.vector,
            t.translation.vector,
            epsilon = 1e-14
        );
        assert_relative_eq!(
            t2.rotation.to_rotation_matrix().into_inner(),
            t.rotation.to_rotation_matrix().into_inner(),
            epsilon = 1e-14
        );
    }

    #[test]
    fn test_dlog_decoupled_dx_finite_difference() {
        let t = test_pose(1.0);
        let target = test_pose(0.3);
        let analytic = dlog_decoupled_dx(&t, &target);
        let numeric = numeric_jacobian(|xi| log_decoupled(&exp_decoupled(&t, xi), &target));
        assert_relative_eq!(analytic, numeric, epsilon = 1e-5);
    }

    #[test]
    fn test_dlog_decoupled_dtarget_finite_difference() {
        let a = test_pose(1.0);
        let b = test_pose(0.3);
        let analytic = dlog_decoupled_dtarget(&a, &b);
        let numeric = numeric_jacobian(|xi| log_decoupled(&a, &exp_decoupled(&b, xi)));
        assert_relative_eq!(analytic, numeric, epsilon = 1e-5);
    }

    #[test]
    fn test_drelative_dx_finite_difference() {
        let t_w1 = test_pose(1.0);
        let t_w2 = test_pose(-0.6);
        let t_12 = test_pose(0.2);
        let (dz_dx1, dz_dx2) = drelative_dx(&t_w1, &t_w2, &t_12);

        let numeric1 = numeric_jacobian(|xi| {
            let p1 = exp_decoupled(&t_w1, xi);
            log_decoupled(&(p1.inverse() * t_w2), &t_12)
        });
        let numeric2 = numeric_jacobian(|xi| {
            let p2 = exp_decoupled(&t_w2, xi);
            log_decoupled(&(t_w1.inverse() * p2), &t_12)
        });
        assert_relative_eq!(dz_dx1, numeric1, epsilon = 1e-5);
        assert_relative_eq!(dz_dx2, numeric2, epsilon = 1e-5);
    }
}
