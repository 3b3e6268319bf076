//! Pinhole camera model
//!
//! The simplest perspective camera model with no lens distortion.
//!
//! # Mathematical Model
//!
//! For a 3D point p = (x, y, z) in sensor coordinates:
//!
//! ```text
//! u = fx * (x/z) + cx
//! v = fy * (y/z) + cy
//! ```
//!
//! where (fx, fy) are focal lengths in pixels and (cx, cy) is the principal
//! point in pixels. Unprojection returns the normalized ray
//! `normalize([(u - cx)/fx, (v - cy)/fy, 1])`.
//!
//! # Parameters
//!
//! Intrinsics: `[fx, fy, cx, cy]` (4 parameters), no distortion.

use nalgebra::{DVector, Isometry3, Matrix2x3, Vector2, Vector3};

use super::{CameraModel, IntrinsicJacobian};

/// Pinhole camera model with 4 intrinsic parameters and an extrinsic pose.
#[derive(Debug, Clone)]
pub struct PinholeCamera {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    t_vs: Isometry3<f64>,
}

impl PinholeCamera {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            t_vs: Isometry3::identity(),
        }
    }

    pub fn with_pose(mut self, t_vs: Isometry3<f64>) -> Self {
        self.t_vs = t_vs;
        self
    }

    fn project_params(params: &[f64], p_s: &Vector3<f64>) -> Vector2<f64> {
        let inv_z = 1.0 / p_s.z;
        Vector2::new(
            params[0] * p_s.x * inv_z + params[2],
            params[1] * p_s.y * inv_z + params[3],
        )
    }
}

impl CameraModel for PinholeCamera {
    fn num_params(&self) -> usize {
        4
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.fx, self.fy, self.cx, self.cy])
    }

    fn set_params(&mut self, params: &DVector<f64>) {
        self.fx = params[0];
        self.fy = params[1];
        self.cx = params[2];
        self.cy = params[3];
    }

    fn pose(&self) -> Isometry3<f64> {
        self.t_vs
    }

    fn set_pose(&mut self, t_vs: Isometry3<f64>) {
        self.t_vs = t_vs;
    }

    fn project_with_params(&self, params: &DVector<f64>, p_s: &Vector3<f64>) -> Vector2<f64> {
        Self::project_params(params.as_slice(), p_s)
    }

    fn unproject(&self, z: &Vector2<f64>) -> Vector3<f64> {
        Vector3::new((z.x - self.cx) / self.fx, (z.y - self.cy) / self.fy, 1.0).normalize()
    }

    fn dproject_dpoint_with_params(
        &self,
        params: &DVector<f64>,
        p_s: &Vector3<f64>,
    ) -> Matrix2x3<f64> {
        let inv_z = 1.0 / p_s.z;
        let inv_z2 = inv_z * inv_z;
        Matrix2x3::new(
            params[0] * inv_z,
            0.0,
            -params[0] * p_s.x * inv_z2,
            0.0,
            params[1] * inv_z,
            -params[1] * p_s.y * inv_z2,
        )
    }

    fn dproject_dparams_with_params(
        &self,
        _params: &DVector<f64>,
        p_s: &Vector3<f64>,
    ) -> IntrinsicJacobian {
        let inv_z = 1.0 / p_s.z;
        let mut j = IntrinsicJacobian::zeros(4);
        j[(0, 0)] = p_s.x * inv_z;
        j[(0, 2)] = 1.0;
        j[(1, 1)] = p_s.y * inv_z;
        j[(1, 3)] = 1.0;
        j
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> PinholeCamera {
        PinholeCamera::new(450.0, 455.0, 320.0, 240.0)
    }

    #[test]
    fn test_project_principal_ray() {
        let cam = camera();
        let z = cam.project(&Vector3::new(0.0, 0.0, 2.0));
        assert_relative_eq!(z, Vector2::new(320.0, 240.0), epsilon = 1e-12);
    }

    #[test]
    fn test_project_unproject_roundtrip() {
        let cam = camera();
        let z = Vector2::new(400.0, 180.0);
        let ray = cam.unproject(&z);
        assert_relative_eq!(ray.norm(), 1.0, epsilon = 1e-12);
        let z_back = cam.project(&(3.7 * ray));
        assert_relative_eq!(z_back, z, epsilon = 1e-9);
    }

    #[test]
    fn test_dproject_dpoint_finite_difference() {
        let cam = camera();
        let p = Vector3::new(0.4, -0.3, 2.5);
        let analytic = cam.dproject_dpoint(&p);
        let eps = 1e-6;
        for i in 0..3 {
            let mut dp = Vector3::zeros();
            dp[i] = eps;
            let numeric = (cam.project(&(p + dp)) - cam.project(&(p - dp))) / (2.0 * eps);
            assert_relative_eq!(analytic.column(i).into_owned(), numeric, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_dproject_dparams_finite_difference() {
        let cam = camera();
        let p = Vector3::new(0.4, -0.3, 2.5);
        let analytic = cam.dproject_dparams(&p);
        let params = cam.params();
        let eps = 1e-6;
        for i in 0..4 {
            let mut plus = params.clone();
            plus[i] += eps;
            let mut minus = params.clone();
            minus[i] -= eps;
            let numeric = (cam.project_with_params(&plus, &p)
                - cam.project_with_params(&minus, &p))
                / (2.0 * eps);
            assert_relative_eq!(analytic.column(i).into_owned(), numeric, epsilon = 1e-6);
        }
    }
}
