//! IMU preintegration with first-order bias Jacobians.
//!
//! Measurements between two poses are integrated in the body frame of the
//! first pose into rotation/velocity/position deltas, then composed with
//! the first pose's state and gravity to predict the second pose. The
//! deltas carry the standard first-order Jacobians with respect to the
//! gyroscope and accelerometer biases, so the inertial residual can be
//! linearized without re-integrating per state perturbation.
//!
//! Reference: Forster et al., "On-Manifold Preintegration for Real-Time
//! Visual-Inertial Odometry".

use nalgebra::{Isometry3, Matrix3, UnitQuaternion, Vector3};

use crate::manifold::so3::{exp_so3, hat, right_jacobian};

use super::ImuMeasurement;

/// A pose/velocity sample along the integrated trajectory.
#[derive(Debug, Clone)]
pub struct ImuPose {
    pub t_wp: Isometry3<f64>,
    pub v_w: Vector3<f64>,
    pub time: f64,
}

/// Preintegrated measurement deltas in the body frame of the start pose.
#[derive(Debug, Clone)]
pub struct Preintegration {
    /// Rotation delta
    pub delta_r: UnitQuaternion<f64>,
    /// Velocity delta in the start body frame
    pub delta_v: Vector3<f64>,
    /// Position delta in the start body frame
    pub delta_p: Vector3<f64>,
    /// Total integration time
    pub delta_t: f64,

    /// d(delta_r) / d(gyro bias), with `delta_r(b+db) ~ delta_r * exp(dr_dbg * db)`
    pub dr_dbg: Matrix3<f64>,
    /// d(delta_v) / d(gyro bias)
    pub dv_dbg: Matrix3<f64>,
    /// d(delta_v) / d(accel bias)
    pub dv_dba: Matrix3<f64>,
    /// d(delta_p) / d(gyro bias)
    pub dp_dbg: Matrix3<f64>,
    /// d(delta_p) / d(accel bias)
    pub dp_dba: Matrix3<f64>,
}

impl Preintegration {
    fn new() -> Self {
        Self {
            delta_r: UnitQuaternion::identity(),
            delta_v: Vector3::zeros(),
            delta_p: Vector3::zeros(),
            delta_t: 0.0,
            dr_dbg: Matrix3::zeros(),
            dv_dbg: Matrix3::zeros(),
            dv_dba: Matrix3::zeros(),
            dp_dbg: Matrix3::zeros(),
            dp_dba: Matrix3::zeros(),
        }
    }

    /// Integrate one measurement over `dt` seconds.
    fn step(&mut self, m: &ImuMeasurement, dt: f64, b_g: &Vector3<f64>, b_a: &Vector3<f64>) {
        let w_ub = m.w - b_g;
        let a_ub = m.a - b_a;
        let theta = w_ub * dt;
        let d_r = exp_so3(&theta);
        let r_k = self.delta_r.to_rotation_matrix().into_inner();
        let a_hat = hat(&a_ub);

        // Bias Jacobians first: the position rows use the pre-update
        // velocity Jacobians, the velocity rows the pre-update rotation.
        self.dp_dbg += self.dv_dbg * dt - 0.5 * r_k * a_hat * self.dr_dbg * dt * dt;
        self.dp_dba += self.dv_dba * dt - 0.5 * r_k * dt * dt;
        self.dv_dbg -= r_k * a_hat * self.dr_dbg * dt;
        self.dv_dba -= r_k * dt;
        self.dr_dbg = d_r.to_rotation_matrix().into_inner().transpose() * self.dr_dbg
            - right_jacobian(&theta) * dt;

        self.delta_p += self.delta_v * dt + 0.5 * r_k * a_ub * dt * dt;
        self.delta_v += r_k * a_ub * dt;
        self.delta_r *= d_r;
        self.delta_t += dt;
    }

    /// Integrate a measurement span with the given biases.
    ///
    /// Measurement `i` is held over `[t_i, t_{i+1})`; spans shorter than
    /// two samples integrate nothing.
    pub fn integrate(
        measurements: &[ImuMeasurement],
        b_g: &Vector3<f64>,
        b_a: &Vector3<f64>,
    ) -> Self {
        let mut out = Self::new();
        for pair in measurements.windows(2) {
            let dt = pair[1].time - pair[0].time;
            if dt <= 0.0 {
                continue;
            }
            out.step(&pair[0], dt, b_g, b_a);
        }
        out
    }

    /// Predict the state at the end of the span from the start state and
    /// gravity.
    pub fn predict(
        &self,
        t_wp1: &Isometry3<f64>,
        v_w1: &Vector3<f64>,
        g_vec: &Vector3<f64>,
        start_time: f64,
    ) -> ImuPose {
        let r1 = t_wp1.rotation;
        let dt = self.delta_t;
        ImuPose {
            t_wp: Isometry3::from_parts(
                (t_wp1.translation.vector + v_w1 * dt + 0.5 * g_vec * dt * dt
                    + r1 * self.delta_p)
                    .into(),
                r1 * self.delta_r,
            ),
            v_w: v_w1 + g_vec * dt + r1 * self.delta_v,
            time: start_time + dt,
        }
    }
}

/// Integrate a measurement span from a start state, recording the
/// world-frame trajectory in `out_poses` and returning the final sample.
///
/// This is the evaluation-side entry point: it produces the same final
/// state as [`Preintegration::integrate`] + [`Preintegration::predict`]
/// while exposing the intermediate poses.
pub fn integrate_residual(
    t_wp1: &Isometry3<f64>,
    v_w1: &Vector3<f64>,
    measurements: &[ImuMeasurement],
    b_g: &Vector3<f64>,
    b_a: &Vector3<f64>,
    g_vec: &Vector3<f64>,
    out_poses: &mut Vec<ImuPose>,
) -> ImuPose {
    out_poses.clear();
    let start_time = measurements.first().map_or(0.0, |m| m.time);
    out_poses.push(ImuPose {
        t_wp: *t_wp1,
        v_w: *v_w1,
        time: start_time,
    });

    let mut pre = Preintegration::new();
    for pair in measurements.windows(2) {
        let dt = pair[1].time - pair[0].time;
        if dt <= 0.0 {
            continue;
        }
        pre.step(&pair[0], dt, b_g, b_a);
        out_poses.push(pre.predict(t_wp1, v_w1, g_vec, start_time));
    }

    out_poses.last().cloned().unwrap_or(ImuPose {
        t_wp: *t_wp1,
        v_w: *v_w1,
        time: start_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imu::{gravity_vector, GRAVITY_MAGNITUDE};
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    /// Stationary IMU: accelerometer measures -g, trajectory stays put.
    #[test]
    fn test_stationary_integration() {
        let g_vec = gravity_vector(&Vector2::zeros());
        let measurements: Vec<ImuMeasurement> = (0..11)
            .map(|i| {
                ImuMeasurement::new(
                    i as f64 * 0.01,
                    Vector3::zeros(),
                    Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE),
                )
            })
            .collect();

        let pre = Preintegration::integrate(&measurements, &Vector3::zeros(), &Vector3::zeros());
        let end = pre.predict(
            &Isometry3::identity(),
            &Vector3::zeros(),
            &g_vec,
            0.0,
        );
        assert_relative_eq!(end.t_wp.translation.vector, Vector3::zeros(), epsilon = 1e-10);
        assert_relative_eq!(end.v_w, Vector3::zeros(), epsilon = 1e-10);
    }

    /// Constant forward acceleration with no rotation: p = a t^2 / 2.
    #[test]
    fn test_constant_acceleration() {
        let g_vec = gravity_vector(&Vector2::zeros());
        let accel = 2.0;
        let measurements: Vec<ImuMeasurement> = (0..101)
            .map(|i| {
                ImuMeasurement::new(
                    i as f64 * 0.01,
                    Vector3::zeros(),
                    Vector3::new(accel, 0.0, GRAVITY_MAGNITUDE),
                )
            })
            .collect();

        let pre = Preintegration::integrate(&measurements, &Vector3::zeros(), &Vector3::zeros());
        let end = pre.predict(
            &Isometry3::identity(),
            &Vector3::zeros(),
            &g_vec,
            0.0,
        );
        assert_relative_eq!(end.v_w.x, accel * 1.0, epsilon = 1e-6);
        // Euler integration converges to a t^2 / 2 at dt -> 0
        assert_relative_eq!(end.t_wp.translation.vector.x, 0.5 * accel, epsilon = 2e-2);
    }

    #[test]
    fn test_bias_jacobians_finite_difference() {
        let measurements: Vec<ImuMeasurement> = (0..21)
            .map(|i| {
                let t = i as f64 * 0.005;
                ImuMeasurement::new(
                    t,
                    Vector3::new(0.4, -0.2, 0.3),
                    Vector3::new(0.5, 0.2, GRAVITY_MAGNITUDE - 0.3),
                )
            })
            .collect();
        let b_g = Vector3::new(0.01, -0.02, 0.005);
        let b_a = Vector3::new(-0.05, 0.02, 0.01);
        let nominal = Preintegration::integrate(&measurements, &b_g, &b_a);

        let eps = 1e-6;
        for i in 0..3 {
            let mut db = Vector3::zeros();
            db[i] = eps;
            let plus_g = Preintegration::integrate(&measurements, &(b_g + db), &b_a);
            let minus_g = Preintegration::integrate(&measurements, &(b_g - db), &b_a);
            let plus_a = Preintegration::integrate(&measurements, &b_g, &(b_a + db));
            let minus_a = Preintegration::integrate(&measurements, &b_g, &(b_a - db));

            // delta_r(b + db) ~ delta_r(b) * exp(dr_dbg * db)
            let dr_num = (nominal.delta_r.inverse() * plus_g.delta_r).scaled_axis() / eps;
            assert_relative_eq!(
                nominal.dr_dbg.column(i).into_owned(),
                dr_num,
                epsilon = 1e-4
            );

            let dv_num = (plus_g.delta_v - minus_g.delta_v) / (2.0 * eps);
            assert_relative_eq!(
                nominal.dv_dbg.column(i).into_owned(),
                dv_num,
                epsilon = 1e-4
            );
            let dp_num = (plus_g.delta_p - minus_g.delta_p) / (2.0 * eps);
            assert_relative_eq!(
                nominal.dp_dbg.column(i).into_owned(),
                dp_num,
                epsilon = 1e-4
            );

            let dva_num = (plus_a.delta_v - minus_a.delta_v) / (2.0 * eps);
            assert_relative_eq!(
                nominal.dv_dba.column(i).into_owned(),
                dva_num,
                epsilon = 1e-6
            );
            let dpa_num = (plus_a.delta_p - minus_a.delta_p) / (2.0 * eps);
            assert_relative_eq!(
                nominal.dp_dba.column(i).into_owned(),
                dpa_num,
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_integrate_residual_trajectory() {
        let g_vec = gravity_vector(&Vector2::zeros());
        let measurements: Vec<ImuMeasurement> = (0..6)
            .map(|i| {
                ImuMeasurement::new(
                    i as f64 * 0.02,
                    Vector3::zeros(),
                    Vector3::new(0.0, 0.0, GRAVITY_MAGNITUDE),
                )
            })
            .collect();
        let mut poses = Vec::new();
        let end = integrate_residual(
            &Isometry3::identity(),
            &Vector3::new(1.0, 0.0, 0.0),
            &measurements,
            &Vector3::zeros(),
            &Vector3::zeros(),
            &g_vec,
            &mut poses,
        );
        assert_eq!(poses.len(), 6);
        assert_relative_eq!(end.time, 0.1, epsilon = 1e-12);
        // constant velocity drift
        assert_relative_eq!(end.t_wp.translation.vector.x, 0.1, epsilon = 1e-10);
    }
}
