//! Inertial solver scenarios: two poses bridged by a preintegrated IMU
//! residual.

mod common;

use approx::assert_relative_eq;
use argus_ba::imu::preintegration::integrate_residual;
use argus_ba::imu::{ImuMeasurement, GRAVITY_MAGNITUDE};
use argus_ba::manifold::exp_decoupled;
use argus_ba::{BaOptions, BundleAdjuster, StateConfig};
use common::{pose_with, single_cam_rig};
use nalgebra::{DMatrix, Vector3, Vector6};

fn tight_options() -> BaOptions {
    BaOptions {
        error_change_threshold: 1e-12,
        param_change_threshold: 1e-10,
        ..BaOptions::default()
    }
}

/// Constant specific force, no rotation, 1 second at 100 Hz.
fn synthetic_measurements() -> Vec<ImuMeasurement> {
    (0..101)
        .map(|i| {
            ImuMeasurement::new(
                i as f64 * 0.01,
                Vector3::zeros(),
                Vector3::new(1.0, 0.0, GRAVITY_MAGNITUDE),
            )
        })
        .collect()
}

/// Two poses joined by a single IMU residual: the second pose and its
/// velocity are recovered from the preintegrated measurements.
#[test]
fn test_imu_only_two_pose_recovery() {
    let config = StateConfig::new(0, 15).unwrap();
    let mut ba = BundleAdjuster::new(config, single_cam_rig(), tight_options()).unwrap();

    let t1 = pose_with(Vector3::zeros(), Vector3::zeros());
    let v1 = Vector3::new(0.2, 0.0, 0.0);
    let measurements = synthetic_measurements();

    // Ground truth from the solver's own integrator, so the residual is
    // exactly zero at the optimum.
    let mut trajectory = Vec::new();
    let end = integrate_residual(
        &t1,
        &v1,
        &measurements,
        &Vector3::zeros(),
        &Vector3::zeros(),
        &Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE),
        &mut trajectory,
    );

    let p1 = ba.add_pose_with_state(t1, v1, Vector6::zeros(), None, false);
    let perturbation = Vector6::new(0.05, -0.03, 0.04, 0.01, -0.02, 0.015);
    let p2 = ba.add_pose_with_state(
        exp_decoupled(&end.t_wp, &perturbation),
        end.v_w + Vector3::new(0.1, -0.05, 0.08),
        Vector6::zeros(),
        None,
        true,
    );
    ba.add_imu_residual(p1, p2, measurements, DMatrix::identity(15, 15))
        .unwrap();

    ba.solve(20, 1.0, false);

    assert!(ba.summary().result.is_good());
    assert_relative_eq!(
        ba.pose(p2).t_wp.translation.vector,
        end.t_wp.translation.vector,
        epsilon = 1e-6
    );
    assert_relative_eq!(
        ba.pose(p2).t_wp.rotation.to_rotation_matrix().into_inner(),
        end.t_wp.rotation.to_rotation_matrix().into_inner(),
        epsilon = 1e-6
    );
    assert_relative_eq!(ba.pose(p2).v_w, end.v_w, epsilon = 1e-6);
    // The bias random-walk rows pin the second pose's biases to the
    // first's.
    assert_relative_eq!(ba.pose(p2).b.norm(), 0.0, epsilon = 1e-8);
    assert_eq!(ba.summary().num_cond_inertial_residuals, 1);
}

/// Gravity in the calibration block: assembly of the inertial calibration
/// coupling, with the solution staying at the correct gravity.
#[test]
fn test_imu_with_gravity_in_calib() {
    let config = StateConfig::new(0, 15).unwrap().with_gravity_in_calib();
    let mut ba = BundleAdjuster::new(config, single_cam_rig(), tight_options()).unwrap();

    let t1 = pose_with(Vector3::zeros(), Vector3::zeros());
    let v1 = Vector3::zeros();
    let measurements = synthetic_measurements();

    let mut trajectory = Vec::new();
    let end = integrate_residual(
        &t1,
        &v1,
        &measurements,
        &Vector3::zeros(),
        &Vector3::zeros(),
        &Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE),
        &mut trajectory,
    );

    let p1 = ba.add_pose_with_state(t1, v1, Vector6::zeros(), None, false);
    let p2 = ba.add_pose_with_state(
        exp_decoupled(&end.t_wp, &Vector6::new(0.02, -0.01, 0.01, 0.005, -0.004, 0.006)),
        end.v_w,
        Vector6::zeros(),
        None,
        true,
    );
    ba.add_imu_residual(p1, p2, measurements, DMatrix::identity(15, 15))
        .unwrap();
    // Pin the second pose: without it a gravity shift is exactly
    // compensable by moving the pose and velocity.
    ba.add_unary_residual(p2, end.t_wp, nalgebra::Matrix6::identity() * 100.0, true);

    ba.solve(20, 1.0, false);

    assert!(ba.summary().result.is_good());
    assert_relative_eq!(
        ba.pose(p2).t_wp.translation.vector,
        end.t_wp.translation.vector,
        epsilon = 1e-5
    );
    // Gravity stays at its (correct) initial direction.
    assert_relative_eq!(
        ba.imu().g_vec,
        Vector3::new(0.0, 0.0, -GRAVITY_MAGNITUDE),
        epsilon = 1e-5
    );
}
