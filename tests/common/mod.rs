//! Shared helpers for the integration suites.
#![allow(dead_code)]

use argus_ba::camera::{PinholeCamera, Rig};
use nalgebra::{Isometry3, UnitQuaternion, Vector2, Vector3, Vector4};

/// A single-camera rig with a pinhole model.
pub fn single_cam_rig() -> Rig {
    let mut rig = Rig::new();
    rig.add_camera(Box::new(PinholeCamera::new(450.0, 450.0, 320.0, 240.0)));
    rig
}

/// A rig with `n` pinhole cameras spread along the body x axis.
pub fn multi_cam_rig(n: usize) -> Rig {
    let mut rig = Rig::new();
    for i in 0..n {
        let t_vs = Isometry3::from_parts(
            Vector3::new(0.1 * i as f64, 0.0, 0.0).into(),
            UnitQuaternion::identity(),
        );
        rig.add_camera(Box::new(
            PinholeCamera::new(450.0, 450.0, 320.0, 240.0).with_pose(t_vs),
        ));
    }
    rig
}

/// Body pose translated by `t` with a small deterministic rotation.
pub fn pose_with(t: Vector3<f64>, rot: Vector3<f64>) -> Isometry3<f64> {
    Isometry3::from_parts(t.into(), UnitQuaternion::from_scaled_axis(rot))
}

/// Exact pixel measurement of a world point from a pose/camera pair.
pub fn observe(
    rig: &Rig,
    cam_id: usize,
    t_wp: &Isometry3<f64>,
    x_w: &Vector4<f64>,
) -> Vector2<f64> {
    let t_sw = (t_wp * rig.t_vs(cam_id)).inverse();
    rig.cameras[cam_id].transfer_3d(&t_sw, &x_w.fixed_rows::<3>(0).into(), x_w[3])
}
