//! Camera models and the multi-camera rig.
//!
//! The adjuster only touches cameras through the [`CameraModel`] trait:
//! projection, unprojection, the projection Jacobians with respect to the
//! sensor-frame point and the intrinsic parameters, and the intrinsic /
//! extrinsic accessors. Concrete projection models live in their own
//! modules; [`pinhole::PinholeCamera`] is provided.

use nalgebra::{DVector, Isometry3, Matrix2x3, OMatrix, Vector2, Vector3, U2};

pub mod pinhole;

pub use pinhole::PinholeCamera;

/// Jacobian of the projection with respect to the intrinsic parameters.
pub type IntrinsicJacobian = OMatrix<f64, U2, nalgebra::Dyn>;

/// Interface the bundle adjuster requires from a projection model.
///
/// A camera owns its intrinsic parameter vector and its extrinsic pose
/// `T_vs` (sensor frame to body frame).
pub trait CameraModel: Send + Sync {
    /// Number of intrinsic parameters.
    fn num_params(&self) -> usize;

    /// Current intrinsic parameter vector.
    fn params(&self) -> DVector<f64>;

    /// Replace the intrinsic parameter vector.
    fn set_params(&mut self, params: &DVector<f64>);

    /// Extrinsic pose `T_vs` (sensor to body).
    fn pose(&self) -> Isometry3<f64>;

    /// Replace the extrinsic pose.
    fn set_pose(&mut self, t_vs: Isometry3<f64>);

    /// Project with an explicit parameter vector, leaving the camera's own
    /// parameters untouched. Used for per-pose intrinsics and for
    /// evaluation from parallel workers.
    fn project_with_params(&self, params: &DVector<f64>, p_s: &Vector3<f64>) -> Vector2<f64>;

    /// Unproject a pixel to a unit-norm ray in the sensor frame.
    fn unproject(&self, z: &Vector2<f64>) -> Vector3<f64>;

    /// Jacobian of the projection with respect to the sensor-frame point,
    /// with an explicit parameter vector.
    fn dproject_dpoint_with_params(
        &self,
        params: &DVector<f64>,
        p_s: &Vector3<f64>,
    ) -> Matrix2x3<f64>;

    /// Jacobian of the projection with respect to the intrinsic parameters,
    /// with an explicit parameter vector.
    fn dproject_dparams_with_params(
        &self,
        params: &DVector<f64>,
        p_s: &Vector3<f64>,
    ) -> IntrinsicJacobian;

    /// Project a sensor-frame point to pixel coordinates.
    fn project(&self, p_s: &Vector3<f64>) -> Vector2<f64> {
        self.project_with_params(&self.params(), p_s)
    }

    /// Jacobian of the projection with respect to the sensor-frame point.
    fn dproject_dpoint(&self, p_s: &Vector3<f64>) -> Matrix2x3<f64> {
        self.dproject_dpoint_with_params(&self.params(), p_s)
    }

    /// Jacobian of the projection with respect to the intrinsic parameters.
    fn dproject_dparams(&self, p_s: &Vector3<f64>) -> IntrinsicJacobian {
        self.dproject_dparams_with_params(&self.params(), p_s)
    }

    /// Transfer a homogeneous point `(x, w)` through `t` and project.
    ///
    /// `w` is the homogeneous weight: 1 for world points, the inverse depth
    /// for normalized rays. Projection models are scale invariant, so the
    /// transferred point `R·x + w·t` can be projected directly.
    fn transfer_3d(&self, t: &Isometry3<f64>, x: &Vector3<f64>, w: f64) -> Vector2<f64> {
        self.project(&(t.rotation * x + w * t.translation.vector))
    }

    /// [`CameraModel::transfer_3d`] with an explicit parameter vector.
    fn transfer_3d_with_params(
        &self,
        params: &DVector<f64>,
        t: &Isometry3<f64>,
        x: &Vector3<f64>,
        w: f64,
    ) -> Vector2<f64> {
        self.project_with_params(params, &(t.rotation * x + w * t.translation.vector))
    }
}

/// A set of cameras rigidly attached to the body frame.
#[derive(Default)]
pub struct Rig {
    pub cameras: Vec<Box<dyn CameraModel>>,
}

impl Rig {
    pub fn new() -> Self {
        Self {
            cameras: Vec::new(),
        }
    }

    /// Add a camera and return its index within the rig.
    pub fn add_camera(&mut self, camera: Box<dyn CameraModel>) -> usize {
        self.cameras.push(camera);
        self.cameras.len() - 1
    }

    pub fn num_cams(&self) -> usize {
        self.cameras.len()
    }

    /// Extrinsic pose of camera `cam_id`.
    pub fn t_vs(&self, cam_id: usize) -> Isometry3<f64> {
        self.cameras[cam_id].pose()
    }
}
