//! The bundle adjuster: state arena, consumer API, the manifold update
//! layer, and the residual evaluator.
//!
//! The problem builder lives in [`build`], the normal-equation assembly and
//! trust-region driver in [`solve`].

use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix6, Vector2, Vector3, Vector4, Vector6,
};
use tracing::debug;

use crate::camera::Rig;
use crate::core::{
    BaOptions, BinaryResidual, Delta, ImuResidual, Landmark, Pose, ProjectionResidual,
    StateConfig, Summary, UnaryResidual,
};
use crate::error::{BaError, BaResult};
use crate::imu::{gravity_vector, preintegration, ImuMeasurement, ImuState};
use crate::linalg::{matrix_sqrt, BlockDiag, BlockMatrix};
use crate::manifold::{exp_decoupled, log_decoupled};

mod build;
mod solve;

/// Joint optimizer over poses, landmarks, inertial state, and calibration.
pub struct BundleAdjuster {
    pub(crate) config: StateConfig,
    pub(crate) options: BaOptions,
    pub(crate) rig: Rig,
    pub(crate) imu: ImuState,

    pub(crate) poses: Vec<Pose>,
    pub(crate) landmarks: Vec<Landmark>,
    pub(crate) proj_residuals: Vec<ProjectionResidual>,
    pub(crate) binary_residuals: Vec<BinaryResidual>,
    pub(crate) unary_residuals: Vec<UnaryResidual>,
    pub(crate) inertial_residuals: Vec<ImuResidual>,
    pub(crate) conditioning_proj_residuals: Vec<usize>,
    pub(crate) conditioning_inertial_residuals: Vec<usize>,

    pub(crate) num_active_poses: usize,
    pub(crate) num_active_landmarks: usize,
    pub(crate) root_pose_id: usize,

    // Stacked Jacobians and residuals, rebuilt each outer iteration. The
    // matrices keep their storage between iterations.
    pub(crate) j_pr: BlockMatrix,
    pub(crate) jt_pr: BlockMatrix,
    pub(crate) j_l: BlockMatrix,
    pub(crate) j_pp: BlockMatrix,
    pub(crate) jt_pp: BlockMatrix,
    pub(crate) j_u: BlockMatrix,
    pub(crate) jt_u: BlockMatrix,
    pub(crate) j_i: BlockMatrix,
    pub(crate) jt_i: BlockMatrix,
    pub(crate) j_kpr: BlockMatrix,
    pub(crate) jt_kpr: BlockMatrix,
    pub(crate) j_ki: BlockMatrix,
    pub(crate) jt_ki: BlockMatrix,
    pub(crate) r_pr: DVector<f64>,
    pub(crate) r_pp: DVector<f64>,
    pub(crate) r_u: DVector<f64>,
    pub(crate) r_i: DVector<f64>,

    // Reduced-system storage
    pub(crate) rhs_p: DVector<f64>,
    pub(crate) rhs_k: DVector<f64>,
    pub(crate) rhs_l: DVector<f64>,
    pub(crate) vi: BlockDiag,
    pub(crate) jt_l_j_pr: BlockMatrix,
    pub(crate) jt_pr_j_l_vi: BlockMatrix,
    pub(crate) jt_l_j_kpr: BlockMatrix,
    pub(crate) s: DMatrix<f64>,

    pub(crate) is_param_mask_used: bool,
    pub(crate) proj_error: f64,
    pub(crate) binary_error: f64,
    pub(crate) unary_error: f64,
    pub(crate) inertial_error: f64,

    pub(crate) translation_enabled: bool,
    pub(crate) last_tvs: Isometry3<f64>,
    /// `None` requests auto-initialization from the first good GN step
    pub(crate) trust_region_size: Option<f64>,

    pub(crate) summary: Summary,
}

impl BundleAdjuster {
    pub fn new(config: StateConfig, rig: Rig, options: BaOptions) -> BaResult<Self> {
        if config.jkpr_used() && rig.num_cams() == 0 {
            return Err(BaError::InvalidInput(
                "calibration requested but the rig has no cameras".to_string(),
            ));
        }
        let pose_dim = config.pose_dim;
        let lm_dim = config.lm_dim;
        let imu = ImuState::default();
        let last_tvs = imu.t_vs;
        Ok(Self {
            config,
            options,
            rig,
            imu,
            poses: Vec::new(),
            landmarks: Vec::new(),
            proj_residuals: Vec::new(),
            binary_residuals: Vec::new(),
            unary_residuals: Vec::new(),
            inertial_residuals: Vec::new(),
            conditioning_proj_residuals: Vec::new(),
            conditioning_inertial_residuals: Vec::new(),
            num_active_poses: 0,
            num_active_landmarks: 0,
            root_pose_id: 0,
            j_pr: BlockMatrix::new(0, 0, ProjectionResidual::RES_SIZE, config.pr_pose_dim()),
            jt_pr: BlockMatrix::new(0, 0, config.pr_pose_dim(), ProjectionResidual::RES_SIZE),
            j_l: BlockMatrix::new(0, 0, ProjectionResidual::RES_SIZE, lm_dim.max(1)),
            j_pp: BlockMatrix::new(0, 0, BinaryResidual::RES_SIZE, pose_dim),
            jt_pp: BlockMatrix::new(0, 0, pose_dim, BinaryResidual::RES_SIZE),
            j_u: BlockMatrix::new(0, 0, UnaryResidual::RES_SIZE, pose_dim),
            jt_u: BlockMatrix::new(0, 0, pose_dim, UnaryResidual::RES_SIZE),
            j_i: BlockMatrix::new(0, 0, config.imu_res_size(), pose_dim),
            jt_i: BlockMatrix::new(0, 0, pose_dim, config.imu_res_size()),
            j_kpr: BlockMatrix::new(0, 0, ProjectionResidual::RES_SIZE, 1),
            jt_kpr: BlockMatrix::new(0, 0, 1, ProjectionResidual::RES_SIZE),
            j_ki: BlockMatrix::new(0, 0, config.imu_res_size(), 1),
            jt_ki: BlockMatrix::new(0, 0, 1, config.imu_res_size()),
            r_pr: DVector::zeros(0),
            r_pp: DVector::zeros(0),
            r_u: DVector::zeros(0),
            r_i: DVector::zeros(0),
            rhs_p: DVector::zeros(0),
            rhs_k: DVector::zeros(0),
            rhs_l: DVector::zeros(0),
            vi: BlockDiag::new(0, lm_dim.max(1)),
            jt_l_j_pr: BlockMatrix::new(0, 0, lm_dim.max(1), config.pr_pose_dim()),
            jt_pr_j_l_vi: BlockMatrix::new(0, 0, config.pr_pose_dim(), lm_dim.max(1)),
            jt_l_j_kpr: BlockMatrix::new(0, 0, lm_dim.max(1), 1),
            s: DMatrix::zeros(0, 0),
            is_param_mask_used: false,
            proj_error: 0.0,
            binary_error: 0.0,
            unary_error: 0.0,
            inertial_error: 0.0,
            // Coarse-to-fine: with T_vs in the calibration the translation
            // part of the inertial error stays disabled until the estimate
            // settles.
            translation_enabled: !config.tvs_in_calib,
            last_tvs,
            trust_region_size: None,
            summary: Summary::default(),
        })
    }

    // ------------------------------------------------------------------
    // Consumer API
    // ------------------------------------------------------------------

    pub fn set_rig(&mut self, rig: Rig) {
        self.rig = rig;
    }

    /// Set the gravity direction through its two-angle parameterization.
    pub fn set_gravity(&mut self, g: Vector2<f64>) {
        self.imu.g = g;
        self.imu.g_vec = gravity_vector(&g);
    }

    /// Set the sensor-to-body extrinsic transform on the IMU state and the
    /// first rig camera.
    pub fn set_tvs(&mut self, t_vs: Isometry3<f64>) {
        self.imu.t_vs = t_vs;
        self.last_tvs = t_vs;
        if let Some(cam) = self.rig.cameras.first_mut() {
            cam.set_pose(t_vs);
        }
    }

    pub fn add_pose(&mut self, t_wp: Isometry3<f64>, is_active: bool) -> usize {
        self.add_pose_with_state(t_wp, Vector3::zeros(), Vector6::zeros(), None, is_active)
    }

    pub fn add_pose_with_state(
        &mut self,
        t_wp: Isometry3<f64>,
        v_w: Vector3<f64>,
        b: Vector6<f64>,
        cam_params: Option<DVector<f64>>,
        is_active: bool,
    ) -> usize {
        let id = self.poses.len();
        let mut pose = Pose::new(id, t_wp, is_active, self.config.pose_dim);
        pose.v_w = v_w;
        pose.b = b;
        if let Some(params) = cam_params {
            pose.cam_params = params;
        }
        if is_active {
            if self.num_active_poses == 0 {
                self.root_pose_id = id;
            }
            pose.opt_id = self.num_active_poses;
            self.num_active_poses += 1;
        }
        self.poses.push(pose);
        id
    }

    pub fn add_landmark(
        &mut self,
        x_w: Vector4<f64>,
        ref_pose_id: usize,
        ref_cam_id: usize,
        z_ref: Vector2<f64>,
        is_active: bool,
    ) -> usize {
        let id = self.landmarks.len();
        let mut lm = Landmark::new(x_w, ref_pose_id, ref_cam_id, z_ref, is_active, self.config.lm_dim);
        if is_active {
            lm.opt_id = self.num_active_landmarks;
            self.num_active_landmarks += 1;
        }
        self.landmarks.push(lm);
        id
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_projection_residual(
        &mut self,
        landmark_id: usize,
        ref_pose_id: usize,
        meas_pose_id: usize,
        cam_id: usize,
        z: Vector2<f64>,
        weight: f64,
        is_conditioning: bool,
    ) -> usize {
        let residual_id = self.proj_residuals.len();
        let num_params = self.rig.cameras[cam_id].num_params();
        self.proj_residuals.push(ProjectionResidual {
            residual_id,
            landmark_id,
            meas_pose_id,
            ref_pose_id,
            cam_id,
            z,
            weight,
            orig_weight: weight,
            is_conditioning,
            residual: Vector2::zeros(),
            mahalanobis_distance: 0.0,
            dz_dx_meas: nalgebra::Matrix2x6::zeros(),
            dz_dx_ref: nalgebra::Matrix2x6::zeros(),
            dz_dlm: DMatrix::zeros(ProjectionResidual::RES_SIZE, self.config.lm_dim.max(1)),
            dz_dcam_params: crate::camera::IntrinsicJacobian::zeros(num_params),
            dz_dtvs: nalgebra::Matrix2x6::zeros(),
            residual_offset: residual_id * ProjectionResidual::RES_SIZE,
        });

        self.landmarks[landmark_id].proj_residuals.push(residual_id);
        self.poses[meas_pose_id].proj_residuals.push(residual_id);
        // In inverse-depth mode the reference pose carries its own Jacobian
        // block.
        if self.config.lm_dim == 1 && ref_pose_id != meas_pose_id {
            self.poses[ref_pose_id].proj_residuals.push(residual_id);
        }
        if is_conditioning {
            self.conditioning_proj_residuals.push(residual_id);
        }
        residual_id
    }

    pub fn add_binary_residual(
        &mut self,
        x1_id: usize,
        x2_id: usize,
        t_12: Isometry3<f64>,
        cov_inv: Matrix6<f64>,
        use_rotation: bool,
        weight: f64,
    ) -> usize {
        let residual_id = self.binary_residuals.len();
        self.binary_residuals.push(BinaryResidual {
            residual_id,
            x1_id,
            x2_id,
            t_12,
            cov_inv,
            cov_inv_sqrt: matrix6_sqrt(&cov_inv),
            use_rotation,
            weight,
            orig_weight: weight,
            residual: Vector6::zeros(),
            mahalanobis_distance: 0.0,
            dz_dx1: Matrix6::zeros(),
            dz_dx2: Matrix6::zeros(),
            residual_offset: residual_id * BinaryResidual::RES_SIZE,
        });
        self.poses[x1_id].binary_residuals.push(residual_id);
        self.poses[x2_id].binary_residuals.push(residual_id);
        residual_id
    }

    pub fn add_unary_residual(
        &mut self,
        pose_id: usize,
        t_wp: Isometry3<f64>,
        cov_inv: Matrix6<f64>,
        use_rotation: bool,
    ) -> usize {
        let residual_id = self.unary_residuals.len();
        self.unary_residuals.push(UnaryResidual {
            residual_id,
            pose_id,
            t_wp,
            orig_cov_inv: cov_inv,
            cov_inv,
            cov_inv_sqrt: matrix6_sqrt(&cov_inv),
            use_rotation,
            residual: Vector6::zeros(),
            mahalanobis_distance: 0.0,
            dz_dx: Matrix6::zeros(),
            residual_offset: residual_id * UnaryResidual::RES_SIZE,
        });
        self.poses[pose_id].unary_residuals.push(residual_id);
        residual_id
    }

    pub fn add_imu_residual(
        &mut self,
        pose1_id: usize,
        pose2_id: usize,
        measurements: Vec<ImuMeasurement>,
        cov_inv: DMatrix<f64>,
    ) -> BaResult<usize> {
        if !self.config.vel_in_state() {
            return Err(BaError::InvalidInput(
                "inertial residuals require velocity in the pose state".to_string(),
            ));
        }
        let res_size = self.config.imu_res_size();
        if cov_inv.nrows() != res_size || cov_inv.ncols() != res_size {
            return Err(BaError::InvalidInput(format!(
                "inertial covariance must be {res_size}x{res_size}"
            )));
        }
        let residual_id = self.inertial_residuals.len();
        self.inertial_residuals.push(ImuResidual {
            residual_id,
            pose1_id,
            pose2_id,
            measurements,
            poses: Vec::new(),
            orig_cov_inv: cov_inv.clone(),
            cov_inv: cov_inv.clone(),
            cov_inv_sqrt: matrix_sqrt(&cov_inv),
            residual: DVector::zeros(res_size),
            mahalanobis_distance: 0.0,
            dz_dx1: DMatrix::zeros(res_size, self.config.pose_dim),
            dz_dx2: DMatrix::zeros(res_size, self.config.pose_dim),
            dz_dg: crate::core::residuals::GravityJacobian::zeros(),
            residual_offset: residual_id * res_size,
        });
        self.poses[pose1_id].inertial_residuals.push(residual_id);
        self.poses[pose2_id].inertial_residuals.push(residual_id);
        if !self.poses[pose1_id].is_active && self.poses[pose2_id].is_active {
            self.conditioning_inertial_residuals.push(residual_id);
        }
        Ok(residual_id)
    }

    // ------------------------------------------------------------------
    // Readouts
    // ------------------------------------------------------------------

    pub fn pose(&self, id: usize) -> &Pose {
        &self.poses[id]
    }

    pub fn pose_mut(&mut self, id: usize) -> &mut Pose {
        &mut self.poses[id]
    }

    pub fn landmark(&self, id: usize) -> &Landmark {
        &self.landmarks[id]
    }

    pub fn num_poses(&self) -> usize {
        self.poses.len()
    }

    pub fn num_landmarks(&self) -> usize {
        self.landmarks.len()
    }

    pub fn rig(&self) -> &Rig {
        &self.rig
    }

    pub fn rig_mut(&mut self) -> &mut Rig {
        &mut self.rig
    }

    pub fn imu(&self) -> &ImuState {
        &self.imu
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn options(&self) -> &BaOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut BaOptions {
        &mut self.options
    }

    /// Fraction of a landmark's projection residuals currently flagged as
    /// outliers.
    pub fn landmark_outlier_ratio(&self, id: usize) -> f64 {
        let lm = &self.landmarks[id];
        if lm.proj_residuals.is_empty() {
            0.0
        } else {
            lm.num_outlier_residuals as f64 / lm.proj_residuals.len() as f64
        }
    }

    // ------------------------------------------------------------------
    // Manifold update layer
    // ------------------------------------------------------------------

    /// Apply `coef * delta` to the state, where
    /// `coef = (rollback ? -1 : 1) * damping`, subtracting element-wise and
    /// retracting poses through the decoupled exponential.
    pub fn apply_update(&mut self, delta: &Delta, rollback: bool, damping: f64) {
        self.summary.delta_norm = delta.delta_l.norm() + delta.delta_p.norm();

        let coef = if rollback { -1.0 } else { 1.0 } * damping;
        let num_cam_params = self
            .rig
            .cameras
            .first()
            .map_or(0, |c| c.num_params());

        // Gravity
        if !self.inertial_residuals.is_empty()
            && self.config.gravity_in_calib
            && delta.delta_k.len() >= 2
        {
            let dg = Vector2::new(delta.delta_k[0], delta.delta_k[1]) * coef;
            self.imu.g -= dg;
            self.imu.g_vec = gravity_vector(&self.imu.g);
            debug!(delta = ?dg, gravity = ?self.imu.g, "gravity updated");
        }

        // Camera intrinsics
        if self.config.cam_params_in_calib && delta.delta_k.len() > 0 {
            let offset = self.config.cam_params_offset();
            if let Some(cam) = self.rig.cameras.first_mut() {
                let mut params = cam.params();
                for i in 0..num_cam_params {
                    params[i] -= coef * delta.delta_k[offset + i];
                }
                cam.set_params(&params);
            }
            // In inverse-depth mode the stored rays were unprojected with
            // the old intrinsics; re-anchor them, preserving length.
            if self.config.lm_dim == 1 {
                if let Some(cam) = self.rig.cameras.first() {
                    for lm in &mut self.landmarks {
                        let norm = lm.x_s.fixed_rows::<3>(0).norm();
                        let ray = cam.unproject(&lm.z_ref) * norm;
                        lm.x_s.fixed_rows_mut::<3>(0).copy_from(&ray);
                    }
                }
            }
        }

        // Camera extrinsics
        if self.config.tvs_in_calib && delta.delta_k.len() > 0 {
            let offset = self.config.tvs_offset(num_cam_params);
            let mut xi = Vector6::zeros();
            for i in 0..6 {
                xi[i] = -coef * delta.delta_k[offset + i];
            }
            if let Some(cam) = self.rig.cameras.first_mut() {
                let t_vs = exp_decoupled(&cam.pose(), &xi);
                cam.set_pose(t_vs);
                self.imu.t_vs = t_vs;
            }
        }

        // Poses
        let pose_dim = self.config.pose_dim;
        for pose in &mut self.poses {
            if pose.is_active {
                let offset = pose.opt_id * pose_dim;
                let mut xi = Vector6::zeros();
                for i in 0..6 {
                    xi[i] = -coef * delta.delta_p[offset + i];
                }
                pose.t_wp = exp_decoupled(&pose.t_wp, &xi);

                if self.config.vel_in_state() {
                    for i in 0..3 {
                        pose.v_w[i] -= coef * delta.delta_p[offset + 6 + i];
                    }
                }
                if self.config.bias_in_state() {
                    for i in 0..6 {
                        pose.b[i] -= coef * delta.delta_p[offset + 9 + i];
                    }
                }
            }
            pose.invalidate_tsw_cache();
        }

        // Landmarks
        let lm_dim = self.config.lm_dim;
        for lm in &mut self.landmarks {
            if !lm.is_active || lm_dim == 0 {
                continue;
            }
            let offset = lm.opt_id * lm_dim;
            if lm_dim == 1 {
                let d = coef * delta.delta_l[offset];
                lm.x_s[3] -= d;
                if lm.x_s[3] < 0.0 {
                    lm.x_s[3] += d;
                    lm.is_reliable = false;
                }
            } else {
                for i in 0..3 {
                    lm.x_w[i] -= coef * delta.delta_l[offset + i];
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Residual evaluator
    // ------------------------------------------------------------------

    /// Recompute residuals and accumulate Mahalanobis sums for each family
    /// with a non-`None` output. Does not touch Jacobians.
    pub fn evaluate_residuals(
        &mut self,
        proj_error: Option<&mut f64>,
        binary_error: Option<&mut f64>,
        unary_error: Option<&mut f64>,
        inertial_error: Option<&mut f64>,
    ) {
        for i in 0..self.poses.len() {
            let rig = &self.rig;
            // borrow of disjoint fields
            let pose = &mut self.poses[i];
            pose.warm_tsw_cache(rig);
        }

        if let Some(proj_error) = proj_error {
            *proj_error = 0.0;
            for lm in &mut self.landmarks {
                lm.num_outlier_residuals = 0;
            }

            let BundleAdjuster {
                ref mut proj_residuals,
                ref poses,
                ref mut landmarks,
                ref mut rig,
                ref options,
                ref config,
                ..
            } = *self;

            for res in proj_residuals.iter_mut() {
                let lm = &landmarks[res.landmark_id];
                let pose = &poses[res.meas_pose_id];
                let ref_pose = &poses[res.ref_pose_id];
                let t_sw_m = pose.tsw(res.cam_id, rig);
                let t_ws_r = ref_pose.tsw(lm.ref_cam_id, rig).inverse();

                let cam = &mut rig.cameras[res.cam_id];
                let backup_params = cam.params();
                if options.use_per_pose_cam_params {
                    cam.set_params(&pose.cam_params);
                }

                let p = if config.lm_dim == 3 {
                    cam.transfer_3d(&t_sw_m, &lm.x_w.fixed_rows::<3>(0).into(), lm.x_w[3])
                } else {
                    cam.transfer_3d(
                        &(t_sw_m * t_ws_r),
                        &lm.x_s.fixed_rows::<3>(0).into(),
                        lm.x_s[3],
                    )
                };
                res.residual = res.z - p;

                if options.use_per_pose_cam_params {
                    cam.set_params(&backup_params);
                }

                res.mahalanobis_distance = res.residual.norm_squared() * res.weight;
                *proj_error += res.mahalanobis_distance;
                if res.residual.norm() > options.projection_outlier_threshold {
                    landmarks[res.landmark_id].num_outlier_residuals += 1;
                }
            }
        }

        if let Some(unary_error) = unary_error {
            *unary_error = 0.0;
            for res in &mut self.unary_residuals {
                let pose = &self.poses[res.pose_id];
                res.residual = log_decoupled(&pose.t_wp, &res.t_wp);
                if !res.use_rotation {
                    res.residual.fixed_rows_mut::<3>(3).fill(0.0);
                }
                res.mahalanobis_distance =
                    (res.residual.transpose() * res.cov_inv * res.residual)[0];
                *unary_error += res.mahalanobis_distance;
            }
        }

        if let Some(binary_error) = binary_error {
            *binary_error = 0.0;
            for res in &mut self.binary_residuals {
                let pose1 = &self.poses[res.x1_id];
                let pose2 = &self.poses[res.x2_id];
                res.residual = log_decoupled(&(pose1.t_wp.inverse() * pose2.t_wp), &res.t_12);
                if !res.use_rotation {
                    res.residual.fixed_rows_mut::<3>(3).fill(0.0);
                }
                res.mahalanobis_distance = res.residual.norm_squared() * res.weight;
                *binary_error += res.mahalanobis_distance;
            }
        }

        if let Some(inertial_error) = inertial_error {
            *inertial_error = 0.0;
            let gravity = if self.config.gravity_in_calib {
                gravity_vector(&self.imu.g)
            } else {
                self.imu.g_vec
            };
            let bias_in_state = self.config.bias_in_state();
            let translation_enabled = self.translation_enabled;

            let BundleAdjuster {
                ref mut inertial_residuals,
                ref poses,
                ..
            } = *self;

            for res in inertial_residuals.iter_mut() {
                let pose1 = &poses[res.pose1_id];
                let pose2 = &poses[res.pose2_id];
                let imu_pose = preintegration::integrate_residual(
                    &pose1.t_wp,
                    &pose1.v_w,
                    &res.measurements,
                    &pose1.b.fixed_rows::<3>(0).into(),
                    &pose1.b.fixed_rows::<3>(3).into(),
                    &gravity,
                    &mut res.poses,
                );

                res.residual.fill(0.0);
                res.residual
                    .rows_mut(0, 6)
                    .copy_from(&log_decoupled(&imu_pose.t_wp, &pose2.t_wp));
                res.residual
                    .rows_mut(6, 3)
                    .copy_from(&(imu_pose.v_w - pose2.v_w));
                if bias_in_state {
                    res.residual.rows_mut(9, 6).copy_from(&(pose1.b - pose2.b));
                }
                if !translation_enabled {
                    res.residual.rows_mut(0, 3).fill(0.0);
                }

                res.mahalanobis_distance =
                    (res.residual.transpose() * &res.cov_inv * &res.residual)[0];
                *inertial_error += res.mahalanobis_distance;
            }

            // Once the extrinsic estimate settles, enable the translation
            // part of the inertial error.
            if !self.inertial_residuals.is_empty()
                && !self.translation_enabled
                && self.config.tvs_in_calib
            {
                let log_dif = log_decoupled(&self.imu.t_vs, &self.last_tvs).norm();
                debug!(log_dif, "T_vs stability");
                if log_dif < 0.01 && self.poses.len() >= 30 {
                    debug!("enabling translation errors");
                    self.translation_enabled = true;
                }
                self.last_tvs = self.imu.t_vs;
            }
        }
    }
}

/// Principal square root of a symmetric PSD 6x6 matrix.
pub(crate) fn matrix6_sqrt(m: &Matrix6<f64>) -> Matrix6<f64> {
    let dyn_m = DMatrix::from_fn(6, 6, |i, j| m[(i, j)]);
    let r = matrix_sqrt(&dyn_m);
    Matrix6::from_fn(|i, j| r[(i, j)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::PinholeCamera;
    use approx::assert_relative_eq;

    fn simple_rig() -> Rig {
        let mut rig = Rig::new();
        rig.add_camera(Box::new(PinholeCamera::new(450.0, 450.0, 320.0, 240.0)));
        rig
    }

    #[test]
    fn test_add_pose_assigns_opt_ids() {
        let config = StateConfig::new(3, 6).unwrap();
        let mut ba = BundleAdjuster::new(config, simple_rig(), BaOptions::default()).unwrap();
        let p0 = ba.add_pose(Isometry3::identity(), false);
        let p1 = ba.add_pose(Isometry3::identity(), true);
        let p2 = ba.add_pose(Isometry3::identity(), true);
        assert_eq!(ba.pose(p0).is_active, false);
        assert_eq!(ba.pose(p1).opt_id, 0);
        assert_eq!(ba.pose(p2).opt_id, 1);
        assert_eq!(ba.num_active_poses, 2);
        assert_eq!(ba.root_pose_id, p1);
    }

    #[test]
    fn test_apply_rollback_identity() {
        let config = StateConfig::new(3, 15).unwrap();
        let mut ba = BundleAdjuster::new(config, simple_rig(), BaOptions::default()).unwrap();
        let p = ba.add_pose(
            Isometry3::from_parts(
                Vector3::new(1.0, 2.0, 3.0).into(),
                nalgebra::UnitQuaternion::from_scaled_axis(Vector3::new(0.1, 0.2, -0.1)),
            ),
            true,
        );
        let lm = ba.add_landmark(
            Vector4::new(0.5, -0.5, 4.0, 1.0),
            p,
            0,
            Vector2::new(300.0, 200.0),
            true,
        );

        let before_pose = ba.pose(p).t_wp;
        let before_lm = ba.landmark(lm).x_w;

        let mut delta = Delta::zeros(15, 0, 3);
        for i in 0..15 {
            delta.delta_p[i] = 0.01 * (i as f64 + 1.0);
        }
        for i in 0..3 {
            delta.delta_l[i] = 0.05 * (i as f64 - 1.0);
        }

        ba.apply_update(&delta, false, 1.0);
        ba.apply_update(&delta, true, 1.0);

        let after_pose = ba.pose(p).t_wp;
        assert_relative_eq!(
            after_pose.translation.vector,
            before_pose.translation.vector,
            epsilon = 1e-10
        );
        assert_relative_eq!(
            after_pose.rotation.to_rotation_matrix().into_inner(),
            before_pose.rotation.to_rotation_matrix().into_inner(),
            epsilon = 1e-10
        );
        assert_relative_eq!(ba.landmark(lm).x_w, before_lm, epsilon = 1e-10);
        assert_relative_eq!(ba.pose(p).v_w.norm(), 0.0, epsilon = 1e-10);
        assert_relative_eq!(ba.pose(p).b.norm(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_apply_rollback_identity_calibration() {
        let config = StateConfig::new(0, 15)
            .unwrap()
            .with_gravity_in_calib()
            .with_cam_params_in_calib()
            .with_tvs_in_calib();
        let mut ba = BundleAdjuster::new(config, simple_rig(), BaOptions::default()).unwrap();
        let p1 = ba.add_pose(Isometry3::identity(), true);
        let p2 = ba.add_pose(Isometry3::identity(), true);
        let measurements = vec![
            crate::imu::ImuMeasurement::new(0.0, Vector3::zeros(), Vector3::zeros()),
            crate::imu::ImuMeasurement::new(0.1, Vector3::zeros(), Vector3::zeros()),
        ];
        ba.add_imu_residual(p1, p2, measurements, DMatrix::identity(15, 15))
            .unwrap();

        let g_before = ba.imu.g;
        let params_before = ba.rig.cameras[0].params();
        let tvs_before = ba.rig.cameras[0].pose();

        let mut delta = Delta::zeros(30, 12, 0);
        for i in 0..12 {
            delta.delta_k[i] = 0.02 * (i as f64 + 1.0);
        }
        ba.apply_update(&delta, false, 1.0);
        ba.apply_update(&delta, true, 1.0);

        assert_relative_eq!(ba.imu.g, g_before, epsilon = 1e-10);
        assert_relative_eq!(ba.rig.cameras[0].params(), params_before, epsilon = 1e-10);
        let tvs_after = ba.rig.cameras[0].pose();
        assert_relative_eq!(
            tvs_after.translation.vector,
            tvs_before.translation.vector,
            epsilon = 1e-10
        );
        assert_relative_eq!(
            tvs_after.rotation.to_rotation_matrix().into_inner(),
            tvs_before.rotation.to_rotation_matrix().into_inner(),
            epsilon = 1e-10
        );
        assert_relative_eq!(
            ba.imu.t_vs.translation.vector,
            tvs_before.translation.vector,
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_inverse_depth_rollback_marks_unreliable() {
        let config = StateConfig::new(1, 6).unwrap();
        let mut ba = BundleAdjuster::new(config, simple_rig(), BaOptions::default()).unwrap();
        let p = ba.add_pose(Isometry3::identity(), true);
        let lm = ba.add_landmark(
            Vector4::new(0.0, 0.0, 2.0, 1.0),
            p,
            0,
            Vector2::new(320.0, 240.0),
            true,
        );
        ba.landmarks[lm].x_s = Vector4::new(0.0, 0.0, 1.0, 0.5);

        let mut delta = Delta::zeros(6, 0, 1);
        delta.delta_l[0] = 1.0; // would push inverse depth to -0.5
        ba.apply_update(&delta, false, 1.0);

        assert_relative_eq!(ba.landmark(lm).x_s[3], 0.5, epsilon = 1e-12);
        assert!(!ba.landmark(lm).is_reliable);
    }

    #[test]
    fn test_unary_residual_evaluation() {
        let config = StateConfig::new(0, 6).unwrap();
        let mut ba = BundleAdjuster::new(config, simple_rig(), BaOptions::default()).unwrap();
        let p = ba.add_pose(
            Isometry3::from_parts(
                Vector3::new(0.1, 0.0, 0.0).into(),
                nalgebra::UnitQuaternion::identity(),
            ),
            true,
        );
        ba.add_unary_residual(p, Isometry3::identity(), Matrix6::identity(), true);

        let mut unary = 0.0;
        ba.evaluate_residuals(None, None, Some(&mut unary), None);
        assert_relative_eq!(unary, 0.01, epsilon = 1e-12);
    }
}
