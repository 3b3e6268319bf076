//! Problem construction: residual + Jacobian evaluation, robust-norm
//! weighting, parameter masking, and sparse block insertion.
//!
//! Projection and inertial residuals are evaluated in parallel; each worker
//! writes only into its own residual's fields and contributes its squared
//! errors to a reduction that only the median of is consumed. Insertion
//! into the sparse block matrices is single-threaded and happens strictly
//! after evaluation, in residual-id sorted order so every column insert is
//! O(1).

use nalgebra::{DMatrix, DVector, Matrix2x6, Matrix3, Matrix3x6, Vector3};
use rayon::prelude::*;
use tracing::debug;

use crate::camera::Rig;
use crate::core::{
    BaOptions, BinaryResidual, ImuResidual, Landmark, Pose, ProjectionResidual, StateConfig,
    UnaryResidual,
};
use crate::imu::{dgravity_dparams, gravity_vector, ImuState, Preintegration};
use crate::linalg::matrix_sqrt;
use crate::manifold::log_decoupled;
use crate::manifold::se3::{dlog_decoupled_dtarget, dlog_decoupled_dx, drelative_dx};
use crate::manifold::so3::{hat, log_so3, right_jacobian_inv};

use super::{matrix6_sqrt, BundleAdjuster};

/// Huber constant scale on the residual median, after Zhang,
/// "Parameter Estimation Techniques: A Tutorial with Application to Conic
/// Fitting".
const HUBER_SCALE: f64 = 1.2107;

/// Median of a squared-error buffer via quick-select.
fn median(errors: &mut [f64]) -> Option<f64> {
    if errors.is_empty() {
        return None;
    }
    let mid = errors.len() / 2;
    let (_, m, _) = errors.select_nth_unstable_by(mid, f64::total_cmp);
    Some(*m)
}

fn huber_constant(errors: &mut [f64]) -> Option<f64> {
    median(errors).map(|m| HUBER_SCALE * m.sqrt())
}

impl BundleAdjuster {
    /// Evaluate residuals and Jacobians for all four families, apply
    /// robust-norm weights, and insert everything into the sparse system.
    pub(crate) fn build_problem(&mut self) {
        let num_poses = self.num_active_poses;
        let num_lm = self.num_active_landmarks;
        let num_proj = self.proj_residuals.len();
        let num_bin = self.binary_residuals.len();
        let num_un = self.unary_residuals.len();
        let num_im = self.inertial_residuals.len();
        let pose_dim = self.config.pose_dim;
        let pr_pose_dim = self.config.pr_pose_dim();
        let lm_dim = self.config.lm_dim;
        let imu_res = self.config.imu_res_size();
        let num_cam_params = self.rig.cameras.first().map_or(0, |c| c.num_params());
        let calib_dim = self.config.calib_dim(num_cam_params);

        // Resize and clear the stacked system; block storage is retained.
        if num_proj > 0 {
            self.j_pr.resize(num_proj, num_poses);
            self.jt_pr.resize(num_poses, num_proj);
            self.j_l.resize(num_proj, num_lm);
            self.r_pr = DVector::zeros(num_proj * ProjectionResidual::RES_SIZE);
            if self.config.jkpr_used() && calib_dim > 0 {
                self.j_kpr
                    .reshape_blocks(ProjectionResidual::RES_SIZE, calib_dim);
                self.j_kpr.resize(num_proj, 1);
                self.jt_kpr
                    .reshape_blocks(calib_dim, ProjectionResidual::RES_SIZE);
                self.jt_kpr.resize(1, num_proj);
            }
        }
        if num_bin > 0 {
            self.j_pp.resize(num_bin, num_poses);
            self.jt_pp.resize(num_poses, num_bin);
            self.r_pp = DVector::zeros(num_bin * BinaryResidual::RES_SIZE);
        }
        if num_un > 0 {
            self.j_u.resize(num_un, num_poses);
            self.jt_u.resize(num_poses, num_un);
            self.r_u = DVector::zeros(num_un * UnaryResidual::RES_SIZE);
        }
        if num_im > 0 {
            self.j_i.resize(num_im, num_poses);
            self.jt_i.resize(num_poses, num_im);
            self.r_i = DVector::zeros(num_im * imu_res);
            if self.config.gravity_in_calib && calib_dim > 0 {
                self.j_ki.reshape_blocks(imu_res, calib_dim);
                self.j_ki.resize(num_im, 1);
                self.jt_ki.reshape_blocks(calib_dim, imu_res);
                self.jt_ki.resize(1, num_im);
            }
        }

        self.is_param_mask_used = false;

        // Pre-warm the per-camera transform caches and regularize poses
        // with no constraints at all, which would otherwise make the
        // Hessian singular.
        let mut are_all_active = true;
        for i in 0..self.poses.len() {
            {
                let rig = &self.rig;
                self.poses[i].warm_tsw_cache(rig);
            }
            let pose = &mut self.poses[i];
            pose.is_param_mask_used = false;
            pose.param_mask.iter_mut().for_each(|m| *m = true);
            if !pose.is_active {
                are_all_active = false;
            }
            if pose.proj_residuals.is_empty()
                && pose.binary_residuals.is_empty()
                && pose.unary_residuals.is_empty()
                && pose.inertial_residuals.is_empty()
            {
                pose.is_param_mask_used = true;
                pose.param_mask.iter_mut().for_each(|m| *m = false);
            }
        }

        // Poses without inertial constraints have unobservable velocities
        // and biases; freeze those slots.
        if self.config.vel_in_state() {
            let bias_in_state = self.config.bias_in_state();
            for pose in &mut self.poses {
                if pose.inertial_residuals.is_empty() && pose.is_active {
                    debug!(
                        pose_id = pose.id,
                        "no inertial residuals, regularizing velocity and biases"
                    );
                    pose.is_param_mask_used = true;
                    pose.param_mask.iter_mut().for_each(|m| *m = true);
                    for i in 6..9 {
                        pose.param_mask[i] = false;
                    }
                    if bias_in_state {
                        for i in 9..15 {
                            pose.param_mask[i] = false;
                        }
                    }
                }
            }
        }

        // With every pose active and no unary prior the gauge is free;
        // mask the root pose's unobservable directions.
        if are_all_active && num_un == 0 && self.options.enable_auto_regularization {
            debug!(
                root_pose_id = self.root_pose_id,
                "all poses active, regularizing root pose translation"
            );
            let reg_dim = self.gravity_regularization_dimension();
            let bias_in_state = self.config.bias_in_state();
            let vel_in_state = self.config.vel_in_state();
            let gravity_in_calib = self.config.gravity_in_calib;
            let regularize_biases = self.options.regularize_biases_in_batch;
            let root_pose = &mut self.poses[self.root_pose_id];
            root_pose.is_param_mask_used = true;
            root_pose.param_mask.iter_mut().for_each(|m| *m = true);
            for i in 0..3 {
                root_pose.param_mask[i] = false;
            }
            if bias_in_state && regularize_biases {
                for i in 9..15 {
                    root_pose.param_mask[i] = false;
                }
            }
            if !vel_in_state || gravity_in_calib {
                // No gravity to accommodate (or it is explicitly
                // parameterized): the initial rotation is free too.
                for i in 3..6 {
                    root_pose.param_mask[i] = false;
                }
            } else {
                // Rotation about the gravity axis is the only rotational
                // null space.
                debug!(reg_dim, "regularizing gravity-aligned rotation axis");
                root_pose.param_mask[reg_dim] = false;
            }
        }

        // ---------------- projection residuals ----------------
        self.proj_error = 0.0;
        let (mut errors, mut cond_errors): (Vec<f64>, Vec<f64>) = {
            let BundleAdjuster {
                ref mut proj_residuals,
                ref poses,
                ref landmarks,
                ref rig,
                ref options,
                ref config,
                ..
            } = *self;

            let results: Vec<(bool, f64)> = proj_residuals
                .par_iter_mut()
                .map(|res| {
                    linearize_projection(res, poses, landmarks, rig, config, options);
                    (res.is_conditioning, res.mahalanobis_distance)
                })
                .collect();

            let mut errors = Vec::with_capacity(results.len());
            let mut cond_errors = Vec::new();
            for (is_cond, m) in results {
                if is_cond {
                    cond_errors.push(m);
                } else {
                    errors.push(m);
                }
            }
            (errors, cond_errors)
        };

        if num_proj > 0 {
            let c_huber = huber_constant(&mut errors);
            let cond_c_huber = huber_constant(&mut cond_errors);
            debug!(?c_huber, ?cond_c_huber, "projection Huber constants");
            let use_robust = self.options.use_robust_norm_for_proj_residuals;

            for res in &mut self.proj_residuals {
                let e = res.mahalanobis_distance.sqrt();
                let threshold = if res.is_conditioning {
                    cond_c_huber
                } else {
                    c_huber
                };
                let is_outlier = threshold.is_some_and(|c| e > c);
                if is_outlier && use_robust {
                    if let Some(c) = c_huber {
                        res.weight *= c / e;
                    }
                }
                res.mahalanobis_distance = res.residual.norm_squared() * res.weight;
                self.r_pr
                    .rows_mut(res.residual_offset, ProjectionResidual::RES_SIZE)
                    .copy_from(&(res.residual * res.weight.sqrt()));
                self.proj_error += res.mahalanobis_distance;
            }
        }

        // ---------------- binary residuals ----------------
        self.binary_error = 0.0;
        for res in &mut self.binary_residuals {
            let t_w1 = self.poses[res.x1_id].t_wp;
            let t_w2 = self.poses[res.x2_id].t_wp;
            res.residual = log_decoupled(&(t_w1.inverse() * t_w2), &res.t_12);
            let (dz_dx1, dz_dx2) = drelative_dx(&t_w1, &t_w2, &res.t_12);
            res.dz_dx1 = dz_dx1;
            res.dz_dx2 = dz_dx2;

            if !res.use_rotation {
                res.residual.fixed_rows_mut::<3>(3).fill(0.0);
                res.dz_dx1.fixed_view_mut::<3, 6>(3, 0).fill(0.0);
                res.dz_dx2.fixed_view_mut::<3, 6>(3, 0).fill(0.0);
            }

            res.weight = res.orig_weight;
            self.r_pp
                .rows_mut(res.residual_offset, BinaryResidual::RES_SIZE)
                .copy_from(&(res.cov_inv_sqrt * res.residual * res.weight.sqrt()));
            res.mahalanobis_distance = res.residual.norm_squared() * res.weight;
            self.binary_error += res.mahalanobis_distance;
        }

        // ---------------- unary residuals ----------------
        self.unary_error = 0.0;
        let mut unary_errors = Vec::with_capacity(num_un);
        for res in &mut self.unary_residuals {
            let t_wp = self.poses[res.pose_id].t_wp;
            res.dz_dx = dlog_decoupled_dx(&t_wp, &res.t_wp);
            res.residual = log_decoupled(&t_wp, &res.t_wp);

            if !res.use_rotation {
                res.residual.fixed_rows_mut::<3>(3).fill(0.0);
                res.dz_dx.fixed_view_mut::<3, 6>(3, 0).fill(0.0);
            }

            res.cov_inv = res.orig_cov_inv;
            res.mahalanobis_distance =
                (res.residual.transpose() * res.cov_inv * res.residual)[0];
            unary_errors.push(res.mahalanobis_distance);
        }

        if let Some(c_huber) = huber_constant(&mut unary_errors) {
            for res in &mut self.unary_residuals {
                let e = res.mahalanobis_distance.sqrt();
                let weight = if e > c_huber { c_huber / e } else { 1.0 };

                res.cov_inv = res.orig_cov_inv * weight;
                res.cov_inv_sqrt = matrix6_sqrt(&res.cov_inv);
                let res_std_form = res.cov_inv_sqrt * res.residual;
                self.r_u
                    .rows_mut(res.residual_offset, UnaryResidual::RES_SIZE)
                    .copy_from(&res_std_form);
                // The problem is in standard form, no extra weighting.
                res.mahalanobis_distance = res_std_form.norm_squared();
                self.unary_error += res.mahalanobis_distance;
            }
        }

        // ---------------- inertial residuals ----------------
        self.inertial_error = 0.0;
        let mut inertial_errors: Vec<f64> = {
            let BundleAdjuster {
                ref mut inertial_residuals,
                ref poses,
                ref imu,
                ref config,
                translation_enabled,
                ..
            } = *self;

            inertial_residuals
                .par_iter_mut()
                .map(|res| {
                    linearize_inertial(res, poses, imu, config, translation_enabled);
                    res.mahalanobis_distance
                })
                .collect()
        };

        if let Some(c_huber) = huber_constant(&mut inertial_errors) {
            let use_robust = self.options.use_robust_norm_for_inertial_residuals;
            for res in &mut self.inertial_residuals {
                // Conditioning edges pin the active window against an
                // inactive pose and are never down-weighted.
                let is_cond = !self.poses[res.pose1_id].is_active
                    && self.poses[res.pose2_id].is_active;
                let e = res.mahalanobis_distance.sqrt();
                let weight = if e > c_huber && !is_cond && use_robust {
                    c_huber / e
                } else {
                    1.0
                };

                res.cov_inv = &res.orig_cov_inv * weight;
                res.cov_inv_sqrt = matrix_sqrt(&res.cov_inv);
                let res_std_form = &res.cov_inv_sqrt * &res.residual;
                self.r_i
                    .rows_mut(res.residual_offset, imu_res)
                    .copy_from(&res_std_form);
                res.mahalanobis_distance = res_std_form.norm_squared();
                self.inertial_error += res.mahalanobis_distance;
            }
        }

        // ---------------- sparse insertion ----------------
        // Per-column reservations from residual fanout.
        let mut j_pr_sizes = vec![0usize; num_poses];
        let mut j_pp_sizes = vec![0usize; num_poses];
        let mut j_u_sizes = vec![0usize; num_poses];
        let mut j_i_sizes = vec![0usize; num_poses];
        let mut j_l_sizes = vec![0usize; num_lm];

        for pose in &self.poses {
            if pose.is_active {
                j_pr_sizes[pose.opt_id] = pose.proj_residuals.len();
                j_pp_sizes[pose.opt_id] = pose.binary_residuals.len();
                j_u_sizes[pose.opt_id] = pose.unary_residuals.len();
                j_i_sizes[pose.opt_id] = pose.inertial_residuals.len();
            }
        }
        for lm in &self.landmarks {
            if lm.is_active {
                j_l_sizes[lm.opt_id] = lm.proj_residuals.len();
            }
        }

        if num_proj > 0 && num_poses > 0 {
            self.j_pr.reserve(&j_pr_sizes);
            self.jt_pr
                .reserve_constant(if lm_dim == 1 { 2 } else { 1 });
            if self.config.jkpr_used() && calib_dim > 0 {
                self.j_kpr.reserve_constant(num_proj);
                self.jt_kpr.reserve_constant(1);
            }
        }
        if num_bin > 0 {
            self.j_pp.reserve(&j_pp_sizes);
            self.jt_pp.reserve_constant(2);
        }
        if num_un > 0 {
            self.j_u.reserve(&j_u_sizes);
            self.jt_u.reserve_constant(1);
        }
        if num_im > 0 {
            self.j_i.reserve(&j_i_sizes);
            self.jt_i.reserve_constant(2);
            if self.config.gravity_in_calib && calib_dim > 0 {
                self.j_ki.reserve_constant(num_im);
                self.jt_ki.reserve_constant(1);
            }
        }
        if num_lm > 0 {
            self.j_l.reserve(&j_l_sizes);
        }

        let mut any_mask_used = false;
        for pose_idx in 0..self.poses.len() {
            if !self.poses[pose_idx].is_active {
                continue;
            }
            // Sorting by residual id keeps the per-column inserts in row
            // order.
            self.poses[pose_idx].proj_residuals.sort_unstable();
            self.poses[pose_idx].binary_residuals.sort_unstable();
            self.poses[pose_idx].unary_residuals.sort_unstable();
            self.poses[pose_idx].inertial_residuals.sort_unstable();

            let opt_id = self.poses[pose_idx].opt_id;
            let pose_id = self.poses[pose_idx].id;
            let mask_used = self.poses[pose_idx].is_param_mask_used;
            let param_mask = self.poses[pose_idx].param_mask.clone();

            for k in 0..self.poses[pose_idx].proj_residuals.len() {
                let id = self.poses[pose_idx].proj_residuals[k];
                let res = &self.proj_residuals[id];
                let mut dz: Matrix2x6<f64> = if res.meas_pose_id == pose_id {
                    res.dz_dx_meas
                } else {
                    res.dz_dx_ref
                };
                if mask_used {
                    any_mask_used = true;
                    for (i, &keep) in param_mask.iter().take(pr_pose_dim).enumerate() {
                        if !keep {
                            dz.column_mut(i).fill(0.0);
                        }
                    }
                }
                // The weight multiplies both factors as square roots so
                // that Jt*J and Jt*r carry the full weight.
                let w_sqrt = res.weight.sqrt();
                self.j_pr.insert(
                    res.residual_id,
                    opt_id,
                    DMatrix::from_fn(2, pr_pose_dim, |i, j| dz[(i, j)] * w_sqrt),
                );
                self.jt_pr.insert(
                    opt_id,
                    res.residual_id,
                    DMatrix::from_fn(pr_pose_dim, 2, |i, j| dz[(j, i)] * w_sqrt),
                );
            }

            for k in 0..self.poses[pose_idx].binary_residuals.len() {
                let id = self.poses[pose_idx].binary_residuals[k];
                let res = &self.binary_residuals[id];
                let mut dz = if res.x1_id == pose_id {
                    res.dz_dx1
                } else {
                    res.dz_dx2
                };
                if mask_used {
                    any_mask_used = true;
                    for (i, &keep) in param_mask.iter().take(6).enumerate() {
                        if !keep {
                            dz.column_mut(i).fill(0.0);
                        }
                    }
                }
                let w_sqrt = res.weight.sqrt();
                let std = res.cov_inv_sqrt * dz * w_sqrt;
                let mut block = DMatrix::zeros(BinaryResidual::RES_SIZE, pose_dim);
                block.view_mut((0, 0), (6, 6)).copy_from(&std);
                self.j_pp.insert(res.residual_id, opt_id, block);

                let mut block_t = DMatrix::zeros(pose_dim, BinaryResidual::RES_SIZE);
                block_t
                    .view_mut((0, 0), (6, 6))
                    .copy_from(&(dz.transpose() * res.cov_inv_sqrt * w_sqrt));
                self.jt_pp.insert(opt_id, res.residual_id, block_t);
            }

            for k in 0..self.poses[pose_idx].unary_residuals.len() {
                let id = self.poses[pose_idx].unary_residuals[k];
                let res = &mut self.unary_residuals[id];
                if mask_used {
                    any_mask_used = true;
                    for (i, &keep) in param_mask.iter().take(6).enumerate() {
                        if !keep {
                            res.dz_dx.column_mut(i).fill(0.0);
                        }
                    }
                }
                let std = res.cov_inv_sqrt * res.dz_dx;
                let mut block = DMatrix::zeros(UnaryResidual::RES_SIZE, pose_dim);
                block.view_mut((0, 0), (6, 6)).copy_from(&std);
                self.j_u.insert(res.residual_id, opt_id, block);

                let mut block_t = DMatrix::zeros(pose_dim, UnaryResidual::RES_SIZE);
                block_t
                    .view_mut((0, 0), (6, 6))
                    .copy_from(&(res.dz_dx.transpose() * res.cov_inv_sqrt));
                self.jt_u.insert(opt_id, res.residual_id, block_t);
            }

            for k in 0..self.poses[pose_idx].inertial_residuals.len() {
                let id = self.poses[pose_idx].inertial_residuals[k];
                let res = &self.inertial_residuals[id];
                let mut dz = if res.pose1_id == pose_id {
                    res.dz_dx1.clone()
                } else {
                    res.dz_dx2.clone()
                };
                if mask_used {
                    any_mask_used = true;
                    for (i, &keep) in param_mask.iter().take(pose_dim).enumerate() {
                        if !keep {
                            dz.column_mut(i).fill(0.0);
                        }
                    }
                }
                self.j_i
                    .insert(res.residual_id, opt_id, &res.cov_inv_sqrt * &dz);
                self.jt_i
                    .insert(opt_id, res.residual_id, dz.transpose() * &res.cov_inv_sqrt);
            }
        }
        self.is_param_mask_used = any_mask_used;

        // Calibration Jacobians.
        if calib_dim > 0 {
            if self.config.gravity_in_calib {
                for res in &self.inertial_residuals {
                    let mut dz_dg_pad = DMatrix::zeros(imu_res, 2);
                    dz_dg_pad.view_mut((0, 0), (9, 2)).copy_from(&res.dz_dg);

                    let mut block = DMatrix::zeros(imu_res, calib_dim);
                    block
                        .view_mut((0, 0), (imu_res, 2))
                        .copy_from(&(&res.cov_inv_sqrt * &dz_dg_pad));
                    self.j_ki.insert(res.residual_id, 0, block);

                    // The velocity rows of the gravity Jacobian are
                    // down-weighted in the gradient.
                    let mut dz_dg_down = dz_dg_pad;
                    {
                        let mut vel_rows = dz_dg_down.view_mut((6, 0), (3, 2));
                        vel_rows *= 0.1;
                    }
                    let mut block_t = DMatrix::zeros(calib_dim, imu_res);
                    block_t
                        .view_mut((0, 0), (2, imu_res))
                        .copy_from(&(dz_dg_down.transpose() * &res.cov_inv_sqrt));
                    self.jt_ki.insert(0, res.residual_id, block_t);
                }
            }

            if self.config.jkpr_used() {
                let cam_offset = self.config.cam_params_offset();
                let tvs_offset = self.config.tvs_offset(num_cam_params);
                for res in &self.proj_residuals {
                    let weight_sqrt = res.weight.sqrt();
                    let mut block = DMatrix::zeros(ProjectionResidual::RES_SIZE, calib_dim);
                    if self.config.cam_params_in_calib {
                        for j in 0..num_cam_params {
                            for i in 0..2 {
                                block[(i, cam_offset + j)] =
                                    res.dz_dcam_params[(i, j)] * weight_sqrt;
                            }
                        }
                    }
                    if self.config.tvs_in_calib {
                        for j in 0..6 {
                            for i in 0..2 {
                                block[(i, tvs_offset + j)] = res.dz_dtvs[(i, j)] * weight_sqrt;
                            }
                        }
                    }
                    self.jt_kpr.insert(0, res.residual_id, block.transpose());
                    self.j_kpr.insert(res.residual_id, 0, block);
                }
            }
        }

        // Landmark Jacobians.
        for lm_idx in 0..self.landmarks.len() {
            if lm_dim == 0 || !self.landmarks[lm_idx].is_active {
                continue;
            }
            self.landmarks[lm_idx].proj_residuals.sort_unstable();
            let opt_id = self.landmarks[lm_idx].opt_id;
            for k in 0..self.landmarks[lm_idx].proj_residuals.len() {
                let id = self.landmarks[lm_idx].proj_residuals[k];
                let res = &self.proj_residuals[id];
                self.j_l
                    .insert(res.residual_id, opt_id, &res.dz_dlm * res.weight.sqrt());
            }
        }
    }

    /// Index of the root-pose rotation axis most aligned with gravity; the
    /// rotation about gravity is the unobservable direction.
    pub(crate) fn gravity_regularization_dimension(&self) -> usize {
        let g_b = self.poses[self.root_pose_id].t_wp.rotation.inverse() * self.imu.g_vec;
        let mut max_i = 0;
        for i in 1..3 {
            if g_b[i].abs() > g_b[max_i].abs() {
                max_i = i;
            }
        }
        3 + max_i
    }
}

/// Evaluate one projection residual and its Jacobians.
///
/// Writes only into `res`; poses, landmarks and the rig are read-only, so
/// this is safe to run from parallel workers.
fn linearize_projection(
    res: &mut ProjectionResidual,
    poses: &[Pose],
    landmarks: &[Landmark],
    rig: &Rig,
    config: &StateConfig,
    options: &BaOptions,
) {
    res.weight = res.orig_weight;

    let lm = &landmarks[res.landmark_id];
    let pose = &poses[res.meas_pose_id];
    let ref_pose = &poses[res.ref_pose_id];
    let cam = &rig.cameras[res.cam_id];
    let params = if options.use_per_pose_cam_params && pose.cam_params.len() > 0 {
        pose.cam_params.clone()
    } else {
        cam.params()
    };

    let t_vs_m = rig.t_vs(res.cam_id);
    let rm: Matrix3<f64> = pose.t_wp.rotation.to_rotation_matrix().into_inner();
    let rv: Matrix3<f64> = t_vs_m.rotation.to_rotation_matrix().into_inner();
    let t_m = pose.t_wp.translation.vector;
    let tv = t_vs_m.translation.vector;

    // Homogeneous world-frame point and its weight.
    let (x_h, w): (Vector3<f64>, f64) = if config.lm_dim == 1 {
        let t_ws_r = ref_pose.tsw(lm.ref_cam_id, rig).inverse();
        let ray: Vector3<f64> = lm.x_s.fixed_rows::<3>(0).into();
        let rho = lm.x_s[3];
        (
            t_ws_r.rotation * ray + rho * t_ws_r.translation.vector,
            rho,
        )
    } else {
        (lm.x_w.fixed_rows::<3>(0).into(), lm.x_w[3])
    };

    // Body- and sensor-frame points under the measurement pose.
    let y = rm.transpose() * (x_h - w * t_m);
    let p_s = rv.transpose() * (y - w * tv);

    res.residual = res.z - cam.project_with_params(&params, &p_s);
    res.mahalanobis_distance = res.residual.norm_squared() * res.weight;

    let dpi = cam.dproject_dpoint_with_params(&params, &p_s);
    let m = rv.transpose() * rm.transpose();

    let same_pose = res.meas_pose_id == res.ref_pose_id && config.lm_dim == 1;
    if same_pose {
        // The transfer is pose independent when a pose observes its own
        // reference ray.
        res.dz_dx_meas = Matrix2x6::zeros();
        res.dz_dx_ref = Matrix2x6::zeros();
    } else {
        let mut j_meas = Matrix3x6::zeros();
        j_meas.fixed_view_mut::<3, 3>(0, 0).copy_from(&(-w * m));
        j_meas
            .fixed_view_mut::<3, 3>(0, 3)
            .copy_from(&(rv.transpose() * hat(&y)));
        res.dz_dx_meas = -dpi * j_meas;

        if config.lm_dim == 1 {
            let t_vs_r = rig.t_vs(lm.ref_cam_id);
            let rv_r: Matrix3<f64> = t_vs_r.rotation.to_rotation_matrix().into_inner();
            let rr: Matrix3<f64> = ref_pose.t_wp.rotation.to_rotation_matrix().into_inner();
            let ray: Vector3<f64> = lm.x_s.fixed_rows::<3>(0).into();
            let rho = lm.x_s[3];
            let u = rv_r * ray + rho * t_vs_r.translation.vector;

            let mut j_ref = Matrix3x6::zeros();
            j_ref.fixed_view_mut::<3, 3>(0, 0).copy_from(&(rho * m));
            j_ref
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(-m * rr * hat(&u)));
            res.dz_dx_ref = -dpi * j_ref;
        } else {
            res.dz_dx_ref = Matrix2x6::zeros();
        }
    }

    match config.lm_dim {
        1 => {
            let t_ws_r = ref_pose.tsw(lm.ref_cam_id, rig).inverse();
            let t_sm = pose.tsw(res.cam_id, rig) * t_ws_r;
            let col = -dpi * t_sm.translation.vector;
            res.dz_dlm.set_column(0, &col);
        }
        3 => {
            let d = -dpi * m;
            for j in 0..3 {
                res.dz_dlm.set_column(j, &d.column(j).into_owned());
            }
        }
        _ => {}
    }

    if config.cam_params_in_calib {
        res.dz_dcam_params = -cam.dproject_dparams_with_params(&params, &p_s);
    }

    if config.tvs_in_calib {
        let ray: Vector3<f64> = lm.x_s.fixed_rows::<3>(0).into();
        let rho = lm.x_s[3];
        let mut j_tvs = Matrix3x6::zeros();
        if config.lm_dim == 1 {
            let a = pose.t_wp.inverse() * ref_pose.t_wp;
            let ra: Matrix3<f64> = a.rotation.to_rotation_matrix().into_inner();
            j_tvs
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(rho * rv.transpose() * (ra - Matrix3::identity())));
            j_tvs
                .fixed_view_mut::<3, 3>(0, 3)
                .copy_from(&(hat(&p_s) - rv.transpose() * ra * rv * hat(&ray)));
        } else {
            j_tvs
                .fixed_view_mut::<3, 3>(0, 0)
                .copy_from(&(-w * rv.transpose()));
            j_tvs.fixed_view_mut::<3, 3>(0, 3).copy_from(&hat(&p_s));
        }
        res.dz_dtvs = -dpi * j_tvs;
    }
}

/// Evaluate one inertial residual and its Jacobians.
fn linearize_inertial(
    res: &mut ImuResidual,
    poses: &[Pose],
    imu: &ImuState,
    config: &StateConfig,
    translation_enabled: bool,
) {
    let pose1 = &poses[res.pose1_id];
    let pose2 = &poses[res.pose2_id];
    let b_g: Vector3<f64> = pose1.b.fixed_rows::<3>(0).into();
    let b_a: Vector3<f64> = pose1.b.fixed_rows::<3>(3).into();
    let gravity = if config.gravity_in_calib {
        gravity_vector(&imu.g)
    } else {
        imu.g_vec
    };

    let pre = Preintegration::integrate(&res.measurements, &b_g, &b_a);
    let imu_pose = crate::imu::preintegration::integrate_residual(
        &pose1.t_wp,
        &pose1.v_w,
        &res.measurements,
        &b_g,
        &b_a,
        &gravity,
        &mut res.poses,
    );

    let bias_in_state = config.bias_in_state();
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

    let r1: Matrix3<f64> = pose1.t_wp.rotation.to_rotation_matrix().into_inner();
    let dr: Matrix3<f64> = pre.delta_r.to_rotation_matrix().into_inner();
    let dt = pre.delta_t;
    let phi = log_so3(&(pose2.t_wp.rotation.inverse() * imu_pose.t_wp.rotation));
    let jr_inv = right_jacobian_inv(&phi);
    let dgdp = dgravity_dparams(&imu.g);

    res.dz_dx1.fill(0.0);
    // translation rows
    res.dz_dx1
        .view_mut((0, 0), (3, 3))
        .copy_from(&Matrix3::identity());
    res.dz_dx1
        .view_mut((0, 3), (3, 3))
        .copy_from(&(-r1 * hat(&pre.delta_p)));
    res.dz_dx1
        .view_mut((0, 6), (3, 3))
        .copy_from(&(Matrix3::identity() * dt));
    // rotation rows
    res.dz_dx1
        .view_mut((3, 3), (3, 3))
        .copy_from(&(jr_inv * dr.transpose()));
    // velocity rows
    res.dz_dx1
        .view_mut((6, 3), (3, 3))
        .copy_from(&(-r1 * hat(&pre.delta_v)));
    res.dz_dx1
        .view_mut((6, 6), (3, 3))
        .copy_from(&Matrix3::identity());
    if bias_in_state {
        res.dz_dx1
            .view_mut((0, 9), (3, 3))
            .copy_from(&(r1 * pre.dp_dbg));
        res.dz_dx1
            .view_mut((0, 12), (3, 3))
            .copy_from(&(r1 * pre.dp_dba));
        res.dz_dx1
            .view_mut((3, 9), (3, 3))
            .copy_from(&(jr_inv * pre.dr_dbg));
        res.dz_dx1
            .view_mut((6, 9), (3, 3))
            .copy_from(&(r1 * pre.dv_dbg));
        res.dz_dx1
            .view_mut((6, 12), (3, 3))
            .copy_from(&(r1 * pre.dv_dba));
        // bias random-walk rows
        res.dz_dx1
            .view_mut((9, 9), (6, 6))
            .copy_from(&DMatrix::identity(6, 6));
    }

    res.dz_dx2.fill(0.0);
    let dpose2 = dlog_decoupled_dtarget(&imu_pose.t_wp, &pose2.t_wp);
    res.dz_dx2
        .view_mut((0, 0), (6, 6))
        .copy_from(&DMatrix::from_fn(6, 6, |i, j| dpose2[(i, j)]));
    res.dz_dx2
        .view_mut((6, 6), (3, 3))
        .copy_from(&(-Matrix3::identity()));
    if bias_in_state {
        res.dz_dx2
            .view_mut((9, 9), (6, 6))
            .copy_from(&(-DMatrix::identity(6, 6)));
    }

    res.dz_dg.fill(0.0);
    res.dz_dg
        .fixed_view_mut::<3, 2>(0, 0)
        .copy_from(&(0.5 * dt * dt * dgdp));
    res.dz_dg
        .fixed_view_mut::<3, 2>(6, 0)
        .copy_from(&(dt * dgdp));

    if !translation_enabled {
        res.residual.rows_mut(0, 3).fill(0.0);
        res.dz_dx1.view_mut((0, 0), (3, config.pose_dim)).fill(0.0);
        res.dz_dx2.view_mut((0, 0), (3, config.pose_dim)).fill(0.0);
        res.dz_dg.fixed_view_mut::<3, 2>(0, 0).fill(0.0);
    }

    res.cov_inv = res.orig_cov_inv.clone();
    res.mahalanobis_distance =
        (res.residual.transpose() * &res.cov_inv * &res.residual)[0];
}
