//! Outer solve loop: normal-equation assembly, Schur complement reduction,
//! Gauss-Newton factorization, and the dogleg trust-region driver.
//!
//! Per outer iteration the flow is: build the problem, condense the block
//! system into the reduced camera matrix `S`, then run one inner
//! trust-region (or damped Gauss-Newton) step with snapshot/rollback on
//! error increase. Landmark updates are recovered by back-substitution
//! through the cached `W·V⁻¹` products.

use nalgebra::{DMatrix, DVector, Vector4};
use tracing::{debug, error};

use crate::core::{Delta, ProjectionResidual, SolveResult, Summary};
use crate::linalg::{factorize_reduced, BlockMatrix};

use super::BundleAdjuster;

/// Diagonal value pinning masked parameters in the reduced system.
const MASK_REGULARIZATION: f64 = 1e6;

/// Floor applied to a landmark Hessian block before inversion.
const LANDMARK_REGULARIZATION: f64 = 1e-6;

/// Transform a homogeneous 4-vector: `[R*x + w*t, w]`.
fn mult_homogeneous(t: &nalgebra::Isometry3<f64>, x: &Vector4<f64>) -> Vector4<f64> {
    let p = t.rotation * nalgebra::Vector3::new(x[0], x[1], x[2]) + x[3] * t.translation.vector;
    Vector4::new(p[0], p[1], p[2], x[3])
}

impl BundleAdjuster {
    /// Jointly refine all active state over at most `max_iter` outer
    /// iterations.
    ///
    /// `gn_damping` scales the Gauss-Newton update on the non-dogleg path;
    /// `error_increase_allowed` keeps an increasing Gauss-Newton step
    /// instead of rolling it back.
    pub fn solve(&mut self, max_iter: usize, gn_damping: f64, error_increase_allowed: bool) {
        if self.proj_residuals.is_empty()
            && self.binary_residuals.is_empty()
            && self.unary_residuals.is_empty()
            && self.inertial_residuals.is_empty()
        {
            return;
        }

        self.summary = Summary {
            result: SolveResult::Success,
            ..Summary::default()
        };

        // Move landmarks into their reference sensor frame and normalize
        // the ray.
        if self.config.lm_dim == 1 {
            for i in 0..self.landmarks.len() {
                let lm = &self.landmarks[i];
                let t_sw = self.poses[lm.ref_pose_id].tsw(lm.ref_cam_id, &self.rig);
                let x_s = mult_homogeneous(&t_sw, &lm.x_w);
                let length = x_s.fixed_rows::<3>(0).norm();
                self.landmarks[i].x_s = x_s / length;
            }
        }

        for iteration in 0..max_iter {
            debug!(iteration, "outer iteration");
            self.build_problem();
            let rhs_p_sc = self.assemble_system();

            if !self.solve_internal(
                &rhs_p_sc,
                gn_damping,
                error_increase_allowed,
                self.options.use_dogleg,
            ) {
                debug!("exiting due to error increase or solver failure");
                break;
            }

            let relative_change = (self.summary.post_solve_norm - self.summary.pre_solve_norm)
                .abs()
                / self.summary.pre_solve_norm;
            if relative_change < self.options.error_change_threshold {
                debug!(relative_change, "error change below threshold");
                self.summary.result = SolveResult::ErrorChangeBelowThreshold;
                break;
            }
            if self.summary.delta_norm < self.options.param_change_threshold {
                debug!(delta_norm = self.summary.delta_norm, "parameter change below threshold");
                self.summary.result = SolveResult::ParamChangeBelowThreshold;
                break;
            }
        }

        if self.config.bias_in_state() {
            if let Some(last) = self.poses.last() {
                self.imu.b_g = last.b.fixed_rows::<3>(0).into();
                self.imu.b_a = last.b.fixed_rows::<3>(3).into();
            }
        }

        // Landmarks back to the world frame.
        if self.config.lm_dim == 1 {
            for i in 0..self.landmarks.len() {
                let lm = &self.landmarks[i];
                let t_ws = self.poses[lm.ref_pose_id]
                    .tsw(lm.ref_cam_id, &self.rig)
                    .inverse();
                self.landmarks[i].x_w = mult_homogeneous(&t_ws, &lm.x_s);
            }
        }

        // Conditioning diagnostics.
        self.summary.proj_error = self.proj_error;
        self.summary.binary_error = self.binary_error;
        self.summary.unary_error = self.unary_error;
        self.summary.inertial_error = self.inertial_error;
        self.summary.num_proj_residuals = self.proj_residuals.len();
        self.summary.num_cond_proj_residuals = self.conditioning_proj_residuals.len();
        self.summary.num_inertial_residuals = self.inertial_residuals.len();
        self.summary.num_cond_inertial_residuals = self.conditioning_inertial_residuals.len();
        self.summary.cond_inertial_error = self
            .conditioning_inertial_residuals
            .iter()
            .map(|&id| self.inertial_residuals[id].mahalanobis_distance)
            .sum();
        self.summary.cond_proj_error = self
            .conditioning_proj_residuals
            .iter()
            .map(|&id| {
                let res = &self.proj_residuals[id];
                res.mahalanobis_distance / res.weight
            })
            .sum();
    }

    /// Form `U`, the landmark Hessian inverse, the pose-landmark and
    /// calibration couplings, and condense them into the reduced system
    /// `S * [delta_p; delta_k] = rhs_p_sc`.
    pub(crate) fn assemble_system(&mut self) -> DVector<f64> {
        let num_poses = self.num_active_poses;
        let num_lm = self.num_active_landmarks;
        let pose_dim = self.config.pose_dim;
        let pr_pose_dim = self.config.pr_pose_dim();
        let lm_dim = self.config.lm_dim;
        let imu_res = self.config.imu_res_size();
        let num_cam_params = self.rig.cameras.first().map_or(0, |c| c.num_params());
        let calib_dim = self.config.calib_dim(num_cam_params);
        let num_pose_params = num_poses * pose_dim;
        let tri = self.options.use_triangular_matrices;

        self.rhs_p = DVector::zeros(num_pose_params);
        self.rhs_k = DVector::zeros(calib_dim);
        self.vi.resize(num_lm, lm_dim.max(1));
        self.s = DMatrix::zeros(num_pose_params + calib_dim, num_pose_params + calib_dim);
        let mut rhs_p_sc = DVector::zeros(num_pose_params + calib_dim);

        let mut u = BlockMatrix::new(num_poses, num_poses, pose_dim, pose_dim);

        if !self.proj_residuals.is_empty() && num_poses > 0 {
            // Block-added because the projection blocks only span the
            // first six pose parameters.
            u.add_assign_promoted(&self.jt_pr.mul(&self.j_pr, tri));
            self.rhs_p += self.jt_pr.mul_vec(&self.r_pr, ProjectionResidual::RES_SIZE, pose_dim);
        }
        if !self.binary_residuals.is_empty() && num_poses > 0 {
            u.add_assign_promoted(&self.jt_pp.mul(&self.j_pp, tri));
            let jt_pp_r_pp = self.jt_pp.mul_vec(&self.r_pp, 6, pose_dim);
            debug!(norm = jt_pp_r_pp.norm(), "binary rhs contribution");
            self.rhs_p += jt_pp_r_pp;
        }
        if !self.unary_residuals.is_empty() && num_poses > 0 {
            u.add_assign_promoted(&self.jt_u.mul(&self.j_u, tri));
            self.rhs_p += self.jt_u.mul_vec(&self.r_u, 6, pose_dim);
        }
        if !self.inertial_residuals.is_empty() && num_poses > 0 {
            u.add_assign_promoted(&self.jt_i.mul(&self.j_i, tri));
            self.rhs_p += self.jt_i.mul_vec(&self.r_i, imu_res, pose_dim);
        }

        // Landmark elimination.
        let have_landmarks = lm_dim > 0 && num_lm > 0;
        if have_landmarks {
            self.rhs_l = DVector::zeros(num_lm * lm_dim);
            for i in 0..self.landmarks.len() {
                if !self.landmarks[i].is_active {
                    continue;
                }
                let mut jtj = DMatrix::zeros(lm_dim, lm_dim);
                let mut jtr_l = DVector::zeros(lm_dim);
                for &id in &self.landmarks[i].proj_residuals {
                    let res = &self.proj_residuals[id];
                    jtj += res.dz_dlm.transpose() * &res.dz_dlm * res.weight;
                    jtr_l += res.dz_dlm.transpose()
                        * res.weight.sqrt()
                        * self
                            .r_pr
                            .rows(res.residual_offset, ProjectionResidual::RES_SIZE);
                }
                let opt_id = self.landmarks[i].opt_id;
                self.rhs_l.rows_mut(opt_id * lm_dim, lm_dim).copy_from(&jtr_l);

                if lm_dim == 1 {
                    if jtj[(0, 0)].abs() < LANDMARK_REGULARIZATION {
                        jtj[(0, 0)] += LANDMARK_REGULARIZATION;
                    }
                } else if jtj.norm() < LANDMARK_REGULARIZATION {
                    for d in 0..lm_dim {
                        jtj[(d, d)] += LANDMARK_REGULARIZATION;
                    }
                }
                let inv = jtj.clone().try_inverse().unwrap_or_else(|| {
                    // A still-singular block freezes the landmark for this
                    // iteration.
                    DMatrix::zeros(lm_dim, lm_dim)
                });
                self.vi.set_block(opt_id, inv);
                self.landmarks[i].jtj = jtj;
            }

            if num_poses > 0 && !self.proj_residuals.is_empty() {
                let jt_pr_j_l = self.jt_pr.mul(&self.j_l, false);
                self.jt_l_j_pr = jt_pr_j_l.transpose();
                self.jt_pr_j_l_vi = jt_pr_j_l.mul_block_diag(&self.vi);

                let w_vi_wt = self.jt_pr_j_l_vi.mul(&self.jt_l_j_pr, tri);
                u.add_into_dense(&mut self.s, 0, 0, pose_dim, pose_dim, 1.0);
                w_vi_wt.add_into_dense(&mut self.s, 0, 0, pose_dim, pose_dim, -1.0);

                let w_vi_bl = self.jt_pr_j_l_vi.mul_vec(&self.rhs_l, lm_dim, pose_dim);
                rhs_p_sc
                    .rows_mut(0, num_pose_params)
                    .copy_from(&(&self.rhs_p - w_vi_bl));
            } else {
                self.jt_l_j_pr =
                    BlockMatrix::new(num_lm, num_poses, lm_dim.max(1), pr_pose_dim);
                self.jt_pr_j_l_vi =
                    BlockMatrix::new(num_poses, num_lm, pr_pose_dim, lm_dim.max(1));
                u.add_into_dense(&mut self.s, 0, 0, pose_dim, pose_dim, 1.0);
                rhs_p_sc
                    .rows_mut(0, num_pose_params)
                    .copy_from(&self.rhs_p);
            }
        } else {
            self.rhs_l = DVector::zeros(0);
            u.add_into_dense(&mut self.s, 0, 0, pose_dim, pose_dim, 1.0);
            rhs_p_sc
                .rows_mut(0, num_pose_params)
                .copy_from(&self.rhs_p);
        }

        // Calibration coupling from the projection family.
        let jkpr_used =
            self.config.jkpr_used() && calib_dim > 0 && !self.proj_residuals.is_empty();
        if jkpr_used {
            let jt_kpr_j_kpr = self.jt_kpr.mul(&self.j_kpr, false);
            jt_kpr_j_kpr.add_into_dense(
                &mut self.s,
                num_pose_params,
                num_pose_params,
                calib_dim,
                calib_dim,
                1.0,
            );

            let jt_pr_j_kpr = self.jt_pr.mul(&self.j_kpr, false);
            jt_pr_j_kpr.add_into_dense(&mut self.s, 0, num_pose_params, pose_dim, calib_dim, 1.0);
            if !tri {
                jt_pr_j_kpr.transpose().add_into_dense(
                    &mut self.s,
                    num_pose_params,
                    0,
                    calib_dim,
                    pose_dim,
                    1.0,
                );
            }

            self.rhs_k += self
                .jt_kpr
                .mul_vec(&self.r_pr, ProjectionResidual::RES_SIZE, calib_dim);
        }

        // Calibration coupling from the inertial family (gravity).
        let jki_used = self.config.gravity_in_calib
            && calib_dim > 0
            && !self.inertial_residuals.is_empty();
        if jki_used {
            let jt_ki_j_ki = self.jt_ki.mul(&self.j_ki, false);
            jt_ki_j_ki.add_into_dense(
                &mut self.s,
                num_pose_params,
                num_pose_params,
                calib_dim,
                calib_dim,
                1.0,
            );

            if num_poses > 0 {
                let jt_i_j_ki = self.jt_i.mul(&self.j_ki, false);
                jt_i_j_ki.add_into_dense(&mut self.s, 0, num_pose_params, pose_dim, calib_dim, 1.0);
                if !tri {
                    jt_i_j_ki.transpose().add_into_dense(
                        &mut self.s,
                        num_pose_params,
                        0,
                        calib_dim,
                        pose_dim,
                        1.0,
                    );
                }
            }

            self.rhs_k += self.jt_ki.mul_vec(&self.r_i, imu_res, calib_dim);
        }

        if calib_dim > 0 {
            rhs_p_sc
                .rows_mut(num_pose_params, calib_dim)
                .copy_from(&self.rhs_k);
        }

        // Schur complement of the calibration block against the landmarks.
        if jkpr_used && have_landmarks {
            let jt_kpr_jl = self.jt_kpr.mul(&self.j_l, false);
            self.jt_l_j_kpr = jt_kpr_jl.transpose();

            if num_poses > 0 && !self.proj_residuals.is_empty() {
                let w_vi_jt_l_j_kpr = self.jt_pr_j_l_vi.mul(&self.jt_l_j_kpr, false);
                w_vi_jt_l_j_kpr.add_into_dense(
                    &mut self.s,
                    0,
                    num_pose_params,
                    pose_dim,
                    calib_dim,
                    -1.0,
                );
                if !tri {
                    w_vi_jt_l_j_kpr.transpose().add_into_dense(
                        &mut self.s,
                        num_pose_params,
                        0,
                        calib_dim,
                        pose_dim,
                        -1.0,
                    );
                }
            }

            let jt_kpr_j_l_vi = jt_kpr_jl.mul_block_diag(&self.vi);
            let kk = jt_kpr_j_l_vi.mul(&self.jt_l_j_kpr, false);
            kk.add_into_dense(
                &mut self.s,
                num_pose_params,
                num_pose_params,
                calib_dim,
                calib_dim,
                -1.0,
            );

            let bl_term = jt_kpr_j_l_vi.mul_vec(&self.rhs_l, lm_dim, calib_dim);
            let mut tail = rhs_p_sc.rows_mut(num_pose_params, calib_dim);
            tail -= bl_term;
        } else {
            self.jt_l_j_kpr = BlockMatrix::new(num_lm, 0, lm_dim.max(1), calib_dim.max(1));
        }

        // Strong soft pin on every masked parameter.
        if self.is_param_mask_used {
            for pose in &self.poses {
                if pose.is_active && pose.is_param_mask_used {
                    for (i, &keep) in pose.param_mask.iter().enumerate() {
                        if !keep {
                            let idx = pose.opt_id * pose_dim + i;
                            self.s[(idx, idx)] = MASK_REGULARIZATION;
                        }
                    }
                }
            }
        }

        if self.options.write_reduced_camera_matrix {
            self.write_debug_matrices(&rhs_p_sc);
        }

        rhs_p_sc
    }

    /// Factor `S` and solve for the pose + calibration update.
    pub(crate) fn calculate_gn(&mut self, rhs_p_sc: &DVector<f64>, calib_dim: usize) -> Delta {
        self.summary.result = SolveResult::Success;
        let mut delta = Delta::default();
        if rhs_p_sc.is_empty() {
            return delta;
        }

        let factorization = match factorize_reduced(
            &self.s,
            self.options.use_sparse_solver,
            self.options.use_triangular_matrices,
        ) {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, "factorization of the reduced system failed");
                self.summary.result = SolveResult::FactorizationError;
                return delta;
            }
        };

        let delta_p_k = match factorization.solve(rhs_p_sc) {
            Ok(x) => x,
            Err(e) => {
                error!(error = %e, "reduced system solve failed");
                self.summary.result = SolveResult::SolverError;
                return delta;
            }
        };

        let num_pose_params = delta_p_k.len() - calib_dim;
        delta.delta_p = delta_p_k.rows(0, num_pose_params).into_owned();
        if calib_dim > 0 {
            delta.delta_k = delta_p_k.rows(num_pose_params, calib_dim).into_owned();

            if self.options.calculate_calibration_marginals {
                // Bottom-right block of S^-1 column by column.
                let mut cov = DMatrix::zeros(calib_dim, calib_dim);
                for i in 0..calib_dim {
                    let mut unit = DVector::zeros(rhs_p_sc.len());
                    unit[num_pose_params + i] = 1.0;
                    match factorization.solve(&unit) {
                        Ok(col) => {
                            for j in 0..calib_dim {
                                cov[(j, i)] = col[num_pose_params + j];
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "marginal covariance solve failed");
                        }
                    }
                }
                self.summary.calibration_marginals = Some(cov);
            }
        }
        delta
    }

    /// Back-substitute the landmark update:
    /// `delta_l = V⁻¹ (b_l - Wᵀ delta_p - J_kpr_lᵀ delta_k)`.
    pub(crate) fn landmark_delta(&self, delta: &Delta) -> DVector<f64> {
        let num_lm = self.num_active_landmarks;
        let lm_dim = self.config.lm_dim;
        if num_lm == 0 || lm_dim == 0 {
            return DVector::zeros(0);
        }

        let mut rhs_l_sc = self.rhs_l.clone();
        if self.num_active_poses > 0 && !delta.delta_p.is_empty() {
            // Strided: delta_p carries the full pose dimension while the
            // coupling blocks only span the reprojection subset.
            rhs_l_sc -= self
                .jt_l_j_pr
                .mul_vec(&delta.delta_p, self.config.pose_dim, lm_dim);
            if self.jt_l_j_kpr.ncols() > 0 && !delta.delta_k.is_empty() {
                rhs_l_sc -= self
                    .jt_l_j_kpr
                    .mul_vec(&delta.delta_k, delta.delta_k.len(), lm_dim);
            }
        }

        let mut delta_l = DVector::zeros(num_lm * lm_dim);
        for i in 0..num_lm {
            let block = self.vi.block(i) * rhs_l_sc.rows(i * lm_dim, lm_dim);
            delta_l.rows_mut(i * lm_dim, lm_dim).copy_from(&block);
        }
        delta_l
    }

    /// One inner solve step: dogleg trust region or damped Gauss-Newton.
    ///
    /// Returns false when the outer loop must stop (factorization failure
    /// or a disallowed error increase).
    pub(crate) fn solve_internal(
        &mut self,
        rhs_p_sc: &DVector<f64>,
        gn_damping: f64,
        error_increase_allowed: bool,
        use_dogleg: bool,
    ) -> bool {
        let num_cam_params = self.rig.cameras.first().map_or(0, |c| c.num_params());
        let calib_dim = self.config.calib_dim(num_cam_params);
        let pose_dim = self.config.pose_dim;
        let lm_dim = self.config.lm_dim;
        let imu_res = self.config.imu_res_size();

        if use_dogleg {
            // Powell's dogleg, after Rosen et al., "RISE: An Incremental
            // Trust-Region Method for Robust Online Sparse Least-Squares
            // Estimation".
            let numerator = self.rhs_p.norm_squared()
                + self.rhs_l.norm_squared()
                + self.rhs_k.norm_squared();

            let mut j_p_rhs_p = DVector::zeros(0);
            let mut j_kp_rhs_k = DVector::zeros(0);
            let mut j_pp_rhs_p = DVector::zeros(0);
            let mut j_u_rhs_p = DVector::zeros(0);
            let mut j_i_rhs_p = DVector::zeros(0);
            let mut j_l_rhs_l = DVector::zeros(0);

            if self.num_active_poses > 0 {
                if !self.proj_residuals.is_empty() {
                    j_p_rhs_p = self.j_pr.mul_vec(&self.rhs_p, pose_dim, 2);
                    if self.config.jkpr_used() && calib_dim > 0 {
                        j_kp_rhs_k = self.j_kpr.mul_vec(&self.rhs_k, calib_dim, 2);
                    }
                }
                if !self.inertial_residuals.is_empty() {
                    j_i_rhs_p = self.j_i.mul_vec(&self.rhs_p, pose_dim, imu_res);
                }
                if !self.binary_residuals.is_empty() {
                    j_pp_rhs_p = self.j_pp.mul_vec(&self.rhs_p, pose_dim, 6);
                }
                if !self.unary_residuals.is_empty() {
                    j_u_rhs_p = self.j_u.mul_vec(&self.rhs_p, pose_dim, 6);
                }
            }
            if self.num_active_landmarks > 0 && !self.proj_residuals.is_empty() {
                j_l_rhs_l = self.j_l.mul_vec(&self.rhs_l, lm_dim, 2);
            }

            let proj_term = if j_p_rhs_p.is_empty() && j_l_rhs_l.is_empty() {
                0.0
            } else if j_p_rhs_p.is_empty() {
                j_l_rhs_l.norm_squared()
            } else if j_l_rhs_l.is_empty() {
                j_p_rhs_p.norm_squared()
            } else {
                (j_p_rhs_p + j_l_rhs_l).norm_squared()
            };
            let denominator = proj_term
                + j_pp_rhs_p.norm_squared()
                + j_u_rhs_p.norm_squared()
                + j_i_rhs_p.norm_squared()
                + j_kp_rhs_k.norm_squared();

            let factor = if denominator > 0.0 {
                numerator / denominator
            } else {
                0.0
            };
            debug!(factor, numerator, denominator, "steepest descent scale");

            let delta_sd = Delta {
                delta_p: &self.rhs_p * factor,
                delta_k: &self.rhs_k * factor,
                delta_l: &self.rhs_l * factor,
            };
            let delta_sd_norm = delta_sd.norm();
            debug!(delta_sd_norm, "steepest descent norm");

            let mut gn_computed = false;
            let mut delta_gn = Delta::default();

            for inner_iteration in 0..self.options.dogleg_max_inner_iterations {
                let trust = self.trust_region_size;
                let delta_dl = match trust {
                    Some(tr) if delta_sd_norm > tr => {
                        debug!(
                            trust_region = tr,
                            "steepest descent exceeds trust region, truncating"
                        );
                        let scale = tr / delta_sd_norm;
                        Delta {
                            delta_p: &delta_sd.delta_p * scale,
                            delta_k: &delta_sd.delta_k * scale,
                            delta_l: &delta_sd.delta_l * scale,
                        }
                    }
                    _ => {
                        if !gn_computed {
                            if self.num_active_poses > 0 {
                                delta_gn = self.calculate_gn(rhs_p_sc, calib_dim);
                                if self.summary.result == SolveResult::FactorizationError {
                                    return false;
                                }
                            }
                            delta_gn.delta_l = self.landmark_delta(&delta_gn);
                            gn_computed = true;
                        }

                        let delta_gn_norm = delta_gn.norm();
                        // A non-finite Gauss-Newton direction falls back to
                        // steepest descent without touching the trust
                        // region baseline.
                        let gn_good =
                            delta_gn_norm.is_finite() && self.summary.result.is_good();
                        if !self.summary.result.is_good() {
                            self.summary.result = SolveResult::Success;
                        }
                        if gn_good && self.trust_region_size.is_none() {
                            self.trust_region_size = Some(delta_gn_norm);
                        }
                        let tr = self.trust_region_size.unwrap_or(delta_sd_norm);

                        if gn_good && delta_gn_norm <= tr {
                            debug!(delta_gn_norm, trust_region = tr, "taking Gauss-Newton step");
                            delta_gn.clone()
                        } else {
                            debug!(
                                delta_gn_norm,
                                trust_region = tr,
                                "blending Gauss-Newton and steepest descent"
                            );
                            let diff_p = &delta_gn.delta_p - &delta_sd.delta_p;
                            let diff_k = &delta_gn.delta_k - &delta_sd.delta_k;
                            let diff_l = &delta_gn.delta_l - &delta_sd.delta_l;
                            let a = diff_p.norm_squared()
                                + diff_l.norm_squared()
                                + diff_k.norm_squared();
                            let b = 2.0
                                * (diff_p.dot(&delta_sd.delta_p)
                                    + diff_k.dot(&delta_sd.delta_k)
                                    + diff_l.dot(&delta_sd.delta_l));
                            let c = delta_sd.delta_p.norm_squared()
                                + delta_sd.delta_k.norm_squared()
                                + delta_sd.delta_l.norm_squared()
                                - tr * tr;

                            let discriminant = b * b - 4.0 * a * c;
                            let mut beta = 0.0;
                            if gn_good && discriminant > 0.0 && a > 1e-10 {
                                beta = (-b + discriminant.sqrt()) / (2.0 * a);
                            } else {
                                debug!(a, b, c, "cannot compute blending factor, using sd");
                            }

                            Delta {
                                delta_p: &delta_sd.delta_p + &diff_p * beta,
                                delta_k: &delta_sd.delta_k + &diff_k * beta,
                                delta_l: &delta_sd.delta_l + &diff_l * beta,
                            }
                        }
                    }
                };

                // Snapshot for rollback.
                let landmarks_copy = self.landmarks.clone();
                let poses_copy = self.poses.clone();
                let imu_copy = self.imu.clone();
                let params_backup = self.rig.cameras.first().map(|c| c.params());

                let (mut pe, mut be, mut ue, mut ie) = (0.0, 0.0, 0.0, 0.0);
                self.evaluate_residuals(
                    Some(&mut pe),
                    Some(&mut be),
                    Some(&mut ue),
                    Some(&mut ie),
                );
                self.summary.pre_solve_norm = pe + ie + be + ue;
                self.summary.delta_norm =
                    delta_dl.delta_l.norm() + delta_dl.delta_p.norm();

                if self.options.apply_results {
                    self.apply_update(&delta_dl, false, 1.0);
                }
                debug!(
                    inner_iteration,
                    pre_solve_norm = self.summary.pre_solve_norm,
                    proj = pe,
                    inertial = ie,
                    binary = be,
                    unary = ue,
                    "pre-update errors"
                );

                self.evaluate_residuals(
                    Some(&mut pe),
                    Some(&mut be),
                    Some(&mut ue),
                    Some(&mut ie),
                );
                self.summary.post_solve_norm = pe + ie + be + ue;
                debug!(
                    post_solve_norm = self.summary.post_solve_norm,
                    delta_norm = self.summary.delta_norm,
                    "post-update errors"
                );

                if self.summary.post_solve_norm > self.summary.pre_solve_norm {
                    if self.options.apply_results {
                        self.landmarks = landmarks_copy;
                        self.poses = poses_copy;
                        self.imu = imu_copy;
                        if let (Some(cam), Some(params)) =
                            (self.rig.cameras.first_mut(), params_backup)
                        {
                            cam.set_params(&params);
                        }
                    }
                    let halved = self.trust_region_size.unwrap_or(delta_sd_norm) / 2.0;
                    self.trust_region_size = Some(halved);
                    debug!(trust_region = halved, "error increased, shrinking trust region");
                } else {
                    self.proj_error = pe;
                    self.binary_error = be;
                    self.unary_error = ue;
                    self.inertial_error = ie;
                    let doubled = self.trust_region_size.unwrap_or(delta_sd_norm) * 2.0;
                    self.trust_region_size = Some(doubled);
                    debug!(trust_region = doubled, "error decreased, growing trust region");
                    break;
                }
            }
            true
        } else {
            // Damped Gauss-Newton.
            debug!("using pure Gauss-Newton");
            let mut delta = Delta::default();
            if self.num_active_poses > 0 {
                delta = self.calculate_gn(rhs_p_sc, calib_dim);
                if !self.summary.result.is_good() {
                    return false;
                }
            }

            let landmarks_copy = self.landmarks.clone();
            let poses_copy = self.poses.clone();
            let imu_copy = self.imu.clone();
            let params_backup = self.rig.cameras.first().map(|c| c.params());

            delta.delta_l = self.landmark_delta(&delta);
            delta.delta_p *= gn_damping;
            delta.delta_k *= gn_damping;
            delta.delta_l *= gn_damping;

            let (mut pe, mut be, mut ue, mut ie) = (0.0, 0.0, 0.0, 0.0);
            self.evaluate_residuals(Some(&mut pe), Some(&mut be), Some(&mut ue), Some(&mut ie));
            self.summary.pre_solve_norm = pe + ie + be + ue;
            self.summary.delta_norm = delta.delta_l.norm() + delta.delta_p.norm();

            if self.options.apply_results {
                self.apply_update(&delta, false, 1.0);
            }
            debug!(
                pre_solve_norm = self.summary.pre_solve_norm,
                "pre-update errors"
            );

            self.evaluate_residuals(Some(&mut pe), Some(&mut be), Some(&mut ue), Some(&mut ie));
            self.summary.post_solve_norm = pe + ie + be + ue;
            debug!(
                post_solve_norm = self.summary.post_solve_norm,
                "post-update errors"
            );

            if self.summary.post_solve_norm > self.summary.pre_solve_norm
                && !error_increase_allowed
            {
                debug!("error increased, rolling back");
                if self.options.apply_results {
                    self.landmarks = landmarks_copy;
                    self.poses = poses_copy;
                    self.imu = imu_copy;
                    if let (Some(cam), Some(params)) =
                        (self.rig.cameras.first_mut(), params_backup)
                    {
                        cam.set_params(&params);
                    }
                }
                self.summary.result = SolveResult::ErrorIncreased;
                return false;
            }
            self.proj_error = pe;
            self.binary_error = be;
            self.unary_error = ue;
            self.inertial_error = ie;
            true
        }
    }

    /// CSV dump of the reduced system and the projection Jacobians.
    fn write_debug_matrices(&self, rhs_p_sc: &DVector<f64>) {
        use std::io::Write;

        fn write_mat(path: &str, m: &DMatrix<f64>) -> std::io::Result<()> {
            let mut file = std::fs::File::create(path)?;
            for i in 0..m.nrows() {
                let row: Vec<String> = (0..m.ncols())
                    .map(|j| format!("{:.18e}", m[(i, j)]))
                    .collect();
                writeln!(file, "{}", row.join(", "))?;
            }
            Ok(())
        }

        let pr_pose_dim = self.config.pr_pose_dim();
        let lm_dim = self.config.lm_dim.max(1);
        let result = (|| -> std::io::Result<()> {
            write_mat("s.txt", &self.s)?;
            write_mat(
                "rhs.txt",
                &DMatrix::from_fn(rhs_p_sc.len(), 1, |i, _| rhs_p_sc[i]),
            )?;
            write_mat("j_pr.txt", &self.j_pr.to_dense_strided(2, pr_pose_dim))?;
            write_mat(
                "r_pr.txt",
                &DMatrix::from_fn(self.r_pr.len(), 1, |i, _| self.r_pr[i]),
            )?;
            write_mat("j_l.txt", &self.j_l.to_dense_strided(2, lm_dim))?;
            if self.j_kpr.nrows() > 0 {
                let dj_kpr = self.j_kpr.to_dense_strided(2, self.j_kpr.block_cols());
                write_mat("j_kpr.txt", &dj_kpr)?;
                write_mat("jt_kpr_j_kpr.txt", &(dj_kpr.transpose() * &dj_kpr))?;
            }
            Ok(())
        })();
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to write reduced camera matrix dump");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{PinholeCamera, Rig};
    use crate::core::{BaOptions, StateConfig};
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Matrix6, UnitQuaternion, Vector2, Vector3};

    fn rig() -> Rig {
        let mut rig = Rig::new();
        rig.add_camera(Box::new(PinholeCamera::new(400.0, 400.0, 320.0, 240.0)));
        rig
    }

    fn pose_at(seed: f64) -> Isometry3<f64> {
        Isometry3::from_parts(
            Vector3::new(0.3 * seed, 0.05 * seed, 0.0).into(),
            UnitQuaternion::from_scaled_axis(Vector3::new(0.0, -0.02 * seed, 0.01 * seed)),
        )
    }

    /// Small two-pose, two-landmark problem with a unary prior (so no
    /// auto-regularization masks interfere).
    fn small_problem() -> BundleAdjuster {
        let config = StateConfig::new(3, 6).unwrap();
        let mut ba = BundleAdjuster::new(config, rig(), BaOptions::default()).unwrap();
        let p0 = ba.add_pose(pose_at(0.0), true);
        let p1 = ba.add_pose(pose_at(1.0), true);
        ba.add_unary_residual(p0, pose_at(0.0), Matrix6::identity() * 100.0, true);
        ba.add_binary_residual(
            p0,
            p1,
            pose_at(0.0).inverse() * pose_at(1.2),
            Matrix6::identity(),
            true,
            1.0,
        );

        for (i, x) in [
            nalgebra::Vector4::new(0.4, -0.3, 5.0, 1.0),
            nalgebra::Vector4::new(-0.5, 0.2, 6.0, 1.0),
        ]
        .iter()
        .enumerate()
        {
            let lm = ba.add_landmark(*x, p0, 0, Vector2::zeros(), true);
            for &pid in &[p0, p1] {
                let t_sw = ba.poses[pid].tsw(0, &ba.rig);
                let z = ba.rig.cameras[0].transfer_3d(&t_sw, &x.fixed_rows::<3>(0).into(), 1.0)
                    + Vector2::new(0.5 * (i as f64 + 1.0), -0.3);
                ba.add_projection_residual(lm, p0, pid, 0, z, 1.0, false);
            }
        }
        ba
    }

    /// The Schur-reduced Gauss-Newton direction must match the full KKT
    /// solution.
    #[test]
    fn test_schur_equivalence_with_full_system() {
        let mut ba = small_problem();
        ba.build_problem();
        let rhs_p_sc = ba.assemble_system();
        let delta = ba.calculate_gn(&rhs_p_sc, 0);
        assert_eq!(ba.summary.result, SolveResult::Success);
        let delta_l = ba.landmark_delta(&delta);

        // Dense full system from the stacked Jacobians.
        let d_jpr = ba.j_pr.to_dense_strided(2, 6);
        let d_jpp = ba.j_pp.to_dense_strided(6, 6);
        let d_ju = ba.j_u.to_dense_strided(6, 6);
        let d_jl = ba.j_l.to_dense_strided(2, 3);

        let np = ba.num_active_poses * 6;
        let nl = ba.num_active_landmarks * 3;
        let mut h = DMatrix::zeros(np + nl, np + nl);
        h.view_mut((0, 0), (np, np)).copy_from(
            &(d_jpr.transpose() * &d_jpr
                + d_jpp.transpose() * &d_jpp
                + d_ju.transpose() * &d_ju),
        );
        h.view_mut((0, np), (np, nl))
            .copy_from(&(d_jpr.transpose() * &d_jl));
        h.view_mut((np, 0), (nl, np))
            .copy_from(&(d_jl.transpose() * &d_jpr));
        h.view_mut((np, np), (nl, nl))
            .copy_from(&(d_jl.transpose() * &d_jl));

        let mut b = DVector::zeros(np + nl);
        b.rows_mut(0, np).copy_from(&ba.rhs_p);
        b.rows_mut(np, nl).copy_from(&ba.rhs_l);

        let full = h.lu().solve(&b).expect("full system is invertible");

        assert_relative_eq!(
            delta.delta_p,
            full.rows(0, np).into_owned(),
            epsilon = 1e-8
        );
        assert_relative_eq!(delta_l, full.rows(np, nl).into_owned(), epsilon = 1e-8);
    }

    /// Dense and sparse factorizations of S agree, as do triangular and
    /// full assembly.
    #[test]
    fn test_solver_variants_agree() {
        let mut reference = small_problem();
        reference.build_problem();
        let rhs = reference.assemble_system();
        let delta_ref = reference.calculate_gn(&rhs, 0);

        for (sparse, tri) in [(true, false), (false, true), (true, true)] {
            let mut ba = small_problem();
            ba.options.use_sparse_solver = sparse;
            ba.options.use_triangular_matrices = tri;
            ba.build_problem();
            let rhs = ba.assemble_system();
            let delta = ba.calculate_gn(&rhs, 0);
            assert_eq!(ba.summary.result, SolveResult::Success);
            assert_relative_eq!(delta.delta_p, delta_ref.delta_p, epsilon = 1e-8);
        }
    }

    /// An accepted dogleg step must not increase the cost, and the trust
    /// region persists across calls.
    #[test]
    fn test_dogleg_accepts_downhill_step() {
        let mut ba = small_problem();
        let (mut pe, mut be, mut ue, mut ie) = (0.0, 0.0, 0.0, 0.0);
        ba.evaluate_residuals(Some(&mut pe), Some(&mut be), Some(&mut ue), Some(&mut ie));
        let initial = pe + be + ue + ie;

        ba.build_problem();
        let rhs = ba.assemble_system();
        assert!(ba.solve_internal(&rhs, 1.0, false, true));
        assert!(ba.summary.post_solve_norm <= ba.summary.pre_solve_norm);
        assert!(ba.summary.post_solve_norm <= initial);
        assert!(ba.trust_region_size.is_some());
    }

    /// `apply_results = false` computes the step without mutating state.
    #[test]
    fn test_apply_results_false_keeps_state() {
        let mut ba = small_problem();
        ba.options.apply_results = false;
        let pose_before = ba.poses[1].t_wp;
        let lm_before = ba.landmarks[0].x_w;
        ba.solve(3, 1.0, false);
        assert_relative_eq!(
            ba.poses[1].t_wp.translation.vector,
            pose_before.translation.vector,
            epsilon = 1e-14
        );
        assert_relative_eq!(ba.landmarks[0].x_w, lm_before, epsilon = 1e-14);
    }

    /// Masked diagonal entries of S are pinned at the regularization
    /// value.
    #[test]
    fn test_mask_regularization_in_s() {
        let config = StateConfig::new(3, 6).unwrap();
        let mut ba = BundleAdjuster::new(config, rig(), BaOptions::default()).unwrap();
        let p0 = ba.add_pose(pose_at(0.0), true);
        let p1 = ba.add_pose(pose_at(1.0), true);
        ba.add_binary_residual(
            p0,
            p1,
            pose_at(0.0).inverse() * pose_at(1.0),
            Matrix6::identity(),
            true,
            1.0,
        );
        ba.build_problem();
        ba.assemble_system();

        let root = &ba.poses[ba.root_pose_id];
        assert!(root.is_param_mask_used);
        for i in 0..3 {
            let idx = root.opt_id * 6 + i;
            assert_relative_eq!(ba.s[(idx, idx)], MASK_REGULARIZATION, epsilon = 1e-12);
        }
    }
}
