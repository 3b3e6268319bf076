//! Factorization of the reduced camera system and small dense helpers.
//!
//! The reduced system `S * dx = b` is solved either by a dense Cholesky
//! factorization (nalgebra) or by a sparse Cholesky on the sparse view of
//! `S` (faer), mirroring the dense/sparse switch of the solver options.
//! When the assembly only filled the upper triangle, the dense path mirrors
//! it and the sparse path factors with `Side::Upper`.

use faer::linalg::solvers::Solve;
use faer::sparse::linalg::solvers::{Llt, SymbolicLlt};
use faer::sparse::{SparseColMat, Triplet};
use faer::Side;
use faer_ext::IntoNalgebra;
use nalgebra::{DMatrix, DVector};

use super::{LinAlgError, LinAlgResult};

/// Factorized reduced system.
pub enum ReducedFactorization {
    Dense(nalgebra::Cholesky<f64, nalgebra::Dyn>),
    Sparse(Llt<usize, f64>),
}

/// Factor the reduced system matrix.
///
/// `triangular` indicates that only the upper triangle of `s` was filled
/// during assembly.
pub fn factorize_reduced(
    s: &DMatrix<f64>,
    use_sparse: bool,
    triangular: bool,
) -> LinAlgResult<ReducedFactorization> {
    if use_sparse {
        let n = s.nrows();
        let mut triplets = Vec::new();
        for j in 0..n {
            for i in 0..n {
                let v = s[(i, j)];
                if v != 0.0 {
                    triplets.push(Triplet::new(i, j, v));
                }
            }
        }
        let side = if triangular { Side::Upper } else { Side::Lower };
        let sparse = SparseColMat::try_new_from_triplets(n, n, &triplets)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("sparse view: {e:?}")))?;
        // The sparsity pattern changes between outer iterations, so the
        // symbolic analysis is redone per factorization.
        let symbolic = SymbolicLlt::try_new(sparse.symbolic(), side)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("symbolic: {e:?}")))?;
        let llt = Llt::try_new_with_symbolic(symbolic, sparse.as_ref(), side)
            .map_err(|e| LinAlgError::FactorizationFailed(format!("numeric: {e:?}")))?;
        Ok(ReducedFactorization::Sparse(llt))
    } else {
        let mut full = s.clone();
        if triangular {
            mirror_upper(&mut full);
        }
        nalgebra::Cholesky::new(full)
            .map(ReducedFactorization::Dense)
            .ok_or_else(|| {
                LinAlgError::FactorizationFailed("dense Cholesky refused S".to_string())
            })
    }
}

impl ReducedFactorization {
    /// Solve `S * x = rhs`.
    pub fn solve(&self, rhs: &DVector<f64>) -> LinAlgResult<DVector<f64>> {
        let x = match self {
            ReducedFactorization::Dense(chol) => chol.solve(rhs),
            ReducedFactorization::Sparse(llt) => {
                let n = rhs.len();
                let rhs_faer = faer::Mat::from_fn(n, 1, |i, _| rhs[i]);
                let sol = llt.solve(rhs_faer.as_ref());
                let sol_na = sol.as_ref().into_nalgebra();
                DVector::from_fn(n, |i, _| sol_na[(i, 0)])
            }
        };
        if x.iter().any(|v| !v.is_finite()) {
            return Err(LinAlgError::SolveFailed(
                "non-finite solution".to_string(),
            ));
        }
        Ok(x)
    }
}

/// Copy the upper triangle onto the lower one.
pub fn mirror_upper(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in 0..i {
            m[(i, j)] = m[(j, i)];
        }
    }
}

/// Principal square root of a symmetric positive semi-definite matrix,
/// via its eigendecomposition with negative eigenvalues clamped to zero.
pub fn matrix_sqrt(m: &DMatrix<f64>) -> DMatrix<f64> {
    let se = m.clone().symmetric_eigen();
    let sqrt_vals = se.eigenvalues.map(|l| l.max(0.0).sqrt());
    &se.eigenvectors * DMatrix::from_diagonal(&sqrt_vals) * se.eigenvectors.transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn spd_matrix() -> DMatrix<f64> {
        let a = DMatrix::from_row_slice(3, 3, &[2.0, 0.5, 0.0, 0.1, 1.5, 0.2, 0.3, 0.0, 1.0]);
        &a * a.transpose() + DMatrix::identity(3, 3)
    }

    #[test]
    fn test_dense_and_sparse_agree() {
        let s = spd_matrix();
        let rhs = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let dense = factorize_reduced(&s, false, false).unwrap();
        let sparse = factorize_reduced(&s, true, false).unwrap();
        let xd = dense.solve(&rhs).unwrap();
        let xs = sparse.solve(&rhs).unwrap();
        assert_relative_eq!(xd, xs, epsilon = 1e-10);
        assert_relative_eq!(&s * &xd, rhs, epsilon = 1e-10);
    }

    #[test]
    fn test_triangular_storage() {
        let s = spd_matrix();
        let mut upper = s.clone();
        for i in 0..3 {
            for j in 0..i {
                upper[(i, j)] = 0.0;
            }
        }
        let rhs = DVector::from_vec(vec![0.3, 1.0, -0.7]);
        let full = factorize_reduced(&s, false, false).unwrap();
        let tri_dense = factorize_reduced(&upper, false, true).unwrap();
        let tri_sparse = factorize_reduced(&upper, true, true).unwrap();
        let x_full = full.solve(&rhs).unwrap();
        assert_relative_eq!(x_full, tri_dense.solve(&rhs).unwrap(), epsilon = 1e-10);
        assert_relative_eq!(x_full, tri_sparse.solve(&rhs).unwrap(), epsilon = 1e-10);
    }

    #[test]
    fn test_factorization_refuses_indefinite() {
        let mut s = DMatrix::identity(2, 2);
        s[(1, 1)] = -1.0;
        assert!(factorize_reduced(&s, false, false).is_err());
    }

    #[test]
    fn test_matrix_sqrt() {
        let m = spd_matrix();
        let r = matrix_sqrt(&m);
        assert_relative_eq!(&r * &r, m, epsilon = 1e-9);
    }
}
