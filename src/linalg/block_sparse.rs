//! Column-major block-sparse matrix with the block-BLAS primitives the
//! Schur reduction needs.
//!
//! Blocks are runtime-sized dense matrices; every block in a matrix shares
//! the same dimensions. Columns keep their blocks sorted by block-row
//! index, so insertion in residual-id order is O(1) amortized and products
//! stream columns in order.
//!
//! Several operations take explicit *strides*: a matrix whose blocks are
//! narrower than the state slot they occupy (e.g. reprojection Jacobians,
//! which never touch velocity or bias columns) is promoted into the full
//! slot by placing each block at `index * stride` and zero-filling the
//! remainder.

use nalgebra::{DMatrix, DVector};
use std::collections::BTreeMap;

/// Block-sparse matrix in column-major block storage.
#[derive(Debug, Clone)]
pub struct BlockMatrix {
    nrows: usize,
    ncols: usize,
    block_rows: usize,
    block_cols: usize,
    cols: Vec<Vec<(usize, DMatrix<f64>)>>,
}

impl BlockMatrix {
    /// Create an empty matrix of `nrows x ncols` blocks, each
    /// `block_rows x block_cols`.
    pub fn new(nrows: usize, ncols: usize, block_rows: usize, block_cols: usize) -> Self {
        Self {
            nrows,
            ncols,
            block_rows,
            block_cols,
            cols: vec![Vec::new(); ncols],
        }
    }

    /// Resize the block grid and drop all blocks, retaining column storage
    /// where possible.
    pub fn resize(&mut self, nrows: usize, ncols: usize) {
        self.nrows = nrows;
        self.cols.resize(ncols, Vec::new());
        self.ncols = ncols;
        self.set_zero();
    }

    /// Change the per-block dimensions (drops all blocks).
    pub fn reshape_blocks(&mut self, block_rows: usize, block_cols: usize) {
        self.block_rows = block_rows;
        self.block_cols = block_cols;
        self.set_zero();
    }

    /// Remove all blocks but keep allocated column storage.
    pub fn set_zero(&mut self) {
        for col in &mut self.cols {
            col.clear();
        }
    }

    /// Reserve per-column block capacity.
    pub fn reserve(&mut self, sizes: &[usize]) {
        for (col, &n) in self.cols.iter_mut().zip(sizes) {
            col.reserve(n);
        }
    }

    /// Reserve a constant block capacity for every column.
    pub fn reserve_constant(&mut self, n: usize) {
        for col in &mut self.cols {
            col.reserve(n);
        }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    pub fn block_cols(&self) -> usize {
        self.block_cols
    }

    pub fn num_blocks(&self) -> usize {
        self.cols.iter().map(Vec::len).sum()
    }

    /// Insert a block; adds into the existing block if one is present.
    pub fn insert(&mut self, row: usize, col: usize, block: DMatrix<f64>) {
        debug_assert!(row < self.nrows && col < self.ncols);
        debug_assert_eq!(block.nrows(), self.block_rows);
        debug_assert_eq!(block.ncols(), self.block_cols);
        let entries = &mut self.cols[col];
        match entries.binary_search_by_key(&row, |(r, _)| *r) {
            Ok(pos) => entries[pos].1 += block,
            Err(pos) => entries.insert(pos, (row, block)),
        }
    }

    /// Block at `(row, col)` if present.
    pub fn block(&self, row: usize, col: usize) -> Option<&DMatrix<f64>> {
        let entries = &self.cols[col];
        entries
            .binary_search_by_key(&row, |(r, _)| *r)
            .ok()
            .map(|pos| &entries[pos].1)
    }

    /// Blocks of one column, sorted by block row.
    pub fn col_blocks(&self, col: usize) -> &[(usize, DMatrix<f64>)] {
        &self.cols[col]
    }

    /// Transposed copy (blocks transposed, block grid transposed).
    pub fn transpose(&self) -> Self {
        let mut out = Self::new(self.ncols, self.nrows, self.block_cols, self.block_rows);
        for (j, col) in self.cols.iter().enumerate() {
            for (i, block) in col {
                out.insert(j, *i, block.transpose());
            }
        }
        out
    }

    /// Block-sparse product `self * rhs`.
    ///
    /// With `upper_only` set, only blocks on or above the diagonal of the
    /// result are formed (for symmetric products).
    pub fn mul(&self, rhs: &Self, upper_only: bool) -> Self {
        debug_assert_eq!(self.ncols, rhs.nrows);
        debug_assert_eq!(self.block_cols, rhs.block_rows);
        let mut out = Self::new(self.nrows, rhs.ncols, self.block_rows, rhs.block_cols);
        for j in 0..rhs.ncols {
            let mut accum: BTreeMap<usize, DMatrix<f64>> = BTreeMap::new();
            for (k, b_kj) in &rhs.cols[j] {
                for (i, a_ik) in &self.cols[*k] {
                    if upper_only && *i > j {
                        continue;
                    }
                    let prod = a_ik * b_kj;
                    accum
                        .entry(*i)
                        .and_modify(|m| *m += &prod)
                        .or_insert(prod);
                }
            }
            out.cols[j] = accum.into_iter().collect();
        }
        out
    }

    /// Right-multiply by a block-diagonal matrix.
    pub fn mul_block_diag(&self, diag: &BlockDiag) -> Self {
        debug_assert_eq!(self.ncols, diag.len());
        debug_assert_eq!(self.block_cols, diag.dim());
        let mut out = Self::new(self.nrows, self.ncols, self.block_rows, diag.dim());
        for (j, col) in self.cols.iter().enumerate() {
            let d = diag.block(j);
            out.cols[j] = col.iter().map(|(i, b)| (*i, b * d)).collect();
        }
        out
    }

    /// Block-sparse x dense-vector product with source and destination
    /// strides: block column `j` reads `x[j*src_stride ..]`, block row `i`
    /// accumulates into `y[i*dst_stride ..]`.
    pub fn mul_vec(&self, x: &DVector<f64>, src_stride: usize, dst_stride: usize) -> DVector<f64> {
        debug_assert!(src_stride >= self.block_cols && dst_stride >= self.block_rows);
        let mut y = DVector::zeros(self.nrows * dst_stride);
        for (j, col) in self.cols.iter().enumerate() {
            if col.is_empty() {
                continue;
            }
            let xb = x.rows(j * src_stride, self.block_cols).into_owned();
            for (i, block) in col {
                let mut yb = y.rows_mut(i * dst_stride, self.block_rows);
                yb += block * &xb;
            }
        }
        y
    }

    /// Accumulate `sign * self` into a dense region, placing block `(i, j)`
    /// at `(row0 + i*row_stride, col0 + j*col_stride)`.
    pub fn add_into_dense(
        &self,
        dense: &mut DMatrix<f64>,
        row0: usize,
        col0: usize,
        row_stride: usize,
        col_stride: usize,
        sign: f64,
    ) {
        for (j, col) in self.cols.iter().enumerate() {
            for (i, block) in col {
                let mut view = dense.view_mut(
                    (row0 + i * row_stride, col0 + j * col_stride),
                    (self.block_rows, self.block_cols),
                );
                view.zip_apply(block, |d, b| *d += sign * b);
            }
        }
    }

    /// Dense copy with blocks promoted to `row_stride x col_stride` slots.
    pub fn to_dense_strided(&self, row_stride: usize, col_stride: usize) -> DMatrix<f64> {
        let mut out = DMatrix::zeros(self.nrows * row_stride, self.ncols * col_stride);
        self.add_into_dense(&mut out, 0, 0, row_stride, col_stride, 1.0);
        out
    }

    /// Add a matrix with smaller (or equal) block dimensions into this one,
    /// zero-padding each promoted block.
    pub fn add_assign_promoted(&mut self, other: &Self) {
        debug_assert_eq!(self.nrows, other.nrows);
        debug_assert_eq!(self.ncols, other.ncols);
        debug_assert!(
            self.block_rows >= other.block_rows && self.block_cols >= other.block_cols
        );
        for (j, col) in other.cols.iter().enumerate() {
            for (i, block) in col {
                let entries = &mut self.cols[j];
                let pos = match entries.binary_search_by_key(i, |(r, _)| *r) {
                    Ok(pos) => pos,
                    Err(pos) => {
                        entries.insert(
                            pos,
                            (*i, DMatrix::zeros(self.block_rows, self.block_cols)),
                        );
                        pos
                    }
                };
                let mut view = entries[pos]
                    .1
                    .view_mut((0, 0), (other.block_rows, other.block_cols));
                view += block;
            }
        }
    }
}

/// Block-diagonal matrix with square blocks, indexed by block position.
#[derive(Debug, Clone)]
pub struct BlockDiag {
    dim: usize,
    blocks: Vec<DMatrix<f64>>,
}

impl BlockDiag {
    pub fn new(n: usize, dim: usize) -> Self {
        Self {
            dim,
            blocks: vec![DMatrix::zeros(dim, dim); n],
        }
    }

    pub fn resize(&mut self, n: usize, dim: usize) {
        self.dim = dim;
        self.blocks.clear();
        self.blocks.resize(n, DMatrix::zeros(dim, dim));
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn set_block(&mut self, i: usize, block: DMatrix<f64>) {
        debug_assert_eq!(block.nrows(), self.dim);
        self.blocks[i] = block;
    }

    pub fn block(&self, i: usize) -> &DMatrix<f64> {
        &self.blocks[i]
    }
}
