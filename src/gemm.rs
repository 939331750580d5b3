//! `C := alpha * op(A) * op(B) + beta * C` over local dense, local sparse and
//! 1-D distributed operands.
use nalgebra::DMatrix;
use nalgebra_sparse::CscMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::dist_matrix::DistMatrix;
use crate::errors::{RandNLAError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Orientation {
    Normal,
    Transpose,
    /// Conjugate transpose; identical to `Transpose` for real data.
    Adjoint,
}

impl Orientation {
    fn is_transposed(self) -> bool {
        !matches!(self, Orientation::Normal)
    }

    fn apply(self, shape: (usize, usize)) -> (usize, usize) {
        if self.is_transposed() {
            (shape.1, shape.0)
        } else {
            shape
        }
    }
}

fn check_product(
    operation: &'static str,
    a: (usize, usize),
    b: (usize, usize),
    c: (usize, usize),
) -> Result<()> {
    if a.1 != b.0 {
        return Err(RandNLAError::mismatch(operation, (a.1, b.1), b));
    }
    if c != (a.0, b.1) {
        return Err(RandNLAError::mismatch(operation, (a.0, b.1), c));
    }
    Ok(())
}

fn scale(beta: f64, c: &mut DMatrix<f64>) {
    if beta == 0.0 {
        c.fill(0.0);
    } else if beta != 1.0 {
        *c *= beta;
    }
}

/// Dense by dense.
pub fn gemm(
    oa: Orientation,
    ob: Orientation,
    alpha: f64,
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    beta: f64,
    c: &mut DMatrix<f64>,
) -> Result<()> {
    check_product("gemm", oa.apply(a.shape()), ob.apply(b.shape()), c.shape())?;
    scale(beta, c);
    match (oa.is_transposed(), ob.is_transposed()) {
        (false, false) => c.gemm(alpha, a, b, 1.0),
        (true, false) => c.gemm_tr(alpha, a, b, 1.0),
        (false, true) => c.gemm(alpha, a, &b.transpose(), 1.0),
        (true, true) => c.gemm_tr(alpha, a, &b.transpose(), 1.0),
    }
    Ok(())
}

/// Dense by sparse. Output columns are owned by single sparse columns in the
/// `Normal` case, which is parallelized; the transposed case scatters rows of
/// the sparse operand into output columns and runs sequentially.
pub fn gemm_dense_sparse(
    oa: Orientation,
    ob: Orientation,
    alpha: f64,
    a: &DMatrix<f64>,
    b: &CscMatrix<f64>,
    beta: f64,
    c: &mut DMatrix<f64>,
) -> Result<()> {
    check_product(
        "gemm_dense_sparse",
        oa.apply(a.shape()),
        ob.apply((b.nrows(), b.ncols())),
        c.shape(),
    )?;
    scale(beta, c);
    let a_transposed = oa.is_transposed();
    let m = c.nrows();
    // column `k` of op(A)
    let op_a = |k: usize, i: usize| if a_transposed { a[(k, i)] } else { a[(i, k)] };

    if !ob.is_transposed() {
        // C[:, col] += alpha * B[row, col] * op(A)[:, row]
        c.as_mut_slice()
            .par_chunks_mut(m.max(1))
            .enumerate()
            .for_each(|(col, c_col)| {
                let lane = b.col(col);
                for (&row, &val) in lane.row_indices().iter().zip(lane.values()) {
                    let s = alpha * val;
                    for (i, ci) in c_col.iter_mut().enumerate() {
                        *ci += s * op_a(row, i);
                    }
                }
            });
    } else {
        // op(B) = B^T, so B[row, col] lands in C[:, row] from op(A)[:, col]
        for col in 0..b.ncols() {
            let lane = b.col(col);
            for (&row, &val) in lane.row_indices().iter().zip(lane.values()) {
                let s = alpha * val;
                for i in 0..m {
                    c[(i, row)] += s * op_a(col, i);
                }
            }
        }
    }
    Ok(())
}

/// Sparse by dense. Every output column is independent, so the loop runs
/// over output columns in parallel for all four orientations.
pub fn gemm_sparse_dense(
    oa: Orientation,
    ob: Orientation,
    alpha: f64,
    a: &CscMatrix<f64>,
    b: &DMatrix<f64>,
    beta: f64,
    c: &mut DMatrix<f64>,
) -> Result<()> {
    check_product(
        "gemm_sparse_dense",
        oa.apply((a.nrows(), a.ncols())),
        ob.apply(b.shape()),
        c.shape(),
    )?;
    scale(beta, c);
    let a_transposed = oa.is_transposed();
    let b_transposed = ob.is_transposed();
    let m = c.nrows();
    // entry (k, j) of op(B)
    let op_b = |k: usize, j: usize| if b_transposed { b[(j, k)] } else { b[(k, j)] };

    c.as_mut_slice()
        .par_chunks_mut(m.max(1))
        .enumerate()
        .for_each(|(j, c_col)| {
            for col in 0..a.ncols() {
                let lane = a.col(col);
                for (&row, &val) in lane.row_indices().iter().zip(lane.values()) {
                    // A[row, col] is op(A)[row, col] or op(A)[col, row]
                    let (out_row, inner) = if a_transposed { (col, row) } else { (row, col) };
                    c_col[out_row] += alpha * val * op_b(inner, j);
                }
            }
        });
    Ok(())
}

fn require_row_distributed(operation: &'static str, d: &DistMatrix) -> Result<()> {
    if !d.distribution().is_row_distributed() {
        return Err(RandNLAError::UnsupportedOperation(format!(
            "{} needs a [VC,*] or [VR,*] operand, got {}",
            operation,
            d.distribution()
        )));
    }
    Ok(())
}

/// `C := alpha * A^T * B + beta * C` with `A`, `B` row-distributed alike and
/// `C` replicated; the local products are summed over the grid.
pub fn gemm_dist_tn(alpha: f64, a: &DistMatrix, b: &DistMatrix, beta: f64, c: &mut DMatrix<f64>) -> Result<()> {
    require_row_distributed("gemm_dist_tn", a)?;
    if b.distribution() != a.distribution() || b.grid() != a.grid() {
        return Err(RandNLAError::UnsupportedOperation(format!(
            "gemm_dist_tn needs matching operands, got {} and {}",
            a.distribution(),
            b.distribution()
        )));
    }
    check_product("gemm_dist_tn", (a.width(), a.height()), b.shape(), c.shape())?;

    let mut partials: Vec<DMatrix<f64>> = a
        .locals()
        .par_iter()
        .zip(b.locals().par_iter())
        .map(|(al, bl)| al.tr_mul(bl))
        .collect();
    a.grid().all_reduce_sum(&mut partials)?;
    scale(beta, c);
    if let Some(total) = partials.first() {
        *c += alpha * total;
    }
    Ok(())
}

/// `C := alpha * A * B + beta * C` with `A` row-distributed, `B` replicated
/// and `C` distributed like `A`. No communication.
pub fn gemm_dist_nn(alpha: f64, a: &DistMatrix, b: &DMatrix<f64>, beta: f64, c: &mut DistMatrix) -> Result<()> {
    require_row_distributed("gemm_dist_nn", a)?;
    if c.distribution() != a.distribution() || c.grid() != a.grid() {
        return Err(RandNLAError::UnsupportedOperation(format!(
            "gemm_dist_nn writes {} output from {} input",
            c.distribution(),
            a.distribution()
        )));
    }
    check_product("gemm_dist_nn", a.shape(), b.shape(), c.shape())?;
    c.locals_mut()
        .par_iter_mut()
        .zip(a.locals().par_iter())
        .for_each(|(cl, al)| {
            scale(beta, cl);
            cl.gemm(alpha, al, b, 1.0);
        });
    Ok(())
}
