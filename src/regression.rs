//! Least squares problems `min ||A X - B||` over local or distributed
//! coefficient matrices.
use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::comm::Communicator;
use crate::dist_matrix::{DistMatrix, Distribution};
use crate::errors::{RandNLAError, Result};
use crate::gemm::{gemm_dist_nn, gemm_dist_tn};
use crate::sketch::{Dimension, MatrixMut, MatrixRef, Rfut, SketchTransform};

/// Blocks of vectors living in the range of a coefficient matrix: the right
/// hand sides and residuals of a solve. Scalars are per column.
pub trait BlockVector: Clone + Send + Sync {
    fn nrows(&self) -> usize;
    fn ncols(&self) -> usize;
    fn column_norms(&self) -> Result<Vec<f64>>;
    fn scale_columns(&mut self, factors: &[f64]);
    /// `self[:, j] += alpha[j] * x[:, j]`
    fn axpy_columns(&mut self, alpha: &[f64], x: &Self) -> Result<()>;
    /// Gathers the whole block.
    fn gather(&self) -> DMatrix<f64>;
}

fn scale_local_columns(m: &mut DMatrix<f64>, factors: &[f64]) {
    for (mut col, f) in m.column_iter_mut().zip(factors) {
        col *= *f;
    }
}

fn axpy_local_columns(operation: &'static str, y: &mut DMatrix<f64>, alpha: &[f64], x: &DMatrix<f64>) -> Result<()> {
    if y.shape() != x.shape() {
        return Err(RandNLAError::mismatch(operation, y.shape(), x.shape()));
    }
    for ((mut yc, xc), a) in y.column_iter_mut().zip(x.column_iter()).zip(alpha) {
        yc.axpy(*a, &xc, 1.0);
    }
    Ok(())
}

impl BlockVector for DMatrix<f64> {
    fn nrows(&self) -> usize {
        self.shape().0
    }

    fn ncols(&self) -> usize {
        self.shape().1
    }

    fn column_norms(&self) -> Result<Vec<f64>> {
        Ok(self.column_iter().map(|c| c.norm()).collect())
    }

    fn scale_columns(&mut self, factors: &[f64]) {
        scale_local_columns(self, factors);
    }

    fn axpy_columns(&mut self, alpha: &[f64], x: &Self) -> Result<()> {
        axpy_local_columns("axpy_columns", self, alpha, x)
    }

    fn gather(&self) -> DMatrix<f64> {
        self.clone()
    }
}

impl BlockVector for DistMatrix {
    fn nrows(&self) -> usize {
        self.height()
    }

    fn ncols(&self) -> usize {
        self.width()
    }

    fn column_norms(&self) -> Result<Vec<f64>> {
        let layout = *self.layout();
        let width = self.width();
        let mut partials: Vec<DMatrix<f64>> = self
            .locals()
            .iter()
            .enumerate()
            .map(|(rank, local)| {
                let mut sums = DMatrix::zeros(1, width);
                if layout.is_primary(rank) {
                    for (lj, col) in local.column_iter().enumerate() {
                        sums[(0, layout.global_col(rank, lj))] = col.norm_squared();
                    }
                }
                sums
            })
            .collect();
        self.grid().all_reduce_sum(&mut partials)?;
        Ok(partials
            .first()
            .map(|s| s.iter().map(|v| v.sqrt()).collect())
            .unwrap_or_else(|| vec![0.0; width]))
    }

    fn scale_columns(&mut self, factors: &[f64]) {
        let layout = *self.layout();
        self.locals_mut().par_iter_mut().enumerate().for_each(|(rank, local)| {
            for (lj, mut col) in local.column_iter_mut().enumerate() {
                col *= factors[layout.global_col(rank, lj)];
            }
        });
    }

    fn axpy_columns(&mut self, alpha: &[f64], x: &Self) -> Result<()> {
        if self.layout() != x.layout() {
            return Err(RandNLAError::UnsupportedOperation(format!(
                "axpy_columns between {} and {} blocks",
                self.distribution(),
                x.distribution()
            )));
        }
        let layout = *self.layout();
        self.locals_mut()
            .par_iter_mut()
            .zip(x.locals().par_iter())
            .enumerate()
            .for_each(|(rank, (y, xl))| {
                for (lj, (mut yc, xc)) in y.column_iter_mut().zip(xl.column_iter()).enumerate() {
                    yc.axpy(alpha[layout.global_col(rank, lj)], &xc, 1.0);
                }
            });
        Ok(())
    }

    fn gather(&self) -> DMatrix<f64> {
        self.to_global()
    }
}

/// Coefficient matrix of a regression problem, seen through the few products
/// and reductions the solvers need.
pub trait LinearOperator: Sync {
    type Rhs: BlockVector;

    fn height(&self) -> usize;
    fn width(&self) -> usize;
    /// `A X` for a replicated `n x k` block.
    fn multiply(&self, x: &DMatrix<f64>) -> Result<Self::Rhs>;
    /// `A^T U`, replicated.
    fn multiply_transpose(&self, u: &Self::Rhs) -> Result<DMatrix<f64>>;
    /// `S A` for a sketch with `S.n() == height`, gathered.
    fn sketch_columnwise(&self, transform: &dyn SketchTransform) -> Result<DMatrix<f64>>;
    /// `scale * (F A)[rows, :]` for the mixing transform `F`, gathered.
    fn mixed_row_sample(&self, mixing: &Rfut, rows: &[usize], scale: f64) -> Result<DMatrix<f64>>;
    /// The whole matrix.
    fn to_local(&self) -> Result<DMatrix<f64>>;
}

fn sample_rows(mixed: &DMatrix<f64>, rows: &[usize], scale: f64) -> Result<DMatrix<f64>> {
    if let Some(&bad) = rows.iter().find(|&&r| r >= mixed.nrows()) {
        return Err(RandNLAError::OutOfRange {
            index: bad,
            size: mixed.nrows(),
        });
    }
    Ok(DMatrix::from_fn(rows.len(), mixed.ncols(), |i, j| scale * mixed[(rows[i], j)]))
}

impl LinearOperator for DMatrix<f64> {
    type Rhs = DMatrix<f64>;

    fn height(&self) -> usize {
        self.nrows()
    }

    fn width(&self) -> usize {
        self.ncols()
    }

    fn multiply(&self, x: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if x.nrows() != self.ncols() {
            return Err(RandNLAError::mismatch("multiply", (self.ncols(), x.ncols()), x.shape()));
        }
        Ok(self * x)
    }

    fn multiply_transpose(&self, u: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if u.nrows() != self.nrows() {
            return Err(RandNLAError::mismatch("multiply_transpose", (self.nrows(), u.ncols()), u.shape()));
        }
        Ok(self.tr_mul(u))
    }

    fn sketch_columnwise(&self, transform: &dyn SketchTransform) -> Result<DMatrix<f64>> {
        let mut out = DMatrix::zeros(transform.s(), self.ncols());
        transform.apply(MatrixRef::Local(self), MatrixMut::Local(&mut out), Dimension::Columnwise)?;
        Ok(out)
    }

    fn mixed_row_sample(&self, mixing: &Rfut, rows: &[usize], scale: f64) -> Result<DMatrix<f64>> {
        let mut mixed = self.clone();
        mixing.apply_columnwise_inplace(&mut mixed)?;
        sample_rows(&mixed, rows, scale)
    }

    fn to_local(&self) -> Result<DMatrix<f64>> {
        Ok(self.clone())
    }
}

/// Row-distributed coefficient matrices ([VC,*] or [VR,*]).
impl LinearOperator for DistMatrix {
    type Rhs = DistMatrix;

    fn height(&self) -> usize {
        DistMatrix::height(self)
    }

    fn width(&self) -> usize {
        DistMatrix::width(self)
    }

    fn multiply(&self, x: &DMatrix<f64>) -> Result<DistMatrix> {
        let mut out = DistMatrix::zeros(*self.grid(), DistMatrix::height(self), x.ncols(), self.distribution())?;
        gemm_dist_nn(1.0, self, x, 0.0, &mut out)?;
        Ok(out)
    }

    fn multiply_transpose(&self, u: &DistMatrix) -> Result<DMatrix<f64>> {
        let mut out = DMatrix::zeros(DistMatrix::width(self), u.width());
        gemm_dist_tn(1.0, self, u, 0.0, &mut out)?;
        Ok(out)
    }

    fn sketch_columnwise(&self, transform: &dyn SketchTransform) -> Result<DMatrix<f64>> {
        let mut out = DistMatrix::zeros(*self.grid(), transform.s(), DistMatrix::width(self), Distribution::STAR_STAR)?;
        transform.apply(MatrixRef::Dist(self), MatrixMut::Dist(&mut out), Dimension::Columnwise)?;
        Ok(out.local(0).clone())
    }

    fn mixed_row_sample(&self, mixing: &Rfut, rows: &[usize], scale: f64) -> Result<DMatrix<f64>> {
        // whole columns per rank, so each rank mixes its own columns
        let spread = self.redistribute(Distribution::STAR_VR)?;
        let mut mixed = DistMatrix::zeros(*self.grid(), DistMatrix::height(self), DistMatrix::width(self), Distribution::STAR_VR)?;
        mixing.apply(MatrixRef::Dist(&spread), MatrixMut::Dist(&mut mixed), Dimension::Columnwise)?;
        sample_rows(&mixed.to_global(), rows, scale)
    }

    fn to_local(&self) -> Result<DMatrix<f64>> {
        Ok(self.to_global())
    }
}

/// `min ||A X - B||` with `A` of size `m x n`, `m >= n`.
#[derive(Debug)]
pub struct RegressionProblem<'a, A: LinearOperator> {
    pub m: usize,
    pub n: usize,
    pub input_matrix: &'a A,
}

impl<'a, A: LinearOperator> RegressionProblem<'a, A> {
    pub fn new(input_matrix: &'a A) -> Result<Self> {
        let (m, n) = (input_matrix.height(), input_matrix.width());
        if n == 0 || m < n {
            return Err(RandNLAError::InvalidDimensions(format!(
                "regression needs an overdetermined, non-empty matrix, got {}x{}",
                m, n
            )));
        }
        Ok(RegressionProblem { m, n, input_matrix })
    }
}

impl<'a, A: LinearOperator> Clone for RegressionProblem<'a, A> {
    fn clone(&self) -> Self {
        RegressionProblem {
            m: self.m,
            n: self.n,
            input_matrix: self.input_matrix,
        }
    }
}

impl<'a, A: LinearOperator> Copy for RegressionProblem<'a, A> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Grid;
    use crate::context::Context;
    use crate::sketch::DenseTransform;
    use approx::assert_relative_eq;

    fn coefficients() -> DMatrix<f64> {
        DMatrix::from_fn(11, 3, |i, j| ((i * 5 + j * 3) % 7) as f64 - 2.5)
    }

    #[test]
    fn distributed_products_match_local() {
        let grid = Grid::new(2, 2).unwrap();
        let a = coefficients();
        let da = DistMatrix::from_global(grid, &a, Distribution::VR_STAR).unwrap();
        let x = DMatrix::from_fn(3, 2, |i, j| (i + j) as f64);

        let ax = da.multiply(&x).unwrap();
        assert_relative_eq!(ax.gather(), a.multiply(&x).unwrap(), epsilon = 1e-12);
        let atu = da.multiply_transpose(&ax).unwrap();
        assert_relative_eq!(atu, a.multiply_transpose(&(&a * &x)).unwrap(), epsilon = 1e-10);
    }

    #[test]
    fn block_vector_operations_agree() {
        let grid = Grid::new(3, 1).unwrap();
        let a = coefficients();
        let mut local = a.clone();
        let mut dist = DistMatrix::from_global(grid, &a, Distribution::VC_STAR).unwrap();

        let ln = BlockVector::column_norms(&local).unwrap();
        let dn = dist.column_norms().unwrap();
        for (l, d) in ln.iter().zip(&dn) {
            assert_relative_eq!(*l, *d, epsilon = 1e-12);
        }

        local.scale_columns(&[2.0, 0.0, -1.0]);
        dist.scale_columns(&[2.0, 0.0, -1.0]);
        let x = DistMatrix::from_global(grid, &a, Distribution::VC_STAR).unwrap();
        local.axpy_columns(&[1.0, 1.0, 0.5], &a).unwrap();
        dist.axpy_columns(&[1.0, 1.0, 0.5], &x).unwrap();
        assert_relative_eq!(dist.gather(), local, epsilon = 1e-12);
    }

    #[test]
    fn sketches_agree_across_layouts() {
        let grid = Grid::new(2, 1).unwrap();
        let a = coefficients();
        let (t, _) = DenseTransform::jlt(11, 6, &Context::new(3)).unwrap();
        let local = a.sketch_columnwise(&t).unwrap();
        let da = DistMatrix::from_global(grid, &a, Distribution::VC_STAR).unwrap();
        assert_relative_eq!(da.sketch_columnwise(&t).unwrap(), local, epsilon = 1e-12);

        let (rfut, _) = Rfut::new(11, &Context::new(4)).unwrap();
        let rows = [0, 4, 4, 10];
        let local = a.mixed_row_sample(&rfut, &rows, 2.0).unwrap();
        assert_relative_eq!(da.mixed_row_sample(&rfut, &rows, 2.0).unwrap(), local, epsilon = 1e-12);
        assert_eq!(local.shape(), (4, 3));
        assert!(a.mixed_row_sample(&rfut, &[11], 1.0).is_err());
    }

    #[test]
    fn underdetermined_problems_are_rejected() {
        let wide = DMatrix::<f64>::zeros(2, 3);
        assert!(RegressionProblem::new(&wide).is_err());
        let a = coefficients();
        let p = RegressionProblem::new(&a).unwrap();
        assert_eq!((p.m, p.n), (11, 3));
    }
}
