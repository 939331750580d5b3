use nalgebra::{DMatrix, Dyn, RealField, Scalar, SVD};
use num_traits::{One, Zero};
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

use crate::errors::{RandNLAError, Result};

fn check_square_system<T: Scalar>(operation: &'static str, u: &DMatrix<T>, y: &DMatrix<T>) -> Result<()> {
    if !u.is_square() {
        return Err(RandNLAError::mismatch(operation, (u.nrows(), u.nrows()), u.shape()));
    }
    if y.nrows() != u.nrows() {
        return Err(RandNLAError::mismatch(operation, (u.nrows(), y.ncols()), y.shape()));
    }
    Ok(())
}

fn zero_pivot(operation: &str, i: usize) -> RandNLAError {
    RandNLAError::NumericalInstability(format!("{}: zero pivot at row {}", operation, i))
}

/// Back substitution for `U X = Y` with `U` upper triangular, one column of
/// `Y` at a time.
pub fn solve_upper_triangular_system<T>(u: &DMatrix<T>, y: &DMatrix<T>) -> Result<DMatrix<T>>
where
    T: Scalar + RealField + Zero + One + AddAssign + SubAssign + MulAssign + DivAssign + Copy,
{
    check_square_system("solve_upper_triangular_system", u, y)?;
    let n = u.nrows();
    let mut x = DMatrix::zeros(n, y.ncols());

    for k in 0..y.ncols() {
        for i in (0..n).rev() {
            let mut sum = T::zero();
            for j in (i + 1)..n {
                sum += u[(i, j)] * x[(j, k)];
            }
            if u[(i, i)] == T::zero() {
                return Err(zero_pivot("solve_upper_triangular_system", i));
            }
            x[(i, k)] = (y[(i, k)] - sum) / u[(i, i)];
        }
    }
    Ok(x)
}

/// Forward substitution for `U^T X = Y` with `U` upper triangular.
pub fn solve_upper_triangular_transpose_system<T>(u: &DMatrix<T>, y: &DMatrix<T>) -> Result<DMatrix<T>>
where
    T: Scalar + RealField + Zero + One + AddAssign + SubAssign + MulAssign + DivAssign + Copy,
{
    check_square_system("solve_upper_triangular_transpose_system", u, y)?;
    let n = u.nrows();
    let mut x = DMatrix::zeros(n, y.ncols());

    for k in 0..y.ncols() {
        for i in 0..n {
            let mut sum = T::zero();
            for j in 0..i {
                sum += u[(j, i)] * x[(j, k)];
            }
            if u[(i, i)] == T::zero() {
                return Err(zero_pivot("solve_upper_triangular_transpose_system", i));
            }
            x[(i, k)] = (y[(i, k)] - sum) / u[(i, i)];
        }
    }
    Ok(x)
}

/// Solves `diag(sigma) X = Y`; zero diagonal entries give zero rows
/// (the minimum norm solution).
pub fn solve_diagonal_system<T>(sigma: &[T], y: &DMatrix<T>) -> Result<DMatrix<T>>
where
    T: Scalar + RealField + Zero + Copy,
{
    if sigma.len() != y.nrows() {
        return Err(RandNLAError::mismatch("solve_diagonal_system", (sigma.len(), y.ncols()), y.shape()));
    }
    Ok(DMatrix::from_fn(y.nrows(), y.ncols(), |i, k| {
        if sigma[i] == T::zero() {
            T::zero()
        } else {
            y[(i, k)] / sigma[i]
        }
    }))
}

/// Direct least squares through a full SVD. Singular values below
/// `max(m, n) * sigma_max * eps` are treated as zero, so rank deficient
/// problems get the minimum norm solution.
#[derive(Clone, Debug)]
pub struct SvdLeastSquaresSolver {
    svd: SVD<f64, Dyn, Dyn>,
    m: usize,
    eps: f64,
}

impl SvdLeastSquaresSolver {
    pub fn new(a: &DMatrix<f64>) -> Result<Self> {
        let (m, n) = a.shape();
        if m == 0 || n == 0 {
            return Err(RandNLAError::InvalidDimensions(format!(
                "least squares needs a non-empty matrix, got {}x{}",
                m, n
            )));
        }
        let svd = a.clone().svd(true, true);
        let eps = m.max(n) as f64 * svd.singular_values.max() * f64::EPSILON;
        Ok(SvdLeastSquaresSolver { svd, m, eps })
    }

    pub fn singular_values(&self) -> &[f64] {
        self.svd.singular_values.as_slice()
    }

    pub fn solve(&self, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
        if b.nrows() != self.m {
            return Err(RandNLAError::mismatch("svd_least_squares", (self.m, b.ncols()), b.shape()));
        }
        self.svd
            .solve(b, self.eps)
            .map_err(|e| RandNLAError::NumericalInstability(e.to_string()))
    }
}

/// One-shot `argmin ||A X - B||` by SVD.
pub fn svd_least_squares(a: &DMatrix<f64>, b: &DMatrix<f64>) -> Result<DMatrix<f64>> {
    SvdLeastSquaresSolver::new(a)?.solve(b)
}
