//! Right preconditioners built from a sketch of the coefficient matrix.
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::errors::{RandNLAError, Result};
use crate::solvers::{solve_upper_triangular_system, solve_upper_triangular_transpose_system};

/// Operator `N` applied in place to the columns of an `n x k` block.
pub trait InplacePrecond: Send + Sync {
    /// `x := N x`
    fn apply(&self, x: &mut DMatrix<f64>) -> Result<()>;
    /// `x := N^T x`
    fn apply_adjoint(&self, x: &mut DMatrix<f64>) -> Result<()>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityPrecond;

impl InplacePrecond for IdentityPrecond {
    fn apply(&self, _x: &mut DMatrix<f64>) -> Result<()> {
        Ok(())
    }

    fn apply_adjoint(&self, _x: &mut DMatrix<f64>) -> Result<()> {
        Ok(())
    }
}

/// `N = R^{-1}` for an upper triangular `R`.
#[derive(Clone, Debug)]
pub struct TriangularInversePrecond {
    r: DMatrix<f64>,
}

impl TriangularInversePrecond {
    pub fn new(r: DMatrix<f64>) -> Result<Self> {
        if !r.is_square() {
            return Err(RandNLAError::mismatch("TriangularInversePrecond", (r.ncols(), r.ncols()), r.shape()));
        }
        Ok(TriangularInversePrecond { r })
    }

    pub fn r(&self) -> &DMatrix<f64> {
        &self.r
    }
}

impl InplacePrecond for TriangularInversePrecond {
    fn apply(&self, x: &mut DMatrix<f64>) -> Result<()> {
        *x = solve_upper_triangular_system(&self.r, x)?;
        Ok(())
    }

    fn apply_adjoint(&self, x: &mut DMatrix<f64>) -> Result<()> {
        *x = solve_upper_triangular_transpose_system(&self.r, x)?;
        Ok(())
    }
}

/// Explicit `n x n` preconditioner matrix.
#[derive(Clone, Debug)]
pub struct MatrixPrecond {
    n: DMatrix<f64>,
}

impl MatrixPrecond {
    pub fn new(n: DMatrix<f64>) -> Result<Self> {
        if !n.is_square() {
            return Err(RandNLAError::mismatch("MatrixPrecond", (n.ncols(), n.ncols()), n.shape()));
        }
        Ok(MatrixPrecond { n })
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.n
    }
}

impl InplacePrecond for MatrixPrecond {
    fn apply(&self, x: &mut DMatrix<f64>) -> Result<()> {
        if x.nrows() != self.n.ncols() {
            return Err(RandNLAError::mismatch("MatrixPrecond", (self.n.ncols(), x.ncols()), x.shape()));
        }
        *x = &self.n * &*x;
        Ok(())
    }

    fn apply_adjoint(&self, x: &mut DMatrix<f64>) -> Result<()> {
        if x.nrows() != self.n.nrows() {
            return Err(RandNLAError::mismatch("MatrixPrecond", (self.n.nrows(), x.ncols()), x.shape()));
        }
        *x = self.n.tr_mul(x);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrecondTag {
    /// `N = R^{-1}` from a QR factorization of the sketch.
    Qr,
    /// `N = V diag(1/sigma)` from an SVD of the sketch.
    Svd,
}

fn one_norm(a: &DMatrix<f64>) -> f64 {
    a.column_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

/// Estimate of `||R^{-1}||_1` by Hager's method with Higham's alternating
/// sign vector as a second candidate.
fn inverse_one_norm_estimate(r: &DMatrix<f64>) -> Result<f64> {
    let n = r.nrows();
    let mut x = DMatrix::from_element(n, 1, 1.0 / n as f64);
    let mut estimate = 0.0;

    for _ in 0..5 {
        let y = solve_upper_triangular_system(r, &x)?;
        estimate = y.iter().map(|v| v.abs()).sum::<f64>();
        let xi = y.map(|v| if v >= 0.0 { 1.0 } else { -1.0 });
        let z = solve_upper_triangular_transpose_system(r, &xi)?;
        let (j, zmax) = z
            .iter()
            .enumerate()
            .fold((0, 0.0), |best, (i, v)| if v.abs() > best.1 { (i, v.abs()) } else { best });
        if zmax <= z.dot(&x) {
            break;
        }
        x.fill(0.0);
        x[(j, 0)] = 1.0;
    }

    let alternating = DMatrix::from_fn(n, 1, |i, _| {
        let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
        let ramp = if n > 1 { i as f64 / (n - 1) as f64 } else { 0.0 };
        sign * (1.0 + ramp)
    });
    let y = solve_upper_triangular_system(r, &alternating)?;
    let alt = 2.0 * y.iter().map(|v| v.abs()).sum::<f64>() / (3.0 * n as f64);
    Ok(estimate.max(alt))
}

/// 1-norm condition estimate of an upper triangular matrix. Exactly
/// singular input gives infinity.
pub fn triangular_condest(r: &DMatrix<f64>) -> Result<f64> {
    if !r.is_square() {
        return Err(RandNLAError::mismatch("triangular_condest", (r.ncols(), r.ncols()), r.shape()));
    }
    if r.nrows() == 0 {
        return Ok(1.0);
    }
    if r.diagonal().iter().any(|d| *d == 0.0) {
        return Ok(f64::INFINITY);
    }
    let cond = one_norm(r) * inverse_one_norm_estimate(r)?;
    Ok(if cond.is_finite() { cond } else { f64::INFINITY })
}

/// Builds a right preconditioner from a `t x n` sketch (`t >= n`) and
/// returns it with a condition estimate of the sketch.
pub fn build_precond(sketch: &DMatrix<f64>, tag: PrecondTag) -> Result<(Box<dyn InplacePrecond>, f64)> {
    let (t, n) = sketch.shape();
    if t < n || n == 0 {
        return Err(RandNLAError::mismatch("build_precond", (n.max(1), n), (t, n)));
    }
    match tag {
        PrecondTag::Qr => {
            let r = sketch.clone().qr().r();
            let cond = triangular_condest(&r)?;
            Ok((Box::new(TriangularInversePrecond::new(r)?), cond))
        }
        PrecondTag::Svd => {
            let svd = sketch.clone().svd(false, true);
            let v_t = svd
                .v_t
                .ok_or_else(|| RandNLAError::NumericalInstability("SVD did not produce V".to_string()))?;
            let sigma = &svd.singular_values;
            let mut nmat = v_t.transpose();
            for (j, s) in sigma.iter().enumerate() {
                let inv = if *s > 0.0 { 1.0 / s } else { 0.0 };
                nmat.column_mut(j).scale_mut(inv);
            }
            let (max, min) = (sigma.max(), sigma.min());
            let cond = if min > 0.0 { max / min } else { f64::INFINITY };
            Ok((Box::new(MatrixPrecond::new(nmat)?), cond))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::dmatrix;

    fn tall() -> DMatrix<f64> {
        DMatrix::from_fn(9, 3, |i, j| ((i * 7 + j * 5) % 11) as f64 - 5.0 + if i == j { 4.0 } else { 0.0 })
    }

    #[test]
    fn triangular_estimate_is_exact_for_small_cases() {
        let r = dmatrix![2.0, 0.0; 0.0, 0.5];
        assert_relative_eq!(triangular_condest(&r).unwrap(), 4.0, epsilon = 1e-12);
        let r = dmatrix![1.0, 1.0; 0.0, 0.0];
        assert_eq!(triangular_condest(&r).unwrap(), f64::INFINITY);
    }

    #[test]
    fn triangular_estimate_bounds_true_condition() {
        let r = dmatrix![1.0, -2.0, 3.0; 0.0, 0.1, 4.0; 0.0, 0.0, 2.0];
        let inv = r.clone().try_inverse().unwrap();
        let exact = one_norm(&r) * one_norm(&inv);
        let est = triangular_condest(&r).unwrap();
        assert!(est <= exact * (1.0 + 1e-12));
        assert!(est >= exact / 10.0);
    }

    #[test]
    fn qr_preconditioner_orthogonalizes_the_sketch() {
        let s = tall();
        let (precond, cond) = build_precond(&s, PrecondTag::Qr).unwrap();
        assert!(cond.is_finite() && cond >= 1.0);
        let mut n = DMatrix::identity(3, 3);
        precond.apply(&mut n).unwrap();
        let q = &s * &n;
        assert_relative_eq!(q.transpose() * &q, DMatrix::identity(3, 3), epsilon = 1e-10);

        let mut m = DMatrix::identity(3, 3);
        precond.apply_adjoint(&mut m).unwrap();
        assert_relative_eq!(m, n.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn svd_preconditioner_orthogonalizes_the_sketch() {
        let s = tall();
        let (precond, cond) = build_precond(&s, PrecondTag::Svd).unwrap();
        let sv = s.clone().svd(false, false).singular_values;
        assert_relative_eq!(cond, sv.max() / sv.min(), epsilon = 1e-10);
        let mut n = DMatrix::identity(3, 3);
        precond.apply(&mut n).unwrap();
        let q = &s * &n;
        assert_relative_eq!(q.transpose() * &q, DMatrix::identity(3, 3), epsilon = 1e-10);
    }

    #[test]
    fn wide_sketch_is_rejected() {
        let err = build_precond(&DMatrix::zeros(2, 3), PrecondTag::Qr).err().unwrap();
        assert!(matches!(err, RandNLAError::DimensionMismatch { .. }));
    }

    #[test]
    fn singular_sketch_reports_infinite_condition() {
        let s = DMatrix::from_fn(5, 2, |i, _| i as f64 + 1.0);
        let (_, cond) = build_precond(&s, PrecondTag::Svd).unwrap();
        assert!(cond > 1e14);
        let (_, cond) = build_precond(&s, PrecondTag::Qr).unwrap();
        assert!(cond > 1e14);
    }
}
