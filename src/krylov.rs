//! Preconditioned Krylov least squares on blocks of right hand sides. Every
//! scalar of the recurrences is kept per column, and a column stops moving
//! once it meets its own stopping test.
use log::debug;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::errors::{RandNLAError, Result};
use crate::precond::InplacePrecond;
use crate::regression::{BlockVector, LinearOperator};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KrylovIterParams {
    pub tolerance: f64,
    pub iter_lim: usize,
    /// Log residuals every `res_print` iterations; 0 disables.
    pub res_print: usize,
}

impl Default for KrylovIterParams {
    fn default() -> Self {
        KrylovIterParams {
            tolerance: 1e-14,
            iter_lim: 100,
            res_print: 10,
        }
    }
}

/// Outcome of a solve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KrylovStatus {
    /// Every column met the stopping test.
    Converged { iterations: usize },
    /// `iter_lim` was reached with some column still above tolerance.
    IterationLimit { iterations: usize },
    /// Chebyshev runs a precomputed number of steps.
    FixedIterations { iterations: usize },
    /// No iteration: the alternate direct solver answered.
    Direct,
}

impl KrylovStatus {
    pub fn iterations(&self) -> usize {
        match *self {
            KrylovStatus::Converged { iterations }
            | KrylovStatus::IterationLimit { iterations }
            | KrylovStatus::FixedIterations { iterations } => iterations,
            KrylovStatus::Direct => 0,
        }
    }
}

fn check_rhs<A: LinearOperator>(operation: &'static str, a: &A, b: &A::Rhs) -> Result<()> {
    if b.nrows() != a.height() {
        return Err(RandNLAError::mismatch(operation, (a.height(), b.ncols()), (b.nrows(), b.ncols())));
    }
    Ok(())
}

fn inverse_or_zero(values: &[f64]) -> Vec<f64> {
    values.iter().map(|v| if *v > 0.0 { 1.0 / v } else { 0.0 }).collect()
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().cloned().fold(0.0, f64::max)
}

/// `N^T A^T u`
fn adjoint_product<A: LinearOperator>(a: &A, precond: &dyn InplacePrecond, u: &A::Rhs) -> Result<DMatrix<f64>> {
    let mut v = a.multiply_transpose(u)?;
    precond.apply_adjoint(&mut v)?;
    Ok(v)
}

/// Minimizes `||A X - B||` column by column with LSQR on the right
/// preconditioned operator `A N`, returning `X = N Y`.
///
/// A column stops when `||(AN)^T r|| <= tol * ||AN|| * ||r||` (estimates from
/// the bidiagonalization) or `||r|| <= tol * ||b||`. Columns with `b = 0` or
/// `A^T b = 0` have the zero solution.
pub fn lsqr<A: LinearOperator>(
    a: &A,
    b: &A::Rhs,
    precond: &dyn InplacePrecond,
    params: &KrylovIterParams,
) -> Result<(DMatrix<f64>, KrylovStatus)> {
    check_rhs("lsqr", a, b)?;
    let (n, k) = (a.width(), b.ncols());
    let tol = params.tolerance;

    let bnorm = b.column_norms()?;
    let mut beta = bnorm.clone();
    let mut u = b.clone();
    u.scale_columns(&inverse_or_zero(&beta));

    let mut v = adjoint_product(a, precond, &u)?;
    let mut alpha = BlockVector::column_norms(&v)?;
    v.scale_columns(&inverse_or_zero(&alpha));

    let mut w = v.clone();
    let mut y = DMatrix::zeros(n, k);
    let mut phibar = beta.clone();
    let mut rhobar = alpha.clone();
    let mut anorm = vec![0.0; k];
    let mut active: Vec<bool> = (0..k).map(|j| beta[j] > 0.0 && alpha[j] > 0.0).collect();

    let freeze = |u: &mut A::Rhs, v: &mut DMatrix<f64>, active: &[bool]| {
        let keep: Vec<f64> = active.iter().map(|on| if *on { 1.0 } else { 0.0 }).collect();
        u.scale_columns(&keep);
        v.scale_columns(&keep);
    };
    freeze(&mut u, &mut v, &active);

    let mut itn = 0;
    while itn < params.iter_lim && active.iter().any(|on| *on) {
        itn += 1;

        // u := (A N) v - alpha u
        let mut nv = v.clone();
        precond.apply(&mut nv)?;
        let anv = a.multiply(&nv)?;
        u.scale_columns(&alpha.iter().map(|x| -x).collect::<Vec<_>>());
        u.axpy_columns(&vec![1.0; k], &anv)?;
        beta = u.column_norms()?;
        u.scale_columns(&inverse_or_zero(&beta));
        for j in 0..k {
            anorm[j] = (anorm[j] * anorm[j] + alpha[j] * alpha[j] + beta[j] * beta[j]).sqrt();
        }

        // v := (A N)^T u - beta v
        let atu = adjoint_product(a, precond, &u)?;
        v.scale_columns(&beta.iter().map(|x| -x).collect::<Vec<_>>());
        v += atu;
        alpha = BlockVector::column_norms(&v)?;
        v.scale_columns(&inverse_or_zero(&alpha));

        let mut y_step = vec![0.0; k];
        let mut w_keep = vec![0.0; k];
        let mut normr = vec![0.0; k];
        let mut normar = vec![0.0; k];
        for j in 0..k {
            if !active[j] {
                continue;
            }
            let rho = (rhobar[j] * rhobar[j] + beta[j] * beta[j]).sqrt();
            if rho == 0.0 {
                active[j] = false;
                continue;
            }
            let c = rhobar[j] / rho;
            let s = beta[j] / rho;
            let theta = s * alpha[j];
            rhobar[j] = -c * alpha[j];
            let phi = c * phibar[j];
            phibar[j] = s * phibar[j];

            y_step[j] = phi / rho;
            w_keep[j] = -theta / rho;
            normr[j] = phibar[j];
            normar[j] = phibar[j] * alpha[j] * c.abs();
        }

        for (j, mut col) in y.column_iter_mut().enumerate() {
            col.axpy(y_step[j], &w.column(j), 1.0);
        }
        w.scale_columns(&w_keep);
        w += &v;

        for j in 0..k {
            if active[j] && (normar[j] <= tol * anorm[j] * normr[j] || normr[j] <= tol * bnorm[j]) {
                active[j] = false;
            }
        }
        freeze(&mut u, &mut v, &active);

        if params.res_print > 0 && itn % params.res_print == 0 {
            debug!(
                "lsqr iteration {}: max ||r|| = {:e}, max ||A^T r|| = {:e}, {} of {} columns active",
                itn,
                max_of(&normr),
                max_of(&normar),
                active.iter().filter(|on| **on).count(),
                k
            );
        }
    }

    precond.apply(&mut y)?;
    let status = if active.iter().any(|on| *on) {
        KrylovStatus::IterationLimit { iterations: itn }
    } else {
        KrylovStatus::Converged { iterations: itn }
    };
    Ok((y, status))
}

/// Number of Chebyshev steps that reduce the error by `tolerance` when the
/// singular values of `A N` lie in `[sigma_l, sigma_u]`.
pub fn chebyshev_iterations(sigma_l: f64, sigma_u: f64, tolerance: f64) -> Result<usize> {
    if !(sigma_l > 0.0 && sigma_l <= sigma_u && sigma_u.is_finite()) {
        return Err(RandNLAError::Configuration(format!(
            "singular value bounds must satisfy 0 < sigma_l <= sigma_u, got [{}, {}]",
            sigma_l, sigma_u
        )));
    }
    if !(tolerance > 0.0 && tolerance < 1.0) {
        return Err(RandNLAError::Configuration(format!(
            "Chebyshev tolerance must lie in (0, 1), got {}",
            tolerance
        )));
    }
    let rate = ((sigma_u - sigma_l) / (sigma_u + sigma_l)).ln();
    let steps = ((tolerance.ln() - 2f64.ln()) / rate).ceil();
    Ok(if steps.is_finite() && steps > 1.0 { steps as usize } else { 1 })
}

/// Chebyshev semi-iterative least squares for `A N` with known singular
/// value bounds. Runs a fixed number of steps independent of `iter_lim`.
pub fn chebyshev_ls<A: LinearOperator>(
    a: &A,
    b: &A::Rhs,
    precond: &dyn InplacePrecond,
    sigma_l: f64,
    sigma_u: f64,
    params: &KrylovIterParams,
) -> Result<(DMatrix<f64>, KrylovStatus)> {
    check_rhs("chebyshev_ls", a, b)?;
    let iterations = chebyshev_iterations(sigma_l, sigma_u, params.tolerance)?;
    let (n, k) = (a.width(), b.ncols());
    let d = (sigma_u * sigma_u + sigma_l * sigma_l) / 2.0;
    let c = (sigma_u * sigma_u - sigma_l * sigma_l) / 2.0;

    let mut x = DMatrix::zeros(n, k);
    let mut v = DMatrix::zeros(n, k);
    let mut r = b.clone();
    let mut alpha = 0.0;

    for step in 0..iterations {
        let beta = match step {
            0 => 0.0,
            1 => 0.5 * (c / d) * (c / d),
            _ => (c * alpha / 2.0) * (c * alpha / 2.0),
        };
        alpha = match step {
            0 => 1.0 / d,
            1 => 1.0 / (d - c * c / (2.0 * d)),
            _ => 1.0 / (d - beta / alpha),
        };

        let g = adjoint_product(a, precond, &r)?;
        v *= beta;
        v += g;
        let mut nv = v.clone();
        precond.apply(&mut nv)?;
        x += alpha * &nv;
        let anv = a.multiply(&nv)?;
        r.axpy_columns(&vec![-alpha; k], &anv)?;

        if params.res_print > 0 && (step + 1) % params.res_print == 0 {
            debug!(
                "chebyshev step {} of {}: max ||r|| = {:e}",
                step + 1,
                iterations,
                max_of(&r.column_norms()?)
            );
        }
    }
    Ok((x, KrylovStatus::FixedIterations { iterations }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Grid;
    use crate::dist_matrix::{DistMatrix, Distribution};
    use crate::precond::{build_precond, IdentityPrecond, PrecondTag};
    use crate::solvers::svd_least_squares;
    use approx::assert_relative_eq;

    fn problem() -> (DMatrix<f64>, DMatrix<f64>) {
        let a = DMatrix::from_fn(30, 4, |i, j| ((i * 7 + j * 13) % 17) as f64 / 17.0 + if i == j { 1.0 } else { 0.0 });
        let b = DMatrix::from_fn(30, 2, |i, j| ((i + 3 * j) as f64 * 0.37).sin());
        (a, b)
    }

    fn tight() -> KrylovIterParams {
        KrylovIterParams {
            tolerance: 1e-12,
            iter_lim: 200,
            res_print: 0,
        }
    }

    #[test]
    fn lsqr_matches_direct_solution() {
        let (a, b) = problem();
        let (x, status) = lsqr(&a, &b, &IdentityPrecond, &tight()).unwrap();
        assert!(matches!(status, KrylovStatus::Converged { .. }), "{:?}", status);
        assert_relative_eq!(x, svd_least_squares(&a, &b).unwrap(), epsilon = 1e-8);
    }

    #[test]
    fn preconditioning_cuts_iterations() {
        let (mut a, b) = problem();
        a.column_mut(2).scale_mut(1e3);
        let params = KrylovIterParams { iter_lim: 500, ..tight() };
        let (precond, _) = build_precond(&a, PrecondTag::Qr).unwrap();
        let (x, status) = lsqr(&a, &b, precond.as_ref(), &params).unwrap();
        let (_, plain) = lsqr(&a, &b, &IdentityPrecond, &params).unwrap();
        assert!(status.iterations() <= 4, "{:?}", status);
        assert!(status.iterations() <= plain.iterations());
        assert_relative_eq!(x, svd_least_squares(&a, &b).unwrap(), epsilon = 1e-8);
    }

    #[test]
    fn zero_columns_stay_zero() {
        let (a, mut b) = problem();
        b.column_mut(1).fill(0.0);
        let (x, status) = lsqr(&a, &b, &IdentityPrecond, &tight()).unwrap();
        assert!(x.column(1).iter().all(|v| *v == 0.0));
        assert!(matches!(status, KrylovStatus::Converged { .. }));

        let zero = DMatrix::zeros(30, 1);
        let (x, status) = lsqr(&a, &zero, &IdentityPrecond, &tight()).unwrap();
        assert_eq!(status, KrylovStatus::Converged { iterations: 0 });
        assert!(x.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn iteration_limit_is_reported() {
        let (a, b) = problem();
        let params = KrylovIterParams { iter_lim: 1, ..tight() };
        let (_, status) = lsqr(&a, &b, &IdentityPrecond, &params).unwrap();
        assert_eq!(status, KrylovStatus::IterationLimit { iterations: 1 });
    }

    #[test]
    fn distributed_lsqr_matches_local() {
        let (a, b) = problem();
        let grid = Grid::new(2, 2).unwrap();
        let da = DistMatrix::from_global(grid, &a, Distribution::VC_STAR).unwrap();
        let db = DistMatrix::from_global(grid, &b, Distribution::VC_STAR).unwrap();
        let (local, _) = lsqr(&a, &b, &IdentityPrecond, &tight()).unwrap();
        let (dist, _) = lsqr(&da, &db, &IdentityPrecond, &tight()).unwrap();
        assert_relative_eq!(dist, local, epsilon = 1e-10);
    }

    #[test]
    fn chebyshev_step_count() {
        assert_eq!(chebyshev_iterations(1.0, 1.0, 1e-14).unwrap(), 1);
        // ratio 1/3: ceil(ln(0.5e-14) / ln(1/3)) = 30
        assert_eq!(chebyshev_iterations(1.0, 2.0, 1e-14).unwrap(), 30);
        assert!(chebyshev_iterations(0.0, 2.0, 1e-14).is_err());
        assert!(chebyshev_iterations(3.0, 2.0, 1e-14).is_err());
    }

    #[test]
    fn chebyshev_converges_with_valid_bounds() {
        let (a, b) = problem();
        let (precond, _) = build_precond(&a, PrecondTag::Svd).unwrap();
        // A N has orthonormal columns, so any bounds around 1 are valid
        let params = KrylovIterParams { tolerance: 1e-12, ..Default::default() };
        let (x, status) = chebyshev_ls(&a, &b, precond.as_ref(), 0.5, 1.5, &params).unwrap();
        assert!(matches!(status, KrylovStatus::FixedIterations { iterations } if iterations > 0));
        assert_relative_eq!(x, svd_least_squares(&a, &b).unwrap(), epsilon = 1e-8);
    }

    #[test]
    fn params_have_documented_defaults() {
        let p = KrylovIterParams::default();
        assert_eq!((p.tolerance, p.iter_lim, p.res_print), (1e-14, 100, 10));
        let parsed: KrylovIterParams = serde_json::from_str(r#"{"iter_lim": 7}"#).unwrap();
        assert_eq!(parsed.iter_lim, 7);
        assert_eq!(parsed.tolerance, 1e-14);
    }
}
