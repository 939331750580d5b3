use nalgebra::DMatrix;

use crate::errors::{RandNLAError, Result};
use crate::regression::LinearOperator;
use crate::sketch::SketchTransform;
use crate::solvers::{solve_diagonal_system, solve_upper_triangular_system};

fn sketch_problem<A>(transform: &dyn SketchTransform, a: &A, b: &A::Rhs) -> Result<(DMatrix<f64>, DMatrix<f64>)>
where
    A: LinearOperator,
    A::Rhs: LinearOperator,
{
    if transform.s() < a.width() {
        return Err(RandNLAError::InvalidDimensions(format!(
            "{} sketch of size {} cannot determine {} unknowns",
            transform.name(),
            transform.s(),
            a.width()
        )));
    }
    Ok((a.sketch_columnwise(transform)?, b.sketch_columnwise(transform)?))
}

/// Approximate `argmin ||A X - B||` as the exact solution of the sketched
/// problem `min ||S A X - S B||`, through a QR factorization of `S A`.
pub fn sketched_least_squares_qr<A>(transform: &dyn SketchTransform, a: &A, b: &A::Rhs) -> Result<DMatrix<f64>>
where
    A: LinearOperator,
    A::Rhs: LinearOperator,
{
    let (a_sk, b_sk) = sketch_problem(transform, a, b)?;
    let (q, r) = a_sk.qr().unpack();
    solve_upper_triangular_system(&r, &q.tr_mul(&b_sk))
}

/// Same as [`sketched_least_squares_qr`] through an SVD of `S A`; rank
/// deficient sketches give the minimum norm solution.
pub fn sketched_least_squares_svd<A>(transform: &dyn SketchTransform, a: &A, b: &A::Rhs) -> Result<DMatrix<f64>>
where
    A: LinearOperator,
    A::Rhs: LinearOperator,
{
    let (a_sk, b_sk) = sketch_problem(transform, a, b)?;
    let svd_obj = a_sk.svd(true, true);
    let (u, v_t) = match (svd_obj.u, svd_obj.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => {
            return Err(RandNLAError::NumericalInstability(
                "SVD of the sketch did not produce singular vectors".to_string(),
            ))
        }
    };
    let x = solve_diagonal_system(svd_obj.singular_values.as_slice(), &u.tr_mul(&b_sk))?;
    Ok(v_t.tr_mul(&x))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Grid;
    use crate::context::Context;
    use crate::dist_matrix::{DistMatrix, Distribution};
    use crate::sketch::{DenseTransform, HashTransform};
    use crate::solvers::svd_least_squares;
    use crate::test_assist::{random_matrix, with_noise};
    use approx::assert_relative_eq;

    #[test]
    fn consistent_systems_are_solved_exactly() {
        let a = random_matrix(300, 5, 11);
        let x = random_matrix(5, 2, 12);
        let b = &a * &x;
        let (t, _) = DenseTransform::jlt(300, 40, &Context::new(1)).unwrap();
        assert_relative_eq!(sketched_least_squares_qr(&t, &a, &b).unwrap(), x, epsilon = 1e-8);
        assert_relative_eq!(sketched_least_squares_svd(&t, &a, &b).unwrap(), x, epsilon = 1e-8);
    }

    #[test]
    fn noisy_residual_is_close_to_optimal() {
        let a = random_matrix(300, 5, 21);
        let x = random_matrix(5, 1, 22);
        let b = with_noise(&(&a * &x), 0.1, 23);
        let optimal = (&a * svd_least_squares(&a, &b).unwrap() - &b).norm();

        let (jlt, _) = DenseTransform::jlt(300, 150, &Context::new(2)).unwrap();
        let (cwt, _) = HashTransform::cwt(300, 150, &Context::new(3)).unwrap();
        for t in [&jlt as &dyn SketchTransform, &cwt] {
            let qr = sketched_least_squares_qr(t, &a, &b).unwrap();
            let svd = sketched_least_squares_svd(t, &a, &b).unwrap();
            assert_relative_eq!(qr, svd, epsilon = 1e-8);
            let residual = (&a * &qr - &b).norm();
            assert!(residual >= optimal * (1.0 - 1e-12));
            assert!(residual < 2.0 * optimal, "{} vs {}", residual, optimal);
        }
    }

    #[test]
    fn distributed_input_matches_local() {
        let grid = Grid::new(2, 1).unwrap();
        let a = random_matrix(60, 4, 31);
        let b = random_matrix(60, 1, 32);
        let (t, _) = DenseTransform::jlt(60, 20, &Context::new(4)).unwrap();
        let da = DistMatrix::from_global(grid, &a, Distribution::VC_STAR).unwrap();
        let db = DistMatrix::from_global(grid, &b, Distribution::VC_STAR).unwrap();
        let local = sketched_least_squares_qr(&t, &a, &b).unwrap();
        assert_relative_eq!(sketched_least_squares_qr(&t, &da, &db).unwrap(), local, epsilon = 1e-10);
    }

    #[test]
    fn sketch_smaller_than_unknowns_is_rejected() {
        let a = random_matrix(30, 6, 1);
        let (t, _) = DenseTransform::jlt(30, 4, &Context::new(0)).unwrap();
        let err = sketched_least_squares_qr(&t, &a, &a).unwrap_err();
        assert!(matches!(err, RandNLAError::InvalidDimensions(_)));
    }
}
