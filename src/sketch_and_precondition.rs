//! Sketch-and-precondition least squares: sketch `A`, factor the sketch into
//! a right preconditioner, then solve every right hand side iteratively.
use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand_distr::Uniform;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::errors::{RandNLAError, Result};
use crate::krylov::{chebyshev_ls, lsqr, KrylovIterParams, KrylovStatus};
use crate::precond::{build_precond, InplacePrecond, PrecondTag};
use crate::regression::{BlockVector, LinearOperator, RegressionProblem};
use crate::sketch::{DenseTransform, Rfut, SketchKind};
use crate::solvers::SvdLeastSquaresSolver;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratedSolverParams {
    /// Sketch size `t = sketch_size_multiplier * n`.
    pub sketch_size_multiplier: usize,
    /// Largest acceptable condition estimate of a resampled sketch.
    pub condition_threshold: f64,
    /// Sketches drawn before the resampling solver gives up.
    pub max_attempts: usize,
    /// Failure probability `delta` behind the LSRN singular value bounds.
    pub failure_probability: f64,
    /// Run construction and solves on a dedicated pool of this size.
    pub num_threads: Option<usize>,
    pub krylov: KrylovIterParams,
}

impl Default for AcceleratedSolverParams {
    fn default() -> Self {
        AcceleratedSolverParams {
            sketch_size_multiplier: 4,
            condition_threshold: 1e14,
            max_attempts: 3,
            failure_probability: 1e-6,
            num_threads: None,
            krylov: KrylovIterParams::default(),
        }
    }
}

/// Iteration used once a preconditioner is in place.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SolverMethod {
    Lsqr,
    /// Chebyshev with bounds on the singular values of `A N`.
    Chebyshev { sigma_l: f64, sigma_u: f64 },
}

enum SolverState {
    Preconditioned {
        precond: Box<dyn InplacePrecond>,
        method: SolverMethod,
    },
    /// Exact SVD solver, taken when no acceptable sketch was found.
    Alternate(SvdLeastSquaresSolver),
}

/// Least squares solver for one coefficient matrix, reusable across right
/// hand sides.
pub struct AcceleratedRegressionSolver<'a, A: LinearOperator> {
    problem: RegressionProblem<'a, A>,
    state: SolverState,
    params: AcceleratedSolverParams,
    condition_estimates: Vec<f64>,
    pool: Option<ThreadPool>,
}

fn thread_pool(params: &AcceleratedSolverParams) -> Result<Option<ThreadPool>> {
    match params.num_threads {
        None => Ok(None),
        Some(threads) => ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map(Some)
            .map_err(|e| RandNLAError::Configuration(format!("cannot build worker pool: {}", e))),
    }
}

fn install<R, F>(pool: &Option<ThreadPool>, f: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    match pool {
        Some(pool) => pool.install(f),
        None => f(),
    }
}

fn sketch_size<A: LinearOperator>(problem: &RegressionProblem<'_, A>, params: &AcceleratedSolverParams) -> Result<usize> {
    if params.sketch_size_multiplier == 0 {
        return Err(RandNLAError::Configuration(
            "sketch_size_multiplier must be at least 1".to_string(),
        ));
    }
    problem
        .n
        .checked_mul(params.sketch_size_multiplier)
        .ok_or_else(|| RandNLAError::Configuration(format!("sketch of {} x {} columns overflows", params.sketch_size_multiplier, problem.n)))
}

/// LSRN bounds on the singular values of `A N` for a Gaussian sketch of
/// size `t`, or `None` when the bound is vacuous at this failure
/// probability.
pub fn lsrn_singular_value_bounds(n: usize, t: usize, delta: f64) -> Result<Option<(f64, f64)>> {
    if !(delta > 0.0 && delta < 1.0) {
        return Err(RandNLAError::Configuration(format!(
            "failure probability must lie in (0, 1), got {}",
            delta
        )));
    }
    let (n, t) = (n as f64, t as f64);
    let alpha = (2.0 * (2.0 / delta).ln() / t).sqrt();
    if alpha >= 1.0 - (n / t).sqrt() {
        return Ok(None);
    }
    let sigma_u = t.sqrt() / ((1.0 - alpha) * t.sqrt() - n.sqrt());
    let sigma_l = t.sqrt() / ((1.0 + alpha) * t.sqrt() + n.sqrt());
    Ok(Some((sigma_l, sigma_u)))
}

impl<'a, A: LinearOperator> AcceleratedRegressionSolver<'a, A> {
    /// Sketches once with `kind` and always keeps the resulting
    /// preconditioner, solving with LSQR.
    pub fn simplified(
        problem: RegressionProblem<'a, A>,
        kind: SketchKind,
        tag: PrecondTag,
        context: &Context,
        params: AcceleratedSolverParams,
    ) -> Result<(Self, Context)> {
        let pool = thread_pool(&params)?;
        let t = sketch_size(&problem, &params)?;
        let (precond, cond, context) = install(&pool, || -> Result<_> {
            let (transform, context) = kind.build(problem.m, t, context)?;
            let sketch = problem.input_matrix.sketch_columnwise(transform.as_ref())?;
            let (precond, cond) = build_precond(&sketch, tag)?;
            Ok((precond, cond, context))
        })?;
        info!(
            "simplified solver for {}x{} problem: {:?} sketch of size {}, condition estimate {:e}",
            problem.m, problem.n, kind, t, cond
        );
        let solver = AcceleratedRegressionSolver {
            problem,
            state: SolverState::Preconditioned {
                precond,
                method: SolverMethod::Lsqr,
            },
            params,
            condition_estimates: vec![cond],
            pool,
        };
        Ok((solver, context))
    }

    /// Blendenpik: mixes the rows of `A` with a randomized unitary transform,
    /// samples `t` of them uniformly and factors the sample. A sketch whose
    /// condition estimate exceeds the threshold is redrawn; after
    /// `max_attempts` failures the solver settles on the exact SVD solver.
    pub fn blendenpik(
        problem: RegressionProblem<'a, A>,
        tag: PrecondTag,
        context: &Context,
        params: AcceleratedSolverParams,
    ) -> Result<(Self, Context)> {
        if params.max_attempts == 0 {
            return Err(RandNLAError::Configuration("max_attempts must be at least 1".to_string()));
        }
        let pool = thread_pool(&params)?;
        let t = sketch_size(&problem, &params)?;
        let (m, a) = (problem.m, problem.input_matrix);
        let scale = (m as f64 / t as f64).sqrt();

        let (accepted, estimates, context) = install(&pool, || -> Result<_> {
            let rows = Uniform::new(0u64, m as u64);
            let mut context = context.clone();
            let mut estimates = Vec::with_capacity(params.max_attempts);
            for attempt in 1..=params.max_attempts {
                let (mixing, next) = Rfut::new(m, &context)?;
                let (samples, next) = next.generate_random_samples_array::<u64, _>(t, rows)?;
                context = next;
                let samples: Vec<usize> = samples.into_iter().map(|r| r as usize).collect();
                let sketch = a.mixed_row_sample(&mixing, &samples, scale)?;
                let (precond, cond) = build_precond(&sketch, tag)?;
                estimates.push(cond);
                debug!("blendenpik attempt {}: condition estimate {:e}", attempt, cond);
                if cond <= params.condition_threshold {
                    return Ok((Some(precond), estimates, context));
                }
            }
            Ok((None, estimates, context))
        })?;

        let state = match accepted {
            Some(precond) => {
                info!(
                    "blendenpik solver for {}x{} problem: preconditioner accepted after {} attempt(s)",
                    problem.m,
                    problem.n,
                    estimates.len()
                );
                SolverState::Preconditioned {
                    precond,
                    method: SolverMethod::Lsqr,
                }
            }
            None => {
                warn!(
                    "blendenpik: no sketch within condition threshold {:e} (estimates {:?}), using SVD solver",
                    params.condition_threshold, estimates
                );
                let full = a.to_local()?;
                SolverState::Alternate(install(&pool, || SvdLeastSquaresSolver::new(&full))?)
            }
        };
        let solver = AcceleratedRegressionSolver {
            problem,
            state,
            params,
            condition_estimates: estimates,
            pool,
        };
        Ok((solver, context))
    }

    /// LSRN: Gaussian sketch and SVD preconditioner (or `tag`). When the
    /// failure probability admits useful singular value bounds the solves
    /// use Chebyshev iteration, otherwise LSQR.
    pub fn lsrn(
        problem: RegressionProblem<'a, A>,
        tag: PrecondTag,
        context: &Context,
        params: AcceleratedSolverParams,
    ) -> Result<(Self, Context)> {
        let pool = thread_pool(&params)?;
        let t = sketch_size(&problem, &params)?;
        let bounds = lsrn_singular_value_bounds(problem.n, t, params.failure_probability)?;
        let (precond, cond, context) = install(&pool, || -> Result<_> {
            let (transform, context) = DenseTransform::jlt(problem.m, t, context)?;
            let sketch = problem.input_matrix.sketch_columnwise(&transform)?;
            let (precond, cond) = build_precond(&sketch, tag)?;
            Ok((precond, cond, context))
        })?;
        let method = match bounds {
            Some((sigma_l, sigma_u)) => SolverMethod::Chebyshev { sigma_l, sigma_u },
            None => SolverMethod::Lsqr,
        };
        info!(
            "lsrn solver for {}x{} problem: sketch size {}, {:?}",
            problem.m, problem.n, t, method
        );
        let solver = AcceleratedRegressionSolver {
            problem,
            state: SolverState::Preconditioned { precond, method },
            params,
            condition_estimates: vec![cond],
            pool,
        };
        Ok((solver, context))
    }

    /// Solves `min ||A X - B||` for the columns of `b`. Repeated calls with
    /// the same `b` give identical results.
    pub fn solve(&self, b: &A::Rhs) -> Result<(DMatrix<f64>, KrylovStatus)> {
        let a = self.problem.input_matrix;
        let krylov = &self.params.krylov;
        install(&self.pool, || match &self.state {
            SolverState::Alternate(svd) => Ok((svd.solve(&b.gather())?, KrylovStatus::Direct)),
            SolverState::Preconditioned {
                precond,
                method: SolverMethod::Lsqr,
            } => lsqr(a, b, precond.as_ref(), krylov),
            SolverState::Preconditioned {
                precond,
                method: SolverMethod::Chebyshev { sigma_l, sigma_u },
            } => chebyshev_ls(a, b, precond.as_ref(), *sigma_l, *sigma_u, krylov),
        })
    }

    pub fn is_using_alternate(&self) -> bool {
        matches!(self.state, SolverState::Alternate(_))
    }

    /// `None` in the alternate state.
    pub fn method(&self) -> Option<SolverMethod> {
        match &self.state {
            SolverState::Preconditioned { method, .. } => Some(*method),
            SolverState::Alternate(_) => None,
        }
    }

    /// Condition estimates of every sketch factored during construction.
    pub fn condition_estimates(&self) -> &[f64] {
        &self.condition_estimates
    }

    pub fn problem(&self) -> &RegressionProblem<'a, A> {
        &self.problem
    }

    pub fn params(&self) -> &AcceleratedSolverParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_assist::{random_matrix, with_noise};

    #[test]
    fn lsrn_bounds_pick_the_iteration() {
        assert_eq!(lsrn_singular_value_bounds(20, 80, 1e-6).unwrap(), None);
        let (l, u) = lsrn_singular_value_bounds(40, 160, 1e-6).unwrap().unwrap();
        assert!(l > 0.5 && l < 0.53, "{}", l);
        assert!(u > 13.0 && u < 14.0, "{}", u);
        assert!(lsrn_singular_value_bounds(40, 160, 0.0).is_err());
    }

    #[test]
    fn simplified_solver_recovers_planted_solution() {
        let a = random_matrix(200, 10, 1);
        let x = random_matrix(10, 1, 2);
        let b = with_noise(&(&a * &x), 1e-3, 3);
        let problem = RegressionProblem::new(&a).unwrap();
        for kind in [SketchKind::Jlt, SketchKind::Cwt] {
            let (solver, next) = AcceleratedRegressionSolver::simplified(
                problem,
                kind,
                PrecondTag::Qr,
                &Context::new(5),
                AcceleratedSolverParams {
                    krylov: KrylovIterParams {
                        iter_lim: 300,
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .unwrap();
            assert!(next.counter() > 0);
            assert!(!solver.is_using_alternate());
            let (sol, _) = solver.solve(&b).unwrap();
            let normal = (a.transpose() * &a).lu().solve(&(a.transpose() * &b)).unwrap();
            assert!((&sol - &normal).norm() < 1e-6 * normal.norm());
        }
    }

    #[test]
    fn lsrn_state_follows_bounds() {
        let a = random_matrix(400, 20, 7);
        let problem = RegressionProblem::new(&a).unwrap();
        let (solver, _) =
            AcceleratedRegressionSolver::lsrn(problem, PrecondTag::Svd, &Context::new(1), Default::default()).unwrap();
        assert_eq!(solver.method(), Some(SolverMethod::Lsqr));

        let a = random_matrix(400, 40, 8);
        let problem = RegressionProblem::new(&a).unwrap();
        let (solver, _) =
            AcceleratedRegressionSolver::lsrn(problem, PrecondTag::Svd, &Context::new(1), Default::default()).unwrap();
        assert!(matches!(solver.method(), Some(SolverMethod::Chebyshev { .. })));
    }

    #[test]
    fn zero_attempts_is_a_configuration_error() {
        let a = random_matrix(40, 3, 1);
        let problem = RegressionProblem::new(&a).unwrap();
        let params = AcceleratedSolverParams {
            max_attempts: 0,
            ..Default::default()
        };
        let err = AcceleratedRegressionSolver::blendenpik(problem, PrecondTag::Qr, &Context::new(0), params)
            .err()
            .unwrap();
        assert!(matches!(err, RandNLAError::Configuration(_)));
    }

    #[test]
    fn params_load_from_json() {
        let p: AcceleratedSolverParams =
            serde_json::from_str(r#"{"max_attempts": 5, "krylov": {"iter_lim": 20}}"#).unwrap();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.krylov.iter_lim, 20);
        assert_eq!(p.sketch_size_multiplier, 4);
        assert_eq!(p.condition_threshold, 1e14);
        assert_eq!(p.num_threads, None);
    }
}
