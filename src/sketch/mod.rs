//! Randomized sketching transforms.
//!
//! Every transform maps vectors of length `n` to vectors of length `s` and
//! can act on the columns or on the rows of its input. Which input/output
//! storage combinations a family supports is decided by an explicit match in
//! its `apply`; anything not listed there is rejected with
//! [`RandNLAError::UnsupportedOperation`].
pub mod dense;
pub(crate) mod dense_dist;
pub mod hash;
pub mod rfut;
pub mod rft;
pub mod rlt;

use nalgebra::DMatrix;
use nalgebra_sparse::CscMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::dist_matrix::{DistMatrix, Distribution};
use crate::errors::{RandNLAError, Result};

pub use dense::{DenseParams, DenseTransform, DenseTransformData};
pub use dense_dist::{select_strategy, PanelStrategy};
pub use hash::{HashTransform, HashTransformData, HashValues};
pub use rfut::Rfut;
pub use rft::{approximate_cos, Rft, RftKernel, RftParams};
pub use rlt::Rlt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    /// Sketch each column: an `n x w` input becomes `s x w`.
    Columnwise,
    /// Sketch each row: an `h x n` input becomes `h x s`.
    Rowwise,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransformFamily {
    Dense,
    Hashing,
    TrigRandomFeature,
    SemigroupRandomFeature,
    UnitaryMixing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layout {
    LocalDense,
    DistDense(Distribution),
    LocalSparse,
}

/// Input operand of a sketch.
#[derive(Clone, Copy, Debug)]
pub enum MatrixRef<'a> {
    Local(&'a DMatrix<f64>),
    Dist(&'a DistMatrix),
    Sparse(&'a CscMatrix<f64>),
}

impl<'a> MatrixRef<'a> {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            MatrixRef::Local(a) => a.shape(),
            MatrixRef::Dist(a) => a.shape(),
            MatrixRef::Sparse(a) => (a.nrows(), a.ncols()),
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            MatrixRef::Local(_) => Layout::LocalDense,
            MatrixRef::Dist(a) => Layout::DistDense(a.distribution()),
            MatrixRef::Sparse(_) => Layout::LocalSparse,
        }
    }
}

impl<'a> From<&'a DMatrix<f64>> for MatrixRef<'a> {
    fn from(a: &'a DMatrix<f64>) -> Self {
        MatrixRef::Local(a)
    }
}

impl<'a> From<&'a DistMatrix> for MatrixRef<'a> {
    fn from(a: &'a DistMatrix) -> Self {
        MatrixRef::Dist(a)
    }
}

impl<'a> From<&'a CscMatrix<f64>> for MatrixRef<'a> {
    fn from(a: &'a CscMatrix<f64>) -> Self {
        MatrixRef::Sparse(a)
    }
}

/// Output operand of a sketch. Its contents are overwritten.
#[derive(Debug)]
pub enum MatrixMut<'a> {
    Local(&'a mut DMatrix<f64>),
    Dist(&'a mut DistMatrix),
}

impl<'a> MatrixMut<'a> {
    pub fn shape(&self) -> (usize, usize) {
        match self {
            MatrixMut::Local(a) => a.shape(),
            MatrixMut::Dist(a) => a.shape(),
        }
    }

    pub fn layout(&self) -> Layout {
        match self {
            MatrixMut::Local(_) => Layout::LocalDense,
            MatrixMut::Dist(a) => Layout::DistDense(a.distribution()),
        }
    }

    pub fn reborrow(&mut self) -> MatrixMut<'_> {
        match self {
            MatrixMut::Local(a) => MatrixMut::Local(&mut **a),
            MatrixMut::Dist(a) => MatrixMut::Dist(&mut **a),
        }
    }
}

impl<'a> From<&'a mut DMatrix<f64>> for MatrixMut<'a> {
    fn from(a: &'a mut DMatrix<f64>) -> Self {
        MatrixMut::Local(a)
    }
}

impl<'a> From<&'a mut DistMatrix> for MatrixMut<'a> {
    fn from(a: &'a mut DistMatrix) -> Self {
        MatrixMut::Dist(a)
    }
}

pub trait SketchTransform: Send + Sync {
    /// Input dimension.
    fn n(&self) -> usize;
    /// Sketch dimension.
    fn s(&self) -> usize;
    fn name(&self) -> &'static str;
    fn family(&self) -> TransformFamily;
    fn apply(&self, input: MatrixRef<'_>, output: MatrixMut<'_>, dimension: Dimension) -> Result<()>;
}

pub(crate) fn check_apply_shapes(
    name: &'static str,
    n: usize,
    s: usize,
    input: (usize, usize),
    output: (usize, usize),
    dimension: Dimension,
) -> Result<()> {
    let (expected_input, expected_output) = match dimension {
        Dimension::Columnwise => ((n, input.1), (s, input.1)),
        Dimension::Rowwise => ((input.0, n), (input.0, s)),
    };
    if input != expected_input {
        return Err(RandNLAError::mismatch(name, expected_input, input));
    }
    if output != expected_output {
        return Err(RandNLAError::mismatch(name, expected_output, output));
    }
    Ok(())
}

pub(crate) fn unsupported(
    name: &'static str,
    input: Layout,
    output: Layout,
    dimension: Dimension,
) -> RandNLAError {
    RandNLAError::UnsupportedOperation(format!(
        "{} cannot sketch {:?} into {:?} {:?}",
        name, input, output, dimension
    ))
}

/// Rewrites every entry of a sketch as `f(feature, value)`, where `feature` is
/// the entry's global index along the sketched dimension.
pub(crate) fn map_features<F>(output: MatrixMut<'_>, dimension: Dimension, f: F)
where
    F: Fn(usize, f64) -> f64 + Sync,
{
    match output {
        MatrixMut::Local(out) => {
            let rows = out.nrows();
            if rows == 0 {
                return;
            }
            out.as_mut_slice()
                .par_chunks_mut(rows)
                .enumerate()
                .for_each(|(j, col)| {
                    for (i, v) in col.iter_mut().enumerate() {
                        let feature = match dimension {
                            Dimension::Columnwise => i,
                            Dimension::Rowwise => j,
                        };
                        *v = f(feature, *v);
                    }
                });
        }
        MatrixMut::Dist(out) => {
            let layout = *out.layout();
            out.locals_mut()
                .par_iter_mut()
                .enumerate()
                .for_each(|(rank, local)| {
                    for lj in 0..local.ncols() {
                        for li in 0..local.nrows() {
                            let feature = match dimension {
                                Dimension::Columnwise => layout.global_row(rank, li),
                                Dimension::Rowwise => layout.global_col(rank, lj),
                            };
                            local[(li, lj)] = f(feature, local[(li, lj)]);
                        }
                    }
                });
        }
    }
}

/// Sketching operators the solvers can instantiate by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SketchKind {
    /// Gaussian Johnson-Lindenstrauss transform.
    Jlt,
    /// Cauchy transform with `C = 1`.
    Ct,
    /// Clarkson-Woodruff (CountSketch) transform.
    Cwt,
    /// Meng-Mahoney transform (hashing with Cauchy values).
    Mmt,
}

impl SketchKind {
    pub fn build(self, n: usize, s: usize, context: &Context) -> Result<(Box<dyn SketchTransform>, Context)> {
        let built: (Box<dyn SketchTransform>, Context) = match self {
            SketchKind::Jlt => {
                let (t, ctx) = DenseTransform::jlt(n, s, context)?;
                (Box::new(t) as Box<dyn SketchTransform>, ctx)
            }
            SketchKind::Ct => {
                let (t, ctx) = DenseTransform::ct(n, s, 1.0, context)?;
                (Box::new(t) as Box<dyn SketchTransform>, ctx)
            }
            SketchKind::Cwt => {
                let (t, ctx) = HashTransform::cwt(n, s, context)?;
                (Box::new(t) as Box<dyn SketchTransform>, ctx)
            }
            SketchKind::Mmt => {
                let (t, ctx) = HashTransform::mmt(n, s, context)?;
                (Box::new(t) as Box<dyn SketchTransform>, ctx)
            }
        };
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_check_follows_dimension() {
        assert!(check_apply_shapes("t", 10, 3, (10, 4), (3, 4), Dimension::Columnwise).is_ok());
        assert!(check_apply_shapes("t", 10, 3, (4, 10), (4, 3), Dimension::Rowwise).is_ok());
        let err = check_apply_shapes("t", 10, 3, (9, 4), (3, 4), Dimension::Columnwise).unwrap_err();
        assert_eq!(err, RandNLAError::mismatch("t", (10, 4), (9, 4)));
        let err = check_apply_shapes("t", 10, 3, (4, 10), (3, 4), Dimension::Rowwise).unwrap_err();
        assert_eq!(err, RandNLAError::mismatch("t", (4, 3), (3, 4)));
    }

    #[test]
    fn every_kind_builds_with_requested_dimensions() {
        let ctx = Context::new(3);
        for kind in [SketchKind::Jlt, SketchKind::Ct, SketchKind::Cwt, SketchKind::Mmt] {
            let (t, next) = kind.build(12, 5, &ctx).unwrap();
            assert_eq!((t.n(), t.s()), (12, 5));
            assert!(next.counter() > ctx.counter());
        }
    }

    #[test]
    fn feature_map_sees_global_indices() {
        use crate::comm::Grid;
        let grid = Grid::new(2, 1).unwrap();
        let mut d = DistMatrix::zeros(grid, 5, 3, Distribution::VC_STAR).unwrap();
        map_features(MatrixMut::Dist(&mut d), Dimension::Columnwise, |i, _| i as f64);
        let g = d.to_global();
        for i in 0..5 {
            assert_eq!(g[(i, 2)], i as f64);
        }
        let mut m = DMatrix::zeros(2, 4);
        map_features(MatrixMut::Local(&mut m), Dimension::Rowwise, |j, v| v + j as f64);
        assert_eq!(m[(1, 3)], 3.0);
    }
}
