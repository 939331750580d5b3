//! Random Laplace features for the exponential semigroup kernel
//! `k(x, y) = exp(-beta * sum_i sqrt(x_i + y_i))` on nonnegative data.
use super::dense::{DenseParams, DenseTransformData};
use super::{map_features, Dimension, MatrixMut, MatrixRef, SketchTransform, TransformFamily};
use crate::context::Context;
use crate::distributions::DistributionType;
use crate::errors::{RandNLAError, Result};

#[derive(Clone, Debug)]
pub struct Rlt {
    beta: f64,
    dense: DenseTransformData,
    outscale: f64,
    dense_params: DenseParams,
}

impl Rlt {
    /// Projection entries are Lévy with scale `beta^2 / 2`; feature `s` is
    /// `sqrt(1/S) * exp(-(w_s . x))`.
    pub fn exp_semigroup(n: usize, s: usize, beta: f64, context: &Context) -> Result<(Self, Context)> {
        if !(beta > 0.0 && beta.is_finite()) {
            return Err(RandNLAError::Configuration(format!(
                "beta must be positive and finite, got {}",
                beta
            )));
        }
        let (dense, context) =
            DenseTransformData::new(n, s, beta * beta / 2.0, DistributionType::Levy, context)?;
        let rlt = Rlt {
            beta,
            dense,
            outscale: (1.0 / s as f64).sqrt(),
            dense_params: DenseParams::default(),
        };
        Ok((rlt, context))
    }

    pub fn with_dense_params(mut self, params: DenseParams) -> Self {
        self.dense_params = params;
        self
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    pub fn dense(&self) -> &DenseTransformData {
        &self.dense
    }
}

impl SketchTransform for Rlt {
    fn n(&self) -> usize {
        self.dense.n()
    }

    fn s(&self) -> usize {
        self.dense.s()
    }

    fn name(&self) -> &'static str {
        "ExpSemigroupRLT"
    }

    fn family(&self) -> TransformFamily {
        TransformFamily::SemigroupRandomFeature
    }

    fn apply(&self, input: MatrixRef<'_>, mut output: MatrixMut<'_>, dimension: Dimension) -> Result<()> {
        self.dense
            .apply(self.name(), &self.dense_params, input, output.reborrow(), dimension)?;
        let outscale = self.outscale;
        map_features(output, dimension, |_, v| outscale * (-v).exp());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Grid;
    use crate::dist_matrix::{DistMatrix, Distribution};
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    #[test]
    fn features_are_scaled_exponentials() {
        let (t, next) = Rlt::exp_semigroup(3, 6, 2.0, &Context::new(1)).unwrap();
        assert_eq!(next.counter(), 18);
        assert_relative_eq!(t.dense().scale(), 2.0);
        let w = t.dense().realize_matrix().unwrap();
        assert!(w.iter().all(|v| *v > 0.0));

        let a = DMatrix::from_column_slice(3, 2, &[0.1, 0.2, 0.0, 1.0, 0.5, 0.25]);
        let mut out = DMatrix::zeros(6, 2);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut out), Dimension::Columnwise).unwrap();
        let projected = &w * &a;
        for s in 0..6 {
            for j in 0..2 {
                let expected = (1.0f64 / 6.0).sqrt() * (-projected[(s, j)]).exp();
                assert_relative_eq!(out[(s, j)], expected, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn features_approximate_the_semigroup_kernel() {
        let beta = 0.5;
        let (t, _) = Rlt::exp_semigroup(2, 4000, beta, &Context::new(31)).unwrap();
        let x = DMatrix::from_row_slice(2, 2, &[0.2, 0.4, 0.3, 0.1]);
        let mut z = DMatrix::zeros(2, 4000);
        t.apply(MatrixRef::Local(&x), MatrixMut::Local(&mut z), Dimension::Rowwise).unwrap();
        let k = z.row(0).dot(&z.row(1));
        let expected = (-beta * ((0.2f64 + 0.3).sqrt() + (0.4f64 + 0.1).sqrt())).exp();
        assert!((k - expected).abs() < 0.05, "k = {}, expected {}", k, expected);
    }

    #[test]
    fn distributed_features_match_local() {
        let grid = Grid::new(1, 3).unwrap();
        let (t, _) = Rlt::exp_semigroup(5, 4, 1.0, &Context::new(2)).unwrap();
        let a = DMatrix::from_fn(5, 3, |i, j| (i + j) as f64 * 0.1);
        let mut expected = DMatrix::zeros(4, 3);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut expected), Dimension::Columnwise).unwrap();

        let da = DistMatrix::from_global(grid, &a, Distribution::STAR_VR).unwrap();
        let mut out = DistMatrix::zeros(grid, 4, 3, Distribution::STAR_VR).unwrap();
        t.apply(MatrixRef::Dist(&da), MatrixMut::Dist(&mut out), Dimension::Columnwise).unwrap();
        assert_relative_eq!(out.to_global(), expected, epsilon = 1e-12);

        assert!(Rlt::exp_semigroup(5, 4, 0.0, &Context::new(2)).is_err());
    }
}
