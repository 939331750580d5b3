//! Random Fourier features for shift-invariant kernels.
//!
//! Feature `s` of a vector `x` is `sqrt(2/S) * cos(scale_s * (w_s . x) + b_s)`
//! with `w_s` drawn from the kernel's spectral density and `b_s` uniform on
//! `[0, 2pi)`.
use std::f64::consts::PI;

use rand_distr::{ChiSquared, Uniform};
use serde::{Deserialize, Serialize};

use super::dense::{DenseParams, DenseTransformData};
use super::{map_features, Dimension, MatrixMut, MatrixRef, SketchTransform, TransformFamily};
use crate::context::Context;
use crate::distributions::DistributionType;
use crate::errors::{RandNLAError, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RftParams {
    /// Use the quadratic cosine approximation instead of `f64::cos`.
    pub inexact_cosine: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RftKernel {
    Gaussian { sigma: f64 },
    Laplacian { sigma: f64 },
    Matern { nu: f64, l: f64 },
}

/// Low accuracy cosine: one range reduction to `[-pi, pi]`, a shift by
/// `pi/2` and a quadratic fit of the sine. Absolute error stays below 0.06.
#[allow(clippy::approx_constant)]
pub fn approximate_cos(x: f64) -> f64 {
    let mut x = if x.abs() > 3.0 * PI {
        (x + PI).rem_euclid(2.0 * PI) - PI
    } else {
        x
    };
    if x < -3.14159265 {
        x += 6.28318531;
    } else if x > 3.14159265 {
        x -= 6.28318531;
    }
    x += 1.57079632;
    if x > 3.14159265 {
        x -= 6.28318531;
    }
    if x < 0.0 {
        1.27323954 * x + 0.405284735 * x * x
    } else {
        1.27323954 * x - 0.405284735 * x * x
    }
}

#[derive(Clone, Debug)]
pub struct Rft {
    kernel: RftKernel,
    dense: DenseTransformData,
    shifts: Vec<f64>,
    scales: Vec<f64>,
    outscale: f64,
    params: RftParams,
    dense_params: DenseParams,
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(RandNLAError::Configuration(format!(
            "{} must be positive and finite, got {}",
            name, value
        )))
    }
}

impl Rft {
    pub fn gaussian(n: usize, s: usize, sigma: f64, context: &Context) -> Result<(Self, Context)> {
        Rft::new(n, s, RftKernel::Gaussian { sigma }, context)
    }

    pub fn laplacian(n: usize, s: usize, sigma: f64, context: &Context) -> Result<(Self, Context)> {
        Rft::new(n, s, RftKernel::Laplacian { sigma }, context)
    }

    pub fn matern(n: usize, s: usize, nu: f64, l: f64, context: &Context) -> Result<(Self, Context)> {
        Rft::new(n, s, RftKernel::Matern { nu, l }, context)
    }

    pub fn new(n: usize, s: usize, kernel: RftKernel, context: &Context) -> Result<(Self, Context)> {
        let (distribution, val_scale) = match kernel {
            RftKernel::Gaussian { sigma } => {
                positive("sigma", sigma)?;
                (DistributionType::Gaussian, 1.0 / sigma)
            }
            RftKernel::Laplacian { sigma } => {
                positive("sigma", sigma)?;
                (DistributionType::Cauchy, 1.0 / sigma)
            }
            RftKernel::Matern { nu, l } => {
                positive("nu", nu)?;
                positive("l", l)?;
                (DistributionType::Gaussian, 1.0 / l)
            }
        };
        let (dense, context) = DenseTransformData::new(n, s, val_scale, distribution, context)?;
        let (shifts, context) = context.generate_random_samples_array::<f64, _>(s, Uniform::new(0.0, 2.0 * PI))?;

        let (scales, context) = match kernel {
            RftKernel::Matern { nu, .. } => {
                let chi = ChiSquared::new(2.0 * nu).map_err(|e| RandNLAError::Configuration(e.to_string()))?;
                let (draws, context) = context.generate_random_samples_array::<f64, _>(s, chi)?;
                let scales = draws.into_iter().map(|c| (2.0 * nu / c).sqrt()).collect();
                (scales, context)
            }
            _ => (vec![1.0; s], context),
        };

        let rft = Rft {
            kernel,
            dense,
            shifts,
            scales,
            outscale: (2.0 / s as f64).sqrt(),
            params: RftParams::default(),
            dense_params: DenseParams::default(),
        };
        Ok((rft, context))
    }

    pub fn with_params(mut self, params: RftParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_dense_params(mut self, params: DenseParams) -> Self {
        self.dense_params = params;
        self
    }

    pub fn kernel(&self) -> RftKernel {
        self.kernel
    }

    pub fn dense(&self) -> &DenseTransformData {
        &self.dense
    }

    pub fn shifts(&self) -> &[f64] {
        &self.shifts
    }

    pub fn scales(&self) -> &[f64] {
        &self.scales
    }

    pub fn outscale(&self) -> f64 {
        self.outscale
    }
}

impl SketchTransform for Rft {
    fn n(&self) -> usize {
        self.dense.n()
    }

    fn s(&self) -> usize {
        self.dense.s()
    }

    fn name(&self) -> &'static str {
        match self.kernel {
            RftKernel::Gaussian { .. } => "GaussianRFT",
            RftKernel::Laplacian { .. } => "LaplacianRFT",
            RftKernel::Matern { .. } => "MaternRFT",
        }
    }

    fn family(&self) -> TransformFamily {
        TransformFamily::TrigRandomFeature
    }

    fn apply(&self, input: MatrixRef<'_>, mut output: MatrixMut<'_>, dimension: Dimension) -> Result<()> {
        self.dense
            .apply(self.name(), &self.dense_params, input, output.reborrow(), dimension)?;
        let (shifts, scales, outscale) = (&self.shifts, &self.scales, self.outscale);
        if self.params.inexact_cosine {
            map_features(output, dimension, |f, v| {
                outscale * approximate_cos(scales[f] * v + shifts[f])
            });
        } else {
            map_features(output, dimension, |f, v| outscale * (scales[f] * v + shifts[f]).cos());
        }
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

    fn input(h: usize, w: usize) -> DMatrix<f64> {
        DMatrix::from_fn(h, w, |i, j| ((i * 3 + j * 7) % 5) as f64 * 0.25 - 0.5)
    }

    #[test]
    fn approximate_cosine_tracks_cosine() {
        let mut x: f64 = -20.0;
        while x < 20.0 {
            assert!((approximate_cos(x) - x.cos()).abs() < 0.06, "x = {}", x);
            x += 0.01;
        }
        assert_relative_eq!(approximate_cos(0.0), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn approximate_cosine_uses_fixed_quadratic() {
        // x = 1 lands on the positive branch
        let y = 1.0 + 1.57079632;
        assert_eq!(approximate_cos(1.0), 1.27323954 * y - 0.405284735 * y * y);
        // x = -3 lands on the negative branch
        let y = -3.0 + 1.57079632;
        assert_eq!(approximate_cos(-3.0), 1.27323954 * y + 0.405284735 * y * y);
    }

    #[test]
    fn features_follow_cosine_formula() {
        let (t, next) = Rft::gaussian(6, 8, 2.0, &Context::new(4)).unwrap();
        assert_eq!(next.counter(), 48 + 8);
        let w = t.dense().realize_matrix().unwrap();
        let a = input(6, 3);
        let projected = &w * &a;

        let mut out = DMatrix::zeros(8, 3);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut out), Dimension::Columnwise).unwrap();
        for s in 0..8 {
            assert!(t.shifts()[s] >= 0.0 && t.shifts()[s] < 2.0 * PI);
            for j in 0..3 {
                let expected = (2.0f64 / 8.0).sqrt() * (projected[(s, j)] + t.shifts()[s]).cos();
                assert_relative_eq!(out[(s, j)], expected, epsilon = 1e-12);
            }
        }

        let t = t.with_params(RftParams { inexact_cosine: true });
        let mut rough = DMatrix::zeros(8, 3);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut rough), Dimension::Columnwise).unwrap();
        assert_relative_eq!(rough, out, epsilon = 0.06 * 0.5);
    }

    #[test]
    fn gaussian_features_approximate_the_kernel() {
        let sigma = 1.5;
        let (t, _) = Rft::gaussian(3, 4000, sigma, &Context::new(12)).unwrap();
        let x = DMatrix::from_row_slice(2, 3, &[0.3, -0.2, 0.5, 0.3 + sigma, -0.2, 0.5]);
        let mut z = DMatrix::zeros(2, 4000);
        t.apply(MatrixRef::Local(&x), MatrixMut::Local(&mut z), Dimension::Rowwise).unwrap();
        let k = z.row(0).dot(&z.row(1));
        assert!((k - (-0.5f64).exp()).abs() < 0.1, "k = {}", k);
    }

    #[test]
    fn matern_draws_per_feature_scales() {
        let (t, next) = Rft::matern(4, 10, 1.5, 0.5, &Context::new(8)).unwrap();
        assert_eq!(next.counter(), 40 + 10 + 10);
        assert!(t.scales().iter().all(|s| *s > 0.0));
        assert!(t.scales().iter().any(|s| *s != 1.0));
        assert_relative_eq!(t.dense().scale(), 2.0);
        assert!(Rft::matern(4, 10, -1.0, 0.5, &Context::new(8)).is_err());
        assert!(Rft::laplacian(4, 10, 0.0, &Context::new(8)).is_err());
    }

    #[test]
    fn distributed_features_match_local() {
        let grid = Grid::new(2, 2).unwrap();
        let (t, _) = Rft::laplacian(7, 5, 1.0, &Context::new(6)).unwrap();
        let a = input(4, 7);
        let mut expected = DMatrix::zeros(4, 5);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut expected), Dimension::Rowwise).unwrap();

        let da = DistMatrix::from_global(grid, &a, Distribution::VC_STAR).unwrap();
        let mut out = DistMatrix::zeros(grid, 4, 5, Distribution::VC_STAR).unwrap();
        t.apply(MatrixRef::Dist(&da), MatrixMut::Dist(&mut out), Dimension::Rowwise).unwrap();
        assert_relative_eq!(out.to_global(), expected, epsilon = 1e-12);

        let da = DistMatrix::from_global(grid, &a, Distribution::MC_MR).unwrap();
        let mut out = DistMatrix::zeros(grid, 4, 5, Distribution::MC_MR).unwrap();
        t.apply(MatrixRef::Dist(&da), MatrixMut::Dist(&mut out), Dimension::Rowwise).unwrap();
        assert_relative_eq!(out.to_global(), expected, epsilon = 1e-10);
    }
}
