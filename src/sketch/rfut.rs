use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use nalgebra::DMatrix;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::num_traits::Zero;
use rustfft::{Fft, FftPlanner};

use super::{check_apply_shapes, unsupported, Dimension, MatrixMut, MatrixRef, SketchTransform, TransformFamily};
use crate::context::Context;
use crate::distributions::Rademacher;
use crate::errors::{RandNLAError, Result};

/// Randomized fast unitary transform `F * D`: a random +-1 diagonal followed
/// by the orthonormal DCT-II. Mixes the rows of a tall matrix so that uniform
/// row sampling afterwards keeps its geometry.
#[derive(Clone)]
pub struct Rfut {
    n: usize,
    diagonal: Vec<f64>,
    fft: Arc<dyn Fft<f64>>,
    // e^{-i pi k / (2n)} times the orthonormal scale of coefficient k
    twiddles: Vec<Complex<f64>>,
}

impl fmt::Debug for Rfut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Rfut {{ n: {} }}", self.n)
    }
}

impl Rfut {
    pub fn new(n: usize, context: &Context) -> Result<(Self, Context)> {
        if n == 0 {
            return Err(RandNLAError::InvalidDimensions(
                "Input dimension must be greater than 0".to_string(),
            ));
        }
        let (diagonal, context) = context.generate_random_samples_array::<f64, _>(n, Rademacher)?;
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(n);
        let nf = n as f64;
        let twiddles = (0..n)
            .map(|k| {
                let scale = if k == 0 { (1.0 / nf).sqrt() } else { (2.0 / nf).sqrt() };
                Complex::from_polar(scale, -PI * k as f64 / (2.0 * nf))
            })
            .collect();
        Ok((Rfut { n, diagonal, fft, twiddles }, context))
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn diagonal(&self) -> &[f64] {
        &self.diagonal
    }

    /// `F * D * x` in place, through one complex FFT of the even/odd
    /// reordered input.
    fn transform(&self, x: &mut [f64], buffer: &mut [Complex<f64>]) {
        let n = self.n;
        for (k, b) in buffer.iter_mut().enumerate() {
            let src = if 2 * k < n { 2 * k } else { 2 * (n - 1 - k) + 1 };
            *b = Complex::new(x[src] * self.diagonal[src], 0.0);
        }
        self.fft.process(buffer);
        for ((v, b), t) in x.iter_mut().zip(buffer.iter()).zip(&self.twiddles) {
            *v = (b * t).re;
        }
    }

    /// Mixes every column of `a`.
    pub fn apply_columnwise_inplace(&self, a: &mut DMatrix<f64>) -> Result<()> {
        if a.nrows() != self.n {
            return Err(RandNLAError::mismatch("RFUT", (self.n, a.ncols()), a.shape()));
        }
        a.as_mut_slice()
            .par_chunks_mut(self.n)
            .for_each_init(
                || vec![Complex::zero(); self.n],
                |buffer, col| self.transform(col, buffer),
            );
        Ok(())
    }

    /// Mixes every row of `a`.
    pub fn apply_rowwise_inplace(&self, a: &mut DMatrix<f64>) -> Result<()> {
        if a.ncols() != self.n {
            return Err(RandNLAError::mismatch("RFUT", (a.nrows(), self.n), a.shape()));
        }
        let mut t = a.transpose();
        self.apply_columnwise_inplace(&mut t)?;
        a.copy_from(&t.transpose());
        Ok(())
    }
}

impl SketchTransform for Rfut {
    fn n(&self) -> usize {
        self.n
    }

    fn s(&self) -> usize {
        self.n
    }

    fn name(&self) -> &'static str {
        "RFUT"
    }

    fn family(&self) -> TransformFamily {
        TransformFamily::UnitaryMixing
    }

    fn apply(&self, input: MatrixRef<'_>, output: MatrixMut<'_>, dimension: Dimension) -> Result<()> {
        check_apply_shapes(self.name(), self.n, self.n, input.shape(), output.shape(), dimension)?;
        let (in_layout, out_layout) = (input.layout(), output.layout());
        match (input, output) {
            (MatrixRef::Local(a), MatrixMut::Local(out)) => {
                out.copy_from(a);
                match dimension {
                    Dimension::Columnwise => self.apply_columnwise_inplace(out),
                    Dimension::Rowwise => self.apply_rowwise_inplace(out),
                }
            }
            (MatrixRef::Dist(a), MatrixMut::Dist(out))
                if a.grid() == out.grid() && a.distribution() == out.distribution() =>
            {
                let d = a.distribution();
                let whole_columns = d.is_col_distributed() && dimension == Dimension::Columnwise;
                let whole_rows = d.is_row_distributed() && dimension == Dimension::Rowwise;
                if !(whole_columns || whole_rows) {
                    return Err(unsupported(self.name(), in_layout, out_layout, dimension));
                }
                for (local_out, local) in out.locals_mut().iter_mut().zip(a.locals()) {
                    local_out.copy_from(local);
                    if whole_columns {
                        self.apply_columnwise_inplace(local_out)?;
                    } else {
                        self.apply_rowwise_inplace(local_out)?;
                    }
                }
                Ok(())
            }
            _ => Err(unsupported(self.name(), in_layout, out_layout, dimension)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Grid;
    use crate::dist_matrix::{DistMatrix, Distribution};
    use approx::assert_relative_eq;

    fn dct_reference(x: &[f64]) -> Vec<f64> {
        let n = x.len() as f64;
        (0..x.len())
            .map(|k| {
                let scale = if k == 0 { (1.0 / n).sqrt() } else { (2.0 / n).sqrt() };
                scale
                    * x.iter()
                        .enumerate()
                        .map(|(m, v)| v * (PI * (2.0 * m as f64 + 1.0) * k as f64 / (2.0 * n)).cos())
                        .sum::<f64>()
            })
            .collect()
    }

    #[test]
    fn matches_direct_cosine_transform() {
        for n in [1, 2, 5, 8, 13] {
            let (t, next) = Rfut::new(n, &Context::new(n as u64)).unwrap();
            assert_eq!(next.counter(), n as u64);
            let x: Vec<f64> = (0..n).map(|i| (i as f64 * 0.7).sin() + 0.1).collect();
            let signed: Vec<f64> = x.iter().zip(t.diagonal()).map(|(a, d)| a * d).collect();
            let expected = dct_reference(&signed);

            let mut a = DMatrix::from_column_slice(n, 1, &x);
            t.apply_columnwise_inplace(&mut a).unwrap();
            for k in 0..n {
                assert_relative_eq!(a[(k, 0)], expected[k], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn preserves_column_norms() {
        let (t, _) = Rfut::new(16, &Context::new(3)).unwrap();
        let a = DMatrix::from_fn(16, 3, |i, j| (i * j) as f64 - 4.0);
        let mut out = DMatrix::zeros(16, 3);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut out), Dimension::Columnwise).unwrap();
        for j in 0..3 {
            assert_relative_eq!(out.column(j).norm(), a.column(j).norm(), epsilon = 1e-10);
        }
        assert!(t.diagonal().iter().all(|d| d.abs() == 1.0));
    }

    #[test]
    fn rowwise_is_columnwise_of_transpose() {
        let (t, _) = Rfut::new(6, &Context::new(9)).unwrap();
        let a = DMatrix::from_fn(4, 6, |i, j| (i + 2 * j) as f64);
        let mut rows = DMatrix::zeros(4, 6);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut rows), Dimension::Rowwise).unwrap();
        let mut cols = a.transpose();
        t.apply_columnwise_inplace(&mut cols).unwrap();
        assert_relative_eq!(rows, cols.transpose(), epsilon = 1e-12);
    }

    #[test]
    fn distributed_layouts() {
        let grid = Grid::new(2, 2).unwrap();
        let (t, _) = Rfut::new(7, &Context::new(1)).unwrap();
        let a = DMatrix::from_fn(7, 5, |i, j| ((i * 3 + j) % 4) as f64);
        let mut expected = DMatrix::zeros(7, 5);
        t.apply(MatrixRef::Local(&a), MatrixMut::Local(&mut expected), Dimension::Columnwise).unwrap();

        let da = DistMatrix::from_global(grid, &a, Distribution::STAR_VC).unwrap();
        let mut out = DistMatrix::zeros(grid, 7, 5, Distribution::STAR_VC).unwrap();
        t.apply(MatrixRef::Dist(&da), MatrixMut::Dist(&mut out), Dimension::Columnwise).unwrap();
        assert_relative_eq!(out.to_global(), expected, epsilon = 1e-12);

        let da = DistMatrix::from_global(grid, &a, Distribution::VC_STAR).unwrap();
        let mut out = DistMatrix::zeros(grid, 7, 5, Distribution::VC_STAR).unwrap();
        let err = t.apply(MatrixRef::Dist(&da), MatrixMut::Dist(&mut out), Dimension::Columnwise).unwrap_err();
        assert!(matches!(err, RandNLAError::UnsupportedOperation(_)));
    }
}
