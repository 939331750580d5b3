use nalgebra::DMatrix;
use nalgebra_sparse::CscMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::dense_dist;
use super::{check_apply_shapes, unsupported, Dimension, MatrixMut, MatrixRef, SketchTransform, TransformFamily};
use crate::context::{Context, RandomSamplesArray};
use crate::distributions::DistributionType;
use crate::errors::{RandNLAError, Result};
use crate::gemm::{gemm_dense_sparse, gemm_sparse_dense, Orientation};

/// Tuning of the dense apply algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseParams {
    /// Rows/columns of the random matrix realized at a time; `0` lets each
    /// algorithm pick its default.
    pub blocksize: usize,
    /// Ratio used to pick between inner, outer and matrix panel strategies.
    pub factor: f64,
}

impl Default for DenseParams {
    fn default() -> Self {
        DenseParams {
            blocksize: 0,
            factor: 1.0,
        }
    }
}

/// Implicit `s x n` random matrix. Entry `(i, j)` is `scale` times sample
/// `j * s + i` of the entry array; nothing is stored until a view is realized.
#[derive(Clone, Debug)]
pub struct DenseTransformData {
    n: usize,
    s: usize,
    scale: f64,
    entries: RandomSamplesArray<DistributionType>,
}

impl DenseTransformData {
    pub fn new(
        n: usize,
        s: usize,
        scale: f64,
        distribution: DistributionType,
        context: &Context,
    ) -> Result<(Self, Context)> {
        if n == 0 || s == 0 {
            return Err(RandNLAError::InvalidDimensions(
                "Input and sketch dimensions must be greater than 0".to_string(),
            ));
        }
        let size = n.checked_mul(s).ok_or(RandNLAError::ExhaustedRandomStream {
            base: context.counter(),
            size: usize::MAX,
        })?;
        let (entries, context) = context.allocate_random_samples_array(size, distribution)?;
        Ok((DenseTransformData { n, s, scale, entries }, context))
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn s(&self) -> usize {
        self.s
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn distribution(&self) -> DistributionType {
        *self.entries.distribution()
    }

    pub fn entry(&self, i: usize, j: usize) -> Result<f64> {
        if i >= self.s || j >= self.n {
            return Err(RandNLAError::OutOfRange {
                index: j * self.s + i,
                size: self.entries.len(),
            });
        }
        let v: f64 = self.entries.get(j * self.s + i)?;
        Ok(self.scale * v)
    }

    /// Fills `target` with the entries `(i + a * col_stride, j + b * row_stride)`
    /// for `a < height`, `b < width`.
    #[allow(clippy::too_many_arguments)]
    pub fn realize_view(
        &self,
        target: &mut DMatrix<f64>,
        i: usize,
        j: usize,
        height: usize,
        width: usize,
        col_stride: usize,
        row_stride: usize,
    ) -> Result<()> {
        if target.shape() != (height, width) {
            return Err(RandNLAError::mismatch("realize_view", (height, width), target.shape()));
        }
        if height == 0 || width == 0 {
            return Ok(());
        }
        let last = (i + (height - 1) * col_stride, j + (width - 1) * row_stride);
        if last.0 >= self.s || last.1 >= self.n {
            return Err(RandNLAError::mismatch("realize_view", (self.s, self.n), (last.0 + 1, last.1 + 1)));
        }

        let (s, scale, entries) = (self.s, self.scale, &self.entries);
        target
            .as_mut_slice()
            .par_chunks_mut(height)
            .enumerate()
            .try_for_each(|(b, col)| {
                let gj = j + b * row_stride;
                for (a, v) in col.iter_mut().enumerate() {
                    let sample: f64 = entries.get(gj * s + i + a * col_stride)?;
                    *v = scale * sample;
                }
                Ok(())
            })
    }

    /// Allocating form of [`realize_view`](Self::realize_view).
    pub fn realize_block(
        &self,
        i: usize,
        j: usize,
        height: usize,
        width: usize,
        col_stride: usize,
        row_stride: usize,
    ) -> Result<DMatrix<f64>> {
        let mut block = DMatrix::zeros(height, width);
        self.realize_view(&mut block, i, j, height, width, col_stride, row_stride)?;
        Ok(block)
    }

    /// The whole `s x n` matrix.
    pub fn realize_matrix(&self) -> Result<DMatrix<f64>> {
        self.realize_block(0, 0, self.s, self.n, 1, 1)
    }

    /// Shared apply for every transform built on a dense random matrix.
    pub(crate) fn apply(
        &self,
        name: &'static str,
        params: &DenseParams,
        input: MatrixRef<'_>,
        output: MatrixMut<'_>,
        dimension: Dimension,
    ) -> Result<()> {
        check_apply_shapes(name, self.n, self.s, input.shape(), output.shape(), dimension)?;
        let (in_layout, out_layout) = (input.layout(), output.layout());
        match (input, output) {
            (MatrixRef::Local(a), MatrixMut::Local(out)) => self.apply_local(params, a, out, dimension),
            (MatrixRef::Sparse(a), MatrixMut::Local(out)) => self.apply_sparse(params, a, out, dimension),
            (MatrixRef::Dist(a), MatrixMut::Dist(out)) => {
                dense_dist::apply(self, name, params, a, out, dimension)
            }
            _ => Err(unsupported(name, in_layout, out_layout, dimension)),
        }
    }

    fn local_blocksize(&self, params: &DenseParams) -> usize {
        if params.blocksize == 0 {
            self.s
        } else {
            params.blocksize
        }
    }

    fn apply_local(&self, params: &DenseParams, a: &DMatrix<f64>, out: &mut DMatrix<f64>, dimension: Dimension) -> Result<()> {
        let b = self.local_blocksize(params);
        for base in (0..self.s).step_by(b) {
            let k = b.min(self.s - base);
            let panel = self.realize_block(base, 0, k, self.n, 1, 1)?;
            match dimension {
                Dimension::Columnwise => {
                    let w = a.ncols();
                    out.view_mut((base, 0), (k, w)).gemm(1.0, &panel, a, 0.0);
                }
                Dimension::Rowwise => {
                    let h = a.nrows();
                    out.view_mut((0, base), (h, k)).gemm(1.0, a, &panel.transpose(), 0.0);
                }
            }
        }
        Ok(())
    }

    fn apply_sparse(&self, params: &DenseParams, a: &CscMatrix<f64>, out: &mut DMatrix<f64>, dimension: Dimension) -> Result<()> {
        let b = self.local_blocksize(params);
        for base in (0..self.s).step_by(b) {
            let k = b.min(self.s - base);
            let panel = self.realize_block(base, 0, k, self.n, 1, 1)?;
            match dimension {
                Dimension::Columnwise => {
                    let mut block = DMatrix::zeros(k, a.ncols());
                    gemm_dense_sparse(Orientation::Normal, Orientation::Normal, 1.0, &panel, a, 0.0, &mut block)?;
                    out.view_mut((base, 0), (k, a.ncols())).copy_from(&block);
                }
                Dimension::Rowwise => {
                    let mut block = DMatrix::zeros(a.nrows(), k);
                    gemm_sparse_dense(Orientation::Normal, Orientation::Transpose, 1.0, a, &panel, 0.0, &mut block)?;
                    out.view_mut((0, base), (a.nrows(), k)).copy_from(&block);
                }
            }
        }
        Ok(())
    }
}

/// Dense sketching operator: `S * A` columnwise or `A * S^T` rowwise.
#[derive(Clone, Debug)]
pub struct DenseTransform {
    data: DenseTransformData,
    params: DenseParams,
    name: &'static str,
}

impl DenseTransform {
    /// Johnson-Lindenstrauss transform: Gaussian entries scaled by `sqrt(1/s)`.
    pub fn jlt(n: usize, s: usize, context: &Context) -> Result<(Self, Context)> {
        let scale = (1.0 / s as f64).sqrt();
        let (data, context) = DenseTransformData::new(n, s, scale, DistributionType::Gaussian, context)?;
        Ok((DenseTransform::from_data(data, "JLT"), context))
    }

    /// Cauchy transform: standard Cauchy entries scaled by `c / s`.
    pub fn ct(n: usize, s: usize, c: f64, context: &Context) -> Result<(Self, Context)> {
        let (data, context) = DenseTransformData::new(n, s, c / s as f64, DistributionType::Cauchy, context)?;
        Ok((DenseTransform::from_data(data, "CT"), context))
    }

    pub fn with_distribution(
        n: usize,
        s: usize,
        scale: f64,
        distribution: DistributionType,
        context: &Context,
    ) -> Result<(Self, Context)> {
        let (data, context) = DenseTransformData::new(n, s, scale, distribution, context)?;
        Ok((DenseTransform::from_data(data, "DenseTransform"), context))
    }

    pub fn from_data(data: DenseTransformData, name: &'static str) -> Self {
        DenseTransform {
            data,
            params: DenseParams::default(),
            name,
        }
    }

    pub fn with_params(mut self, params: DenseParams) -> Self {
        self.params = params;
        self
    }

    pub fn data(&self) -> &DenseTransformData {
        &self.data
    }

    pub fn params(&self) -> &DenseParams {
        &self.params
    }
}

impl SketchTransform for DenseTransform {
    fn n(&self) -> usize {
        self.data.n
    }

    fn s(&self) -> usize {
        self.data.s
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn family(&self) -> TransformFamily {
        TransformFamily::Dense
    }

    fn apply(&self, input: MatrixRef<'_>, output: MatrixMut<'_>, dimension: Dimension) -> Result<()> {
        self.data.apply(self.name, &self.params, input, output, dimension)
    }
}
