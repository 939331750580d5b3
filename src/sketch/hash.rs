use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CscMatrix};
use rand_distr::Uniform;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{check_apply_shapes, unsupported, Dimension, Layout, MatrixMut, MatrixRef, SketchTransform, TransformFamily};
use crate::context::Context;
use crate::distributions::{standard_cauchy, Rademacher};
use crate::dist_matrix::DistMatrix;
use crate::errors::{RandNLAError, Result};

/// Distribution of the coefficient attached to each hashed input index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashValues {
    /// +-1, giving the Clarkson-Woodruff transform.
    Rademacher,
    /// Standard Cauchy, giving the Meng-Mahoney transform.
    Cauchy,
}

/// Input index `i` is sent to output index `row_idx[i]` with coefficient
/// `row_value[i]`. Equivalent to an `s x n` matrix with one nonzero per column.
#[derive(Clone, Debug)]
pub struct HashTransformData {
    n: usize,
    s: usize,
    row_idx: Vec<usize>,
    row_value: Vec<f64>,
}

impl HashTransformData {
    pub fn new(n: usize, s: usize, values: HashValues, context: &Context) -> Result<(Self, Context)> {
        if n == 0 || s == 0 {
            return Err(RandNLAError::InvalidDimensions(
                "Input and sketch dimensions must be greater than 0".to_string(),
            ));
        }
        let (idx, context) = context.generate_random_samples_array::<u64, _>(n, Uniform::new(0u64, s as u64))?;
        let (row_value, context) = match values {
            HashValues::Rademacher => context.generate_random_samples_array::<f64, _>(n, Rademacher)?,
            HashValues::Cauchy => context.generate_random_samples_array::<f64, _>(n, standard_cauchy())?,
        };
        let row_idx = idx.into_iter().map(|i| i as usize).collect();
        Ok((HashTransformData { n, s, row_idx, row_value }, context))
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn s(&self) -> usize {
        self.s
    }

    pub fn row_idx(&self) -> &[usize] {
        &self.row_idx
    }

    pub fn row_value(&self) -> &[f64] {
        &self.row_value
    }

    /// The transform as an explicit `s x n` sparse matrix.
    pub fn to_sparse(&self) -> CscMatrix<f64> {
        let mut coo = CooMatrix::new(self.s, self.n);
        for (i, (&r, &v)) in self.row_idx.iter().zip(&self.row_value).enumerate() {
            coo.push(r, i, v);
        }
        CscMatrix::from(&coo)
    }

    /// Source indices grouped by the output index they land on.
    fn buckets(&self) -> Vec<Vec<usize>> {
        let mut buckets = vec![Vec::new(); self.s];
        for (i, &r) in self.row_idx.iter().enumerate() {
            buckets[r].push(i);
        }
        buckets
    }

    /// Scatter-add of the rows of `a` into `out`, which holds all `s` rows.
    fn scatter_rows(&self, a: &DMatrix<f64>, out: &mut DMatrix<f64>) {
        out.fill(0.0);
        let (rows, s) = (a.nrows(), out.nrows());
        if s == 0 {
            return;
        }
        out.as_mut_slice()
            .par_chunks_mut(s)
            .enumerate()
            .for_each(|(j, out_col)| {
                for i in 0..rows {
                    out_col[self.row_idx[i]] += self.row_value[i] * a[(i, j)];
                }
            });
    }

    /// Scatter-add of the columns of `a` into `out`, which holds all `s`
    /// columns.
    fn scatter_cols(&self, a: &DMatrix<f64>, out: &mut DMatrix<f64>) {
        out.fill(0.0);
        let h = out.nrows();
        if h == 0 {
            return;
        }
        let buckets = self.buckets();
        out.as_mut_slice()
            .par_chunks_mut(h)
            .zip(buckets.par_iter())
            .for_each(|(out_col, sources)| {
                for &j in sources {
                    let v = self.row_value[j];
                    for (o, x) in out_col.iter_mut().zip(a.column(j).iter()) {
                        *o += v * x;
                    }
                }
            });
    }

    fn apply_sparse(&self, a: &CscMatrix<f64>, out: &mut DMatrix<f64>, dimension: Dimension) {
        out.fill(0.0);
        match dimension {
            Dimension::Columnwise => {
                let s = out.nrows();
                out.as_mut_slice()
                    .par_chunks_mut(s)
                    .enumerate()
                    .for_each(|(j, out_col)| {
                        let lane = a.col(j);
                        for (&i, &val) in lane.row_indices().iter().zip(lane.values()) {
                            out_col[self.row_idx[i]] += self.row_value[i] * val;
                        }
                    });
            }
            Dimension::Rowwise => {
                let h = out.nrows();
                if h == 0 {
                    return;
                }
                let buckets = self.buckets();
                out.as_mut_slice()
                    .par_chunks_mut(h)
                    .zip(buckets.par_iter())
                    .for_each(|(out_col, sources)| {
                        for &i in sources {
                            let lane = a.col(i);
                            let v = self.row_value[i];
                            for (&r, &val) in lane.row_indices().iter().zip(lane.values()) {
                                out_col[r] += v * val;
                            }
                        }
                    });
            }
        }
    }

    fn apply_dist(&self, name: &'static str, a: &DistMatrix, out: &mut DistMatrix, dimension: Dimension) -> Result<()> {
        let (din, dout) = (a.distribution(), out.distribution());
        if a.grid() != out.grid() {
            return Err(unsupported(name, Layout::DistDense(din), Layout::DistDense(dout), dimension));
        }
        let layout = *a.layout();

        if dout.is_gathered() {
            // every primary rank hashes its own entries into a full-size partial
            let (h, w) = out.shape();
            let partials: Vec<DMatrix<f64>> = a
                .locals()
                .par_iter()
                .enumerate()
                .map(|(rank, local)| {
                    let mut partial = DMatrix::zeros(h, w);
                    if !layout.is_primary(rank) {
                        return partial;
                    }
                    for lj in 0..local.ncols() {
                        let gj = layout.global_col(rank, lj);
                        for li in 0..local.nrows() {
                            let gi = layout.global_row(rank, li);
                            let x = local[(li, lj)];
                            match dimension {
                                Dimension::Columnwise => {
                                    partial[(self.row_idx[gi], gj)] += self.row_value[gi] * x
                                }
                                Dimension::Rowwise => {
                                    partial[(gi, self.row_idx[gj])] += self.row_value[gj] * x
                                }
                            }
                        }
                    }
                    partial
                })
                .collect();
            return out.sum_scatter_block(0, 0, &partials);
        }

        let whole_rows = din.is_row_distributed() && dimension == Dimension::Rowwise;
        let whole_cols = din.is_col_distributed() && dimension == Dimension::Columnwise;
        if dout != din || !(whole_rows || whole_cols) {
            return Err(unsupported(name, Layout::DistDense(din), Layout::DistDense(dout), dimension));
        }
        out.locals_mut()
            .par_iter_mut()
            .zip(a.locals().par_iter())
            .for_each(|(out_local, local)| match dimension {
                Dimension::Columnwise => self.scatter_rows(local, out_local),
                Dimension::Rowwise => self.scatter_cols(local, out_local),
            });
        Ok(())
    }
}

/// Hashing sketch (CountSketch family). Cost is linear in the input size and
/// independent of `s`.
#[derive(Clone, Debug)]
pub struct HashTransform {
    data: HashTransformData,
    name: &'static str,
}

impl HashTransform {
    pub fn cwt(n: usize, s: usize, context: &Context) -> Result<(Self, Context)> {
        let (data, context) = HashTransformData::new(n, s, HashValues::Rademacher, context)?;
        Ok((HashTransform { data, name: "CWT" }, context))
    }

    pub fn mmt(n: usize, s: usize, context: &Context) -> Result<(Self, Context)> {
        let (data, context) = HashTransformData::new(n, s, HashValues::Cauchy, context)?;
        Ok((HashTransform { data, name: "MMT" }, context))
    }

    pub fn data(&self) -> &HashTransformData {
        &self.data
    }
}

impl SketchTransform for HashTransform {
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
        TransformFamily::Hashing
    }

    fn apply(&self, input: MatrixRef<'_>, output: MatrixMut<'_>, dimension: Dimension) -> Result<()> {
        check_apply_shapes(self.name, self.data.n, self.data.s, input.shape(), output.shape(), dimension)?;
        let (in_layout, out_layout) = (input.layout(), output.layout());
        match (input, output) {
            (MatrixRef::Local(a), MatrixMut::Local(out)) => {
                match dimension {
                    Dimension::Columnwise => self.data.scatter_rows(a, out),
                    Dimension::Rowwise => self.data.scatter_cols(a, out),
                }
                Ok(())
            }
            (MatrixRef::Sparse(a), MatrixMut::Local(out)) => {
                self.data.apply_sparse(a, out, dimension);
                Ok(())
            }
            (MatrixRef::Dist(a), MatrixMut::Dist(out)) => self.data.apply_dist(self.name, a, out, dimension),
            _ => Err(unsupported(self.name, in_layout, out_layout, dimension)),
        }
    }
}
