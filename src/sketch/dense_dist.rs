//! Dense sketches of distributed matrices.
//!
//! The random matrix is never communicated: every rank realizes exactly the
//! panel its local data meets and the partial products are combined with the
//! grid collectives.
use log::debug;
use nalgebra::DMatrix;
use rayon::prelude::*;

use super::dense::{DenseParams, DenseTransformData};
use super::{unsupported, Dimension, Layout};
use crate::comm::Grid;
use crate::dist_matrix::{DistLayout, DistMatrix, Distribution};
use crate::errors::{RandNLAError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanelStrategy {
    /// Panels of the random matrix against 1-D redistributed input,
    /// reduce-scattered over the whole grid.
    Inner,
    /// Input gathered along the sketched axis once; every rank accumulates
    /// its own output block without further communication.
    Outer,
    /// Random panels against the local [MC,MR] blocks, reduce-scattered
    /// within grid columns (or rows).
    MatrixPanel,
}

/// Picks the communication pattern for an `height x width` output sketched
/// from an axis of length `n`.
pub fn select_strategy(height: usize, width: usize, n: usize, factor: f64) -> PanelStrategy {
    let (h, w, n) = (height as f64, width as f64, n as f64);
    if h * factor <= n && w * factor <= n {
        PanelStrategy::Inner
    } else if h >= n * factor && w >= n * factor {
        PanelStrategy::Outer
    } else {
        PanelStrategy::MatrixPanel
    }
}

fn blocksize(params: &DenseParams, out_shape: (usize, usize)) -> usize {
    if params.blocksize > 0 {
        params.blocksize
    } else {
        out_shape.0.min(out_shape.1).max(1)
    }
}

/// Blocks `[base, base + len)` covering `0..total`.
fn panels(total: usize, b: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..total).step_by(b).map(move |base| (base, b.min(total - base)))
}

/// Local product that tolerates an empty inner dimension.
fn local_product(a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
    if a.ncols() == 0 || a.nrows() == 0 || b.ncols() == 0 {
        return DMatrix::zeros(a.nrows(), b.ncols());
    }
    a * b
}

/// Realizes the part of the `height x width` block of the random matrix at
/// `(i, j)` that `rank` would hold if that block were distributed as `dist`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn realize_local_panel(
    data: &DenseTransformData,
    grid: Grid,
    dist: Distribution,
    rank: usize,
    i: usize,
    j: usize,
    height: usize,
    width: usize,
) -> Result<DMatrix<f64>> {
    let layout = DistLayout {
        grid,
        height,
        width,
        distribution: dist,
    };
    data.realize_block(
        i + layout.col_shift(rank),
        j + layout.row_shift(rank),
        layout.local_height(rank),
        layout.local_width(rank),
        layout.col_stride(),
        layout.row_stride(),
    )
}

pub(crate) fn apply(
    data: &DenseTransformData,
    name: &'static str,
    params: &DenseParams,
    a: &DistMatrix,
    out: &mut DistMatrix,
    dimension: Dimension,
) -> Result<()> {
    if a.grid() != out.grid() {
        return Err(RandNLAError::UnsupportedOperation(format!(
            "{} cannot sketch between different process grids",
            name
        )));
    }
    let (din, dout) = (a.distribution(), out.distribution());
    let fail = || {
        unsupported(
            name,
            Layout::DistDense(din),
            Layout::DistDense(dout),
            dimension,
        )
    };

    if din == Distribution::MC_MR {
        if dout != Distribution::MC_MR {
            return Err(fail());
        }
        let (h, w) = out.shape();
        let strategy = select_strategy(h, w, data.n(), params.factor);
        debug!(
            "{}: {:?} sketch of {}x{} [MC,MR] into {}x{} with {:?} panels",
            name,
            dimension,
            a.height(),
            a.width(),
            h,
            w,
            strategy
        );
        return match (strategy, dimension) {
            (PanelStrategy::Inner, Dimension::Columnwise) => inner_columnwise(data, params, a, out),
            (PanelStrategy::Inner, Dimension::Rowwise) => inner_rowwise(data, params, a, out),
            (PanelStrategy::Outer, Dimension::Columnwise) => outer_columnwise(data, params, a, out),
            (PanelStrategy::Outer, Dimension::Rowwise) => outer_rowwise(data, params, a, out),
            (PanelStrategy::MatrixPanel, Dimension::Columnwise) => matrix_panel_columnwise(data, params, a, out),
            (PanelStrategy::MatrixPanel, Dimension::Rowwise) => matrix_panel_rowwise(data, params, a, out),
        };
    }

    let reducing = (din.is_row_distributed() && dimension == Dimension::Columnwise)
        || (din.is_col_distributed() && dimension == Dimension::Rowwise);
    let local = (din.is_row_distributed() && dimension == Dimension::Rowwise)
        || (din.is_col_distributed() && dimension == Dimension::Columnwise);

    if reducing && (dout.is_gathered() || dout == din) {
        debug!("{}: {:?} sketch of {} input reduce-scattered into {}", name, dimension, din, dout);
        one_d_reducing(data, params, a, out, dimension)
    } else if local && (dout.is_gathered() || dout == din) {
        debug!("{}: {:?} sketch of {} input computed locally into {}", name, dimension, din, dout);
        if dout == din {
            one_d_local(data, params, a, out, dimension)
        } else {
            let mut staged = DistMatrix::zeros(*a.grid(), out.height(), out.width(), din)?;
            one_d_local(data, params, a, &mut staged, dimension)?;
            *out = staged.redistribute(dout)?;
            Ok(())
        }
    } else {
        Err(fail())
    }
}

fn inner_columnwise(data: &DenseTransformData, params: &DenseParams, a: &DistMatrix, out: &mut DistMatrix) -> Result<()> {
    let grid = *a.grid();
    let a_vc = a.redistribute(Distribution::VC_STAR)?;
    let n = data.n();
    for (base, k) in panels(out.height(), blocksize(params, out.shape())) {
        let partials = (0..grid.size())
            .into_par_iter()
            .map(|rank| {
                let r = realize_local_panel(data, grid, Distribution::STAR_VC, rank, base, 0, k, n)?;
                Ok(local_product(&r, a_vc.local(rank)))
            })
            .collect::<Result<Vec<_>>>()?;
        out.sum_scatter_block(base, 0, &partials)?;
    }
    Ok(())
}

fn inner_rowwise(data: &DenseTransformData, params: &DenseParams, a: &DistMatrix, out: &mut DistMatrix) -> Result<()> {
    let grid = *a.grid();
    let a_vr = a.redistribute(Distribution::STAR_VR)?;
    let n = data.n();
    for (base, k) in panels(out.width(), blocksize(params, out.shape())) {
        let partials = (0..grid.size())
            .into_par_iter()
            .map(|rank| {
                let r = realize_local_panel(data, grid, Distribution::STAR_VR, rank, base, 0, k, n)?;
                Ok(local_product(a_vr.local(rank), &r.transpose()))
            })
            .collect::<Result<Vec<_>>>()?;
        out.sum_scatter_block(0, base, &partials)?;
    }
    Ok(())
}

fn outer_columnwise(data: &DenseTransformData, params: &DenseParams, a: &DistMatrix, out: &mut DistMatrix) -> Result<()> {
    let grid = *a.grid();
    let a_mr = a.redistribute(Distribution::STAR_MR)?;
    let layout = *out.layout();
    let n = data.n();
    for (base, k) in panels(out.height(), blocksize(params, out.shape())) {
        out.locals_mut()
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(rank, local)| -> Result<()> {
                let rows = layout.local_rows_in(rank, base..base + k);
                if rows.is_empty() {
                    return Ok(());
                }
                let first = layout.global_row(rank, rows.start);
                let r = data.realize_block(first, 0, rows.len(), n, grid.height(), 1)?;
                local
                    .rows_mut(rows.start, rows.len())
                    .copy_from(&local_product(&r, a_mr.local(rank)));
                Ok(())
            })?;
    }
    Ok(())
}

fn outer_rowwise(data: &DenseTransformData, params: &DenseParams, a: &DistMatrix, out: &mut DistMatrix) -> Result<()> {
    let grid = *a.grid();
    let a_mc = a.redistribute(Distribution::MC_STAR)?;
    let layout = *out.layout();
    let n = data.n();
    for (base, k) in panels(out.width(), blocksize(params, out.shape())) {
        out.locals_mut()
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(rank, local)| -> Result<()> {
                let cols = layout.local_cols_in(rank, base..base + k);
                if cols.is_empty() {
                    return Ok(());
                }
                let first = layout.global_col(rank, cols.start);
                let r = data.realize_block(first, 0, cols.len(), n, grid.width(), 1)?;
                local
                    .columns_mut(cols.start, cols.len())
                    .copy_from(&local_product(a_mc.local(rank), &r.transpose()));
                Ok(())
            })?;
    }
    Ok(())
}

fn matrix_panel_columnwise(
    data: &DenseTransformData,
    params: &DenseParams,
    a: &DistMatrix,
    out: &mut DistMatrix,
) -> Result<()> {
    let grid = *a.grid();
    let a_layout = *a.layout();
    let width = out.width();
    for (base, k) in panels(out.height(), blocksize(params, out.shape())) {
        let partials = (0..grid.size())
            .into_par_iter()
            .map(|rank| {
                let local = a.local(rank);
                let r = data.realize_block(
                    base,
                    a_layout.col_shift(rank),
                    k,
                    local.nrows(),
                    1,
                    a_layout.col_stride(),
                )?;
                Ok(local_product(&r, local))
            })
            .collect::<Result<Vec<_>>>()?;
        out.col_sum_scatter_block(base, 0, (k, width), &partials)?;
    }
    Ok(())
}

fn matrix_panel_rowwise(
    data: &DenseTransformData,
    params: &DenseParams,
    a: &DistMatrix,
    out: &mut DistMatrix,
) -> Result<()> {
    let grid = *a.grid();
    let a_layout = *a.layout();
    let height = out.height();
    for (base, k) in panels(out.width(), blocksize(params, out.shape())) {
        let partials = (0..grid.size())
            .into_par_iter()
            .map(|rank| {
                let local = a.local(rank);
                let r = data.realize_block(
                    base,
                    a_layout.row_shift(rank),
                    k,
                    local.ncols(),
                    1,
                    a_layout.row_stride(),
                )?;
                Ok(local_product(local, &r.transpose()))
            })
            .collect::<Result<Vec<_>>>()?;
        out.row_sum_scatter_block(0, base, (height, k), &partials)?;
    }
    Ok(())
}

/// Input split along the sketched axis: every rank multiplies its slice by
/// the matching columns of the random matrix and the slices are summed.
fn one_d_reducing(
    data: &DenseTransformData,
    params: &DenseParams,
    a: &DistMatrix,
    out: &mut DistMatrix,
    dimension: Dimension,
) -> Result<()> {
    let grid = *a.grid();
    let a_layout = *a.layout();
    let (features, b) = match dimension {
        Dimension::Columnwise => (out.height(), blocksize(params, out.shape())),
        Dimension::Rowwise => (out.width(), blocksize(params, out.shape())),
    };
    for (base, k) in panels(features, b) {
        let partials = (0..grid.size())
            .into_par_iter()
            .map(|rank| {
                let local = a.local(rank);
                match dimension {
                    Dimension::Columnwise => {
                        let r = data.realize_block(
                            base,
                            a_layout.col_shift(rank),
                            k,
                            local.nrows(),
                            1,
                            a_layout.col_stride(),
                        )?;
                        Ok(local_product(&r, local))
                    }
                    Dimension::Rowwise => {
                        let r = data.realize_block(
                            base,
                            a_layout.row_shift(rank),
                            k,
                            local.ncols(),
                            1,
                            a_layout.row_stride(),
                        )?;
                        Ok(local_product(local, &r.transpose()))
                    }
                }
            })
            .collect::<Result<Vec<_>>>()?;
        match dimension {
            Dimension::Columnwise => out.sum_scatter_block(base, 0, &partials)?,
            Dimension::Rowwise => out.sum_scatter_block(0, base, &partials)?,
        }
    }
    Ok(())
}

/// Input split along the other axis: each rank holds whole vectors to
/// sketch, so the output keeps the input's distribution and no rank talks.
fn one_d_local(
    data: &DenseTransformData,
    params: &DenseParams,
    a: &DistMatrix,
    out: &mut DistMatrix,
    dimension: Dimension,
) -> Result<()> {
    let n = data.n();
    let b = blocksize(params, out.shape());
    let features = data.s();
    out.locals_mut()
        .par_iter_mut()
        .enumerate()
        .try_for_each(|(rank, local_out)| {
            let local = a.local(rank);
            for (base, k) in panels(features, b) {
                let r = data.realize_block(base, 0, k, n, 1, 1)?;
                match dimension {
                    Dimension::Columnwise => local_out
                        .rows_mut(base, k)
                        .copy_from(&local_product(&r, local)),
                    Dimension::Rowwise => local_out
                        .columns_mut(base, k)
                        .copy_from(&local_product(local, &r.transpose())),
                }
            }
            Ok(())
        })
}
