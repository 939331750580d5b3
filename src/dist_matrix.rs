use std::fmt;
use std::ops::Range;

use nalgebra::DMatrix;
use rayon::prelude::*;

use crate::comm::{check_uniform_shapes, ordered_sum, Communicator, Grid};
use crate::errors::{RandNLAError, Result};

/// How one matrix axis is spread over the process grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dist {
    /// Cyclic over grid rows.
    Mc,
    /// Cyclic over grid columns.
    Mr,
    /// Cyclic over all ranks in column-major order.
    Vc,
    /// Cyclic over all ranks in row-major order.
    Vr,
    /// Replicated.
    Star,
    /// Held by the root rank only.
    Circ,
}

impl Dist {
    fn uses_grid_rows(self) -> bool {
        matches!(self, Dist::Mc | Dist::Vc | Dist::Vr)
    }

    fn uses_grid_cols(self) -> bool {
        matches!(self, Dist::Mr | Dist::Vc | Dist::Vr)
    }

    fn label(self) -> &'static str {
        match self {
            Dist::Mc => "MC",
            Dist::Mr => "MR",
            Dist::Vc => "VC",
            Dist::Vr => "VR",
            Dist::Star => "*",
            Dist::Circ => "CIRC",
        }
    }
}

/// Pair of axis distributions: `col` spreads the rows of the matrix (it
/// decides which entries of each column a rank holds), `row` spreads the
/// columns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Distribution {
    pub col: Dist,
    pub row: Dist,
}

impl Distribution {
    pub const MC_MR: Distribution = Distribution::new(Dist::Mc, Dist::Mr);
    pub const MR_MC: Distribution = Distribution::new(Dist::Mr, Dist::Mc);
    pub const MC_STAR: Distribution = Distribution::new(Dist::Mc, Dist::Star);
    pub const STAR_MC: Distribution = Distribution::new(Dist::Star, Dist::Mc);
    pub const MR_STAR: Distribution = Distribution::new(Dist::Mr, Dist::Star);
    pub const STAR_MR: Distribution = Distribution::new(Dist::Star, Dist::Mr);
    pub const VC_STAR: Distribution = Distribution::new(Dist::Vc, Dist::Star);
    pub const STAR_VC: Distribution = Distribution::new(Dist::Star, Dist::Vc);
    pub const VR_STAR: Distribution = Distribution::new(Dist::Vr, Dist::Star);
    pub const STAR_VR: Distribution = Distribution::new(Dist::Star, Dist::Vr);
    pub const STAR_STAR: Distribution = Distribution::new(Dist::Star, Dist::Star);
    pub const CIRC_CIRC: Distribution = Distribution::new(Dist::Circ, Dist::Circ);

    pub const fn new(col: Dist, row: Dist) -> Self {
        Distribution { col, row }
    }

    pub fn validate(&self) -> Result<()> {
        let circ = (self.col == Dist::Circ) as u8 + (self.row == Dist::Circ) as u8;
        let clash = (self.col.uses_grid_rows() && self.row.uses_grid_rows())
            || (self.col.uses_grid_cols() && self.row.uses_grid_cols());
        if circ == 1 || clash {
            return Err(RandNLAError::UnsupportedOperation(format!(
                "{} is not a valid distribution",
                self
            )));
        }
        Ok(())
    }

    /// Rows spread over every rank, columns whole: [VC,*] or [VR,*].
    pub fn is_row_distributed(&self) -> bool {
        matches!(self.col, Dist::Vc | Dist::Vr) && self.row == Dist::Star
    }

    /// Columns spread over every rank, rows whole: [*,VC] or [*,VR].
    pub fn is_col_distributed(&self) -> bool {
        self.col == Dist::Star && matches!(self.row, Dist::Vc | Dist::Vr)
    }

    /// Every rank (or the root alone) sees the whole matrix.
    pub fn is_gathered(&self) -> bool {
        *self == Distribution::STAR_STAR || *self == Distribution::CIRC_CIRC
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{}]", self.col.label(), self.row.label())
    }
}

pub(crate) fn axis_stride(grid: &Grid, d: Dist) -> usize {
    match d {
        Dist::Mc => grid.height(),
        Dist::Mr => grid.width(),
        Dist::Vc | Dist::Vr => grid.size(),
        Dist::Star | Dist::Circ => 1,
    }
}

pub(crate) fn axis_shift(grid: &Grid, d: Dist, rank: usize) -> usize {
    match d {
        Dist::Mc => grid.row(rank),
        Dist::Mr => grid.col(rank),
        Dist::Vc => grid.vc_rank(rank),
        Dist::Vr => grid.vr_rank(rank),
        Dist::Star | Dist::Circ => 0,
    }
}

/// Number of indices `shift, shift + stride, ...` below `n`.
pub fn local_length(n: usize, shift: usize, stride: usize) -> usize {
    if n > shift {
        (n - shift - 1) / stride + 1
    } else {
        0
    }
}

fn first_local_at_or_after(start: usize, shift: usize, stride: usize) -> usize {
    if start <= shift {
        0
    } else {
        (start - shift + stride - 1) / stride
    }
}

/// Index bookkeeping of a distributed matrix: which global entries each rank
/// holds and where.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DistLayout {
    pub grid: Grid,
    pub height: usize,
    pub width: usize,
    pub distribution: Distribution,
}

impl DistLayout {
    pub fn col_stride(&self) -> usize {
        axis_stride(&self.grid, self.distribution.col)
    }

    pub fn row_stride(&self) -> usize {
        axis_stride(&self.grid, self.distribution.row)
    }

    pub fn col_shift(&self, rank: usize) -> usize {
        axis_shift(&self.grid, self.distribution.col, rank)
    }

    pub fn row_shift(&self, rank: usize) -> usize {
        axis_shift(&self.grid, self.distribution.row, rank)
    }

    fn holds_data(&self, rank: usize) -> bool {
        self.distribution.col != Dist::Circ || rank == 0
    }

    pub fn local_height(&self, rank: usize) -> usize {
        if !self.holds_data(rank) {
            return 0;
        }
        local_length(self.height, self.col_shift(rank), self.col_stride())
    }

    pub fn local_width(&self, rank: usize) -> usize {
        if !self.holds_data(rank) {
            return 0;
        }
        local_length(self.width, self.row_shift(rank), self.row_stride())
    }

    pub fn global_row(&self, rank: usize, i_loc: usize) -> usize {
        self.col_shift(rank) + i_loc * self.col_stride()
    }

    pub fn global_col(&self, rank: usize, j_loc: usize) -> usize {
        self.row_shift(rank) + j_loc * self.row_stride()
    }

    /// Local rows of `rank` whose global index lies in `rows`.
    pub fn local_rows_in(&self, rank: usize, rows: Range<usize>) -> Range<usize> {
        let (shift, stride, len) = (self.col_shift(rank), self.col_stride(), self.local_height(rank));
        let lo = first_local_at_or_after(rows.start, shift, stride).min(len);
        let hi = first_local_at_or_after(rows.end, shift, stride).min(len);
        lo..hi.max(lo)
    }

    /// Local columns of `rank` whose global index lies in `cols`.
    pub fn local_cols_in(&self, rank: usize, cols: Range<usize>) -> Range<usize> {
        let (shift, stride, len) = (self.row_shift(rank), self.row_stride(), self.local_width(rank));
        let lo = first_local_at_or_after(cols.start, shift, stride).min(len);
        let hi = first_local_at_or_after(cols.end, shift, stride).min(len);
        lo..hi.max(lo)
    }

    /// One rank holding entry `(gi, gj)` and its local coordinates there.
    /// Replicated axes resolve to grid coordinate 0.
    pub fn owner(&self, gi: usize, gj: usize) -> (usize, usize, usize) {
        if self.distribution.col == Dist::Circ {
            return (0, gi, gj);
        }
        let mut coords = (0, 0);
        let li = self.place(self.distribution.col, gi, &mut coords);
        let lj = self.place(self.distribution.row, gj, &mut coords);
        (self.grid.rank_at(coords.0, coords.1), li, lj)
    }

    fn place(&self, d: Dist, g: usize, coords: &mut (usize, usize)) -> usize {
        let stride = axis_stride(&self.grid, d);
        let a = g % stride;
        match d {
            Dist::Mc => coords.0 = a,
            Dist::Mr => coords.1 = a,
            Dist::Vc => {
                coords.0 = self.grid.row(a);
                coords.1 = self.grid.col(a);
            }
            Dist::Vr => {
                coords.0 = a / self.grid.width();
                coords.1 = a % self.grid.width();
            }
            Dist::Star | Dist::Circ => {}
        }
        g / stride
    }

    /// Whether `rank` is the designated holder of its entries, so that
    /// replicated data is counted once when contributions are summed.
    pub fn is_primary(&self, rank: usize) -> bool {
        let d = self.distribution;
        if d.col == Dist::Circ {
            return rank == 0;
        }
        let rows = d.col.uses_grid_rows() || d.row.uses_grid_rows() || self.grid.row(rank) == 0;
        let cols = d.col.uses_grid_cols() || d.row.uses_grid_cols() || self.grid.col(rank) == 0;
        rows && cols
    }
}

/// Dense matrix spread over a process grid. Holds one local block per rank.
#[derive(Clone, Debug, PartialEq)]
pub struct DistMatrix {
    layout: DistLayout,
    locals: Vec<DMatrix<f64>>,
}

impl DistMatrix {
    pub fn zeros(grid: Grid, height: usize, width: usize, distribution: Distribution) -> Result<Self> {
        distribution.validate()?;
        let layout = DistLayout {
            grid,
            height,
            width,
            distribution,
        };
        let locals = (0..grid.size())
            .map(|rank| DMatrix::zeros(layout.local_height(rank), layout.local_width(rank)))
            .collect();
        Ok(DistMatrix { layout, locals })
    }

    /// Scatters a matrix known to every rank.
    pub fn from_global(grid: Grid, a: &DMatrix<f64>, distribution: Distribution) -> Result<Self> {
        distribution.validate()?;
        let layout = DistLayout {
            grid,
            height: a.nrows(),
            width: a.ncols(),
            distribution,
        };
        let locals = (0..grid.size())
            .into_par_iter()
            .map(|rank| {
                DMatrix::from_fn(layout.local_height(rank), layout.local_width(rank), |i, j| {
                    a[(layout.global_row(rank, i), layout.global_col(rank, j))]
                })
            })
            .collect();
        Ok(DistMatrix { layout, locals })
    }

    pub fn layout(&self) -> &DistLayout {
        &self.layout
    }

    pub fn grid(&self) -> &Grid {
        &self.layout.grid
    }

    pub fn height(&self) -> usize {
        self.layout.height
    }

    pub fn width(&self) -> usize {
        self.layout.width
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.layout.height, self.layout.width)
    }

    pub fn distribution(&self) -> Distribution {
        self.layout.distribution
    }

    pub fn local(&self, rank: usize) -> &DMatrix<f64> {
        &self.locals[rank]
    }

    pub fn local_mut(&mut self, rank: usize) -> &mut DMatrix<f64> {
        &mut self.locals[rank]
    }

    pub fn locals(&self) -> &[DMatrix<f64>] {
        &self.locals
    }

    pub fn locals_mut(&mut self) -> &mut [DMatrix<f64>] {
        &mut self.locals
    }

    pub(crate) fn value_at(&self, gi: usize, gj: usize) -> f64 {
        let (rank, li, lj) = self.layout.owner(gi, gj);
        self.locals[rank][(li, lj)]
    }

    /// All-gather into a plain matrix.
    pub fn to_global(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.height(), self.width(), |i, j| self.value_at(i, j))
    }

    /// Gathers the matrix onto `root` by a zero-padded sum reduction.
    pub fn collect(&self, root: usize) -> Result<DMatrix<f64>> {
        let layout = self.layout;
        let padded: Vec<DMatrix<f64>> = self
            .locals
            .par_iter()
            .enumerate()
            .map(|(rank, local)| {
                let mut full = DMatrix::zeros(layout.height, layout.width);
                if layout.is_primary(rank) {
                    for j in 0..local.ncols() {
                        for i in 0..local.nrows() {
                            full[(layout.global_row(rank, i), layout.global_col(rank, j))] = local[(i, j)];
                        }
                    }
                }
                full
            })
            .collect();
        layout.grid.reduce_sum(&padded, root)
    }

    pub fn redistribute(&self, distribution: Distribution) -> Result<DistMatrix> {
        self.redistribute_block(0, 0, self.height(), self.width(), distribution)
    }

    /// Copies the `height x width` block at `(i, j)` into a new matrix with
    /// the requested distribution.
    pub fn redistribute_block(
        &self,
        i: usize,
        j: usize,
        height: usize,
        width: usize,
        distribution: Distribution,
    ) -> Result<DistMatrix> {
        if i + height > self.height() || j + width > self.width() {
            return Err(RandNLAError::mismatch(
                "redistribute_block",
                (self.height(), self.width()),
                (i + height, j + width),
            ));
        }
        distribution.validate()?;
        let layout = DistLayout {
            grid: self.layout.grid,
            height,
            width,
            distribution,
        };
        let locals = (0..layout.grid.size())
            .into_par_iter()
            .map(|rank| {
                DMatrix::from_fn(layout.local_height(rank), layout.local_width(rank), |li, lj| {
                    self.value_at(i + layout.global_row(rank, li), j + layout.global_col(rank, lj))
                })
            })
            .collect();
        Ok(DistMatrix { layout, locals })
    }

    fn check_block(&self, operation: &'static str, i0: usize, j0: usize, shape: (usize, usize)) -> Result<()> {
        if i0 + shape.0 > self.height() || j0 + shape.1 > self.width() {
            return Err(RandNLAError::mismatch(
                operation,
                (self.height(), self.width()),
                (i0 + shape.0, j0 + shape.1),
            ));
        }
        Ok(())
    }

    /// Reduce-scatter: every rank contributes a partial of the whole block at
    /// `(i0, j0)`; the sum overwrites that block.
    pub fn sum_scatter_block(&mut self, i0: usize, j0: usize, partials: &[DMatrix<f64>]) -> Result<()> {
        if partials.len() != self.layout.grid.size() {
            return Err(RandNLAError::communication(
                "sum_scatter",
                format!("{} partials for {} ranks", partials.len(), self.layout.grid.size()),
            ));
        }
        let shape = check_uniform_shapes("sum_scatter", partials)?;
        self.check_block("sum_scatter", i0, j0, shape)?;
        let total = ordered_sum(partials, shape);
        let layout = self.layout;

        self.locals.par_iter_mut().enumerate().for_each(|(rank, local)| {
            let rows = layout.local_rows_in(rank, i0..i0 + shape.0);
            let cols = layout.local_cols_in(rank, j0..j0 + shape.1);
            for lj in cols {
                let gj = layout.global_col(rank, lj) - j0;
                for li in rows.clone() {
                    local[(li, lj)] = total[(layout.global_row(rank, li) - i0, gj)];
                }
            }
        });
        Ok(())
    }

    /// Reduce-scatter within grid columns into an [MC,MR] matrix. The partial
    /// of each rank spans all rows of the block and that rank's local columns
    /// inside it.
    pub fn col_sum_scatter_block(
        &mut self,
        i0: usize,
        j0: usize,
        block: (usize, usize),
        partials: &[DMatrix<f64>],
    ) -> Result<()> {
        self.grouped_sum_scatter("col_sum_scatter", i0, j0, block, partials, true)
    }

    /// Reduce-scatter within grid rows into an [MC,MR] matrix. The partial of
    /// each rank spans that rank's local rows inside the block and all of its
    /// columns.
    pub fn row_sum_scatter_block(
        &mut self,
        i0: usize,
        j0: usize,
        block: (usize, usize),
        partials: &[DMatrix<f64>],
    ) -> Result<()> {
        self.grouped_sum_scatter("row_sum_scatter", i0, j0, block, partials, false)
    }

    fn grouped_sum_scatter(
        &mut self,
        operation: &'static str,
        i0: usize,
        j0: usize,
        block: (usize, usize),
        partials: &[DMatrix<f64>],
        within_columns: bool,
    ) -> Result<()> {
        if self.distribution() != Distribution::MC_MR {
            return Err(RandNLAError::UnsupportedOperation(format!(
                "{} into {} (only [MC,MR])",
                operation,
                self.distribution()
            )));
        }
        let layout = self.layout;
        let grid = layout.grid;
        if partials.len() != grid.size() {
            return Err(RandNLAError::communication(
                operation,
                format!("{} partials for {} ranks", partials.len(), grid.size()),
            ));
        }
        self.check_block(operation, i0, j0, block)?;

        for (rank, partial) in partials.iter().enumerate() {
            let rows = layout.local_rows_in(rank, i0..i0 + block.0).len();
            let cols = layout.local_cols_in(rank, j0..j0 + block.1).len();
            let expected = if within_columns { (block.0, cols) } else { (rows, block.1) };
            if partial.shape() != expected {
                return Err(RandNLAError::communication(
                    operation,
                    format!(
                        "rank {} contributed a {}x{} partial, expected {}x{}",
                        rank,
                        partial.nrows(),
                        partial.ncols(),
                        expected.0,
                        expected.1
                    ),
                ));
            }
        }

        self.locals.par_iter_mut().enumerate().for_each(|(rank, local)| {
            let group: Vec<usize> = if within_columns {
                (0..grid.height()).map(|r| grid.rank_at(r, grid.col(rank))).collect()
            } else {
                (0..grid.width()).map(|c| grid.rank_at(grid.row(rank), c)).collect()
            };
            let rows = layout.local_rows_in(rank, i0..i0 + block.0);
            let cols = layout.local_cols_in(rank, j0..j0 + block.1);
            for (k, lj) in cols.clone().enumerate() {
                for (m, li) in rows.clone().enumerate() {
                    // within a grid column every member shares the column set;
                    // within a grid row every member shares the row set
                    let (pi, pj) = if within_columns {
                        (layout.global_row(rank, li) - i0, k)
                    } else {
                        (m, layout.global_col(rank, lj) - j0)
                    };
                    let mut sum = 0.0;
                    for &q in &group {
                        sum += partials[q][(pi, pj)];
                    }
                    local[(li, lj)] = sum;
                }
            }
        });
        Ok(())
    }
}
