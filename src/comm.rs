use nalgebra::DMatrix;

use crate::errors::{RandNLAError, Result};

/// Logical `height x width` process grid. Ranks are laid out column-major,
/// so rank `r` sits at grid row `r % height` and grid column `r / height`.
///
/// All ranks live in the calling process: distributed matrices keep one local
/// block per rank and the collectives below combine those blocks directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Grid {
    height: usize,
    width: usize,
}

impl Grid {
    pub fn new(height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(RandNLAError::InvalidDimensions(format!(
                "process grid must be non-empty, got {}x{}",
                height, width
            )));
        }
        Ok(Grid { height, width })
    }

    /// The most square grid with `size` processes (height is the largest
    /// divisor not exceeding the square root).
    pub fn square(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(RandNLAError::InvalidDimensions(
                "process grid must have at least one process".to_string(),
            ));
        }
        let mut height = (size as f64).sqrt() as usize;
        while size % height != 0 {
            height -= 1;
        }
        Grid::new(height, size / height)
    }

    pub fn single() -> Self {
        Grid { height: 1, width: 1 }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn size(&self) -> usize {
        self.height * self.width
    }

    pub fn row(&self, rank: usize) -> usize {
        rank % self.height
    }

    pub fn col(&self, rank: usize) -> usize {
        rank / self.height
    }

    pub fn vc_rank(&self, rank: usize) -> usize {
        rank
    }

    pub fn vr_rank(&self, rank: usize) -> usize {
        self.row(rank) * self.width + self.col(rank)
    }

    pub fn rank_at(&self, row: usize, col: usize) -> usize {
        row + col * self.height
    }

    pub fn rank_from_vr(&self, vr: usize) -> usize {
        self.rank_at(vr / self.width, vr % self.width)
    }

    fn check_participants(&self, operation: &'static str, count: usize) -> Result<()> {
        if count != self.size() {
            return Err(RandNLAError::communication(
                operation,
                format!("{} buffers supplied for {} ranks", count, self.size()),
            ));
        }
        Ok(())
    }
}

/// Collective operations over a fixed process group. Every rank contributes
/// exactly one buffer, indexed by rank.
pub trait Communicator {
    fn size(&self) -> usize;

    /// Sums all buffers and leaves the total on every rank.
    fn all_reduce_sum(&self, buffers: &mut [DMatrix<f64>]) -> Result<()>;

    /// Sums all buffers onto `root`.
    fn reduce_sum(&self, buffers: &[DMatrix<f64>], root: usize) -> Result<DMatrix<f64>>;

    /// Copies the buffer of `root` over every other rank's buffer.
    fn broadcast(&self, buffers: &mut [DMatrix<f64>], root: usize) -> Result<()>;
}

pub(crate) fn check_uniform_shapes(
    operation: &'static str,
    buffers: &[DMatrix<f64>],
) -> Result<(usize, usize)> {
    let shape = buffers.first().map(|b| b.shape()).unwrap_or((0, 0));
    for (rank, buffer) in buffers.iter().enumerate() {
        if buffer.shape() != shape {
            return Err(RandNLAError::communication(
                operation,
                format!(
                    "rank {} contributed a {}x{} buffer, expected {}x{}",
                    rank,
                    buffer.nrows(),
                    buffer.ncols(),
                    shape.0,
                    shape.1
                ),
            ));
        }
    }
    Ok(shape)
}

/// Sums `buffers` in ascending rank order.
pub(crate) fn ordered_sum(buffers: &[DMatrix<f64>], shape: (usize, usize)) -> DMatrix<f64> {
    let mut total = DMatrix::zeros(shape.0, shape.1);
    for buffer in buffers {
        total += buffer;
    }
    total
}

impl Communicator for Grid {
    fn size(&self) -> usize {
        Grid::size(self)
    }

    fn all_reduce_sum(&self, buffers: &mut [DMatrix<f64>]) -> Result<()> {
        self.check_participants("all_reduce_sum", buffers.len())?;
        let shape = check_uniform_shapes("all_reduce_sum", buffers)?;
        let total = ordered_sum(buffers, shape);
        for buffer in buffers.iter_mut() {
            buffer.copy_from(&total);
        }
        Ok(())
    }

    fn reduce_sum(&self, buffers: &[DMatrix<f64>], root: usize) -> Result<DMatrix<f64>> {
        self.check_participants("reduce_sum", buffers.len())?;
        if root >= self.size() {
            return Err(RandNLAError::communication(
                "reduce_sum",
                format!("root {} outside a group of {}", root, self.size()),
            ));
        }
        let shape = check_uniform_shapes("reduce_sum", buffers)?;
        Ok(ordered_sum(buffers, shape))
    }

    fn broadcast(&self, buffers: &mut [DMatrix<f64>], root: usize) -> Result<()> {
        self.check_participants("broadcast", buffers.len())?;
        if root >= self.size() {
            return Err(RandNLAError::communication(
                "broadcast",
                format!("root {} outside a group of {}", root, self.size()),
            ));
        }
        let source = buffers[root].clone();
        for buffer in buffers.iter_mut() {
            buffer.clone_from(&source);
        }
        Ok(())
    }
}
