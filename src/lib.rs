//! Randomized sketching transforms and sketch-accelerated least squares.
pub mod comm;
pub mod context;
pub mod dist_matrix;
pub mod distributions;
pub mod errors;
pub mod gemm;
pub mod krylov;
pub mod precond;
pub mod random123;
pub mod regression;
pub mod sketch;
pub mod sketch_and_precondition;
pub mod sketch_and_solve;
pub mod solvers;
#[cfg(test)]
mod test_assist;

pub use errors::{RandNLAError, Result};
