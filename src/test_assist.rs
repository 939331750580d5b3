use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, StandardNormal};

use crate::random123::Threefry2x64Rng;

/// Generates a random matrix of size (rows, cols) with normally distributed elems
pub fn random_matrix(rows: usize, cols: usize, seed: u64) -> DMatrix<f64> {
    let mut rng = Threefry2x64Rng::seed_from_u64(seed);
    DMatrix::from_fn(rows, cols, |_, _| StandardNormal.sample(&mut rng))
}

/// Adds N(0, sigma^2) noise to every entry of `b`
pub fn with_noise(b: &DMatrix<f64>, sigma: f64, seed: u64) -> DMatrix<f64> {
    let normal = Normal::new(0.0, sigma).unwrap();
    let mut rng = Threefry2x64Rng::seed_from_u64(seed);
    b.map(|v| v + normal.sample(&mut rng))
}
