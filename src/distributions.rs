use rand::Rng;
use rand_distr::{Cauchy, Distribution, StandardNormal, Uniform};
use serde::{Deserialize, Serialize};

/// Entry distributions available to dense sketching operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistributionType {
    Gaussian,
    /// Uniform on `[-1, 1)`.
    Uniform,
    Rademacher,
    Cauchy,
    Levy,
}

impl Distribution<f64> for DistributionType {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match self {
            DistributionType::Gaussian => StandardNormal.sample(rng),
            DistributionType::Uniform => Uniform::new(-1.0, 1.0).sample(rng),
            DistributionType::Rademacher => Rademacher.sample(rng),
            DistributionType::Cauchy => standard_cauchy().sample(rng),
            DistributionType::Levy => StandardLevy.sample(rng),
        }
    }
}

/// +1 or -1 with equal probability.
#[derive(Clone, Copy, Debug, Default)]
pub struct Rademacher;

impl Distribution<f64> for Rademacher {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if rng.gen::<bool>() {
            1.0
        } else {
            -1.0
        }
    }
}

/// Standard Lévy distribution (location 0, scale 1), sampled as `1 / Z^2`
/// with `Z` standard normal.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardLevy;

impl Distribution<f64> for StandardLevy {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let z: f64 = StandardNormal.sample(rng);
        1.0 / (z * z)
    }
}

pub(crate) fn standard_cauchy() -> Cauchy<f64> {
    // median 0 and scale 1 are always valid parameters
    match Cauchy::new(0.0, 1.0) {
        Ok(c) => c,
        Err(_) => unreachable!(),
    }
}
