use rand_distr::Distribution;
use serde::{Deserialize, Serialize};

use crate::errors::{RandNLAError, Result};
use crate::random123::{Array2x64, MicroRng};

/// Immutable seed stream.
///
/// A context names a seed and the first unreserved position of the global
/// counter. Reserving samples never mutates the context; the advanced context
/// is handed back to the caller, who threads it into the next construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Context {
    seed: u64,
    counter: u64,
}

impl Context {
    pub fn new(seed: u64) -> Self {
        Context { seed, counter: 0 }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// First stream position not yet handed out.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Reserves `size` consecutive stream positions for a lazily evaluated
    /// array of samples from `distribution`.
    pub fn allocate_random_samples_array<D>(
        &self,
        size: usize,
        distribution: D,
    ) -> Result<(RandomSamplesArray<D>, Context)> {
        let array = RandomSamplesArray::new(self.counter, size, self.seed, distribution)?;
        Ok((array, self.advanced(size)?))
    }

    /// Draws `size` samples eagerly.
    pub fn generate_random_samples_array<T, D>(
        &self,
        size: usize,
        distribution: D,
    ) -> Result<(Vec<T>, Context)>
    where
        D: Distribution<T>,
    {
        let (array, next) = self.allocate_random_samples_array(size, distribution)?;
        let samples = (0..size)
            .map(|i| array.get(i))
            .collect::<Result<Vec<T>>>()?;
        Ok((samples, next))
    }

    fn advanced(&self, size: usize) -> Result<Context> {
        let counter = self
            .counter
            .checked_add(size as u64)
            .ok_or(RandNLAError::ExhaustedRandomStream {
                base: self.counter,
                size,
            })?;
        Ok(Context {
            seed: self.seed,
            counter,
        })
    }
}

/// Random-access view of `size` samples starting at stream position `base`.
#[derive(Clone, Debug)]
pub struct RandomSamplesArray<D> {
    base: u64,
    size: usize,
    key: Array2x64,
    distribution: D,
}

impl<D> RandomSamplesArray<D> {
    pub fn new(base: u64, size: usize, seed: u64, distribution: D) -> Result<Self> {
        if size > 0 && (size as u64 - 1) > u64::MAX - base {
            return Err(RandNLAError::ExhaustedRandomStream { base, size });
        }
        Ok(RandomSamplesArray {
            base,
            size,
            key: [seed, 0],
            distribution,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn distribution(&self) -> &D {
        &self.distribution
    }

    /// Sample at `index`; a pure function of seed and `base + index`.
    pub fn get<T>(&self, index: usize) -> Result<T>
    where
        D: Distribution<T>,
    {
        if index >= self.size {
            return Err(RandNLAError::OutOfRange {
                index,
                size: self.size,
            });
        }
        let mut rng = MicroRng::new(self.base + index as u64, self.key);
        Ok(self.distribution.sample(&mut rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::DistributionType;
    use rand_distr::StandardNormal;

    #[test]
    fn lookups_do_not_depend_on_access_order() {
        let ctx = Context::new(1234);
        let (a, _) = ctx.allocate_random_samples_array(100, StandardNormal).unwrap();
        let (b, _) = ctx.allocate_random_samples_array(100, StandardNormal).unwrap();

        let a37: f64 = a.get(37).unwrap();
        let a1: f64 = a.get(1).unwrap();
        let b1: f64 = b.get(1).unwrap();
        let b37: f64 = b.get(37).unwrap();
        assert_eq!(a37.to_bits(), b37.to_bits());
        assert_eq!(a1.to_bits(), b1.to_bits());
        assert_ne!(a1, a37);
    }

    #[test]
    fn allocation_advances_a_copy() {
        let ctx = Context::new(5);
        let (first, next) = ctx
            .allocate_random_samples_array(10, DistributionType::Gaussian)
            .unwrap();
        assert_eq!(ctx.counter(), 0);
        assert_eq!(next.counter(), 10);

        let (second, _) = next
            .allocate_random_samples_array(10, DistributionType::Gaussian)
            .unwrap();
        let x: f64 = first.get(3).unwrap();
        let y: f64 = second.get(3).unwrap();
        assert_ne!(x, y);
    }

    #[test]
    fn shifted_arrays_share_the_global_stream() {
        let ctx = Context::new(9);
        let (whole, _) = ctx
            .allocate_random_samples_array(20, DistributionType::Cauchy)
            .unwrap();
        let tail = RandomSamplesArray::new(5, 15, 9, DistributionType::Cauchy).unwrap();
        for i in 0..15 {
            let w: f64 = whole.get(i + 5).unwrap();
            let t: f64 = tail.get(i).unwrap();
            assert_eq!(w.to_bits(), t.to_bits());
        }
    }

    #[test]
    fn out_of_range_lookup_fails() {
        let ctx = Context::new(0);
        let (arr, _) = ctx.allocate_random_samples_array(4, StandardNormal).unwrap();
        let err = arr.get::<f64>(4).unwrap_err();
        assert_eq!(err, RandNLAError::OutOfRange { index: 4, size: 4 });
    }

    #[test]
    fn overflowing_reservation_fails() {
        let err = RandomSamplesArray::new(u64::MAX - 2, 10, 0, StandardNormal).unwrap_err();
        assert!(matches!(err, RandNLAError::ExhaustedRandomStream { .. }));
        assert!(RandomSamplesArray::new(u64::MAX - 2, 3, 0, StandardNormal).is_ok());
    }

    #[test]
    fn generated_samples_match_lazy_array() {
        let ctx = Context::new(77);
        let (eager, next) = ctx
            .generate_random_samples_array::<f64, _>(8, DistributionType::Uniform)
            .unwrap();
        let (lazy, _) = ctx
            .allocate_random_samples_array(8, DistributionType::Uniform)
            .unwrap();
        assert_eq!(next.counter(), 8);
        for (i, v) in eager.iter().enumerate() {
            assert_eq!(*v, lazy.get::<f64>(i).unwrap());
        }
    }
}
