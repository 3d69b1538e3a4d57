//! Seeded random source shared by every stochastic component of a site.

use crate::vector::{SpatialDimensions, Vector3};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rand_distr::{Distribution, Normal};
use std::f64::consts::TAU;

/// Reproducible generator: identical seeds and call sequences yield identical samples.
#[derive(Debug, Clone)]
pub struct RandomSource {
    seed: u64,
    rng: SmallRng,
}

impl RandomSource {
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Seed from entropy, remembering the drawn seed so the run can be replayed.
    #[must_use]
    pub fn from_entropy() -> Self {
        let seed: u64 = rand::random();
        Self::from_seed(seed)
    }

    /// Seed this source was created with.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform sample in `[min, max)`. Degenerate ranges return `min`.
    pub fn generate_double(&mut self, min: f64, max: f64) -> f64 {
        if !(max > min) || !min.is_finite() || !max.is_finite() {
            return min;
        }
        self.rng.random_range(min..max)
    }

    /// Normal sample; a non-positive or non-finite deviation yields `mean` exactly.
    pub fn generate_normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        if !(std_dev > 0.0) || !std_dev.is_finite() {
            return mean;
        }
        match Normal::new(mean, std_dev) {
            Ok(normal) => normal.sample(&mut self.rng),
            Err(_) => mean,
        }
    }

    /// Uniformly random permutation of `0..n`.
    pub fn generate_permutation(&mut self, n: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut self.rng);
        order
    }

    /// Uniformly distributed unit vector over the active axes.
    pub fn unit_direction(&mut self, dimensions: SpatialDimensions) -> Vector3 {
        match dimensions {
            SpatialDimensions::Two => {
                let angle = self.generate_double(0.0, TAU);
                Vector3::new(angle.cos(), angle.sin(), 0.0)
            }
            SpatialDimensions::Three => {
                let z = self.generate_double(-1.0, 1.0);
                let angle = self.generate_double(0.0, TAU);
                let planar = (1.0 - z * z).max(0.0).sqrt();
                Vector3::new(planar * angle.cos(), planar * angle.sin(), z)
            }
        }
    }
}
