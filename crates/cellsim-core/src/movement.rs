//! Movement strategies producing per-timestep displacement vectors.
//!
//! Strategies never touch the agent: they return a shift that the owning agent applies.

use crate::random::RandomSource;
use crate::vector::{SpatialDimensions, Vector3};
use serde::{Deserialize, Serialize};

/// Strategy selector used in agent parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MovementKind {
    #[default]
    Stationary,
    RandomWalk,
    PersistentRandomWalk,
}

/// Raw movement parameters as configured per agent type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MovementParameters {
    pub kind: MovementKind,
    /// Mean step length per timestep; zero selects the diffusion calibration for random walks.
    pub mean: f64,
    pub std_dev: f64,
    pub diffusion_coefficient: f64,
    pub persistence_time: f64,
}

impl Default for MovementParameters {
    fn default() -> Self {
        Self {
            kind: MovementKind::Stationary,
            mean: 0.0,
            std_dev: 0.0,
            diffusion_coefficient: 0.0,
            persistence_time: 0.0,
        }
    }
}

/// Memoryless walk: normal step length, uniform direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomWalk {
    pub mean: f64,
    pub std_dev: f64,
}

impl RandomWalk {
    #[must_use]
    pub const fn new(mean: f64, std_dev: f64) -> Self {
        Self { mean, std_dev }
    }

    /// Deterministic step length `sqrt(2 * d * D / dt)` with zero variance.
    #[must_use]
    pub fn from_diffusion(
        diffusion_coefficient: f64,
        dimensions: SpatialDimensions,
        time_step: f64,
    ) -> Self {
        let d = dimensions.count() as f64;
        let speed = if time_step > 0.0 && diffusion_coefficient > 0.0 {
            (2.0 * d * diffusion_coefficient / time_step).sqrt()
        } else {
            0.0
        };
        Self::new(speed, 0.0)
    }

    fn displacement(&self, rng: &mut RandomSource, dimensions: SpatialDimensions) -> Vector3 {
        let length = rng.generate_normal(self.mean, self.std_dev).max(0.0);
        rng.unit_direction(dimensions) * length
    }
}

/// Walk whose direction decays towards a fresh sample with weight `exp(-dt / tau)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistentRandomWalk {
    pub persistence_time: f64,
    pub mean: f64,
    #[serde(skip)]
    direction: Option<Vector3>,
}

impl PersistentRandomWalk {
    #[must_use]
    pub const fn new(persistence_time: f64, mean: f64) -> Self {
        Self {
            persistence_time,
            mean,
            direction: None,
        }
    }

    /// Direction used by the most recent step.
    #[must_use]
    pub const fn direction(&self) -> Option<Vector3> {
        self.direction
    }

    /// Weight of the previous direction for a step of `time_step`.
    #[must_use]
    pub fn memory_weight(persistence_time: f64, time_step: f64) -> f64 {
        if !(persistence_time > 0.0) {
            return 0.0;
        }
        if persistence_time.is_infinite() {
            return 1.0;
        }
        (-time_step / persistence_time).exp()
    }

    fn displacement(
        &mut self,
        time_step: f64,
        persistence_override: Option<f64>,
        rng: &mut RandomSource,
        dimensions: SpatialDimensions,
    ) -> Vector3 {
        let fresh = rng.unit_direction(dimensions);
        let tau = persistence_override.unwrap_or(self.persistence_time);
        let next = match self.direction {
            Some(previous) => {
                let weight = Self::memory_weight(tau, time_step);
                (previous * weight + fresh * (1.0 - weight))
                    .normalized()
                    .unwrap_or(fresh)
            }
            None => fresh,
        };
        let next = dimensions.project(next);
        self.direction = Some(next);
        next * self.mean.max(0.0)
    }
}

/// Movement strategy owned by an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Movement {
    #[default]
    Stationary,
    RandomWalk(RandomWalk),
    PersistentRandomWalk(PersistentRandomWalk),
}

impl Movement {
    /// Build a strategy from configured parameters.
    #[must_use]
    pub fn from_parameters(
        parameters: &MovementParameters,
        dimensions: SpatialDimensions,
        time_step: f64,
    ) -> Self {
        match parameters.kind {
            MovementKind::Stationary => Self::Stationary,
            MovementKind::RandomWalk if parameters.mean == 0.0 => Self::RandomWalk(
                RandomWalk::from_diffusion(parameters.diffusion_coefficient, dimensions, time_step),
            ),
            MovementKind::RandomWalk => {
                Self::RandomWalk(RandomWalk::new(parameters.mean, parameters.std_dev))
            }
            MovementKind::PersistentRandomWalk => Self::PersistentRandomWalk(
                PersistentRandomWalk::new(parameters.persistence_time, parameters.mean),
            ),
        }
    }

    #[must_use]
    pub const fn is_stationary(&self) -> bool {
        matches!(self, Self::Stationary)
    }

    #[must_use]
    pub const fn kind(&self) -> MovementKind {
        match self {
            Self::Stationary => MovementKind::Stationary,
            Self::RandomWalk(_) => MovementKind::RandomWalk,
            Self::PersistentRandomWalk(_) => MovementKind::PersistentRandomWalk,
        }
    }

    /// Displacement for one timestep. `persistence_override` replaces the persistence time of
    /// correlated walks for this call only.
    pub fn displacement(
        &mut self,
        time_step: f64,
        persistence_override: Option<f64>,
        rng: &mut RandomSource,
        dimensions: SpatialDimensions,
    ) -> Vector3 {
        match self {
            Self::Stationary => Vector3::ZERO,
            Self::RandomWalk(walk) => walk.displacement(rng, dimensions),
            Self::PersistentRandomWalk(walk) => {
                walk.displacement(time_step, persistence_override, rng, dimensions)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean_step_correlation(walk: &mut Movement, rng: &mut RandomSource, steps: usize) -> f64 {
        let mut previous = walk
            .displacement(1.0, None, rng, SpatialDimensions::Three)
            .normalized()
            .expect("non-zero step");
        let mut total = 0.0;
        for _ in 0..steps {
            let next = walk
                .displacement(1.0, None, rng, SpatialDimensions::Three)
                .normalized()
                .expect("non-zero step");
            total += previous.dot(next);
            previous = next;
        }
        total / steps as f64
    }

    #[test]
    fn stationary_never_moves() {
        let mut rng = RandomSource::from_seed(5);
        let mut movement = Movement::from_parameters(
            &MovementParameters::default(),
            SpatialDimensions::Three,
            1.0,
        );
        assert!(movement.is_stationary());
        for _ in 0..10 {
            assert_eq!(
                movement.displacement(1.0, None, &mut rng, SpatialDimensions::Three),
                Vector3::ZERO
            );
        }
    }

    #[test]
    fn diffusion_calibrated_walk_matches_expected_step_length() {
        let params = MovementParameters {
            kind: MovementKind::RandomWalk,
            diffusion_coefficient: 3.0,
            ..MovementParameters::default()
        };
        let time_step = 0.5;
        let expected = (2.0 * 3.0 * 3.0_f64 / time_step).sqrt();
        let mut movement = Movement::from_parameters(&params, SpatialDimensions::Three, time_step);
        let mut rng = RandomSource::from_seed(21);
        let samples = 2_000;
        let mut total = 0.0;
        for _ in 0..samples {
            total += movement
                .displacement(time_step, None, &mut rng, SpatialDimensions::Three)
                .magnitude();
        }
        let average = total / f64::from(samples);
        assert!((average - expected).abs() < 1e-9 * expected.max(1.0));
    }

    #[test]
    fn normal_walk_averages_to_mean_and_clips_negative_lengths() {
        let mut movement = Movement::RandomWalk(RandomWalk::new(2.0, 0.5));
        let mut rng = RandomSource::from_seed(8);
        let samples = 5_000;
        let mut total = 0.0;
        for _ in 0..samples {
            total += movement
                .displacement(1.0, None, &mut rng, SpatialDimensions::Three)
                .magnitude();
        }
        let average = total / f64::from(samples);
        assert!((average - 2.0).abs() < 0.05, "average step {average}");

        let mut shrinking = Movement::RandomWalk(RandomWalk::new(-5.0, 0.1));
        let step = shrinking.displacement(1.0, None, &mut rng, SpatialDimensions::Three);
        assert_eq!(step.magnitude(), 0.0);
    }

    #[test]
    fn planar_walks_keep_z_at_zero() {
        let mut rng = RandomSource::from_seed(2);
        let mut walk = Movement::RandomWalk(RandomWalk::new(1.0, 0.2));
        let mut persistent = Movement::PersistentRandomWalk(PersistentRandomWalk::new(4.0, 1.0));
        for _ in 0..50 {
            assert_eq!(walk.displacement(1.0, None, &mut rng, SpatialDimensions::Two).z, 0.0);
            assert_eq!(
                persistent
                    .displacement(1.0, None, &mut rng, SpatialDimensions::Two)
                    .z,
                0.0
            );
        }
    }

    #[test]
    fn long_persistence_keeps_direction() {
        let mut rng = RandomSource::from_seed(13);
        let mut walk =
            Movement::PersistentRandomWalk(PersistentRandomWalk::new(f64::INFINITY, 1.5));
        let correlation = mean_step_correlation(&mut walk, &mut rng, 200);
        assert!(correlation > 0.999, "correlation {correlation}");
    }

    #[test]
    fn vanishing_persistence_decorrelates_steps() {
        let mut rng = RandomSource::from_seed(17);
        let mut walk = Movement::PersistentRandomWalk(PersistentRandomWalk::new(0.0, 1.5));
        let correlation = mean_step_correlation(&mut walk, &mut rng, 4_000);
        assert!(correlation.abs() < 0.05, "correlation {correlation}");
    }

    #[test]
    fn persistence_override_applies_to_single_call() {
        let mut rng = RandomSource::from_seed(4);
        let mut walk = PersistentRandomWalk::new(0.0, 1.0);
        let first = walk.displacement(1.0, None, &mut rng, SpatialDimensions::Three);
        let second = walk.displacement(1.0, Some(f64::INFINITY), &mut rng, SpatialDimensions::Three);
        assert!((first.dot(second) - 1.0).abs() < 1e-9);
        assert_eq!(walk.persistence_time, 0.0);
        assert_eq!(PersistentRandomWalk::memory_weight(2.0, 2.0), (-1.0_f64).exp());
    }
}
