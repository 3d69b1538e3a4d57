//! Environment boundary: owns the locator, the random source, id issuing, the state factory
//! and the measurement sink, and decides what happens when an agent leaves the bounds.

use crate::agent::AgentCore;
use crate::interaction::InteractionParameters;
use crate::measurement::{
    AnomalyRecord, BoundaryCrossRecord, MeasurementRecord, MeasurementSink, NullMeasurements,
};
use crate::random::RandomSource;
use crate::state::CellStateFactory;
use crate::vector::{SpatialDimensions, Vector3};
use crate::world::WorldError;
use crate::{AgentId, AgentKey, NeighbourhoodLocator};
use cellsim_index::{Footprint, NeighborhoodIndex, UniformGridIndex};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What happens to an agent whose shift leaves the site.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BoundaryCondition {
    /// Leaving the site deletes the agent.
    #[default]
    Absorbing,
    /// Positions are mirrored back at the walls.
    Reflecting,
    /// Positions wrap around to the opposite wall.
    Periodic,
}

/// Constants turning the cumulative persistence gradient into a migration-bias probability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MigrationBias {
    pub scale: f64,
    pub normaliser: f64,
}

impl Default for MigrationBias {
    fn default() -> Self {
        Self {
            scale: 0.6,
            normaliser: 0.424 * 500.0,
        }
    }
}

impl MigrationBias {
    /// `min(1, |g| * scale / normaliser)`.
    #[must_use]
    pub fn probability(&self, gradient_magnitude: f64) -> f64 {
        if !(self.normaliser > 0.0) {
            return 0.0;
        }
        (gradient_magnitude * self.scale / self.normaliser).min(1.0)
    }
}

/// Static configuration of a site.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SiteConfig {
    pub identifier: String,
    pub dimensions: SpatialDimensions,
    pub lower_bound: Vector3,
    pub upper_bound: Vector3,
    pub boundary: BoundaryCondition,
    /// Duration of one tick.
    pub time_step: f64,
    /// Optional RNG seed for deterministic runs.
    pub rng_seed: Option<u64>,
    /// Bucket edge of the neighbourhood locator.
    pub locator_cell_size: f64,
    /// Retry budget of interior placement.
    pub max_placement_attempts: usize,
    /// Entering any of these states requests the run to stop.
    pub stop_states: Vec<String>,
    pub interactions: InteractionParameters,
    pub migration_bias: MigrationBias,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            identifier: "site".to_string(),
            dimensions: SpatialDimensions::Three,
            lower_bound: Vector3::ZERO,
            upper_bound: Vector3::new(100.0, 100.0, 100.0),
            boundary: BoundaryCondition::Absorbing,
            time_step: 1.0,
            rng_seed: None,
            locator_cell_size: 20.0,
            max_placement_attempts: 1_000,
            stop_states: Vec::new(),
            interactions: InteractionParameters::default(),
            migration_bias: MigrationBias::default(),
        }
    }
}

impl SiteConfig {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.identifier.is_empty() {
            return Err(WorldError::InvalidConfig("site identifier must be non-empty"));
        }
        if !(self.time_step > 0.0) || !self.time_step.is_finite() {
            return Err(WorldError::InvalidConfig("time_step must be positive and finite"));
        }
        if !self.lower_bound.is_finite() || !self.upper_bound.is_finite() {
            return Err(WorldError::InvalidConfig("site bounds must be finite"));
        }
        let lo = self.dimensions.project(self.lower_bound);
        let hi = self.dimensions.project(self.upper_bound);
        let axes = self.dimensions.count();
        if (0..axes).any(|axis| lo.to_array()[axis] >= hi.to_array()[axis]) {
            return Err(WorldError::InvalidConfig(
                "upper_bound must exceed lower_bound on every active axis",
            ));
        }
        if !(self.locator_cell_size > 0.0) || !self.locator_cell_size.is_finite() {
            return Err(WorldError::InvalidConfig("locator_cell_size must be positive"));
        }
        if self.max_placement_attempts == 0 {
            return Err(WorldError::InvalidConfig(
                "max_placement_attempts must be positive",
            ));
        }
        if self.interactions.contact_tolerance < 0.0 {
            return Err(WorldError::InvalidConfig(
                "contact_tolerance must be non-negative",
            ));
        }
        Ok(())
    }

    fn seeded_random(&self) -> RandomSource {
        match self.rng_seed {
            Some(seed) => RandomSource::from_seed(seed),
            None => RandomSource::from_entropy(),
        }
    }
}

/// Axis-aligned extent of a site over its active axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SiteBounds {
    pub lower: Vector3,
    pub upper: Vector3,
    pub dimensions: SpatialDimensions,
}

impl SiteBounds {
    /// Inclusive containment on every active axis.
    #[must_use]
    pub fn contains(&self, position: Vector3) -> bool {
        let p = position.to_array();
        let lo = self.lower.to_array();
        let hi = self.upper.to_array();
        (0..self.dimensions.count()).all(|axis| p[axis] >= lo[axis] && p[axis] <= hi[axis])
    }

    #[must_use]
    pub fn clamp(&self, position: Vector3) -> Vector3 {
        let lo = self.lower.to_array();
        let hi = self.upper.to_array();
        let mut p = position.to_array();
        for axis in 0..self.dimensions.count() {
            p[axis] = p[axis].clamp(lo[axis], hi[axis]);
        }
        Vector3::from_array(p)
    }
}

/// Issues unique agent ids.
#[derive(Debug, Clone, Default)]
pub struct AgentManager {
    next_id: u64,
}

impl AgentManager {
    /// Id the next agent will receive.
    #[must_use]
    pub const fn next_id(&self) -> AgentId {
        AgentId(self.next_id)
    }

    pub fn advance_id_counter(&mut self) {
        self.next_id += 1;
    }

    /// Take the next id and advance the counter.
    pub fn issue(&mut self) -> AgentId {
        let id = self.next_id();
        self.advance_id_counter();
        id
    }
}

/// External field (e.g. a chemoattractant) sampled by the field-interaction task.
pub trait ExternalField: Send {
    fn gradient_at(&self, position: Vector3, time: f64) -> Vector3;
}

/// Spatially and temporally constant gradient.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UniformGradient(pub Vector3);

impl ExternalField for UniformGradient {
    fn gradient_at(&self, _position: Vector3, _time: f64) -> Vector3 {
        self.0
    }
}

/// Environment collaborator consumed by every agent.
pub struct Site {
    config: SiteConfig,
    rng: RandomSource,
    locator: NeighbourhoodLocator,
    agents: AgentManager,
    states: CellStateFactory,
    measurements: Box<dyn MeasurementSink>,
    field: Option<Box<dyn ExternalField>>,
    stop_requested: bool,
    boundary_crossings: usize,
}

impl Site {
    pub fn new(config: SiteConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let locator = UniformGridIndex::try_new(config.locator_cell_size)?;
        let rng = config.seeded_random();
        debug!(site = %config.identifier, seed = rng.seed(), "site created");
        Ok(Self {
            config,
            rng,
            locator,
            agents: AgentManager::default(),
            states: CellStateFactory::new(),
            measurements: Box::new(NullMeasurements),
            field: None,
            stop_requested: false,
            boundary_crossings: 0,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SiteConfig {
        &self.config
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.config.identifier
    }

    #[must_use]
    pub const fn dimensions(&self) -> SpatialDimensions {
        self.config.dimensions
    }

    #[must_use]
    pub const fn time_step(&self) -> f64 {
        self.config.time_step
    }

    pub fn rng_mut(&mut self) -> &mut RandomSource {
        &mut self.rng
    }

    #[must_use]
    pub fn locator(&self) -> &NeighbourhoodLocator {
        &self.locator
    }

    pub fn locator_mut(&mut self) -> &mut NeighbourhoodLocator {
        &mut self.locator
    }

    /// Re-index the primary shape of `key`. Unknown keys are inserted.
    pub(crate) fn index_shape(&mut self, key: AgentKey, id: AgentId, center: Vector3, radius: f64) {
        if let Err(error) = self
            .locator
            .insert(key, Footprint::new(center.to_array(), radius))
        {
            warn!(%id, %error, "failed to index shape");
        }
    }

    #[must_use]
    pub fn agent_manager(&self) -> &AgentManager {
        &self.agents
    }

    pub fn agent_manager_mut(&mut self) -> &mut AgentManager {
        &mut self.agents
    }

    #[must_use]
    pub fn cell_state_factory(&self) -> &CellStateFactory {
        &self.states
    }

    pub fn cell_state_factory_mut(&mut self) -> &mut CellStateFactory {
        &mut self.states
    }

    /// Replace the measurement sink.
    pub fn set_measurements(&mut self, sink: Box<dyn MeasurementSink>) {
        self.measurements = sink;
    }

    pub fn measurements_mut(&mut self) -> &mut dyn MeasurementSink {
        self.measurements.as_mut()
    }

    pub fn record(&mut self, record: MeasurementRecord) {
        self.measurements.record(record);
    }

    /// Log and record a local failure of one agent's operation.
    pub fn report_anomaly(&mut self, agent: AgentId, time: f64, message: impl Into<String>) {
        let message = message.into();
        warn!(%agent, time, %message, "agent anomaly");
        self.record(MeasurementRecord::Anomaly(AnomalyRecord {
            time,
            agent,
            message,
        }));
    }

    pub fn set_external_field(&mut self, field: Box<dyn ExternalField>) {
        self.field = Some(field);
    }

    /// Field gradient at `position`; zero when no field is attached.
    #[must_use]
    pub fn field_gradient(&self, position: Vector3, time: f64) -> Vector3 {
        self.field
            .as_ref()
            .map_or(Vector3::ZERO, |field| field.gradient_at(position, time))
    }

    #[must_use]
    pub const fn bounds(&self) -> SiteBounds {
        SiteBounds {
            lower: self.config.lower_bound,
            upper: self.config.upper_bound,
            dimensions: self.config.dimensions,
        }
    }

    /// Whether `position` lies within the bounds on every active axis.
    #[must_use]
    pub fn contains_position(&self, position: Vector3) -> bool {
        self.bounds().contains(position)
    }

    /// Apply the boundary policy to `position`: wrap when periodic, mirror when reflecting.
    pub fn adjust_position(&self, position: &mut Vector3) {
        let lo = self.config.lower_bound.to_array();
        let hi = self.config.upper_bound.to_array();
        let mut p = position.to_array();
        for axis in 0..self.config.dimensions.count() {
            let extent = hi[axis] - lo[axis];
            match self.config.boundary {
                BoundaryCondition::Absorbing => {}
                BoundaryCondition::Periodic => {
                    p[axis] = lo[axis] + (p[axis] - lo[axis]).rem_euclid(extent);
                }
                BoundaryCondition::Reflecting => {
                    let period = 2.0 * extent;
                    let folded = (p[axis] - lo[axis]).rem_euclid(period);
                    p[axis] = lo[axis] + if folded > extent { period - folded } else { folded };
                }
            }
        }
        *position = Vector3::from_array(p);
    }

    /// Handle an agent whose shift carried it outside the bounds.
    ///
    /// Absorbing sites delete the agent and drop it from the locator; other policies clamp
    /// the position back inside.
    pub fn handle_boundary_cross(
        &mut self,
        key: AgentKey,
        agent: &mut AgentCore,
        shift: Vector3,
        current_time: f64,
    ) {
        self.boundary_crossings += 1;
        let deleted = match self.config.boundary {
            BoundaryCondition::Absorbing => {
                agent.deleted = true;
                self.locator.remove(key);
                true
            }
            BoundaryCondition::Reflecting | BoundaryCondition::Periodic => {
                agent.position = self.bounds().clamp(agent.position);
                false
            }
        };
        debug!(id = %agent.id, %shift, deleted, "boundary crossed");
        self.record(MeasurementRecord::BoundaryCross(BoundaryCrossRecord {
            time: current_time,
            agent: agent.id,
            deleted,
        }));
    }

    /// Request the run to stop when `state` is one of the configured stop states.
    pub fn stop_run_for_certain_state(&mut self, agent: AgentId, state: &str, current_time: f64) {
        if !self.stop_requested && self.config.stop_states.iter().any(|s| s == state) {
            info!(%agent, state, time = current_time, "stop state reached");
            self.stop_requested = true;
        }
    }

    #[must_use]
    pub const fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    /// Boundary crossings handled since the last call.
    pub(crate) fn take_boundary_crossings(&mut self) -> usize {
        std::mem::take(&mut self.boundary_crossings)
    }
}
