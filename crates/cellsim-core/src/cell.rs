//! Cells: agents with a morphology, a state machine and an interaction registry, plus the
//! randomly ordered per-tick task schedule.

use crate::agent::{Agent, AgentCore};
use crate::interaction::{InteractionEvent, Interactions, Participant};
use crate::measurement::{MeasurementRecord, StateChangeRecord};
use crate::morphology::{
    GeometryError, Morphology, MorphologyParameters, NestedShape, Sphere, collides_inside,
    find_free_interior_position,
};
use crate::movement::{Movement, MovementParameters};
use crate::site::{MigrationBias, Site};
use crate::state::{CellState, INITIAL_STATE, StateMachine};
use crate::vector::Vector3;
use crate::world::CellArena;
use crate::{AgentId, AgentKey};
use cellsim_index::NeighborhoodIndex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Event variable that zeroes the cumulative persistence gradient.
pub const RESET_CUMULATIVE_GRADIENT: &str = "reset-cumulative-gradient";

/// Per agent type parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CellTypeConfig {
    pub movement: MovementParameters,
    pub passive_movement: MovementParameters,
    pub morphology: MorphologyParameters,
    pub initial_state: String,
}

impl Default for CellTypeConfig {
    fn default() -> Self {
        Self {
            movement: MovementParameters::default(),
            passive_movement: MovementParameters::default(),
            morphology: MorphologyParameters::default(),
            initial_state: INITIAL_STATE.to_string(),
        }
    }
}

/// Derived scalar features read by state rules and analysis.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CellFeature {
    MigrationBiasProbability,
    ReceptorDifferenceFrontRear,
}

impl CellFeature {
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "migration-bias-probability" => Some(Self::MigrationBiasProbability),
            "receptor-difference-front-rear" => Some(Self::ReceptorDifferenceFrontRear),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    Movement,
    InteractionsAndStates,
    MorphologyChange,
    FieldInteraction,
}

impl Task {
    const ORDER: [Self; 4] = [
        Self::Movement,
        Self::InteractionsAndStates,
        Self::MorphologyChange,
        Self::FieldInteraction,
    ];
}

/// Agent nested inside a cell, kept with its arena handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingestion {
    pub key: AgentKey,
    pub id: AgentId,
}

#[derive(Debug, Clone)]
pub struct Cell {
    core: AgentCore,
    agent_type: String,
    morphology: Morphology,
    morphology_parameters: MorphologyParameters,
    states: StateMachine,
    interactions: Interactions,
    timestep_last_treatment: Option<f64>,
    cumulative_persistence_gradient: Vector3,
    ingestions: Vec<Ingestion>,
}

impl Agent for Cell {
    fn core(&self) -> &AgentCore {
        &self.core
    }

    fn current_state_name(&self) -> Option<&str> {
        self.states.current_name()
    }

    fn external_representation(&self) -> Option<String> {
        Some(self.morphology.pov_objects(self.core.position))
    }
}

impl Cell {
    /// Build a cell from its type parameters. Strategies and radius draw from the site.
    ///
    /// The cell enters no state until [`Cell::setup`] runs.
    pub fn new(
        id: AgentId,
        agent_type: impl Into<String>,
        position: Vector3,
        current_time: f64,
        config: &CellTypeConfig,
        site: &mut Site,
    ) -> Self {
        let dimensions = site.dimensions();
        let time_step = site.time_step();
        let movement = Movement::from_parameters(&config.movement, dimensions, time_step);
        let passive = Movement::from_parameters(&config.passive_movement, dimensions, time_step);
        let morphology = Morphology::from_parameters(&config.morphology, site.rng_mut());
        Self {
            core: AgentCore::new(id, position, current_time, movement, passive),
            agent_type: agent_type.into(),
            morphology,
            morphology_parameters: config.morphology.clone(),
            states: StateMachine::new(),
            interactions: Interactions::new(site.config().interactions),
            timestep_last_treatment: None,
            cumulative_persistence_gradient: Vector3::ZERO,
            ingestions: Vec::new(),
        }
    }

    #[must_use]
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    #[must_use]
    pub fn morphology(&self) -> &Morphology {
        &self.morphology
    }

    pub fn morphology_mut(&mut self) -> &mut Morphology {
        &mut self.morphology
    }

    /// Primary collision sphere at the current position.
    #[must_use]
    pub fn basic_sphere(&self) -> Sphere {
        self.morphology.basic_sphere(self.core.position)
    }

    #[must_use]
    pub fn state_machine(&self) -> &StateMachine {
        &self.states
    }

    #[must_use]
    pub fn current_cell_state(&self) -> Option<&CellState> {
        self.states.current()
    }

    /// Stored state instance; `None` when the cell never visited `name`.
    #[must_use]
    pub fn cell_state_by_name(&self, name: &str) -> Option<&CellState> {
        self.states.state_by_name(name)
    }

    pub fn cell_state_by_name_mut(&mut self, name: &str) -> Option<&mut CellState> {
        self.states.state_by_name_mut(name)
    }

    #[must_use]
    pub fn interactions(&self) -> &Interactions {
        &self.interactions
    }

    pub(crate) fn interactions_mut(&mut self) -> &mut Interactions {
        &mut self.interactions
    }

    #[must_use]
    pub const fn timestep_last_treatment(&self) -> Option<f64> {
        self.timestep_last_treatment
    }

    #[must_use]
    pub fn treated_in_timestep(&self, current_time: f64) -> bool {
        self.timestep_last_treatment == Some(current_time)
    }

    #[must_use]
    pub const fn cumulative_persistence_gradient(&self) -> Vector3 {
        self.cumulative_persistence_gradient
    }

    #[must_use]
    pub fn ingestions(&self) -> &[Ingestion] {
        &self.ingestions
    }

    /// Record an ingested agent; duplicate ids are ignored. Returns whether it was new.
    pub fn add_ingestion(&mut self, key: AgentKey, id: AgentId) -> bool {
        if self.ingestions.iter().any(|ingestion| ingestion.id == id) {
            return false;
        }
        self.ingestions.push(Ingestion { key, id });
        true
    }

    #[must_use]
    pub fn lifetime(&self, current_time: f64) -> f64 {
        self.core.lifetime(current_time)
    }

    /// Vector from this cell to `other`.
    #[must_use]
    pub fn effective_connection(&self, other: &Self) -> Vector3 {
        self.core.effective_connection(other.core.position)
    }

    fn participant(&self, key: AgentKey) -> Participant {
        Participant {
            key,
            id: self.core.id,
            agent_type: self.agent_type.clone(),
            sphere: self.basic_sphere(),
        }
    }

    fn reindex(&self, key: AgentKey, site: &mut Site) {
        let sphere = self.basic_sphere();
        site.index_shape(key, self.core.id, sphere.center, sphere.radius);
    }

    /// Mark the cell deleted and drop it from the locator.
    pub(crate) fn mark_deleted(&mut self, key: AgentKey, site: &mut Site) {
        if self.core.deleted {
            return;
        }
        self.core.deleted = true;
        site.locator_mut().remove(key);
        debug!(id = %self.core.id, "cell deleted");
    }

    /// Enter `initial_state` and immediately evaluate one transition.
    pub fn setup(&mut self, key: AgentKey, initial_state: &str, current_time: f64, site: &mut Site) {
        self.timestep_last_treatment = None;
        if self.switch_state(key, initial_state, current_time, site) && !self.core.deleted {
            self.state_transition(key, site.time_step(), current_time, site);
        }
    }

    /// Switch to `name` (reusing a visited instance) and evaluate one transition.
    pub fn set_existing_state(
        &mut self,
        key: AgentKey,
        name: &str,
        current_time: f64,
        site: &mut Site,
    ) -> bool {
        if self.core.deleted || !self.switch_state(key, name, current_time, site) {
            return false;
        }
        if !self.core.deleted {
            self.state_transition(key, site.time_step(), current_time, site);
        }
        true
    }

    /// Evaluate the current state's exit rules and switch when one fires.
    pub fn state_transition(
        &mut self,
        key: AgentKey,
        time_step: f64,
        current_time: f64,
        site: &mut Site,
    ) {
        if self.core.deleted {
            return;
        }
        let Some(state) = self.states.current_mut() else {
            return;
        };
        if let Some(next) = state.next_state(time_step, current_time, site.rng_mut()) {
            self.switch_state(key, &next, current_time, site);
        }
    }

    fn switch_state(
        &mut self,
        key: AgentKey,
        name: &str,
        current_time: f64,
        site: &mut Site,
    ) -> bool {
        let from = self.states.current_name().map(str::to_owned);
        let factory = site.cell_state_factory();
        let site_id = site.identifier();
        let agent_type = &self.agent_type;
        let flags = self
            .states
            .switch_to(name, current_time, || {
                factory.create_state(site_id, agent_type, name)
            })
            .map(|state| (state.spec().deletes_cell, state.spec().immobile));
        let Some((deletes_cell, immobile)) = flags else {
            site.report_anomaly(
                self.core.id,
                current_time,
                format!("state {name} is not configured for {}", self.agent_type),
            );
            return false;
        };
        debug!(id = %self.core.id, from = ?from, to = name, "state changed");
        site.record(MeasurementRecord::StateChange(StateChangeRecord {
            time: current_time,
            agent: self.core.id,
            from,
            to: name.to_string(),
        }));
        self.core.position_shift_allowed = !immobile;
        site.stop_run_for_certain_state(self.core.id, name, current_time);
        if deletes_cell {
            self.mark_deleted(key, site);
        }
        true
    }

    /// Deliver an interaction notification to the current state.
    pub fn receive_interaction_event(&mut self, event: &InteractionEvent) {
        if let Some(state) = self.states.current_mut() {
            state.handle_interaction_event(event);
        }
    }

    /// Place the cell at `position` and re-index it.
    pub fn set_position(&mut self, key: AgentKey, position: Vector3, site: &mut Site) {
        if self.core.deleted {
            return;
        }
        self.core.previous_position = self.core.position;
        self.core.position = position;
        self.reindex(key, site);
    }

    /// Apply `shift`, enforcing the boundary policy. Returns `false` when shifting is not allowed.
    pub fn shift_position(
        &mut self,
        key: AgentKey,
        shift: Vector3,
        current_time: f64,
        site: &mut Site,
    ) -> bool {
        if !self.core.position_shift_allowed || self.core.deleted {
            return false;
        }
        self.core.current_shift = shift;
        self.core.previous_position = self.core.position;
        self.core.position += shift;
        if shift.magnitude() > 0.0 {
            site.adjust_position(&mut self.core.position);
        }
        if site.contains_position(self.core.position) {
            self.reindex(key, site);
        } else {
            site.handle_boundary_cross(key, &mut self.core, shift, current_time);
            if !self.core.deleted {
                self.reindex(key, site);
            }
        }
        true
    }

    fn shift_and_avoid(
        &mut self,
        key: AgentKey,
        shift: Vector3,
        current_time: f64,
        site: &mut Site,
        cells: &CellArena,
    ) {
        let shift = site.dimensions().project(shift);
        let origin = self.core.position;
        if !self.shift_position(key, shift, current_time, site)
            || self.core.deleted
            || !(shift.magnitude() > 0.0)
        {
            return;
        }
        let me = self.participant(key);
        let correction = self
            .interactions
            .avoid_new_interactions(&me, current_time, cells, site);
        if correction.magnitude() > 0.0 && self.shift_position(key, correction, current_time, site)
        {
            self.core.previous_position = origin;
            self.core.current_shift = shift + correction;
        }
    }

    /// Active movement for one tick.
    pub fn move_cell(
        &mut self,
        key: AgentKey,
        time_step: f64,
        current_time: f64,
        site: &mut Site,
        cells: &CellArena,
    ) {
        if self.core.deleted {
            return;
        }
        let dimensions = site.dimensions();
        let shift = self
            .core
            .movement
            .displacement(time_step, None, site.rng_mut(), dimensions);
        self.shift_and_avoid(key, shift, current_time, site, cells);
    }

    /// Passive (carrier-driven) movement for one tick.
    pub fn passive_move(
        &mut self,
        key: AgentKey,
        time_step: f64,
        current_time: f64,
        site: &mut Site,
        cells: &CellArena,
    ) {
        if self.core.deleted || self.core.passive_movement.is_stationary() {
            return;
        }
        let dimensions = site.dimensions();
        let shift = self
            .core
            .passive_movement
            .displacement(time_step, None, site.rng_mut(), dimensions);
        self.shift_and_avoid(key, shift, current_time, site, cells);
    }

    /// Grow the basic sphere by `growth_rate * dt` within the configured radius limits.
    pub fn change_morphology(&mut self, key: AgentKey, time_step: f64, site: &mut Site) {
        let parameters = &self.morphology_parameters;
        if self.core.deleted || parameters.growth_rate == 0.0 {
            return;
        }
        let mut radius =
            (self.morphology.radius() + parameters.growth_rate * time_step).max(parameters.min_radius);
        if let Some(max_radius) = parameters.max_radius {
            radius = radius.min(max_radius);
        }
        let radius = radius.max(f64::EPSILON);
        self.morphology.set_radius(radius);
        self.reindex(key, site);
    }

    /// Accumulate the site's field gradient over one tick.
    pub fn interact_with_field(&mut self, time_step: f64, current_time: f64, site: &Site) {
        if self.core.deleted {
            return;
        }
        let gradient = site.field_gradient(self.core.position, current_time);
        self.cumulative_persistence_gradient += site.dimensions().project(gradient) * time_step;
    }

    #[must_use]
    pub fn feature_value(&self, feature: CellFeature, bias: &MigrationBias) -> f64 {
        let magnitude = self.cumulative_persistence_gradient.magnitude();
        match feature {
            CellFeature::MigrationBiasProbability => bias.probability(magnitude),
            CellFeature::ReceptorDifferenceFrontRear => magnitude,
        }
    }

    /// Feature lookup by its textual name; unknown names read as zero.
    #[must_use]
    pub fn feature_value_by_name(&self, name: &str, bias: &MigrationBias) -> f64 {
        CellFeature::from_name(name).map_or(0.0, |feature| self.feature_value(feature, bias))
    }

    /// Apply a named event variable. Returns whether the name was recognised.
    pub fn apply_event_variable(&mut self, name: &str) -> bool {
        match name {
            RESET_CUMULATIVE_GRADIENT => {
                self.cumulative_persistence_gradient = Vector3::ZERO;
                true
            }
            _ => false,
        }
    }

    /// Restart the cell at `position` under a fresh id.
    pub fn reset(&mut self, key: AgentKey, position: Vector3, current_time: f64, site: &mut Site) {
        if self.core.deleted {
            return;
        }
        let id = site.agent_manager_mut().issue();
        self.core.reset(id, position, current_time);
        self.timestep_last_treatment = None;
        self.interactions.clear();
        self.reindex(key, site);
    }

    /// Whether a body of `incoming_radius` centred at `point` lies fully inside this cell.
    #[must_use]
    pub fn contains_position(&self, point: Vector3, incoming_radius: f64) -> bool {
        self.basic_sphere().contains_interior(incoming_radius, point)
    }

    /// Random interior point for a body of `incoming_radius` that the site also contains.
    pub fn find_free_interior_position(
        &self,
        incoming_radius: f64,
        site: &mut Site,
        mut accept: impl FnMut(Vector3) -> bool,
    ) -> Result<Vector3, GeometryError> {
        let host = self.basic_sphere();
        let attempts = site.config().max_placement_attempts;
        let dimensions = site.dimensions();
        let bounds = site.bounds();
        find_free_interior_position(
            &host,
            incoming_radius,
            site.rng_mut(),
            dimensions,
            attempts,
            |point| bounds.contains(point) && accept(point),
        )
    }

    fn nested_shape(&self) -> NestedShape {
        NestedShape {
            id: self.core.id.0,
            sphere: self.basic_sphere(),
        }
    }

    /// Whether `incoming`, nested inside this cell, overlaps any other nested member.
    #[must_use]
    pub fn collides_inside(&self, incoming: &Self, members: &[&Self]) -> bool {
        let members: Vec<NestedShape> = members.iter().map(|m| m.nested_shape()).collect();
        collides_inside(&self.nested_shape(), &incoming.nested_shape(), &members)
    }

    /// Run this tick's tasks in a fresh random order, abandoning the rest on deletion.
    ///
    /// A cell already treated at `current_time` only moves.
    pub fn do_all_actions_for_timestep(
        &mut self,
        key: AgentKey,
        time_step: f64,
        current_time: f64,
        site: &mut Site,
        cells: &mut CellArena,
    ) {
        if self.treated_in_timestep(current_time) {
            if !self.core.deleted {
                self.move_cell(key, time_step, current_time, site, cells);
            }
            return;
        }
        let order = site.rng_mut().generate_permutation(Task::ORDER.len());
        for task in order.into_iter().map(|index| Task::ORDER[index]) {
            if self.core.deleted {
                break;
            }
            match task {
                Task::Movement => self.move_cell(key, time_step, current_time, site, cells),
                Task::InteractionsAndStates => {
                    self.interactions_and_states(key, time_step, current_time, site, cells);
                }
                Task::MorphologyChange => self.change_morphology(key, time_step, site),
                Task::FieldInteraction => self.interact_with_field(time_step, current_time, site),
            }
        }
        self.timestep_last_treatment = Some(current_time);
    }

    fn interactions_and_states(
        &mut self,
        key: AgentKey,
        time_step: f64,
        current_time: f64,
        site: &mut Site,
        cells: &mut CellArena,
    ) {
        let order = site.rng_mut().generate_permutation(2);
        for change in order {
            if self.core.deleted {
                return;
            }
            if change == 0 {
                self.state_transition(key, time_step, current_time, site);
                if let Some(name) = self.states.current_name() {
                    site.stop_run_for_certain_state(self.core.id, name, current_time);
                }
            } else {
                let me = self.participant(key);
                let events = self
                    .interactions
                    .do_whole_process(&me, current_time, cells, site);
                for event in &events {
                    self.receive_interaction_event(event);
                }
            }
        }
    }
}
