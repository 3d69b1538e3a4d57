//! Cell arena and the per-tick scheduler.

use crate::agent::Agent;
use crate::cell::{Cell, CellTypeConfig};
use crate::measurement::MeasurementSink;
use crate::morphology::{GeometryError, NestedShape, Sphere, collides_inside};
use crate::site::{Site, SiteConfig};
use crate::state::StateGraph;
use crate::vector::Vector3;
use crate::{AgentId, AgentKey};
use cellsim_index::{Footprint, IndexError, NeighborhoodIndex};
use serde::{Deserialize, Serialize};
use slotmap::SlotMap;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while configuring or populating a world.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("cell type {0} is not configured")]
    UnknownCellType(String),
    #[error("agent is not present in the world")]
    UnknownAgent,
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Discrete simulation tick counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Tick(pub u64);

impl Tick {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Everything needed to build a world.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    pub site: SiteConfig,
    pub cell_types: BTreeMap<String, CellTypeConfig>,
    /// State graph per agent type.
    pub state_graphs: BTreeMap<String, StateGraph>,
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), WorldError> {
        self.site.validate()?;
        for config in self.cell_types.values() {
            let morphology = &config.morphology;
            if !(morphology.radius > 0.0) || !morphology.radius.is_finite() {
                return Err(WorldError::InvalidConfig("cell radius must be positive"));
            }
            if morphology.std_dev < 0.0 {
                return Err(WorldError::InvalidConfig(
                    "radius std_dev must be non-negative",
                ));
            }
            if morphology.min_radius < 0.0
                || morphology
                    .max_radius
                    .is_some_and(|max_radius| morphology.min_radius > max_radius)
            {
                return Err(WorldError::InvalidConfig(
                    "radius limits must satisfy 0 <= min_radius <= max_radius",
                ));
            }
            for movement in [&config.movement, &config.passive_movement] {
                if movement.mean < 0.0
                    || movement.std_dev < 0.0
                    || movement.diffusion_coefficient < 0.0
                    || movement.persistence_time < 0.0
                {
                    return Err(WorldError::InvalidConfig(
                        "movement parameters must be non-negative",
                    ));
                }
            }
            if config.initial_state.is_empty() {
                return Err(WorldError::InvalidConfig("initial_state must be non-empty"));
            }
        }
        Ok(())
    }
}

/// Slot-map backed cell storage with stable handles and dense iteration order.
///
/// A cell is checked out during its own turn so partner lookups never alias it.
#[derive(Debug, Default)]
pub struct CellArena {
    slots: SlotMap<AgentKey, Option<Cell>>,
    handles: Vec<AgentKey>,
}

impl CellArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored cells, checked out ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: AgentKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Handles in insertion order.
    pub fn iter_handles(&self) -> impl Iterator<Item = AgentKey> + '_ {
        self.handles.iter().copied()
    }

    /// Cells currently present (not checked out), in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (AgentKey, &Cell)> + '_ {
        self.handles
            .iter()
            .filter_map(|key| self.get(*key).map(|cell| (*key, cell)))
    }

    pub fn insert(&mut self, cell: Cell) -> AgentKey {
        let key = self.slots.insert(Some(cell));
        self.handles.push(key);
        key
    }

    /// `None` when absent or checked out.
    #[must_use]
    pub fn get(&self, key: AgentKey) -> Option<&Cell> {
        self.slots.get(key).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, key: AgentKey) -> Option<&mut Cell> {
        self.slots.get_mut(key).and_then(Option::as_mut)
    }

    /// Handle of the cell carrying `id`.
    #[must_use]
    pub fn find_by_id(&self, id: AgentId) -> Option<AgentKey> {
        self.iter()
            .find(|(_, cell)| cell.id() == id)
            .map(|(key, _)| key)
    }

    /// Take a cell out for exclusive processing.
    pub fn checkout(&mut self, key: AgentKey) -> Option<Cell> {
        self.slots.get_mut(key).and_then(Option::take)
    }

    /// Return a checked-out cell to its slot.
    pub fn checkin(&mut self, key: AgentKey, cell: Cell) {
        if let Some(slot) = self.slots.get_mut(key) {
            *slot = Some(cell);
        }
    }

    pub fn remove(&mut self, key: AgentKey) -> Option<Cell> {
        let cell = self.slots.remove(key)?;
        self.handles.retain(|handle| *handle != key);
        cell
    }

    /// Remove every cell in `dead`, preserving the order of the rest.
    pub fn remove_many(&mut self, dead: &HashSet<AgentKey>) -> usize {
        if dead.is_empty() {
            return 0;
        }
        let before = self.handles.len();
        let slots = &mut self.slots;
        self.handles.retain(|key| {
            if dead.contains(key) {
                slots.remove(*key);
                false
            } else {
                true
            }
        });
        before - self.handles.len()
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickSummary {
    pub tick: Tick,
    /// Simulation time after the tick.
    pub time: f64,
    pub live_cells: usize,
    pub deletions: usize,
    pub boundary_crossings: usize,
    pub stop_requested: bool,
}

/// Externally visible state of one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellSnapshot {
    pub id: AgentId,
    pub agent_type: String,
    pub position: Vector3,
    pub radius: f64,
    pub deleted: bool,
    pub state: Option<String>,
}

/// Site plus population, advanced one tick at a time.
pub struct World {
    site: Site,
    cells: CellArena,
    cell_types: BTreeMap<String, CellTypeConfig>,
    tick: Tick,
    time: f64,
}

impl World {
    pub fn new(config: WorldConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let WorldConfig {
            site,
            cell_types,
            state_graphs,
        } = config;
        let mut site = Site::new(site)?;
        let site_id = site.identifier().to_string();
        for (agent_type, graph) in state_graphs {
            site.cell_state_factory_mut()
                .register(site_id.clone(), agent_type, graph);
        }
        Ok(Self {
            site,
            cells: CellArena::new(),
            cell_types,
            tick: Tick::zero(),
            time: 0.0,
        })
    }

    pub fn with_measurements(
        config: WorldConfig,
        sink: Box<dyn MeasurementSink>,
    ) -> Result<Self, WorldError> {
        let mut world = Self::new(config)?;
        world.site.set_measurements(sink);
        Ok(world)
    }

    #[must_use]
    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn site_mut(&mut self) -> &mut Site {
        &mut self.site
    }

    #[must_use]
    pub fn cells(&self) -> &CellArena {
        &self.cells
    }

    #[must_use]
    pub fn cell(&self, key: AgentKey) -> Option<&Cell> {
        self.cells.get(key)
    }

    pub fn cell_mut(&mut self, key: AgentKey) -> Option<&mut Cell> {
        self.cells.get_mut(key)
    }

    /// Run `f` on a checked-out cell with access to the site and the rest of the population.
    pub fn with_cell<R>(
        &mut self,
        key: AgentKey,
        f: impl FnOnce(&mut Cell, &mut Site, &mut CellArena) -> R,
    ) -> Option<R> {
        let mut cell = self.cells.checkout(key)?;
        let result = f(&mut cell, &mut self.site, &mut self.cells);
        self.cells.checkin(key, cell);
        Some(result)
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub const fn time(&self) -> f64 {
        self.time
    }

    #[must_use]
    pub fn cell_type(&self, agent_type: &str) -> Option<&CellTypeConfig> {
        self.cell_types.get(agent_type)
    }

    /// Create a cell of `agent_type` at `position`, index it and enter its initial state.
    pub fn spawn_cell(&mut self, agent_type: &str, position: Vector3) -> Result<AgentKey, WorldError> {
        let config = self
            .cell_types
            .get(agent_type)
            .cloned()
            .ok_or_else(|| WorldError::UnknownCellType(agent_type.to_string()))?;
        if !position.is_finite() {
            return Err(IndexError::NonFinitePosition(position.to_array()).into());
        }
        let position = self.site.dimensions().project(position);
        if !self.site.contains_position(position) {
            return Err(WorldError::InvalidConfig("spawn position lies outside the site"));
        }
        let id = self.site.agent_manager_mut().issue();
        let cell = Cell::new(id, agent_type, position, self.time, &config, &mut self.site);
        let sphere = cell.basic_sphere();
        let key = self.cells.insert(cell);
        if let Err(error) = self.site.locator_mut().insert(
            key,
            Footprint::new(sphere.center.to_array(), sphere.radius),
        ) {
            self.cells.remove(key);
            return Err(error.into());
        }
        if let Some(cell) = self.cells.get_mut(key) {
            cell.setup(key, &config.initial_state, self.time, &mut self.site);
        }
        debug!(%id, agent_type, %position, "cell spawned");
        Ok(key)
    }

    /// Advance one tick: every live cell takes its turn in insertion order, then deleted cells
    /// are dropped.
    pub fn step(&mut self) -> TickSummary {
        let next_tick = self.tick.next();
        let time_step = self.site.time_step();
        let current_time = self.time;

        let handles: Vec<AgentKey> = self.cells.iter_handles().collect();
        for key in handles {
            let Some(mut cell) = self.cells.checkout(key) else {
                continue;
            };
            if !cell.is_deleted() {
                cell.do_all_actions_for_timestep(
                    key,
                    time_step,
                    current_time,
                    &mut self.site,
                    &mut self.cells,
                );
                cell.passive_move(key, time_step, current_time, &mut self.site, &self.cells);
            }
            self.cells.checkin(key, cell);
        }

        let deletions = self.stage_death_cleanup();
        let boundary_crossings = self.site.take_boundary_crossings();
        self.tick = next_tick;
        self.time = next_tick.0 as f64 * time_step;

        let summary = TickSummary {
            tick: self.tick,
            time: self.time,
            live_cells: self.cells.len(),
            deletions,
            boundary_crossings,
            stop_requested: self.site.stop_requested(),
        };
        debug!(
            tick = summary.tick.0,
            live = summary.live_cells,
            deletions,
            boundary_crossings,
            "tick complete"
        );
        summary
    }

    fn stage_death_cleanup(&mut self) -> usize {
        let dead: HashSet<AgentKey> = self
            .cells
            .iter()
            .filter(|(_, cell)| cell.is_deleted())
            .map(|(key, _)| key)
            .collect();
        for key in &dead {
            self.site.locator_mut().remove(*key);
        }
        self.cells.remove_many(&dead)
    }

    /// Advance up to `ticks` ticks, stopping after a tick that entered a stop state.
    pub fn run(&mut self, ticks: u64) -> Vec<TickSummary> {
        let mut summaries = Vec::new();
        for _ in 0..ticks {
            let summary = self.step();
            let stop = summary.stop_requested;
            summaries.push(summary);
            if stop {
                info!(tick = self.tick.0, "run stopped by state");
                break;
            }
        }
        summaries
    }

    /// Move `incoming` to a free interior position of `host` and record the ingestion.
    pub fn insert_into(&mut self, host: AgentKey, incoming: AgentKey) -> Result<Vector3, WorldError> {
        if host == incoming {
            return Err(WorldError::InvalidConfig("a cell cannot be inserted into itself"));
        }
        let incoming_cell = self
            .cells
            .get(incoming)
            .filter(|cell| !cell.is_deleted())
            .ok_or(WorldError::UnknownAgent)?;
        let incoming_id = incoming_cell.id();
        let incoming_radius = incoming_cell.basic_sphere().radius;
        let host_cell = self
            .cells
            .get(host)
            .filter(|cell| !cell.is_deleted())
            .ok_or(WorldError::UnknownAgent)?;
        let host_shape = NestedShape {
            id: host_cell.id().0,
            sphere: host_cell.basic_sphere(),
        };
        let members: Vec<NestedShape> = host_cell
            .ingestions()
            .iter()
            .filter(|ingestion| ingestion.id != incoming_id)
            .filter_map(|ingestion| {
                self.cells
                    .get(ingestion.key)
                    .filter(|member| member.id() == ingestion.id && !member.is_deleted())
            })
            .map(|member| NestedShape {
                id: member.id().0,
                sphere: member.basic_sphere(),
            })
            .collect();

        let point = host_cell.find_free_interior_position(incoming_radius, &mut self.site, |point| {
            let candidate = NestedShape {
                id: incoming_id.0,
                sphere: Sphere::new(point, incoming_radius),
            };
            !collides_inside(&host_shape, &candidate, &members)
        })?;

        if let Some(cell) = self.cells.get_mut(incoming) {
            cell.set_position(incoming, point, &mut self.site);
        }
        if let Some(cell) = self.cells.get_mut(host) {
            cell.add_ingestion(incoming, incoming_id);
        }
        debug!(host = %host_shape.id, incoming = %incoming_id, %point, "cell inserted");
        Ok(point)
    }

    /// Per-cell view in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CellSnapshot> {
        self.cells
            .iter()
            .map(|(_, cell)| CellSnapshot {
                id: cell.id(),
                agent_type: cell.agent_type().to_string(),
                position: cell.position(),
                radius: cell.basic_sphere().radius,
                deleted: cell.is_deleted(),
                state: cell.current_state_name().map(str::to_owned),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::movement::{MovementKind, MovementParameters};
    use crate::state::{INITIAL_STATE, StateSpec, TransitionTrigger};

    fn config() -> WorldConfig {
        let mut config = WorldConfig {
            site: SiteConfig {
                rng_seed: Some(42),
                ..SiteConfig::default()
            },
            ..WorldConfig::default()
        };
        config.cell_types.insert(
            "Walker".into(),
            CellTypeConfig {
                movement: MovementParameters {
                    kind: MovementKind::RandomWalk,
                    mean: 1.0,
                    ..MovementParameters::default()
                },
                ..CellTypeConfig::default()
            },
        );
        config.state_graphs.insert(
            "Walker".into(),
            StateGraph::default().with_state(INITIAL_STATE, StateSpec::default()),
        );
        config
    }

    #[test]
    fn arena_checkout_hides_cell_until_checkin() {
        let mut world = World::new(config()).expect("world");
        let key = world
            .spawn_cell("Walker", Vector3::new(50.0, 50.0, 50.0))
            .expect("spawn");
        let cell = world.cells.checkout(key).expect("cell");
        assert!(world.cells.get(key).is_none());
        assert!(world.cells.contains(key));
        assert_eq!(world.cells.len(), 1);
        world.cells.checkin(key, cell);
        assert!(world.cells.get(key).is_some());
    }

    #[test]
    fn remove_many_preserves_order() {
        let mut world = World::new(config()).expect("world");
        let keys: Vec<AgentKey> = (0..4)
            .map(|i| {
                world
                    .spawn_cell("Walker", Vector3::new(10.0 + 10.0 * f64::from(i), 50.0, 50.0))
                    .expect("spawn")
            })
            .collect();
        let dead: HashSet<AgentKey> = [keys[1], keys[2]].into_iter().collect();
        assert_eq!(world.cells.remove_many(&dead), 2);
        let left: Vec<AgentKey> = world.cells.iter_handles().collect();
        assert_eq!(left, vec![keys[0], keys[3]]);
        assert!(world.cells.remove(keys[0]).is_some());
        assert!(world.cells.remove(keys[0]).is_none());
    }

    #[test]
    fn spawn_rejects_unknown_types_and_outside_positions() {
        let mut world = World::new(config()).expect("world");
        assert_eq!(
            world.spawn_cell("Ghost", Vector3::ZERO),
            Err(WorldError::UnknownCellType("Ghost".into()))
        );
        assert!(matches!(
            world.spawn_cell("Walker", Vector3::new(500.0, 0.0, 0.0)),
            Err(WorldError::InvalidConfig(_))
        ));
        assert!(matches!(
            world.spawn_cell("Walker", Vector3::new(f64::NAN, 0.0, 0.0)),
            Err(WorldError::Index(IndexError::NonFinitePosition(_)))
        ));
        assert!(world.cells().is_empty());
    }

    #[test]
    fn invalid_cell_type_config_is_rejected() {
        let mut bad = config();
        if let Some(walker) = bad.cell_types.get_mut("Walker") {
            walker.morphology.radius = 0.0;
        }
        assert!(matches!(World::new(bad), Err(WorldError::InvalidConfig(_))));
    }

    #[test]
    fn insert_into_keeps_member_handles_and_skips_removed_members() {
        let mut cfg = config();
        cfg.cell_types.insert(
            "Host".into(),
            CellTypeConfig {
                morphology: crate::morphology::MorphologyParameters {
                    radius: 10.0,
                    ..Default::default()
                },
                ..CellTypeConfig::default()
            },
        );
        cfg.state_graphs.insert(
            "Host".into(),
            StateGraph::default().with_state(INITIAL_STATE, StateSpec::default()),
        );
        let mut world = World::new(cfg).expect("world");
        let host = world
            .spawn_cell("Host", Vector3::new(50.0, 50.0, 50.0))
            .expect("host");
        let first = world
            .spawn_cell("Walker", Vector3::new(10.0, 10.0, 10.0))
            .expect("first");
        let second = world
            .spawn_cell("Walker", Vector3::new(20.0, 10.0, 10.0))
            .expect("second");

        world.insert_into(host, first).expect("first insert");
        let first_id = world.cell(first).map(Agent::id).expect("first");
        assert_eq!(
            world.cell(host).map(|cell| cell.ingestions().to_vec()),
            Some(vec![crate::cell::Ingestion {
                key: first,
                id: first_id
            }])
        );

        world.cells.remove(first);
        world.insert_into(host, second).expect("second insert");
        let keys: Vec<AgentKey> = world
            .cell(host)
            .expect("host")
            .ingestions()
            .iter()
            .map(|ingestion| ingestion.key)
            .collect();
        assert_eq!(keys, vec![first, second]);
    }

    #[test]
    fn radius_limits_are_checked_only_against_a_set_maximum() {
        let mut inverted = config();
        if let Some(walker) = inverted.cell_types.get_mut("Walker") {
            walker.morphology.min_radius = 2.0;
            walker.morphology.max_radius = Some(1.0);
        }
        assert!(matches!(inverted.validate(), Err(WorldError::InvalidConfig(_))));
        let mut open_ended = config();
        if let Some(walker) = open_ended.cell_types.get_mut("Walker") {
            walker.morphology.min_radius = 2.0;
            walker.morphology.max_radius = None;
        }
        assert!(open_ended.validate().is_ok());
    }

    #[test]
    fn step_marks_cells_treated_and_advances_time() {
        let mut world = World::new(config()).expect("world");
        let key = world
            .spawn_cell("Walker", Vector3::new(50.0, 50.0, 50.0))
            .expect("spawn");
        let summary = world.step();
        assert_eq!(summary.tick, Tick(1));
        assert_eq!(summary.time, 1.0);
        assert_eq!(summary.live_cells, 1);
        let cell = world.cell(key).expect("cell");
        assert_eq!(cell.timestep_last_treatment(), Some(0.0));
        assert!((cell.position().distance(Vector3::new(50.0, 50.0, 50.0)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn deleting_state_removes_cell_at_end_of_tick() {
        let mut cfg = config();
        cfg.state_graphs.insert(
            "Walker".into(),
            StateGraph::default()
                .with_state(
                    INITIAL_STATE,
                    StateSpec::default()
                        .with_transition("Dead", TransitionTrigger::AfterDuration { duration: 1.0 }),
                )
                .with_state("Dead", StateSpec::default().deleting()),
        );
        let mut world = World::new(cfg).expect("world");
        let key = world
            .spawn_cell("Walker", Vector3::new(50.0, 50.0, 50.0))
            .expect("spawn");
        assert_eq!(world.step().deletions, 0);
        let summary = world.step();
        assert_eq!(summary.deletions, 1);
        assert!(world.cell(key).is_none());
        assert!(!world.site().locator().contains(key));
    }
}
