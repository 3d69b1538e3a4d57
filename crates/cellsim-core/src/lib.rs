//! Agent-based cell simulation kernel: movement strategies, morphology geometry, neighbour
//! interactions, per-cell state machines and the randomly ordered per-tick scheduler.

pub mod agent;
pub mod cell;
pub mod interaction;
pub mod measurement;
pub mod morphology;
pub mod movement;
pub mod random;
pub mod site;
pub mod state;
pub mod vector;
pub mod world;

use cellsim_index::UniformGridIndex;
use serde::{Deserialize, Serialize};
use slotmap::new_key_type;
use std::fmt;

pub use agent::{Agent, AgentCore};
pub use cell::{Cell, CellFeature, CellTypeConfig, Ingestion};
pub use interaction::{InteractionEvent, InteractionEventKind, InteractionParameters, Interactions};
pub use measurement::{MeasurementRecord, MeasurementSink, NullMeasurements, RecordingMeasurements};
pub use morphology::{GeometryError, Morphology, MorphologyParameters, Sphere};
pub use movement::{Movement, MovementKind, MovementParameters};
pub use random::RandomSource;
pub use site::{BoundaryCondition, ExternalField, Site, SiteConfig, UniformGradient};
pub use state::{CellState, StateGraph, StateSpec, TransitionTrigger, INITIAL_STATE};
pub use vector::{SpatialDimensions, Vector3};
pub use world::{CellArena, CellSnapshot, Tick, TickSummary, World, WorldConfig, WorldError};

new_key_type! {
    /// Stable arena handle of a cell; also its key in the neighbourhood locator.
    pub struct AgentKey;
}

/// Unique agent identifier issued by the site's agent manager.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct AgentId(pub u64);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Spatial locator over every live cell's primary shape.
pub type NeighbourhoodLocator = UniformGridIndex<AgentKey>;
