//! Agent capability interface and the bookkeeping every agent carries.

use crate::AgentId;
use crate::movement::Movement;
use crate::vector::Vector3;

/// Read-side capabilities exposed to the environment and to rendering/analysis collaborators.
pub trait Agent {
    fn core(&self) -> &AgentCore;

    fn id(&self) -> AgentId {
        self.core().id
    }

    fn position(&self) -> Vector3 {
        self.core().position
    }

    fn is_deleted(&self) -> bool {
        self.core().deleted
    }

    /// Name of the current biological state, if the agent has one.
    fn current_state_name(&self) -> Option<&str> {
        None
    }

    /// Scene description for external renderers; concrete shapes override this.
    fn external_representation(&self) -> Option<String> {
        None
    }
}

/// Identity, kinematics and lifecycle flags shared by all agents.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentCore {
    pub(crate) id: AgentId,
    pub(crate) position: Vector3,
    pub(crate) previous_position: Vector3,
    pub(crate) initial_position: Vector3,
    pub(crate) initial_time: f64,
    pub(crate) current_shift: Vector3,
    pub(crate) position_shift_allowed: bool,
    pub(crate) deleted: bool,
    pub(crate) movement: Movement,
    pub(crate) passive_movement: Movement,
}

impl AgentCore {
    #[must_use]
    pub fn new(
        id: AgentId,
        position: Vector3,
        initial_time: f64,
        movement: Movement,
        passive_movement: Movement,
    ) -> Self {
        Self {
            id,
            position,
            previous_position: position,
            initial_position: position,
            initial_time,
            current_shift: Vector3::ZERO,
            position_shift_allowed: true,
            deleted: false,
            movement,
            passive_movement,
        }
    }

    #[must_use]
    pub const fn id(&self) -> AgentId {
        self.id
    }

    #[must_use]
    pub const fn position(&self) -> Vector3 {
        self.position
    }

    #[must_use]
    pub const fn previous_position(&self) -> Vector3 {
        self.previous_position
    }

    #[must_use]
    pub const fn initial_position(&self) -> Vector3 {
        self.initial_position
    }

    #[must_use]
    pub const fn initial_time(&self) -> f64 {
        self.initial_time
    }

    /// Last applied displacement.
    #[must_use]
    pub const fn current_shift(&self) -> Vector3 {
        self.current_shift
    }

    #[must_use]
    pub const fn position_shift_allowed(&self) -> bool {
        self.position_shift_allowed
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }

    #[must_use]
    pub fn movement(&self) -> &Movement {
        &self.movement
    }

    #[must_use]
    pub fn passive_movement(&self) -> &Movement {
        &self.passive_movement
    }

    #[must_use]
    pub fn lifetime(&self, current_time: f64) -> f64 {
        current_time - self.initial_time
    }

    /// Vector from this agent to `other`.
    #[must_use]
    pub fn effective_connection(&self, other: Vector3) -> Vector3 {
        other - self.position
    }

    /// Restart the lifecycle at `position` under a fresh id.
    pub(crate) fn reset(&mut self, id: AgentId, position: Vector3, current_time: f64) {
        self.id = id;
        self.position = position;
        self.previous_position = position;
        self.initial_position = position;
        self.initial_time = current_time;
        self.current_shift = Vector3::ZERO;
    }
}
