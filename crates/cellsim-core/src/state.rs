//! Named cell states, their successor rules and the per-cell state store.

use crate::interaction::{InteractionEvent, InteractionEventKind};
use crate::random::RandomSource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// State every cell enters on setup unless configured otherwise.
pub const INITIAL_STATE: &str = "InitialCellState";

/// Exit condition of a successor rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum TransitionTrigger {
    /// Fires on the first evaluation.
    Immediate,
    /// Poisson exit: fires with probability `1 - exp(-per_time * dt)`.
    Rate { per_time: f64 },
    /// Fires once the cell has spent `duration` in the state.
    AfterDuration { duration: f64 },
    /// Fires when a contact started since the last evaluation.
    OnContact {
        #[serde(default)]
        partner_type: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRule {
    pub target: String,
    pub trigger: TransitionTrigger,
}

impl TransitionRule {
    #[must_use]
    pub fn new(target: impl Into<String>, trigger: TransitionTrigger) -> Self {
        Self {
            target: target.into(),
            trigger,
        }
    }
}

/// Configuration of one named state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateSpec {
    /// Evaluated in order; the first firing rule wins.
    pub transitions: Vec<TransitionRule>,
    /// Entering the state marks the cell deleted.
    pub deletes_cell: bool,
    /// Entering the state disables position shifts; leaving re-enables them.
    pub immobile: bool,
}

impl StateSpec {
    #[must_use]
    pub fn with_transition(mut self, target: impl Into<String>, trigger: TransitionTrigger) -> Self {
        self.transitions.push(TransitionRule::new(target, trigger));
        self
    }

    #[must_use]
    pub fn deleting(mut self) -> Self {
        self.deletes_cell = true;
        self
    }

    #[must_use]
    pub fn immobile(mut self) -> Self {
        self.immobile = true;
        self
    }
}

/// Named-state graph configured for one agent type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StateGraph {
    pub states: BTreeMap<String, StateSpec>,
}

impl StateGraph {
    #[must_use]
    pub fn with_state(mut self, name: impl Into<String>, spec: StateSpec) -> Self {
        self.states.insert(name.into(), spec);
        self
    }

    #[must_use]
    pub fn spec(&self, name: &str) -> Option<&StateSpec> {
        self.states.get(name)
    }

    /// Successor names reachable from `name`.
    pub fn successors<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.states
            .get(name)
            .into_iter()
            .flat_map(|spec| spec.transitions.iter().map(|rule| rule.target.as_str()))
    }
}

/// Creates state instances from the graphs registered per `(site, agent type)`.
#[derive(Debug, Clone, Default)]
pub struct CellStateFactory {
    graphs: BTreeMap<(String, String), StateGraph>,
}

impl CellStateFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        site_id: impl Into<String>,
        agent_type: impl Into<String>,
        graph: StateGraph,
    ) {
        self.graphs.insert((site_id.into(), agent_type.into()), graph);
    }

    #[must_use]
    pub fn state_graph_for(&self, site_id: &str, agent_type: &str) -> Option<&StateGraph> {
        self.graphs
            .get(&(site_id.to_string(), agent_type.to_string()))
    }

    /// Fresh instance of `name`, or `None` when the agent type never configured it.
    #[must_use]
    pub fn create_state(&self, site_id: &str, agent_type: &str, name: &str) -> Option<CellState> {
        let spec = self.state_graph_for(site_id, agent_type)?.spec(name)?;
        Some(CellState::new(name, spec.clone()))
    }
}

/// One named state of one cell. Instances persist across visits.
#[derive(Debug, Clone, PartialEq)]
pub struct CellState {
    name: String,
    spec: StateSpec,
    entered_at: f64,
    visits: u32,
    time_in_state: f64,
    pending_contacts: Vec<InteractionEvent>,
    data: BTreeMap<String, f64>,
}

impl CellState {
    #[must_use]
    pub fn new(name: impl Into<String>, spec: StateSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            entered_at: 0.0,
            visits: 0,
            time_in_state: 0.0,
            pending_contacts: Vec::new(),
            data: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn spec(&self) -> &StateSpec {
        &self.spec
    }

    /// Time of the most recent entry.
    #[must_use]
    pub const fn entered_at(&self) -> f64 {
        self.entered_at
    }

    /// Number of times the state was entered.
    #[must_use]
    pub const fn visits(&self) -> u32 {
        self.visits
    }

    /// Time spent in the state over completed visits.
    #[must_use]
    pub const fn time_in_state(&self) -> f64 {
        self.time_in_state
    }

    #[must_use]
    pub fn data(&self, key: &str) -> Option<f64> {
        self.data.get(key).copied()
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: f64) {
        self.data.insert(key.into(), value);
    }

    pub(crate) fn enter(&mut self, time: f64) {
        self.visits += 1;
        self.entered_at = time;
        self.pending_contacts.clear();
    }

    pub(crate) fn leave(&mut self, time: f64) {
        self.time_in_state += (time - self.entered_at).max(0.0);
    }

    /// Latch an interaction notification for the next transition evaluation.
    pub fn handle_interaction_event(&mut self, event: &InteractionEvent) {
        if event.kind == InteractionEventKind::ContactStarted {
            self.pending_contacts.push(event.clone());
        }
    }

    /// Evaluate exit conditions; returns the successor to switch to, if any.
    ///
    /// Latched contact events are consumed by the evaluation.
    pub fn next_state(
        &mut self,
        time_step: f64,
        current_time: f64,
        rng: &mut RandomSource,
    ) -> Option<String> {
        let elapsed = current_time - self.entered_at;
        let mut chosen = None;
        for rule in &self.spec.transitions {
            let fires = match &rule.trigger {
                TransitionTrigger::Immediate => true,
                TransitionTrigger::Rate { per_time } => {
                    let probability = 1.0 - (-per_time * time_step).exp();
                    probability > 0.0 && rng.generate_double(0.0, 1.0) < probability
                }
                TransitionTrigger::AfterDuration { duration } => elapsed >= *duration,
                TransitionTrigger::OnContact { partner_type } => {
                    self.pending_contacts.iter().any(|event| {
                        partner_type
                            .as_ref()
                            .is_none_or(|wanted| *wanted == event.partner_type)
                    })
                }
            };
            if fires {
                chosen = Some(rule.target.clone());
                break;
            }
        }
        self.pending_contacts.clear();
        chosen
    }
}

/// Current state plus every state visited so far, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: Option<String>,
    states: BTreeMap<String, CellState>,
}

impl StateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Option<&CellState> {
        self.current.as_ref().and_then(|name| self.states.get(name))
    }

    pub fn current_mut(&mut self) -> Option<&mut CellState> {
        let name = self.current.as_ref()?;
        self.states.get_mut(name)
    }

    #[must_use]
    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Stored instance for `name`; `None` when the cell never visited it.
    #[must_use]
    pub fn state_by_name(&self, name: &str) -> Option<&CellState> {
        self.states.get(name)
    }

    pub fn state_by_name_mut(&mut self, name: &str) -> Option<&mut CellState> {
        self.states.get_mut(name)
    }

    /// Names of all visited states.
    pub fn visited(&self) -> impl Iterator<Item = &str> {
        self.states.keys().map(String::as_str)
    }

    /// Switch to `name`, reusing the stored instance or creating it through `create`.
    ///
    /// Returns `None` (leaving the current state untouched) when the state cannot be created.
    pub fn switch_to(
        &mut self,
        name: &str,
        time: f64,
        create: impl FnOnce() -> Option<CellState>,
    ) -> Option<&CellState> {
        if !self.states.contains_key(name) {
            let state = create()?;
            self.states.insert(name.to_string(), state);
        }
        if let Some(previous) = self.current.take()
            && let Some(state) = self.states.get_mut(&previous)
        {
            state.leave(time);
        }
        let state = self.states.get_mut(name)?;
        state.enter(time);
        self.current = Some(name.to_string());
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentId;

    fn graph() -> StateGraph {
        StateGraph::default()
            .with_state(
                INITIAL_STATE,
                StateSpec::default().with_transition("Resting", TransitionTrigger::Immediate),
            )
            .with_state(
                "Resting",
                StateSpec::default().with_transition(
                    "Activated",
                    TransitionTrigger::OnContact {
                        partner_type: Some("Pathogen".into()),
                    },
                ),
            )
            .with_state(
                "Activated",
                StateSpec::default()
                    .with_transition("Resting", TransitionTrigger::AfterDuration { duration: 2.0 }),
            )
    }

    fn contact(partner_type: &str) -> InteractionEvent {
        InteractionEvent {
            kind: InteractionEventKind::ContactStarted,
            partner: AgentId(9),
            partner_type: partner_type.into(),
            time: 0.0,
        }
    }

    #[test]
    fn factory_returns_none_for_unconfigured_names() {
        let mut factory = CellStateFactory::new();
        factory.register("lung", "Macrophage", graph());
        assert!(factory.create_state("lung", "Macrophage", "Resting").is_some());
        assert!(factory.create_state("lung", "Macrophage", "Exploded").is_none());
        assert!(factory.create_state("lung", "Neutrophil", "Resting").is_none());
        assert!(factory.create_state("blood", "Macrophage", "Resting").is_none());
        let successors: Vec<&str> = factory
            .state_graph_for("lung", "Macrophage")
            .expect("graph")
            .successors(INITIAL_STATE)
            .collect();
        assert_eq!(successors, vec!["Resting"]);
    }

    #[test]
    fn revisiting_a_state_reuses_its_instance() {
        let factory = {
            let mut f = CellStateFactory::new();
            f.register("lung", "Macrophage", graph());
            f
        };
        let create = |name: &str| factory.create_state("lung", "Macrophage", name);
        let mut machine = StateMachine::new();

        machine.switch_to("Resting", 0.0, || create("Resting"));
        machine
            .state_by_name_mut("Resting")
            .expect("resting")
            .set_data("ingested", 3.0);
        machine.switch_to("Activated", 1.5, || create("Activated"));
        let reused = machine
            .switch_to("Resting", 4.0, || panic!("stored state must be reused"))
            .expect("resting");

        assert_eq!(reused.visits(), 2);
        assert_eq!(reused.data("ingested"), Some(3.0));
        assert!((reused.time_in_state() - 1.5).abs() < 1e-12);
        assert_eq!(machine.current_name(), Some("Resting"));
        let visited: Vec<&str> = machine.visited().collect();
        assert_eq!(visited, vec!["Activated", "Resting"]);
    }

    #[test]
    fn failed_creation_keeps_current_state() {
        let mut machine = StateMachine::new();
        machine.switch_to("Resting", 0.0, || Some(CellState::new("Resting", StateSpec::default())));
        assert!(machine.switch_to("Missing", 1.0, || None).is_none());
        assert_eq!(machine.current_name(), Some("Resting"));
        assert!(machine.state_by_name("Missing").is_none());
    }

    #[test]
    fn contact_trigger_filters_partner_type_and_consumes_events() {
        let mut rng = RandomSource::from_seed(1);
        let mut state = CellState::new("Resting", graph().spec("Resting").cloned().expect("spec"));
        state.enter(0.0);

        state.handle_interaction_event(&contact("Bystander"));
        assert_eq!(state.next_state(1.0, 1.0, &mut rng), None);

        state.handle_interaction_event(&contact("Pathogen"));
        assert_eq!(state.next_state(1.0, 2.0, &mut rng).as_deref(), Some("Activated"));
        assert_eq!(state.next_state(1.0, 3.0, &mut rng), None);
    }

    #[test]
    fn duration_and_rate_triggers() {
        let mut rng = RandomSource::from_seed(1);
        let mut activated =
            CellState::new("Activated", graph().spec("Activated").cloned().expect("spec"));
        activated.enter(10.0);
        assert_eq!(activated.next_state(1.0, 11.0, &mut rng), None);
        assert_eq!(activated.next_state(1.0, 12.0, &mut rng).as_deref(), Some("Resting"));

        let certain = StateSpec::default()
            .with_transition("Dead", TransitionTrigger::Rate { per_time: 0.0 })
            .with_transition("Gone", TransitionTrigger::Rate { per_time: 1e9 });
        let mut state = CellState::new("Dying", certain);
        state.enter(0.0);
        assert_eq!(state.next_state(1.0, 1.0, &mut rng).as_deref(), Some("Gone"));
    }

    #[test]
    fn graph_deserializes_from_json() {
        let json = r#"{
            "states": {
                "InitialCellState": { "transitions": [ { "target": "Dead", "trigger": { "type": "Rate", "per_time": 0.1 } } ] },
                "Dead": { "deletes_cell": true }
            }
        }"#;
        let graph: StateGraph = serde_json::from_str(json).expect("graph");
        assert!(graph.spec("Dead").expect("dead").deletes_cell);
        assert_eq!(
            graph.spec(INITIAL_STATE).expect("initial").transitions[0].trigger,
            TransitionTrigger::Rate { per_time: 0.1 }
        );
    }
}
