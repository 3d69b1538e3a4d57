//! Narrow sink through which the engine reports to measurement collaborators.

use crate::AgentId;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Kind of interaction occurrence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InteractionOccurrence {
    ContactStarted,
    ContactEnded,
    Avoided,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionRecord {
    pub time: f64,
    pub occurrence: InteractionOccurrence,
    pub agent: AgentId,
    pub partner: AgentId,
    pub agent_type: String,
    pub partner_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChangeRecord {
    pub time: f64,
    pub agent: AgentId,
    pub from: Option<String>,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundaryCrossRecord {
    pub time: f64,
    pub agent: AgentId,
    pub deleted: bool,
}

/// Local, non-fatal failure of one agent's operation during one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyRecord {
    pub time: f64,
    pub agent: AgentId,
    pub message: String,
}

/// Everything a sink can receive, in arrival order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MeasurementRecord {
    Interaction(InteractionRecord),
    StateChange(StateChangeRecord),
    BoundaryCross(BoundaryCrossRecord),
    Anomaly(AnomalyRecord),
}

/// Measurement collaborator invoked by the engine.
pub trait MeasurementSink: Send {
    fn record(&mut self, record: MeasurementRecord);
}

/// No-op sink.
#[derive(Debug, Default)]
pub struct NullMeasurements;

impl MeasurementSink for NullMeasurements {
    fn record(&mut self, _record: MeasurementRecord) {}
}

/// Sink buffering every record behind a shared handle, so callers keep access after
/// handing the sink to a world.
#[derive(Debug, Clone, Default)]
pub struct RecordingMeasurements {
    records: Arc<Mutex<Vec<MeasurementRecord>>>,
}

impl RecordingMeasurements {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far.
    #[must_use]
    pub fn records(&self) -> Vec<MeasurementRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn interactions(&self) -> Vec<InteractionRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                MeasurementRecord::Interaction(interaction) => Some(interaction),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn state_changes(&self) -> Vec<StateChangeRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                MeasurementRecord::StateChange(change) => Some(change),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn boundary_crossings(&self) -> Vec<BoundaryCrossRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                MeasurementRecord::BoundaryCross(cross) => Some(cross),
                _ => None,
            })
            .collect()
    }
}

impl MeasurementSink for RecordingMeasurements {
    fn record(&mut self, record: MeasurementRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
