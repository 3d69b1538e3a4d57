//! Per-agent registry of contacts and avoided pairings with nearby agents.

use crate::agent::Agent;
use crate::measurement::{InteractionOccurrence, InteractionRecord, MeasurementRecord};
use crate::morphology::Sphere;
use crate::site::Site;
use crate::vector::Vector3;
use crate::world::CellArena;
use crate::{AgentId, AgentKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Tunables of the interaction engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InteractionParameters {
    /// Extra gap over touching spheres that still counts as contact.
    pub contact_tolerance: f64,
    /// Push a mover out of agents it newly overlaps.
    pub resolve_overlaps: bool,
}

impl Default for InteractionParameters {
    fn default() -> Self {
        Self {
            contact_tolerance: 0.0,
            resolve_overlaps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InteractionKind {
    Contact,
    Avoided,
}

/// One pairing as seen from one participant.
#[derive(Debug, Clone, PartialEq)]
pub struct Interaction {
    pub partner: AgentKey,
    pub partner_id: AgentId,
    pub partner_type: String,
    pub kind: InteractionKind,
    pub started_at: f64,
    /// Centre distance beyond which the interaction is retired.
    pub range: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InteractionEventKind {
    ContactStarted,
    ContactEnded,
}

/// Notification delivered to a cell's state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionEvent {
    pub kind: InteractionEventKind,
    pub partner: AgentId,
    pub partner_type: String,
    pub time: f64,
}

/// The agent on whose behalf the engine runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub key: AgentKey,
    pub id: AgentId,
    pub agent_type: String,
    pub sphere: Sphere,
}

#[derive(Debug, Clone, Default)]
pub struct Interactions {
    parameters: InteractionParameters,
    active: BTreeMap<AgentKey, Interaction>,
    avoided: BTreeMap<AgentKey, Interaction>,
}

impl Interactions {
    #[must_use]
    pub fn new(parameters: InteractionParameters) -> Self {
        Self {
            parameters,
            active: BTreeMap::new(),
            avoided: BTreeMap::new(),
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &Interaction> {
        self.active.values()
    }

    pub fn avoided(&self) -> impl Iterator<Item = &Interaction> {
        self.avoided.values()
    }

    #[must_use]
    pub fn is_active_with(&self, partner: AgentKey) -> bool {
        self.active.contains_key(&partner)
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.avoided.clear();
    }

    fn search_radius(&self, me: &Participant, site: &Site) -> f64 {
        me.sphere.radius + site.locator().radius_hint() + self.parameters.contact_tolerance
    }

    /// Register newly overlapping neighbours after a move and return the push-back that
    /// separates the mover from them (zero when overlap resolution is off).
    pub fn avoid_new_interactions(
        &mut self,
        me: &Participant,
        current_time: f64,
        cells: &CellArena,
        site: &mut Site,
    ) -> Vector3 {
        let mut correction = Vector3::ZERO;
        let candidates = site
            .locator()
            .neighbors_of(me.key, self.search_radius(me, site));
        for neighbor in candidates {
            if self.active.contains_key(&neighbor.key) {
                continue;
            }
            let Some(other) = cells.get(neighbor.key) else {
                continue;
            };
            if other.is_deleted() {
                continue;
            }
            let overlap = me.sphere.radius + neighbor.footprint.radius - neighbor.distance;
            if overlap <= 0.0 {
                continue;
            }
            let newly_avoided = self
                .avoided
                .insert(
                    neighbor.key,
                    Interaction {
                        partner: neighbor.key,
                        partner_id: other.id(),
                        partner_type: other.agent_type().to_string(),
                        kind: InteractionKind::Avoided,
                        started_at: current_time,
                        range: me.sphere.radius + neighbor.footprint.radius,
                    },
                )
                .is_none();
            if newly_avoided {
                site.record(MeasurementRecord::Interaction(InteractionRecord {
                    time: current_time,
                    occurrence: InteractionOccurrence::Avoided,
                    agent: me.id,
                    partner: other.id(),
                    agent_type: me.agent_type.clone(),
                    partner_type: other.agent_type().to_string(),
                }));
            }
            if self.parameters.resolve_overlaps {
                let away = (me.sphere.center - Vector3::from_array(neighbor.footprint.position))
                    .normalized()
                    .unwrap_or(Vector3::ZERO);
                correction += away * overlap;
            }
        }
        site.dimensions().project(correction)
    }

    /// Full per-tick cycle: retire stale and out-of-range pairings, discover new contacts,
    /// notify both participants and report to the measurement sink.
    ///
    /// Returns the events addressed to `me`; partner events are delivered directly.
    pub fn do_whole_process(
        &mut self,
        me: &Participant,
        current_time: f64,
        cells: &mut CellArena,
        site: &mut Site,
    ) -> Vec<InteractionEvent> {
        let mut events = Vec::new();

        let tracked: Vec<AgentKey> = self.active.keys().copied().collect();
        for key in tracked {
            let Some(interaction) = self.active.get(&key) else {
                continue;
            };
            let Some(partner) = cells.get_mut(key) else {
                self.active.remove(&key);
                continue;
            };
            if partner.is_deleted() || partner.id() != interaction.partner_id {
                self.active.remove(&key);
                continue;
            }
            let distance = me.sphere.center.distance(partner.basic_sphere().center);
            if distance <= interaction.range {
                continue;
            }
            let ended = self.active.remove(&key);
            partner.interactions_mut().active.remove(&me.key);
            partner.receive_interaction_event(&InteractionEvent {
                kind: InteractionEventKind::ContactEnded,
                partner: me.id,
                partner_type: me.agent_type.clone(),
                time: current_time,
            });
            if let Some(ended) = ended {
                debug!(agent = %me.id, partner = %ended.partner_id, distance, "contact ended");
                events.push(InteractionEvent {
                    kind: InteractionEventKind::ContactEnded,
                    partner: ended.partner_id,
                    partner_type: ended.partner_type.clone(),
                    time: current_time,
                });
                site.record(MeasurementRecord::Interaction(InteractionRecord {
                    time: current_time,
                    occurrence: InteractionOccurrence::ContactEnded,
                    agent: me.id,
                    partner: ended.partner_id,
                    agent_type: me.agent_type.clone(),
                    partner_type: ended.partner_type,
                }));
            }
        }

        self.avoided.retain(|key, avoided| {
            cells.get(*key).is_some_and(|partner| {
                !partner.is_deleted()
                    && partner.id() == avoided.partner_id
                    && me.sphere.center.distance(partner.basic_sphere().center) < avoided.range
            })
        });

        let tolerance = self.parameters.contact_tolerance;
        let candidates = site
            .locator()
            .neighbors_of(me.key, self.search_radius(me, site));
        for neighbor in candidates {
            if self.active.contains_key(&neighbor.key) {
                continue;
            }
            let Some(partner) = cells.get_mut(neighbor.key) else {
                continue;
            };
            if partner.is_deleted() {
                continue;
            }
            let range = me.sphere.radius + neighbor.footprint.radius + tolerance;
            if neighbor.distance > range {
                continue;
            }
            let partner_id = partner.id();
            let partner_type = partner.agent_type().to_string();
            self.avoided.remove(&neighbor.key);
            self.active.insert(
                neighbor.key,
                Interaction {
                    partner: neighbor.key,
                    partner_id,
                    partner_type: partner_type.clone(),
                    kind: InteractionKind::Contact,
                    started_at: current_time,
                    range,
                },
            );
            let partner_side = partner.interactions_mut();
            partner_side.avoided.remove(&me.key);
            partner_side.active.insert(
                me.key,
                Interaction {
                    partner: me.key,
                    partner_id: me.id,
                    partner_type: me.agent_type.clone(),
                    kind: InteractionKind::Contact,
                    started_at: current_time,
                    range,
                },
            );
            partner.receive_interaction_event(&InteractionEvent {
                kind: InteractionEventKind::ContactStarted,
                partner: me.id,
                partner_type: me.agent_type.clone(),
                time: current_time,
            });
            debug!(agent = %me.id, partner = %partner_id, "contact started");
            events.push(InteractionEvent {
                kind: InteractionEventKind::ContactStarted,
                partner: partner_id,
                partner_type: partner_type.clone(),
                time: current_time,
            });
            site.record(MeasurementRecord::Interaction(InteractionRecord {
                time: current_time,
                occurrence: InteractionOccurrence::ContactStarted,
                agent: me.id,
                partner: partner_id,
                agent_type: me.agent_type.clone(),
                partner_type,
            }));
        }

        events
    }
}
