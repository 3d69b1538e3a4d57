//! Morphology composition and the collision geometry used for nesting agents.

use crate::random::RandomSource;
use crate::vector::{SpatialDimensions, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Geometric impossibilities surfaced while placing agents.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GeometryError {
    /// The incoming body cannot fit inside the host at all.
    #[error("incoming radius {incoming} does not fit inside host radius {host}")]
    IncomingTooLarge { host: f64, incoming: f64 },
    /// Rejection sampling exhausted its retry budget.
    #[error("no free interior position found after {attempts} attempts")]
    NoFreePosition { attempts: usize },
}

/// Placed sphere used for geometric queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sphere {
    pub center: Vector3,
    pub radius: f64,
}

impl Sphere {
    #[must_use]
    pub const fn new(center: Vector3, radius: f64) -> Self {
        Self { center, radius }
    }

    /// Strict containment of `point` in this sphere shrunk by `incoming_radius`.
    ///
    /// A body of radius `incoming_radius` centred at a contained point lies fully inside.
    #[must_use]
    pub fn contains_interior(&self, incoming_radius: f64, point: Vector3) -> bool {
        point.distance(self.center) < self.radius - incoming_radius
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        self.center.distance(other.center) < self.radius + other.radius
    }
}

/// Shape selector used in agent parameters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MorphologyKind {
    #[default]
    Spherical,
}

/// Per agent type morphology parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MorphologyParameters {
    pub kind: MorphologyKind,
    pub radius: f64,
    pub std_dev: f64,
    pub color: String,
    /// Radius change per unit time applied by the morphology-change task.
    pub growth_rate: f64,
    pub min_radius: f64,
    /// Upper radius limit; unbounded when absent.
    pub max_radius: Option<f64>,
}

impl Default for MorphologyParameters {
    fn default() -> Self {
        Self {
            kind: MorphologyKind::Spherical,
            radius: 1.0,
            std_dev: 0.0,
            color: "White".to_string(),
            growth_rate: 0.0,
            min_radius: 0.0,
            max_radius: None,
        }
    }
}

/// Index of a part inside its morphology.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartId(pub usize);

impl PartId {
    /// The basic part, always present.
    pub const BASIC: Self = Self(0);
}

/// Spherical sub-shape anchored to the owning agent's position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MorphologyPart {
    pub description: String,
    pub radius: f64,
    /// Centre relative to the agent position.
    pub offset: Vector3,
    /// Part this one hangs from; never an ownership edge.
    pub mother: Option<PartId>,
    /// Attachment point relative to the mother's centre.
    pub connection_point: Vector3,
}

/// Coloured container of one or more spherical parts. Part 0 is the collision body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Morphology {
    color: String,
    parts: Vec<MorphologyPart>,
}

impl Morphology {
    /// Single-sphere morphology.
    #[must_use]
    pub fn spherical(color: impl Into<String>, radius: f64, description: impl Into<String>) -> Self {
        Self {
            color: color.into(),
            parts: vec![MorphologyPart {
                description: description.into(),
                radius,
                offset: Vector3::ZERO,
                mother: None,
                connection_point: Vector3::ZERO,
            }],
        }
    }

    /// Build from parameters, drawing the basic radius from `Normal(radius, std_dev)`.
    ///
    /// Samples are clipped to 1% of the configured mean so a body never collapses.
    pub fn from_parameters(parameters: &MorphologyParameters, rng: &mut RandomSource) -> Self {
        let floor = (parameters.radius * 0.01).max(f64::EPSILON);
        let mut radius = rng
            .generate_normal(parameters.radius, parameters.std_dev)
            .max(floor)
            .max(parameters.min_radius);
        if let Some(max_radius) = parameters.max_radius {
            radius = radius.min(max_radius.max(floor));
        }
        match parameters.kind {
            MorphologyKind::Spherical => Self::spherical(parameters.color.clone(), radius, "basic"),
        }
    }

    /// Attach a secondary sphere to `mother` at `connection_point`.
    pub fn attach_part(
        &mut self,
        mother: PartId,
        connection_point: Vector3,
        radius: f64,
        description: impl Into<String>,
    ) -> Option<PartId> {
        let mother_offset = self.parts.get(mother.0)?.offset;
        self.parts.push(MorphologyPart {
            description: description.into(),
            radius,
            offset: mother_offset + connection_point,
            mother: Some(mother),
            connection_point,
        });
        Some(PartId(self.parts.len() - 1))
    }

    #[must_use]
    pub fn color(&self) -> &str {
        &self.color
    }

    #[must_use]
    pub fn parts(&self) -> &[MorphologyPart] {
        &self.parts
    }

    #[must_use]
    pub fn mother_of(&self, part: PartId) -> Option<PartId> {
        self.parts.get(part.0).and_then(|p| p.mother)
    }

    /// Radius of the basic sphere.
    #[must_use]
    pub fn radius(&self) -> f64 {
        self.parts[PartId::BASIC.0].radius
    }

    pub fn set_radius(&mut self, radius: f64) {
        self.parts[PartId::BASIC.0].radius = radius;
    }

    /// Primary collision sphere for an agent located at `anchor`.
    #[must_use]
    pub fn basic_sphere(&self, anchor: Vector3) -> Sphere {
        let basic = &self.parts[PartId::BASIC.0];
        Sphere::new(anchor + basic.offset, basic.radius)
    }

    /// Every sphere of the morphology, basic first.
    pub fn spheres(&self, anchor: Vector3) -> impl Iterator<Item = Sphere> + '_ {
        self.parts
            .iter()
            .map(move |part| Sphere::new(anchor + part.offset, part.radius))
    }

    /// POV-Ray objects for all spheres.
    #[must_use]
    pub fn pov_objects(&self, anchor: Vector3) -> String {
        self.spheres(anchor)
            .map(|sphere| {
                format!(
                    "sphere {{ {}, {} pigment {{ color {} }} }}\n",
                    sphere.center, sphere.radius, self.color
                )
            })
            .collect()
    }
}

/// Shape taking part in a nesting query, identified by its agent id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NestedShape {
    pub id: u64,
    pub sphere: Sphere,
}

/// Rejection-sample a point inside `host` where a body of `incoming_radius` fits entirely.
///
/// Candidates are drawn from the cube bounding the shrunk sphere and must also satisfy
/// `accept` (e.g. the site contains it). Planar sites sample in the host's z plane.
pub fn find_free_interior_position(
    host: &Sphere,
    incoming_radius: f64,
    rng: &mut RandomSource,
    dimensions: SpatialDimensions,
    max_attempts: usize,
    mut accept: impl FnMut(Vector3) -> bool,
) -> Result<Vector3, GeometryError> {
    let reach = host.radius - incoming_radius;
    if !(reach > 0.0) {
        return Err(GeometryError::IncomingTooLarge {
            host: host.radius,
            incoming: incoming_radius,
        });
    }
    let c = host.center;
    for _ in 0..max_attempts {
        let candidate = Vector3::new(
            rng.generate_double(c.x - reach, c.x + reach),
            rng.generate_double(c.y - reach, c.y + reach),
            match dimensions {
                SpatialDimensions::Two => c.z,
                SpatialDimensions::Three => rng.generate_double(c.z - reach, c.z + reach),
            },
        );
        if host.contains_interior(incoming_radius, candidate) && accept(candidate) {
            return Ok(candidate);
        }
    }
    Err(GeometryError::NoFreePosition {
        attempts: max_attempts,
    })
}

/// Whether `incoming` overlaps any other member already nested inside `host`.
///
/// Members that are not themselves inside the host are ignored, as are the host and
/// the incoming shape. The relation is symmetric between two nested shapes.
#[must_use]
pub fn collides_inside(host: &NestedShape, incoming: &NestedShape, members: &[NestedShape]) -> bool {
    if !host
        .sphere
        .contains_interior(incoming.sphere.radius, incoming.sphere.center)
    {
        return false;
    }
    members
        .iter()
        .filter(|member| member.id != host.id && member.id != incoming.id)
        .filter(|member| {
            host.sphere
                .contains_interior(member.sphere.radius, member.sphere.center)
        })
        .any(|member| incoming.sphere.overlaps(&member.sphere))
}
