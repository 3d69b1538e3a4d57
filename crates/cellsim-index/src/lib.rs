//! Spatial indexing abstractions for neighbourhood queries over agent shapes.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// An update or lookup referenced a shape that was never inserted.
    #[error("shape is not present in the index")]
    UnknownKey,
    /// Positions must be finite to be bucketed.
    #[error("position {0:?} is not finite")]
    NonFinitePosition([f64; 3]),
}

/// Key types usable by the index.
pub trait IndexKey: Copy + Ord + Hash + Debug {}

impl<T: Copy + Ord + Hash + Debug> IndexKey for T {}

/// Indexed footprint of a single spherical shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Footprint {
    pub position: [f64; 3],
    pub radius: f64,
}

impl Footprint {
    #[must_use]
    pub const fn new(position: [f64; 3], radius: f64) -> Self {
        Self { position, radius }
    }

    fn is_finite(&self) -> bool {
        self.position.iter().all(|c| c.is_finite()) && self.radius.is_finite()
    }
}

/// Candidate returned by a neighbourhood query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor<K> {
    pub key: K,
    pub footprint: Footprint,
    /// Centre-to-centre distance from the query point.
    pub distance: f64,
}

/// Common behaviour exposed by neighbourhood indices.
pub trait NeighborhoodIndex<K: IndexKey> {
    /// Replace the whole content of the index.
    fn rebuild(&mut self, shapes: &[(K, Footprint)]) -> Result<(), IndexError>;

    /// Add a new shape. Inserting an existing key re-indexes it.
    fn insert(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError>;

    /// Re-index a shape after its position or radius changed.
    fn update(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError>;

    /// Drop a shape, returning its last footprint.
    fn remove(&mut self, key: K) -> Option<Footprint>;

    /// Current footprint of `key`.
    fn footprint(&self, key: K) -> Option<Footprint>;

    /// Visit shapes whose centre lies within `radius` of `center`.
    ///
    /// The visitor receives the squared centre distance. Exact overlap tests are left to the
    /// caller.
    fn neighbors_within(
        &self,
        center: [f64; 3],
        radius: f64,
        visitor: &mut dyn FnMut(K, OrderedFloat<f64>),
    );
}

type CellCoord = [i64; 3];

/// Uniform grid hashing shapes into cubic buckets of edge `cell_size`.
#[derive(Debug, Clone)]
pub struct UniformGridIndex<K: IndexKey> {
    /// Edge length of each grid cell used for bucketing shapes.
    pub cell_size: f64,
    entries: BTreeMap<K, (Footprint, CellCoord)>,
    buckets: HashMap<CellCoord, Vec<K>>,
    radius_hint: f64,
}

impl<K: IndexKey> Default for UniformGridIndex<K> {
    fn default() -> Self {
        Self::new(50.0)
    }
}

impl<K: IndexKey> UniformGridIndex<K> {
    /// Create a new uniform grid with the provided cell size.
    ///
    /// The size is validated lazily by the first mutation; use [`Self::try_new`] to fail early.
    #[must_use]
    pub fn new(cell_size: f64) -> Self {
        Self {
            cell_size,
            entries: BTreeMap::new(),
            buckets: HashMap::new(),
            radius_hint: 0.0,
        }
    }

    /// Create a grid, rejecting unusable cell sizes.
    pub fn try_new(cell_size: f64) -> Result<Self, IndexError> {
        let index = Self::new(cell_size);
        index.validate()?;
        Ok(index)
    }

    fn validate(&self) -> Result<(), IndexError> {
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig(
                "cell_size must be positive and finite",
            ));
        }
        Ok(())
    }

    /// Number of indexed shapes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: K) -> bool {
        self.entries.contains_key(&key)
    }

    /// Indexed keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.keys().copied()
    }

    /// Largest radius indexed since the last rebuild; never shrinks on removal.
    #[must_use]
    pub fn radius_hint(&self) -> f64 {
        self.radius_hint
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.buckets.clear();
        self.radius_hint = 0.0;
    }

    fn coord_of(&self, position: [f64; 3]) -> CellCoord {
        position.map(|c| (c / self.cell_size).floor() as i64)
    }

    fn detach(&mut self, key: K, coord: CellCoord) {
        if let Some(bucket) = self.buckets.get_mut(&coord) {
            if let Some(slot) = bucket.iter().position(|k| *k == key) {
                bucket.swap_remove(slot);
            }
            if bucket.is_empty() {
                self.buckets.remove(&coord);
            }
        }
    }

    fn place(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError> {
        self.validate()?;
        if !footprint.is_finite() {
            return Err(IndexError::NonFinitePosition(footprint.position));
        }
        let coord = self.coord_of(footprint.position);
        if let Some((_, previous)) = self.entries.get(&key).copied() {
            if previous != coord {
                self.detach(key, previous);
                self.buckets.entry(coord).or_default().push(key);
            }
        } else {
            self.buckets.entry(coord).or_default().push(key);
        }
        self.entries.insert(key, (footprint, coord));
        self.radius_hint = self.radius_hint.max(footprint.radius);
        Ok(())
    }

    /// Snapshot of the shapes around `key`, nearest first, excluding `key` itself.
    ///
    /// Returns an owned vector so callers may mutate the index while walking the result.
    #[must_use]
    pub fn neighbors_of(&self, key: K, radius: f64) -> Vec<Neighbor<K>> {
        let Some(footprint) = self.footprint(key) else {
            return Vec::new();
        };
        let mut found = self.neighbors_around(footprint.position, radius);
        found.retain(|n| n.key != key);
        found
    }

    /// Snapshot of the shapes whose centre lies within `radius` of `center`, nearest first.
    #[must_use]
    pub fn neighbors_around(&self, center: [f64; 3], radius: f64) -> Vec<Neighbor<K>> {
        let mut found = Vec::new();
        self.neighbors_within(center, radius, &mut |key, dist_sq| {
            if let Some((footprint, _)) = self.entries.get(&key) {
                found.push(Neighbor {
                    key,
                    footprint: *footprint,
                    distance: dist_sq.into_inner().sqrt(),
                });
            }
        });
        found.sort_by(|a, b| {
            OrderedFloat(a.distance)
                .cmp(&OrderedFloat(b.distance))
                .then(a.key.cmp(&b.key))
        });
        found
    }
}

fn distance_sq(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

impl<K: IndexKey> NeighborhoodIndex<K> for UniformGridIndex<K> {
    fn rebuild(&mut self, shapes: &[(K, Footprint)]) -> Result<(), IndexError> {
        self.validate()?;
        self.clear();
        for (key, footprint) in shapes {
            self.place(*key, *footprint)?;
        }
        Ok(())
    }

    fn insert(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError> {
        self.place(key, footprint)
    }

    fn update(&mut self, key: K, footprint: Footprint) -> Result<(), IndexError> {
        if !self.entries.contains_key(&key) {
            return Err(IndexError::UnknownKey);
        }
        self.place(key, footprint)
    }

    fn remove(&mut self, key: K) -> Option<Footprint> {
        let (footprint, coord) = self.entries.remove(&key)?;
        self.detach(key, coord);
        Some(footprint)
    }

    fn footprint(&self, key: K) -> Option<Footprint> {
        self.entries.get(&key).map(|(footprint, _)| *footprint)
    }

    fn neighbors_within(
        &self,
        center: [f64; 3],
        radius: f64,
        visitor: &mut dyn FnMut(K, OrderedFloat<f64>),
    ) {
        if self.entries.is_empty() || !(radius >= 0.0) || self.validate().is_err() {
            return;
        }
        let radius_sq = radius * radius;
        let lo = self.coord_of(center.map(|c| c - radius));
        let hi = self.coord_of(center.map(|c| c + radius));
        let span: u128 = (0..3)
            .map(|axis| (hi[axis].saturating_sub(lo[axis]) as u128).saturating_add(1))
            .fold(1u128, u128::saturating_mul);

        // Sparse grids with huge query radii are cheaper to scan linearly.
        if span > (self.entries.len() as u128).saturating_mul(4) {
            for (key, (footprint, _)) in &self.entries {
                let dist_sq = distance_sq(footprint.position, center);
                if dist_sq <= radius_sq {
                    visitor(*key, OrderedFloat(dist_sq));
                }
            }
            return;
        }

        for x in lo[0]..=hi[0] {
            for y in lo[1]..=hi[1] {
                for z in lo[2]..=hi[2] {
                    let Some(bucket) = self.buckets.get(&[x, y, z]) else {
                        continue;
                    };
                    for key in bucket {
                        if let Some((footprint, _)) = self.entries.get(key) {
                            let dist_sq = distance_sq(footprint.position, center);
                            if dist_sq <= radius_sq {
                                visitor(*key, OrderedFloat(dist_sq));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(x: f64, y: f64, z: f64) -> Footprint {
        Footprint::new([x, y, z], 1.0)
    }

    fn grid() -> UniformGridIndex<u32> {
        UniformGridIndex::try_new(5.0).expect("grid")
    }

    #[test]
    fn query_finds_shapes_within_radius() {
        let mut index = grid();
        index.insert(0, fp(5.0, 5.0, 0.0)).unwrap();
        index.insert(1, fp(6.0, 5.0, 0.0)).unwrap();
        index.insert(2, fp(50.0, 50.0, 0.0)).unwrap();

        let keys: Vec<u32> = index
            .neighbors_around([5.0, 5.0, 0.0], 2.0)
            .iter()
            .map(|n| n.key)
            .collect();
        assert_eq!(keys, vec![0, 1]);
    }

    #[test]
    fn neighbors_of_excludes_self_and_sorts_by_distance() {
        let mut index = grid();
        index.insert(7, fp(0.0, 0.0, 0.0)).unwrap();
        index.insert(3, fp(3.0, 0.0, 0.0)).unwrap();
        index.insert(9, fp(1.0, 0.0, 0.0)).unwrap();

        let found = index.neighbors_of(7, 10.0);
        let keys: Vec<u32> = found.iter().map(|n| n.key).collect();
        assert_eq!(keys, vec![9, 3]);
        assert!((found[1].distance - 3.0).abs() < 1e-12);
    }

    #[test]
    fn update_moves_shape_between_buckets() {
        let mut index = grid();
        index.insert(1, fp(0.0, 0.0, 0.0)).unwrap();
        index.update(1, fp(-42.0, 17.0, 3.0)).unwrap();

        assert!(index.neighbors_around([0.0, 0.0, 0.0], 1.0).is_empty());
        let found = index.neighbors_around([-42.0, 17.0, 3.0], 0.5);
        assert_eq!(found.len(), 1);
        assert_eq!(index.footprint(1), Some(fp(-42.0, 17.0, 3.0)));
    }

    #[test]
    fn update_of_unknown_key_is_rejected() {
        let mut index = grid();
        assert_eq!(index.update(4, fp(0.0, 0.0, 0.0)), Err(IndexError::UnknownKey));
        assert!(index.is_empty());
    }

    #[test]
    fn remove_drops_shape_from_queries() {
        let mut index = grid();
        index.insert(1, fp(1.0, 1.0, 1.0)).unwrap();
        index.insert(2, fp(1.5, 1.0, 1.0)).unwrap();
        assert_eq!(index.remove(1), Some(fp(1.0, 1.0, 1.0)));
        assert_eq!(index.remove(1), None);
        let keys: Vec<u32> = index.keys().collect();
        assert_eq!(keys, vec![2]);
        assert_eq!(index.neighbors_around([1.0, 1.0, 1.0], 1.0).len(), 1);
    }

    #[test]
    fn invalid_cell_size_is_rejected() {
        assert!(matches!(
            UniformGridIndex::<u32>::try_new(0.0),
            Err(IndexError::InvalidConfig(_))
        ));
        let mut index = UniformGridIndex::<u32>::new(-1.0);
        assert!(index.insert(0, fp(0.0, 0.0, 0.0)).is_err());
    }

    #[test]
    fn non_finite_positions_are_rejected() {
        let mut index = grid();
        let err = index.insert(0, fp(f64::NAN, 0.0, 0.0)).unwrap_err();
        assert!(matches!(err, IndexError::NonFinitePosition(_)));
        assert!(!index.contains(0));
    }

    #[test]
    fn linear_fallback_matches_bucket_scan() {
        let mut index = UniformGridIndex::try_new(0.5).expect("grid");
        for i in 0..20u32 {
            index
                .insert(i, fp(f64::from(i) * 3.0, f64::from(i % 3), 0.0))
                .unwrap();
        }
        // Radius 1000 spans far more cells than there are entries.
        assert_eq!(index.neighbors_around([0.0, 0.0, 0.0], 1_000.0).len(), 20);
        let near: Vec<u32> = index
            .neighbors_around([0.0, 0.0, 0.0], 3.5)
            .iter()
            .map(|n| n.key)
            .collect();
        assert_eq!(near, vec![0, 1]);
    }

    #[test]
    fn rebuild_replaces_contents_and_tracks_radius_hint() {
        let mut index = grid();
        index.insert(1, Footprint::new([0.0; 3], 4.0)).unwrap();
        assert_eq!(index.radius_hint(), 4.0);
        index
            .rebuild(&[(5, Footprint::new([1.0, 0.0, 0.0], 2.0))])
            .unwrap();
        assert!(!index.contains(1));
        assert!(index.contains(5));
        assert_eq!(index.radius_hint(), 2.0);
    }
}
