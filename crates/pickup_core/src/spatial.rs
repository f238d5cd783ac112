//! Spatial operations and the spatial-temporal request index.
//!
//! This module provides:
//!
//! - **GeoIndex**: Wrapper for H3 resolution configuration
//! - **Distance calculations**: Haversine distance between coordinates and H3 cells
//! - **SpatialTemporalIndex**: (time slot, H3 cell) → request mappings with
//!   neighbourhood expansion, so candidate search stays proportional to
//!   requests × ring area instead of requests².
//!
//! Default resolution is 9 (~175m cells), with 15 minute slots.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use h3o::{CellIndex, LatLng, Resolution};

use crate::config::IndexConfig;
use crate::error::ConfigError;
use crate::request::{Coordinate, Request, RequestId};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy)]
pub struct GeoIndex {
    resolution: Resolution,
}

impl GeoIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn cell_of(&self, coord: Coordinate) -> Option<CellIndex> {
        coord.cell(self.resolution)
    }

    pub fn grid_disk(&self, origin: CellIndex, k: u32) -> Vec<CellIndex> {
        debug_assert_eq!(
            origin.resolution(),
            self.resolution,
            "origin resolution must match GeoIndex resolution"
        );
        origin.grid_disk::<Vec<_>>(k)
    }
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self {
            resolution: Resolution::Nine,
        }
    }
}

fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let (lat1, lon1) = (lat1.to_radians(), lng1.to_radians());
    let (lat2, lon2) = (lat2.to_radians(), lng2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let sin_dlat = (dlat * 0.5).sin();
    let sin_dlon = (dlon * 0.5).sin();
    let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_KM * c
}

/// Great-circle distance between two coordinates.
pub fn distance_km(a: Coordinate, b: Coordinate) -> f64 {
    haversine_km(a.lat, a.lng, b.lat, b.lng)
}

/// Great-circle distance between the centers of two H3 cells.
pub fn distance_km_between_cells(a: CellIndex, b: CellIndex) -> f64 {
    let a: LatLng = a.into();
    let b: LatLng = b.into();
    haversine_km(a.lat(), a.lng(), b.lat(), b.lng())
}

/// Discrete (time slot, hex cell) pair a request is indexed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub slot: i64,
    pub cell: CellIndex,
}

/// Spatial-temporal index over the unassigned requests of one run.
///
/// Requests are bucketed by the floor of their scheduled time to a fixed-width
/// slot and by the H3 cell of their origin.
#[derive(Debug, Clone)]
pub struct SpatialTemporalIndex {
    geo: GeoIndex,
    slot_secs: i64,
    rings: u32,
    adjacent_slots: i64,
    buckets: HashMap<BucketKey, Vec<RequestId>>,
    request_to_bucket: HashMap<RequestId, BucketKey>,
}

impl SpatialTemporalIndex {
    pub fn new(config: &IndexConfig) -> Result<Self, ConfigError> {
        if config.slot_minutes == 0 {
            return Err(ConfigError::NonPositive("index.slot_minutes"));
        }
        Ok(Self {
            geo: GeoIndex::new(config.h3_resolution()?),
            slot_secs: i64::from(config.slot_minutes) * 60,
            rings: config.rings,
            adjacent_slots: i64::from(config.adjacent_slots),
            buckets: HashMap::new(),
            request_to_bucket: HashMap::new(),
        })
    }

    /// Build an index holding every request of the batch.
    pub fn build(config: &IndexConfig, requests: &[Request]) -> Result<Self, ConfigError> {
        let mut index = Self::new(config)?;
        for request in requests {
            index.insert(request);
        }
        Ok(index)
    }

    pub fn slot_of(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.slot_secs)
    }

    pub fn bucket_of(&self, request: &Request) -> Option<BucketKey> {
        let cell = self.geo.cell_of(request.origin)?;
        Some(BucketKey {
            slot: self.slot_of(request.scheduled_at()),
            cell,
        })
    }

    /// All bucket keys within `ring` hex rings of `key.cell`, at the same or
    /// adjacent time slots.
    pub fn neighbors(&self, key: BucketKey, ring: u32) -> BTreeSet<BucketKey> {
        self.neighbors_within(key, ring, self.adjacent_slots)
    }

    /// Like [`neighbors`](Self::neighbors) with an explicit slot span.
    pub fn neighbors_within(&self, key: BucketKey, ring: u32, slot_span: i64) -> BTreeSet<BucketKey> {
        let cells = self.geo.grid_disk(key.cell, ring);
        let mut keys = BTreeSet::new();
        for slot in (key.slot - slot_span)..=(key.slot + slot_span) {
            for cell in &cells {
                keys.insert(BucketKey { slot, cell: *cell });
            }
        }
        keys
    }

    /// Index a request. Returns `None` if its origin has no H3 cell.
    pub fn insert(&mut self, request: &Request) -> Option<BucketKey> {
        let key = self.bucket_of(request)?;
        if let Some(previous) = self.request_to_bucket.insert(request.id(), key) {
            self.detach(request.id(), previous);
        }
        self.buckets.entry(key).or_default().push(request.id());
        Some(key)
    }

    /// Remove a request from the index (e.g. once it is placed in a group).
    pub fn remove(&mut self, id: RequestId) {
        if let Some(key) = self.request_to_bucket.remove(&id) {
            self.detach(id, key);
        }
    }

    fn detach(&mut self, id: RequestId, key: BucketKey) {
        if let Some(ids) = self.buckets.get_mut(&key) {
            ids.retain(|&other| other != id);
            if ids.is_empty() {
                self.buckets.remove(&key);
            }
        }
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.request_to_bucket.contains_key(&id)
    }

    /// Indexed requests in the configured neighbourhood of `request`,
    /// excluding the request itself, in ascending id order.
    pub fn candidates(&self, request: &Request) -> Vec<RequestId> {
        self.candidates_within(request, self.rings, self.adjacent_slots)
    }

    /// Candidates within `ring` hex rings and `slot_span` slots either side.
    pub fn candidates_within(&self, request: &Request, ring: u32, slot_span: i64) -> Vec<RequestId> {
        let Some(key) = self.bucket_of(request) else {
            return Vec::new();
        };
        let mut ids: Vec<RequestId> = self
            .neighbors_within(key, ring, slot_span)
            .iter()
            .filter_map(|k| self.buckets.get(k))
            .flatten()
            .copied()
            .filter(|id| *id != request.id())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn rings(&self) -> u32 {
        self.rings
    }

    pub fn adjacent_slots(&self) -> i64 {
        self.adjacent_slots
    }

    pub fn len(&self) -> usize {
        self.request_to_bucket.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_to_bucket.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{lax_origin, request_at};
    use chrono::{Duration, TimeZone};

    fn index() -> SpatialTemporalIndex {
        SpatialTemporalIndex::new(&IndexConfig::default()).expect("index")
    }

    #[test]
    fn widened_lookup_reaches_second_ring_and_slot() {
        let mut index = index();
        let origin = GeoIndex::new(Resolution::Nine)
            .cell_of(lax_origin())
            .expect("cell");
        let second_ring = origin
            .grid_disk::<Vec<_>>(2)
            .into_iter()
            .find(|c| matches!(origin.grid_distance(*c), Ok(2)))
            .expect("ring-2 cell");

        let a = request_at(1, lax_origin(), 0);
        let two_rings_out = request_at(2, LatLng::from(second_ring).into(), 0);
        let two_slots_later = request_at(3, lax_origin(), 35);
        for r in [&a, &two_rings_out, &two_slots_later] {
            index.insert(r);
        }

        assert!(index.candidates(&a).is_empty());
        assert_eq!(
            index.candidates_within(&a, 2, 2),
            vec![two_rings_out.id(), two_slots_later.id()]
        );
    }

    #[test]
    fn slots_floor_to_width() {
        let index = index();
        let base = Utc.with_ymd_and_hms(2026, 5, 1, 14, 0, 0).unwrap();
        assert_eq!(index.slot_of(base), index.slot_of(base + Duration::minutes(14)));
        assert_eq!(index.slot_of(base) + 1, index.slot_of(base + Duration::minutes(15)));
        assert_eq!(index.slot_of(base) - 1, index.slot_of(base - Duration::seconds(1)));
    }

    #[test]
    fn neighbors_cover_rings_and_adjacent_slots() {
        let index = index();
        let request = request_at(1, lax_origin(), 0);
        let key = index.bucket_of(&request).expect("bucket");
        let keys = index.neighbors(key, 1);
        assert_eq!(keys.len(), 7 * 3);
        assert!(keys.contains(&key));
        assert!(keys.iter().all(|k| (k.slot - key.slot).abs() <= 1));
    }

    #[test]
    fn candidates_exclude_far_slots_and_removed_requests() {
        let mut index = index();
        let a = request_at(1, lax_origin(), 0);
        let b = request_at(2, lax_origin(), 10);
        let far_in_time = request_at(3, lax_origin(), 120);
        for r in [&a, &b, &far_in_time] {
            index.insert(r);
        }
        assert_eq!(index.candidates(&a), vec![b.id()]);

        index.remove(b.id());
        assert!(index.candidates(&a).is_empty());
        assert_eq!(index.len(), 2);
    }
}
