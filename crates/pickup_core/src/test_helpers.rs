//! Test helpers: fixtures around LAX/SFO and in-memory collaborators.
//!
//! Compiled with the `test-helpers` feature (on by default) so integration
//! tests, benches and the crate example can share them.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use h3o::{CellIndex, LatLng, Resolution};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::audit::{AuditRecord, AuditSink};
use crate::error::{AuditError, ServiceError, StoreError};
use crate::request::{
    BagCount, Coordinate, Direction, FlightId, RawRequest, Request, TimeWindow,
};
use crate::ride::{CommittedGroup, RideId};
use crate::routing::Router;
use crate::services::Geocoder;
use crate::spatial::distance_km;
use crate::store::{EligibilityWindow, RideStore};

/// A valid H3 cell at resolution 10, used where only some cell is needed.
pub const TEST_CELL: u64 = 0x8a1fb46622dffff;

pub fn test_cell() -> CellIndex {
    CellIndex::try_from(TEST_CELL).expect("TEST_CELL should be a valid H3 cell")
}

pub fn test_neighbor_cell() -> CellIndex {
    test_cell()
        .grid_disk::<Vec<_>>(1)
        .into_iter()
        .find(|c| *c != test_cell())
        .expect("test cell should have neighbors")
}

/// Start of a 15 minute slot all fixtures are scheduled relative to.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 14, 0, 0)
        .single()
        .expect("valid fixture time")
}

pub fn at_minutes(offset: i64) -> DateTime<Utc> {
    base_time() + chrono::Duration::minutes(offset)
}

const INDEX_RESOLUTION: Resolution = Resolution::Nine;

fn cell_center(cell: CellIndex) -> Coordinate {
    LatLng::from(cell).into()
}

fn cell_at(coord: Coordinate) -> CellIndex {
    coord.cell(INDEX_RESOLUTION).expect("fixture coordinate is valid")
}

/// Center of the index cell covering UCLA.
pub fn lax_origin() -> Coordinate {
    cell_center(cell_at(Coordinate::new(34.0689, -118.4452)))
}

/// Center of the `n`-th direct neighbour (ascending cell order) of the
/// [`lax_origin`] index cell.
pub fn neighbor_origin(n: usize) -> Coordinate {
    let center = cell_at(lax_origin());
    let mut ring: Vec<CellIndex> = center
        .grid_disk::<Vec<_>>(1)
        .into_iter()
        .filter(|c| *c != center)
        .collect();
    ring.sort_unstable();
    cell_center(ring[n % ring.len()])
}

pub fn offset_origin(dlat: f64, dlng: f64) -> Coordinate {
    let origin = lax_origin();
    Coordinate::new(origin.lat + dlat, origin.lng + dlng)
}

pub fn lax_terminal() -> Coordinate {
    Coordinate::new(33.9416, -118.4085)
}

/// Center of the index cell covering Stanford.
pub fn sfo_origin() -> Coordinate {
    cell_center(cell_at(Coordinate::new(37.4275, -122.1697)))
}

pub fn sfo_terminal() -> Coordinate {
    Coordinate::new(37.6213, -122.3790)
}

/// Validated LAX drop-off request: terminal T4, one bag, 30 minute window
/// starting `minutes` after [`base_time`].
pub fn request_at(id: i64, origin: Coordinate, minutes: i64) -> Request {
    let earliest = at_minutes(minutes);
    Request {
        flight_id: FlightId(id),
        user_id: format!("user-{id}"),
        airport: "LAX".into(),
        terminal: "T4".into(),
        direction: Direction::ToAirport,
        origin,
        destination: lax_terminal(),
        window: TimeWindow {
            earliest,
            latest: earliest + chrono::Duration::minutes(30),
        },
        bags: BagCount { total: 1, large: 0 },
        budget: Some(40.0),
    }
}

/// Store record for an LAX drop-off from `origin`, coordinates resolved.
pub fn raw_at(id: i64, origin: Coordinate, minutes: i64) -> RawRequest {
    RawRequest {
        flight_id: Some(id),
        user_id: Some(format!("user-{id}")),
        airport: Some("lax".into()),
        terminal: Some("Terminal 4".into()),
        to_airport: Some(true),
        origin_address: Some("UCLA".into()),
        origin: Some(origin),
        destination_address: None,
        destination: Some(lax_terminal()),
        scheduled_at: Some(at_minutes(minutes)),
        latest_at: None,
        bags: Some(1),
        large_bags: Some(0),
        budget: Some(40.0),
    }
}

pub fn raw_request(id: i64, minutes: i64) -> RawRequest {
    raw_at(id, lax_origin(), minutes)
}

/// Store record for an SFO drop-off from around Stanford.
pub fn sfo_raw_at(id: i64, origin: Coordinate, minutes: i64) -> RawRequest {
    RawRequest {
        airport: Some("SFO".into()),
        terminal: Some("INTL".into()),
        origin_address: Some("Stanford".into()),
        destination: Some(sfo_terminal()),
        ..raw_at(id, origin, minutes)
    }
}

/// Seeded batch of LAX requests scattered around [`lax_origin`] over two hours.
pub fn random_batch(seed: u64, size: usize) -> Vec<Request> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..size)
        .map(|i| {
            let origin = offset_origin(rng.gen_range(-0.03..0.03), rng.gen_range(-0.03..0.03));
            let mut request = request_at(i as i64 + 1, origin, rng.gen_range(0..120));
            let large = rng.gen_range(0..2);
            request.bags = BagCount {
                total: large + rng.gen_range(0..3),
                large,
            };
            request.budget = Some(rng.gen_range(20.0..80.0));
            request
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Router answering with straight-line time at 40 km/h, with scriptable faults.
#[derive(Debug, Default)]
pub struct ScriptedRouter {
    calls: Arc<AtomicUsize>,
    stall: Option<Duration>,
    rate_limited_first: usize,
    unavailable: bool,
    overrides: HashMap<(CellIndex, CellIndex), Duration>,
}

impl ScriptedRouter {
    pub const SPEED_KMH: f64 = 40.0;

    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering every call.
    pub fn stall_after(mut self, delay: Duration) -> Self {
        self.stall = Some(delay);
        self
    }

    /// Answer the first `n` calls with [`ServiceError::RateLimited`].
    pub fn rate_limited_first(mut self, n: usize) -> Self {
        self.rate_limited_first = n;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Fixed answer for legs between the route cells (resolution 10) of two
    /// coordinates.
    pub fn with_leg(mut self, from: Coordinate, to: Coordinate, eta: Duration) -> Self {
        if let (Some(from), Some(to)) = (from.cell(Resolution::Ten), to.cell(Resolution::Ten)) {
            self.overrides.insert((from, to), eta);
        }
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Router for ScriptedRouter {
    async fn route_eta(&self, from: Coordinate, to: Coordinate) -> Result<Duration, ServiceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(ServiceError::Unavailable("scripted outage".into()));
        }
        if call < self.rate_limited_first {
            return Err(ServiceError::RateLimited);
        }
        if let Some(delay) = self.stall {
            tokio::time::sleep(delay).await;
        }
        if let (Some(a), Some(b)) = (from.cell(Resolution::Ten), to.cell(Resolution::Ten)) {
            if let Some(eta) = self.overrides.get(&(a, b)) {
                return Ok(*eta);
            }
        }
        let hours = distance_km(from, to) / Self::SPEED_KMH;
        Ok(Duration::from_secs_f64(hours * 3600.0))
    }
}

/// Geocoder over a fixed address book. Lookups ignore case and surrounding
/// whitespace; unknown addresses are [`ServiceError::NotFound`].
#[derive(Debug, Default)]
pub struct StaticGeocoder {
    book: HashMap<String, Coordinate>,
    calls: Arc<AtomicUsize>,
    unavailable: bool,
}

impl StaticGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: &str, coordinate: Coordinate) -> Self {
        self.book.insert(address.trim().to_lowercase(), coordinate);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn resolve(&self, address: &str) -> Result<Coordinate, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(ServiceError::Unavailable("scripted outage".into()));
        }
        self.book
            .get(&address.trim().to_lowercase())
            .copied()
            .ok_or(ServiceError::NotFound)
    }
}

#[derive(Debug, Default)]
struct StoreState {
    flights: HashMap<i64, RawRequest>,
    matched: BTreeSet<FlightId>,
    rides: Vec<CommittedGroup>,
    fetch_failure: Option<(StoreError, usize)>,
    commit_failures: usize,
    mark_failures: usize,
    fetch_calls: usize,
}

/// In-memory [`RideStore`] with fault injection.
#[derive(Debug, Default)]
pub struct InMemoryRideStore {
    state: Mutex<StoreState>,
    commit_delay: Mutex<Option<Duration>>,
}

impl InMemoryRideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_flights(&self, raws: impl IntoIterator<Item = RawRequest>) {
        let mut state = lock(&self.state);
        for raw in raws {
            if let Some(id) = raw.flight_id {
                state.flights.insert(id, raw);
            }
        }
    }

    /// Fail the next `times` fetches with `error`.
    pub fn fail_fetch_with(&self, error: StoreError, times: usize) {
        lock(&self.state).fetch_failure = Some((error, times));
    }

    /// Fail the next `times` commits before anything is written.
    pub fn fail_commits(&self, times: usize) {
        lock(&self.state).commit_failures = times;
    }

    /// Fail the next `times` calls to `mark_matched`.
    pub fn fail_mark_matched(&self, times: usize) {
        lock(&self.state).mark_failures = times;
    }

    /// Sleep this long inside every commit.
    pub fn delay_commits(&self, delay: Duration) {
        *lock(&self.commit_delay) = Some(delay);
    }

    pub fn rides(&self) -> Vec<CommittedGroup> {
        lock(&self.state).rides.clone()
    }

    pub fn matched(&self) -> BTreeSet<FlightId> {
        lock(&self.state).matched.clone()
    }

    pub fn fetch_calls(&self) -> usize {
        lock(&self.state).fetch_calls
    }
}

#[async_trait]
impl RideStore for InMemoryRideStore {
    async fn fetch_eligible(
        &self,
        window: EligibilityWindow,
        limit: usize,
    ) -> Result<Vec<RawRequest>, StoreError> {
        let mut state = lock(&self.state);
        state.fetch_calls += 1;
        if let Some((error, remaining)) = state.fetch_failure.take() {
            if remaining > 1 {
                state.fetch_failure = Some((error.clone(), remaining - 1));
            }
            if remaining > 0 {
                return Err(error);
            }
        }

        let mut eligible: Vec<RawRequest> = state
            .flights
            .values()
            .filter(|raw| {
                let unmatched = raw
                    .flight_id
                    .is_some_and(|id| !state.matched.contains(&FlightId(id)));
                let in_window = raw.scheduled_at.is_some_and(|at| window.contains(at));
                unmatched && in_window
            })
            .cloned()
            .collect();
        eligible.sort_by_key(|raw| (raw.scheduled_at, raw.flight_id));
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn next_ride_id(&self) -> Result<RideId, StoreError> {
        let state = lock(&self.state);
        let highest = state.rides.iter().map(|r| r.ride_id.0).max().unwrap_or(0);
        Ok(RideId(highest + 1))
    }

    async fn commit_groups(&self, groups: &[CommittedGroup]) -> Result<(), StoreError> {
        let delay = *lock(&self.commit_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(StoreError::Unavailable("commit aborted".into()));
        }
        let mut ride_ids: BTreeSet<RideId> = state.rides.iter().map(|r| r.ride_id).collect();
        let mut flights: BTreeSet<FlightId> =
            state.rides.iter().flat_map(|r| r.flight_ids()).collect();
        for group in groups {
            if !ride_ids.insert(group.ride_id) {
                return Err(StoreError::Conflict(format!("ride {} exists", group.ride_id)));
            }
            for flight in group.flight_ids() {
                if !flights.insert(flight) {
                    return Err(StoreError::Conflict(format!("flight {flight} already in a ride")));
                }
            }
        }
        state.rides.extend(groups.iter().cloned());
        Ok(())
    }

    async fn mark_matched(&self, flights: &[FlightId]) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.mark_failures > 0 {
            state.mark_failures -= 1;
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        state.matched.extend(flights.iter().copied());
        Ok(())
    }

    async fn committed_rides(
        &self,
        flights: &[FlightId],
    ) -> Result<Vec<(FlightId, RideId)>, StoreError> {
        let wanted: BTreeSet<FlightId> = flights.iter().copied().collect();
        let state = lock(&self.state);
        Ok(state
            .rides
            .iter()
            .flat_map(|ride| ride.flight_ids().map(move |f| (f, ride.ride_id)))
            .filter(|(flight, _)| wanted.contains(flight))
            .collect())
    }
}

/// Keeps every audit record; can be switched to fail every call.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
    failing: bool,
    hanging: bool,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// A sink whose writes never complete.
    pub fn hanging() -> Self {
        Self {
            hanging: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        if self.hanging {
            std::future::pending::<()>().await;
        }
        if self.failing {
            return Err(AuditError("sink offline".into()));
        }
        lock(&self.records).push(record);
        Ok(())
    }
}
