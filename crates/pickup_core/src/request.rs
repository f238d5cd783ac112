//! Pickup requests: loosely-typed store records and their validated form.
//!
//! A [`RawRequest`] is whatever the store hands back for one flight/user pair.
//! [`Request::from_raw`] turns it into an immutable, strongly-typed [`Request`]
//! or rejects it with a [`ValidationError`]; nothing is silently coerced.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};

use crate::config::ConstraintConfig;
use crate::error::ValidationError;

/// Identifier of a flight record. One request is derived from one flight row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlightId(pub i64);

impl fmt::Display for FlightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requests are identified by the flight they were derived from.
pub type RequestId = FlightId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    fn validated(self, field: &'static str) -> Result<Self, ValidationError> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(ValidationError::InvalidCoordinate {
                field,
                lat: self.lat,
                lng: self.lng,
            })
        }
    }

    /// H3 cell containing this coordinate. Only called on validated coordinates.
    pub fn cell(&self, resolution: Resolution) -> Option<CellIndex> {
        LatLng::new(self.lat, self.lng)
            .ok()
            .map(|ll| ll.to_cell(resolution))
    }
}

impl From<LatLng> for Coordinate {
    fn from(value: LatLng) -> Self {
        Self::new(value.lat(), value.lng())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ToAirport,
    FromAirport,
}

impl Direction {
    pub fn from_to_airport(to_airport: bool) -> Self {
        if to_airport {
            Direction::ToAirport
        } else {
            Direction::FromAirport
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BagCount {
    pub total: u32,
    pub large: u32,
}

impl BagCount {
    pub fn combined(self, other: BagCount) -> BagCount {
        BagCount {
            total: self.total.saturating_add(other.total),
            large: self.large.saturating_add(other.large),
        }
    }
}

/// Pickup availability. `earliest` is the scheduled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub earliest: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl TimeWindow {
    /// Overlap of two windows, if they share more than an instant.
    pub fn intersect(&self, other: &TimeWindow) -> Option<TimeWindow> {
        let earliest = self.earliest.max(other.earliest);
        let latest = self.latest.min(other.latest);
        (earliest < latest).then_some(TimeWindow { earliest, latest })
    }

    pub fn midpoint(&self) -> DateTime<Utc> {
        self.earliest + (self.latest - self.earliest) / 2
    }
}

/// Flight/user record as read from the store. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RawRequest {
    pub flight_id: Option<i64>,
    pub user_id: Option<String>,
    pub airport: Option<String>,
    pub terminal: Option<String>,
    pub to_airport: Option<bool>,
    pub origin_address: Option<String>,
    pub origin: Option<Coordinate>,
    pub destination_address: Option<String>,
    pub destination: Option<Coordinate>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub latest_at: Option<DateTime<Utc>>,
    pub bags: Option<i64>,
    pub large_bags: Option<i64>,
    pub budget: Option<f64>,
}

impl RawRequest {
    /// Address used to geocode the airport side when the record carries none.
    pub fn airport_address(&self) -> Option<String> {
        let airport = normalize_airport(self.airport.as_deref()?)?;
        match self.terminal.as_deref().map(normalize_terminal) {
            Some(terminal) if terminal != UNKNOWN_TERMINAL => {
                Some(format!("{airport} airport terminal {terminal}"))
            }
            _ => Some(format!("{airport} airport")),
        }
    }
}

/// Validated pickup request. Immutable once admitted to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub flight_id: FlightId,
    pub user_id: String,
    pub airport: String,
    pub terminal: String,
    pub direction: Direction,
    pub origin: Coordinate,
    pub destination: Coordinate,
    pub window: TimeWindow,
    pub bags: BagCount,
    pub budget: Option<f64>,
}

impl Request {
    pub fn id(&self) -> RequestId {
        self.flight_id
    }

    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.window.earliest
    }

    /// Endpoint at the airport: the destination for drop-offs, the origin for pickups.
    pub fn airport_side(&self) -> Coordinate {
        match self.direction {
            Direction::ToAirport => self.destination,
            Direction::FromAirport => self.origin,
        }
    }

    /// Validate a store record against the configured constraints.
    pub fn admit(raw: RawRequest, constraints: &ConstraintConfig) -> Result<Self, ValidationError> {
        let request = Self::from_raw(raw, constraints.default_flex())?;
        if request.bags.large > constraints.bag_target_large
            || request.bags.total > constraints.bag_target_total
        {
            return Err(ValidationError::BagsOverCapacity {
                total: request.bags.total,
                large: request.bags.large,
            });
        }
        Ok(request)
    }

    /// Validate a store record. Coordinates must already be resolved.
    pub fn from_raw(raw: RawRequest, default_flex: Duration) -> Result<Self, ValidationError> {
        let flight_id = raw
            .flight_id
            .map(FlightId)
            .ok_or(ValidationError::MissingField("flight_id"))?;
        let user_id = raw
            .user_id
            .filter(|u| !u.trim().is_empty())
            .ok_or(ValidationError::MissingField("user_id"))?;
        let airport = raw
            .airport
            .as_deref()
            .and_then(normalize_airport)
            .ok_or(ValidationError::MissingField("airport"))?;
        let terminal = raw
            .terminal
            .as_deref()
            .map(normalize_terminal)
            .unwrap_or_else(|| UNKNOWN_TERMINAL.to_string());
        let direction = raw
            .to_airport
            .map(Direction::from_to_airport)
            .ok_or(ValidationError::MissingField("to_airport"))?;

        let origin = raw
            .origin
            .ok_or(ValidationError::MissingField("origin"))?
            .validated("origin")?;
        let destination = raw
            .destination
            .ok_or(ValidationError::MissingField("destination"))?
            .validated("destination")?;

        let earliest = raw
            .scheduled_at
            .ok_or(ValidationError::MissingField("scheduled_at"))?;
        let latest = raw.latest_at.unwrap_or(earliest + default_flex);
        if latest <= earliest {
            return Err(ValidationError::InvertedWindow);
        }

        let regular = bag_count("bags", raw.bags)?;
        let large = bag_count("large_bags", raw.large_bags)?;
        let total = regular
            .checked_add(large)
            .ok_or(ValidationError::BagCountOverflow { regular, large })?;

        let budget = match raw.budget {
            Some(b) if !b.is_finite() || b < 0.0 => return Err(ValidationError::InvalidBudget(b)),
            other => other,
        };

        Ok(Request {
            flight_id,
            user_id,
            airport,
            terminal,
            direction,
            origin,
            destination,
            window: TimeWindow { earliest, latest },
            bags: BagCount {
                total,
                large,
            },
            budget,
        })
    }
}

fn bag_count(field: &'static str, value: Option<i64>) -> Result<u32, ValidationError> {
    match value {
        None => Ok(0),
        Some(v) if v < 0 => Err(ValidationError::NegativeBagCount { field, value: v }),
        Some(v) => u32::try_from(v).map_err(|_| ValidationError::NegativeBagCount { field, value: v }),
    }
}

/// Excluded request and the reason, reported per run.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub request_id: Option<RequestId>,
    pub error: ValidationError,
}

pub const UNKNOWN_TERMINAL: &str = "UNKNOWN";

/// Upper-cased, trimmed airport code; `None` for blank input.
pub fn normalize_airport(raw: &str) -> Option<String> {
    let airport = raw.trim().to_uppercase();
    (!airport.is_empty()).then_some(airport)
}

/// Canonical terminal label: `"Terminal 4"`, `"4"`, `"t4"` all become `"T4"`;
/// international terminal aliases become `"INTL"`.
pub fn normalize_terminal(raw: &str) -> String {
    let term = raw.trim().to_uppercase();
    if term.is_empty() {
        return UNKNOWN_TERMINAL.to_string();
    }
    if term.contains("INTL") || term.contains("INTERNATIONAL") || term.contains("TBIT") {
        return "INTL".to_string();
    }

    let rest = term
        .strip_prefix("TERMINAL")
        .map(str::trim)
        .unwrap_or(term.as_str());
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
        return format!("T{rest}");
    }
    if let Some(digits) = rest.strip_prefix('T') {
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            return rest.to_string();
        }
    }
    if rest.len() == 1 && rest.chars().all(|c| c.is_ascii_alphabetic()) {
        return rest.to_string();
    }
    term
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw() -> RawRequest {
        RawRequest {
            flight_id: Some(7),
            user_id: Some("u-7".into()),
            airport: Some(" lax ".into()),
            terminal: Some("Terminal 4".into()),
            to_airport: Some(true),
            origin: Some(Coordinate::new(34.0689, -118.4452)),
            destination: Some(Coordinate::new(33.9416, -118.4085)),
            scheduled_at: Some(Utc.with_ymd_and_hms(2026, 5, 1, 14, 0, 0).unwrap()),
            bags: Some(2),
            large_bags: Some(1),
            budget: Some(45.0),
            ..RawRequest::default()
        }
    }

    #[test]
    fn normalizes_terminal_spellings() {
        assert_eq!(normalize_terminal("Terminal 4"), "T4");
        assert_eq!(normalize_terminal(" 4 "), "T4");
        assert_eq!(normalize_terminal("t5"), "T5");
        assert_eq!(normalize_terminal("Tom Bradley TBIT"), "INTL");
        assert_eq!(normalize_terminal("b"), "B");
        assert_eq!(normalize_terminal(""), UNKNOWN_TERMINAL);
    }

    #[test]
    fn admits_well_formed_record() {
        let request = Request::from_raw(raw(), Duration::minutes(30)).expect("valid");
        assert_eq!(request.id(), FlightId(7));
        assert_eq!(request.airport, "LAX");
        assert_eq!(request.terminal, "T4");
        assert_eq!(request.direction, Direction::ToAirport);
        assert_eq!(request.bags, BagCount { total: 3, large: 1 });
        assert_eq!(
            request.window.latest - request.window.earliest,
            Duration::minutes(30)
        );
        assert_eq!(request.airport_side(), request.destination);
    }

    #[test]
    fn rejects_malformed_records() {
        let mut missing = raw();
        missing.origin = None;
        assert_eq!(
            Request::from_raw(missing, Duration::minutes(30)),
            Err(ValidationError::MissingField("origin"))
        );

        let mut bad_coord = raw();
        bad_coord.destination = Some(Coordinate::new(123.0, 0.0));
        assert!(matches!(
            Request::from_raw(bad_coord, Duration::minutes(30)),
            Err(ValidationError::InvalidCoordinate { field: "destination", .. })
        ));

        let mut bags = raw();
        bags.large_bags = Some(-1);
        assert!(matches!(
            Request::from_raw(bags, Duration::minutes(30)),
            Err(ValidationError::NegativeBagCount { field: "large_bags", value: -1 })
        ));

        let mut window = raw();
        window.latest_at = Some(Utc.with_ymd_and_hms(2026, 5, 1, 13, 0, 0).unwrap());
        assert_eq!(
            Request::from_raw(window, Duration::minutes(30)),
            Err(ValidationError::InvertedWindow)
        );

        let mut budget = raw();
        budget.budget = Some(f64::NAN);
        assert!(matches!(
            Request::from_raw(budget, Duration::minutes(30)),
            Err(ValidationError::InvalidBudget(_))
        ));
    }

    #[test]
    fn rejects_bag_counts_whose_sum_overflows() {
        let mut huge = raw();
        huge.bags = Some(i64::from(u32::MAX));
        huge.large_bags = Some(1);
        assert_eq!(
            Request::admit(huge, &ConstraintConfig::default()),
            Err(ValidationError::BagCountOverflow { regular: u32::MAX, large: 1 })
        );

        let full = BagCount { total: u32::MAX, large: u32::MAX };
        assert_eq!(full.combined(BagCount { total: 3, large: 1 }), full);
    }

    #[test]
    fn zero_and_missing_bag_counts_are_accepted() {
        let mut empty = raw();
        empty.bags = Some(0);
        empty.large_bags = None;
        let request = Request::from_raw(empty, Duration::minutes(30)).expect("valid");
        assert_eq!(request.bags, BagCount { total: 0, large: 0 });
    }

    #[test]
    fn rejects_zero_width_window() {
        let mut instant = raw();
        instant.latest_at = instant.scheduled_at;
        assert_eq!(
            Request::from_raw(instant, Duration::minutes(30)),
            Err(ValidationError::InvertedWindow)
        );
    }

    #[test]
    fn admit_rejects_a_single_request_over_vehicle_capacity() {
        let constraints = ConstraintConfig::default();
        let mut heavy = raw();
        heavy.bags = Some(7);
        heavy.large_bags = Some(4);
        assert_eq!(
            Request::admit(heavy, &constraints),
            Err(ValidationError::BagsOverCapacity { total: 11, large: 4 })
        );
        assert!(Request::admit(raw(), &constraints).is_ok());
    }

    #[test]
    fn window_intersection_and_midpoint() {
        let at = |h, m| Utc.with_ymd_and_hms(2026, 5, 1, h, m, 0).unwrap();
        let a = TimeWindow { earliest: at(14, 0), latest: at(14, 40) };
        let b = TimeWindow { earliest: at(14, 20), latest: at(15, 0) };
        let overlap = a.intersect(&b).expect("overlap");
        assert_eq!(overlap.midpoint(), at(14, 30));

        let c = TimeWindow { earliest: at(14, 40), latest: at(15, 0) };
        assert!(a.intersect(&c).is_none());
    }

    #[test]
    fn airport_address_includes_known_terminal() {
        assert_eq!(
            raw().airport_address().as_deref(),
            Some("LAX airport terminal T4")
        );
        let mut no_terminal = raw();
        no_terminal.terminal = None;
        assert_eq!(no_terminal.airport_address().as_deref(), Some("LAX airport"));
    }
}
