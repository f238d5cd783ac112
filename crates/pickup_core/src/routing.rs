//! Route ETA lookups: the routing-service contract and per-run travel-time tables.
//!
//! - **`Router`**: async contract of the external routing service.
//! - **`TravelTimes`**: synchronous leg lookup used by the scorer during the
//!   grouping pass. The pass never blocks on the network; legs are prefetched
//!   into a [`RouteSnapshot`] beforehand.
//! - **`EstimatedTravelTimes`**: straight-line estimate at an assumed speed.
//!   Zero dependencies, used when no snapshot is needed.
//! - **`OsrmRouter`** (feature `osrm`): calls an OSRM HTTP endpoint.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use h3o::CellIndex;

use crate::cache::RouteKey;
use crate::error::ServiceError;
use crate::request::Coordinate;
use crate::spatial::distance_km_between_cells;

/// External routing service: driving time between two coordinates.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route_eta(&self, from: Coordinate, to: Coordinate) -> Result<Duration, ServiceError>;
}

/// Travel time of one leg as seen by the scorer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LegTime {
    pub minutes: f64,
    /// The leg could not be routed and `minutes` is a straight-line estimate.
    pub degraded: bool,
}

impl LegTime {
    pub const ZERO: LegTime = LegTime {
        minutes: 0.0,
        degraded: false,
    };
}

pub trait TravelTimes {
    fn leg(&self, key: RouteKey) -> LegTime;
}

/// Straight-line minutes between two cell centers at `speed_kmh`.
pub fn estimate_minutes(from: CellIndex, to: CellIndex, speed_kmh: f64) -> f64 {
    if from == to || speed_kmh <= 0.0 {
        return 0.0;
    }
    distance_km_between_cells(from, to) / speed_kmh * 60.0
}

/// Every leg estimated from straight-line distance; never degraded.
#[derive(Debug, Clone, Copy)]
pub struct EstimatedTravelTimes {
    pub speed_kmh: f64,
}

impl TravelTimes for EstimatedTravelTimes {
    fn leg(&self, key: RouteKey) -> LegTime {
        LegTime {
            minutes: estimate_minutes(key.from, key.to, self.speed_kmh),
            degraded: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegOutcome {
    Routed(Duration),
    /// Lookup timed out or found no route; the leg is estimated and penalized.
    Degraded,
}

/// Immutable view of the route legs available to one grouping pass.
///
/// Legs that are missing or degraded fall back to a straight-line estimate and
/// are flagged `degraded`.
#[derive(Debug, Clone, Default)]
pub struct RouteSnapshot {
    legs: HashMap<RouteKey, LegOutcome>,
    fallback_speed_kmh: f64,
}

impl RouteSnapshot {
    pub fn new(fallback_speed_kmh: f64) -> Self {
        Self {
            legs: HashMap::new(),
            fallback_speed_kmh,
        }
    }

    pub fn insert(&mut self, key: RouteKey, outcome: LegOutcome) {
        self.legs.insert(key, outcome);
    }

    pub fn get(&self, key: &RouteKey) -> Option<LegOutcome> {
        self.legs.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.legs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.legs.is_empty()
    }

    pub fn degraded_count(&self) -> usize {
        self.legs
            .values()
            .filter(|outcome| matches!(outcome, LegOutcome::Degraded))
            .count()
    }
}

impl TravelTimes for RouteSnapshot {
    fn leg(&self, key: RouteKey) -> LegTime {
        if key.is_trivial() {
            return LegTime::ZERO;
        }
        match self.legs.get(&key) {
            Some(LegOutcome::Routed(duration)) => LegTime {
                minutes: duration.as_secs_f64() / 60.0,
                degraded: false,
            },
            Some(LegOutcome::Degraded) | None => LegTime {
                minutes: estimate_minutes(key.from, key.to, self.fallback_speed_kmh),
                degraded: true,
            },
        }
    }
}

#[cfg(feature = "osrm")]
pub mod osrm {
    use super::*;
    use reqwest::{Client, StatusCode};
    use serde::Deserialize;

    /// Routes via an OSRM HTTP endpoint.
    pub struct OsrmRouter {
        client: Client,
        endpoint: String,
    }

    impl OsrmRouter {
        pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ServiceError> {
            let client = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|err| ServiceError::Unavailable(format!("http client: {err}")))?;
            Ok(Self {
                client,
                endpoint: endpoint.trim_end_matches('/').to_string(),
            })
        }
    }

    /// Minimal OSRM JSON response structures.
    #[derive(Deserialize)]
    struct OsrmResponse {
        code: String,
        routes: Option<Vec<OsrmRoute>>,
    }

    #[derive(Deserialize)]
    struct OsrmRoute {
        duration: f64, // seconds
    }

    fn map_http_error(err: reqwest::Error) -> ServiceError {
        if err.is_timeout() {
            ServiceError::Timeout(Duration::ZERO)
        } else {
            ServiceError::Unavailable(err.to_string())
        }
    }

    #[async_trait]
    impl Router for OsrmRouter {
        async fn route_eta(
            &self,
            from: Coordinate,
            to: Coordinate,
        ) -> Result<Duration, ServiceError> {
            let url = format!(
                "{}/route/v1/driving/{},{};{},{}?overview=false",
                self.endpoint, from.lng, from.lat, to.lng, to.lat,
            );

            let response = self.client.get(&url).send().await.map_err(map_http_error)?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                return Err(ServiceError::RateLimited);
            }
            let parsed: OsrmResponse = response.json().await.map_err(map_http_error)?;

            match parsed.code.as_str() {
                "Ok" => {}
                "NoRoute" | "NoSegment" => return Err(ServiceError::NotFound),
                other => return Err(ServiceError::Unavailable(format!("osrm code {other}"))),
            }

            let route = parsed
                .routes
                .and_then(|routes| routes.into_iter().next())
                .ok_or(ServiceError::NotFound)?;
            Ok(Duration::from_secs_f64(route.duration.max(0.0)))
        }
    }
}
