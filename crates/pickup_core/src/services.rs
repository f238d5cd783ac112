//! Gateway to the external geocoding/routing service.
//!
//! Every outbound call goes through one [`LookupGateway`], which reads through
//! the [`LookupCaches`], self-throttles to the configured calls-per-minute
//! ceiling and bounds each call with its own timeout, independent of the
//! run-level timeout.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use h3o::LatLng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{LookupCaches, RouteKey};
use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::request::Coordinate;
use crate::routing::{LegOutcome, RouteSnapshot, Router};

/// Base delay after the service reports a rate limit; doubles per retry.
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(1);

/// External geocoding service: address to coordinate.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn resolve(&self, address: &str) -> Result<Coordinate, ServiceError>;
}

/// Spaces calls evenly so at most `calls_per_minute` start in any minute.
#[derive(Debug)]
pub struct Throttle {
    spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl Throttle {
    pub fn per_minute(calls_per_minute: u32) -> Self {
        Self {
            spacing: Duration::from_secs(60) / calls_per_minute.max(1),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub fn spacing(&self) -> Duration {
        self.spacing
    }

    /// Wait for the next free call slot.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.spacing;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }

    /// Push every future slot back by at least `delay` from now.
    pub async fn back_off(&self, delay: Duration) {
        let mut next = self.next_slot.lock().await;
        let until = Instant::now() + delay;
        if *next < until {
            *next = until;
        }
    }
}

fn cache_key(address: &str) -> String {
    address.trim().to_lowercase()
}

pub struct LookupGateway {
    geocoder: Arc<dyn Geocoder>,
    router: Arc<dyn Router>,
    caches: Arc<LookupCaches>,
    throttle: Throttle,
    config: ServiceConfig,
    fallback_speed_kmh: f64,
}

impl LookupGateway {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        router: Arc<dyn Router>,
        caches: Arc<LookupCaches>,
        config: ServiceConfig,
        fallback_speed_kmh: f64,
    ) -> Self {
        Self {
            geocoder,
            router,
            caches,
            throttle: Throttle::per_minute(config.calls_per_minute),
            config,
            fallback_speed_kmh,
        }
    }

    pub fn caches(&self) -> &LookupCaches {
        &self.caches
    }

    /// Run one throttled, timed call, backing off and retrying on rate limits.
    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let timeout = self.config.call_timeout();
        let mut attempt = 0u32;
        loop {
            self.throttle.acquire().await;
            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(timeout)),
            };
            match result {
                Err(ServiceError::RateLimited) if attempt < self.config.rate_limit_retries => {
                    let delay = RATE_LIMIT_BACKOFF * 2u32.pow(attempt.min(8));
                    warn!(attempt, ?delay, "external service rate limited, backing off");
                    self.throttle.back_off(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Resolve an address, reading through the coordinate cache.
    pub async fn resolve_coordinate(&self, address: &str) -> Result<Coordinate, ServiceError> {
        let key = cache_key(address);
        if key.is_empty() {
            return Err(ServiceError::NotFound);
        }
        if let Some(coord) = self.caches.coordinates.get(&key) {
            return Ok(coord);
        }

        let coord = self.call(|| self.geocoder.resolve(address)).await?;
        if !coord.is_valid() {
            return Err(ServiceError::NotFound);
        }
        self.caches.coordinates.put(key, coord);
        Ok(coord)
    }

    async fn fetch_leg(&self, key: RouteKey) -> Result<Duration, ServiceError> {
        let from: Coordinate = LatLng::from(key.from).into();
        let to: Coordinate = LatLng::from(key.to).into();
        self.call(|| self.router.route_eta(from, to)).await
    }

    /// Look up every leg concurrently (bounded in-flight) and freeze the
    /// results into a snapshot for one grouping pass.
    ///
    /// A timeout, missing route or exhausted rate-limit retries degrade the
    /// leg; only an unavailable service fails the call.
    pub async fn prefetch_routes(
        &self,
        legs: BTreeSet<RouteKey>,
    ) -> Result<RouteSnapshot, ServiceError> {
        let mut snapshot = RouteSnapshot::new(self.fallback_speed_kmh);
        let mut missing = Vec::new();
        for key in legs.into_iter().filter(|key| !key.is_trivial()) {
            match self.caches.routes.get(&key) {
                Some(duration) => snapshot.insert(key, LegOutcome::Routed(duration)),
                None => missing.push(key),
            }
        }
        let cached = snapshot.len();

        // Routed legs are cached as they arrive; a cancelled prefetch keeps them.
        let results: Vec<(RouteKey, Result<Duration, ServiceError>)> = stream::iter(missing)
            .map(|key| async move {
                let result = self.fetch_leg(key).await;
                if let Ok(duration) = &result {
                    self.caches.routes.put(key, *duration);
                }
                (key, result)
            })
            .buffer_unordered(self.config.max_in_flight)
            .collect()
            .await;

        let fetched = results.len();
        for (key, result) in results {
            match result {
                Ok(duration) => snapshot.insert(key, LegOutcome::Routed(duration)),
                Err(ServiceError::Unavailable(reason)) => {
                    return Err(ServiceError::Unavailable(reason));
                }
                Err(err) => {
                    debug!(from = %key.from, to = %key.to, error = %err, "route leg degraded");
                    snapshot.insert(key, LegOutcome::Degraded);
                }
            }
        }

        debug!(
            cached,
            fetched,
            degraded = snapshot.degraded_count(),
            "route snapshot ready"
        );
        Ok(snapshot)
    }
}
