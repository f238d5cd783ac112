//! Engine configuration: every tunable knob of the pooling engine, with defaults.
//!
//! All sections deserialize with `#[serde(default)]`, so a partial document only
//! overrides what it names. Call [`EngineConfig::validate`] before handing the
//! config to the engine or scheduler.

use std::time::Duration;

use h3o::Resolution;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default maximum detour (minutes) any member may incur by sharing a ride.
pub const MAX_DETOUR_DEFAULT_MIN: f64 = 20.0;
/// Default combined bag capacity of one ride.
pub const BAG_TARGET_TOTAL: u32 = 10;
/// Default combined large-bag capacity of one ride.
pub const BAG_TARGET_LARGE: u32 = 4;

/// How terminal mismatches are treated when pairing requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalPolicy {
    /// Members of one group must share the exact terminal.
    #[default]
    Strict,
    /// Terminal mismatches are tolerated with a distance-weighted penalty.
    Soft,
}

/// Spatial-temporal bucketing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Width of one time slot in minutes.
    pub slot_minutes: u32,
    /// H3 resolution used for bucketing origins (9 is roughly 175 m cells).
    pub resolution: u8,
    /// Hex rings expanded around a cell during candidate search.
    pub rings: u32,
    /// Number of neighbouring slots (on each side) included in candidate search.
    pub adjacent_slots: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            slot_minutes: 15,
            resolution: 9,
            rings: 1,
            adjacent_slots: 1,
        }
    }
}

impl IndexConfig {
    pub fn slot_width(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.slot_minutes))
    }

    pub fn h3_resolution(&self) -> Result<Resolution, ConfigError> {
        Resolution::try_from(self.resolution)
            .map_err(|_| ConfigError::InvalidResolution(self.resolution))
    }
}

/// Weights of the compatibility sub-scores. They need not sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub time: f64,
    pub route: f64,
    pub terminal: f64,
    pub budget: f64,
    pub bags: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            time: 1.0,
            route: 0.8,
            terminal: 0.5,
            budget: 0.3,
            bags: 0.2,
        }
    }
}

impl ScoringWeights {
    fn iter(&self) -> [(&'static str, f64); 5] {
        [
            ("time", self.time),
            ("route", self.route),
            ("terminal", self.terminal),
            ("budget", self.budget),
            ("bags", self.bags),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoringWeights,
    /// A request joins an existing group only if the join scores strictly above this.
    pub acceptance_threshold: f64,
    /// Route sub-score used when a leg could not be routed (timeout, no route).
    pub degraded_route_score: f64,
    /// Distance (km) at which the soft terminal sub-score halves.
    pub terminal_scale_km: f64,
    /// Budget difference at which the budget sub-score halves.
    pub budget_scale: f64,
    /// Speed assumed when a leg has to be estimated from straight-line distance.
    pub assumed_speed_kmh: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            acceptance_threshold: 1.2,
            degraded_route_score: 0.25,
            terminal_scale_km: 1.5,
            budget_scale: 40.0,
            assumed_speed_kmh: 40.0,
        }
    }
}

/// Hard per-group constraints.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintConfig {
    pub bag_target_total: u32,
    pub bag_target_large: u32,
    pub max_group_size: usize,
    pub max_detour_minutes: f64,
    pub terminal_policy: TerminalPolicy,
    /// Pickup flexibility assumed when a request carries no latest time.
    pub default_flex_minutes: u32,
    /// H3 resolution of the cells route legs are keyed and cached by.
    pub route_resolution: u8,
}

impl Default for ConstraintConfig {
    fn default() -> Self {
        Self {
            bag_target_total: BAG_TARGET_TOTAL,
            bag_target_large: BAG_TARGET_LARGE,
            max_group_size: 4,
            max_detour_minutes: MAX_DETOUR_DEFAULT_MIN,
            terminal_policy: TerminalPolicy::Strict,
            default_flex_minutes: 30,
            route_resolution: 10,
        }
    }
}

impl ConstraintConfig {
    pub fn default_flex(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.default_flex_minutes))
    }

    pub fn route_h3_resolution(&self) -> Result<Resolution, ConfigError> {
        Resolution::try_from(self.route_resolution)
            .map_err(|_| ConfigError::InvalidResolution(self.route_resolution))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub coordinate_ttl_secs: u64,
    pub coordinate_max_entries: usize,
    pub route_ttl_secs: u64,
    pub route_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            coordinate_ttl_secs: 7 * 24 * 60 * 60,
            coordinate_max_entries: 10_000,
            route_ttl_secs: 15 * 60,
            route_max_entries: 50_000,
        }
    }
}

/// Limits applied to the external geocoding/routing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub calls_per_minute: u32,
    pub call_timeout_ms: u64,
    /// How many times a rate-limited call is retried after backing off.
    pub rate_limit_retries: u32,
    pub max_in_flight: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: 300,
            call_timeout_ms: 5_000,
            rate_limit_retries: 3,
            max_in_flight: 8,
        }
    }
}

impl ServiceConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// How far ahead of now a flight becomes eligible (read horizon).
    pub lead_time_minutes: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub run_timeout_secs: u64,
    /// Commit requests that found no partner as single-member rides.
    pub commit_singletons: bool,
    pub audit_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            batch_size: 200,
            lead_time_minutes: 90,
            max_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
            run_timeout_secs: 120,
            commit_singletons: false,
            audit_enabled: true,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn lead_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.lead_time_minutes))
    }

    /// Exponential backoff before retry `attempt` (1-based), capped at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let millis = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(millis.min(self.backoff_max_ms))
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub index: IndexConfig,
    pub scoring: ScoringConfig,
    pub constraints: ConstraintConfig,
    pub cache: CacheConfig,
    pub service: ServiceConfig,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index.slot_minutes == 0 {
            return Err(ConfigError::NonPositive("index.slot_minutes"));
        }
        self.index.h3_resolution()?;
        self.constraints.route_h3_resolution()?;

        for (name, weight) in self.scoring.weights.iter() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::InvalidWeight { name, value: weight });
            }
        }
        if !(0.0..=1.0).contains(&self.scoring.degraded_route_score) {
            return Err(ConfigError::OutOfRange("scoring.degraded_route_score"));
        }
        if self.scoring.terminal_scale_km <= 0.0 {
            return Err(ConfigError::NonPositive("scoring.terminal_scale_km"));
        }
        if self.scoring.budget_scale <= 0.0 {
            return Err(ConfigError::NonPositive("scoring.budget_scale"));
        }
        if self.scoring.assumed_speed_kmh <= 0.0 {
            return Err(ConfigError::NonPositive("scoring.assumed_speed_kmh"));
        }

        if self.constraints.bag_target_total == 0 {
            return Err(ConfigError::NonPositive("constraints.bag_target_total"));
        }
        if self.constraints.bag_target_large > self.constraints.bag_target_total {
            return Err(ConfigError::OutOfRange("constraints.bag_target_large"));
        }
        if self.constraints.max_group_size < 2 {
            return Err(ConfigError::OutOfRange("constraints.max_group_size"));
        }
        if self.constraints.max_detour_minutes <= 0.0 {
            return Err(ConfigError::NonPositive("constraints.max_detour_minutes"));
        }
        if self.constraints.default_flex_minutes == 0 {
            return Err(ConfigError::NonPositive("constraints.default_flex_minutes"));
        }

        if self.cache.coordinate_max_entries == 0 {
            return Err(ConfigError::NonPositive("cache.coordinate_max_entries"));
        }
        if self.cache.route_max_entries == 0 {
            return Err(ConfigError::NonPositive("cache.route_max_entries"));
        }

        if self.service.calls_per_minute == 0 {
            return Err(ConfigError::NonPositive("service.calls_per_minute"));
        }
        if self.service.call_timeout_ms == 0 {
            return Err(ConfigError::NonPositive("service.call_timeout_ms"));
        }
        if self.service.max_in_flight == 0 {
            return Err(ConfigError::NonPositive("service.max_in_flight"));
        }

        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::NonPositive("scheduler.interval_secs"));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::NonPositive("scheduler.batch_size"));
        }
        if self.scheduler.run_timeout_secs == 0 {
            return Err(ConfigError::NonPositive("scheduler.run_timeout_secs"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        EngineConfig::default().validate().expect("default config is valid");
    }

    #[test]
    fn partial_json_overrides_only_named_fields() {
        let config: EngineConfig = serde_json::from_str(
            r#"{ "constraints": { "terminal_policy": "soft", "max_group_size": 3 } }"#,
        )
        .expect("parse");
        assert_eq!(config.constraints.terminal_policy, TerminalPolicy::Soft);
        assert_eq!(config.constraints.max_group_size, 3);
        assert_eq!(config.constraints.bag_target_total, BAG_TARGET_TOTAL);
        assert_eq!(config.index, IndexConfig::default());
    }

    #[test]
    fn rejects_invalid_resolution_and_weights() {
        let mut config = EngineConfig::default();
        config.index.resolution = 16;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidResolution(16))
        ));

        let mut config = EngineConfig::default();
        config.scoring.weights.route = -1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWeight { name: "route", .. })
        ));
    }

    #[test]
    fn rejects_zero_default_flexibility() {
        let mut config = EngineConfig::default();
        config.constraints.default_flex_minutes = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositive("constraints.default_flex_minutes"))
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let scheduler = SchedulerConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..SchedulerConfig::default()
        };
        assert_eq!(scheduler.backoff(1), Duration::from_millis(100));
        assert_eq!(scheduler.backoff(2), Duration::from_millis(200));
        assert_eq!(scheduler.backoff(3), Duration::from_millis(350));
    }
}
