//! Error types for each boundary of the engine.

use std::time::Duration;

use thiserror::Error;

/// A request record that cannot be admitted to a matching run.
///
/// Validation errors exclude the request from the run and are reported; they
/// never fail the run itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid coordinate for `{field}`: ({lat}, {lng})")]
    InvalidCoordinate {
        field: &'static str,
        lat: f64,
        lng: f64,
    },
    #[error("could not resolve `{field}` address {address:?}: {reason}")]
    UnresolvedLocation {
        field: &'static str,
        address: String,
        reason: String,
    },
    #[error("negative bag count for `{field}`: {value}")]
    NegativeBagCount { field: &'static str, value: i64 },
    #[error("latest pickup time is not after scheduled time")]
    InvertedWindow,
    #[error("bag counts {regular} + {large} overflow")]
    BagCountOverflow { regular: u32, large: u32 },
    #[error("{total} bags ({large} large) exceed what one vehicle carries")]
    BagsOverCapacity { total: u32, large: u32 },
    #[error("invalid budget ceiling: {0}")]
    InvalidBudget(f64),
}

/// Failure of a geocoding or routing call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("no result for query")]
    NotFound,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// A uniqueness constraint (ride id, flight already committed) rejected the write.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("store rejected the operation: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{0}` must be positive")]
    NonPositive(&'static str),
    #[error("`{0}` is out of range")]
    OutOfRange(&'static str),
    #[error("invalid H3 resolution {0}")]
    InvalidResolution(u8),
    #[error("invalid weight `{name}`: {value}")]
    InvalidWeight { name: &'static str, value: f64 },
}

#[derive(Debug, Clone, Error)]
#[error("audit sink failure: {0}")]
pub struct AuditError(pub String);

/// Run-level failure reported by the scheduler.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("run exceeded its wall-clock budget of {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Whether another attempt of the same run may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(StoreError::Rejected(_)) => false,
            EngineError::Store(_) => true,
            EngineError::Service(_) => true,
            EngineError::Timeout(_) => false,
            EngineError::Config(_) => false,
        }
    }
}
