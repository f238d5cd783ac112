//! Batch pooling engine for airport pickups.
//!
//! Requests derived from flights are bucketed by time slot and H3 cell,
//! scored pairwise and against open groups, and greedily grouped into shared
//! rides. A [`scheduler::BatchScheduler`] runs the pass periodically against a
//! [`store::RideStore`], committing groups and marking their flights matched.

pub mod admission;
pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod matching;
pub mod request;
pub mod ride;
pub mod routing;
pub mod scheduler;
pub mod services;
pub mod spatial;
pub mod store;

#[cfg(feature = "test-helpers")]
pub mod test_helpers;

pub use config::EngineConfig;
pub use error::{EngineError, ServiceError, StoreError, ValidationError};
pub use request::{RawRequest, Request, RequestId};
pub use ride::{CommittedGroup, RideId};
pub use scheduler::{BatchScheduler, RunReport, RunState, TickOutcome};
