//! Persistent store contract.
//!
//! The store owns flight records and committed rides. The engine reads
//! eligible unmatched flights, commits groups and marks flights matched; it
//! never assumes the two writes are atomic together and reconciles through
//! [`RideStore::committed_rides`] instead.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::request::{FlightId, RawRequest};
use crate::ride::{CommittedGroup, RideId};

/// Scheduled-time range a run reads: `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl EligibilityWindow {
    /// `[now, now + lead_time]`.
    pub fn starting_at(now: DateTime<Utc>, lead_time: Duration) -> Self {
        Self {
            from: now,
            to: now + lead_time,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.to
    }
}

#[async_trait]
pub trait RideStore: Send + Sync {
    /// Unmatched flights scheduled inside `window`, ordered by scheduled time
    /// then id, at most `limit` of them.
    async fn fetch_eligible(
        &self,
        window: EligibilityWindow,
        limit: usize,
    ) -> Result<Vec<RawRequest>, StoreError>;

    /// One past the highest ride id committed so far (the first id is 1).
    /// Calling it does not reserve anything; uniqueness is enforced by
    /// [`commit_groups`](Self::commit_groups).
    async fn next_ride_id(&self) -> Result<RideId, StoreError>;

    /// Persist every group or none. A reused ride id or an already committed
    /// flight is a [`StoreError::Conflict`].
    async fn commit_groups(&self, groups: &[CommittedGroup]) -> Result<(), StoreError>;

    async fn mark_matched(&self, flights: &[FlightId]) -> Result<(), StoreError>;

    /// Rides already committed for any of `flights`.
    async fn committed_rides(
        &self,
        flights: &[FlightId],
    ) -> Result<Vec<(FlightId, RideId)>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_is_inclusive_of_both_ends() {
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
        let window = EligibilityWindow::starting_at(now, Duration::minutes(90));
        assert!(window.contains(now));
        assert!(window.contains(now + Duration::minutes(90)));
        assert!(!window.contains(now + Duration::minutes(91)));
        assert!(!window.contains(now - Duration::seconds(1)));
    }
}
