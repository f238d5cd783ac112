//! Committed rides: the persisted form of a candidate group.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::matching::CandidateGroup;
use crate::request::{Direction, FlightId};

/// Ride identifier issued by the store. Strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RideId(pub u64);

impl RideId {
    /// The id `n` places after this one.
    pub fn offset(self, n: usize) -> RideId {
        RideId(self.0 + n as u64)
    }
}

impl fmt::Display for RideId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RideMember {
    pub user_id: String,
    pub flight_id: FlightId,
}

/// A group persisted as one shared ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedGroup {
    pub ride_id: RideId,
    pub members: Vec<RideMember>,
    pub created_at: DateTime<Utc>,
    pub airport: String,
    pub direction: Direction,
    /// Shared terminal, `None` when members use different terminals.
    pub terminal: Option<String>,
    /// Midpoint of the members' common pickup window.
    pub suggested_pickup: DateTime<Utc>,
    pub score: f64,
}

impl CommittedGroup {
    /// Freeze a candidate group under a freshly issued ride id.
    ///
    /// Returns `None` for an empty group.
    pub fn from_candidate(
        ride_id: RideId,
        group: &CandidateGroup,
        created_at: DateTime<Utc>,
    ) -> Option<Self> {
        let first = group.members().first()?;
        let terminals = group.terminals();
        let terminal = (terminals.len() == 1).then(|| first.terminal.clone());
        Some(Self {
            ride_id,
            members: group
                .members()
                .iter()
                .map(|m| RideMember {
                    user_id: m.user_id.clone(),
                    flight_id: m.flight_id,
                })
                .collect(),
            created_at,
            airport: first.airport.clone(),
            direction: first.direction,
            terminal,
            suggested_pickup: group.window().midpoint(),
            score: group.score(),
        })
    }

    pub fn flight_ids(&self) -> impl Iterator<Item = FlightId> + '_ {
        self.members.iter().map(|m| m.flight_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
