//! Compatibility scoring between requests and candidate groups.
//!
//! A score is a weighted sum of five sub-scores, each normalized to [0, 1]:
//! time, route efficiency, terminal proximity, budget and bag headroom. Hard
//! constraint violations short-circuit to [`Score::Infeasible`] regardless of
//! the weighted sum. Scores are only comparable within one configuration.

use chrono::{DateTime, Utc};
use h3o::{CellIndex, Resolution};

use crate::cache::RouteKey;
use crate::config::{ConstraintConfig, ScoringConfig, ScoringWeights, TerminalPolicy};
use crate::request::{BagCount, Request, TimeWindow};
use crate::routing::TravelTimes;
use crate::spatial::distance_km;

use super::group::CandidateGroup;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubScores {
    pub time: f64,
    pub route: f64,
    pub terminal: f64,
    pub budget: f64,
    pub bags: f64,
}

impl SubScores {
    pub fn weighted(&self, weights: &ScoringWeights) -> f64 {
        weights.time * self.time
            + weights.route * self.route
            + weights.terminal * self.terminal
            + weights.budget * self.budget
            + weights.bags * self.bags
    }
}

/// Hard constraint a combination violates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Infeasibility {
    AirportMismatch,
    DirectionMismatch,
    TerminalMismatch,
    GroupFull,
    BagCapacity { total: u32 },
    LargeBagCapacity { large: u32 },
    NoCommonWindow,
    Unroutable,
    DetourExceeded { minutes: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Feasible {
        total: f64,
        parts: SubScores,
        max_detour_minutes: f64,
    },
    Infeasible(Infeasibility),
}

impl Score {
    /// Weighted total, or negative infinity when infeasible.
    pub fn value(&self) -> f64 {
        match self {
            Score::Feasible { total, .. } => *total,
            Score::Infeasible(_) => f64::NEG_INFINITY,
        }
    }

    pub fn is_feasible(&self) -> bool {
        matches!(self, Score::Feasible { .. })
    }
}

/// Outcome of routing one shared ride through its members.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEvaluation {
    pub max_detour_minutes: f64,
    pub degraded: bool,
}

fn route_cells(request: &Request, resolution: Resolution) -> Option<(CellIndex, CellIndex)> {
    Some((
        request.origin.cell(resolution)?,
        request.destination.cell(resolution)?,
    ))
}

/// Ride order: by scheduled time, then id.
pub fn ride_order(a: &Request, b: &Request) -> std::cmp::Ordering {
    a.scheduled_at()
        .cmp(&b.scheduled_at())
        .then_with(|| a.id().cmp(&b.id()))
}

#[derive(Debug, Clone, Copy)]
pub struct CompatibilityScorer {
    scoring: ScoringConfig,
    constraints: ConstraintConfig,
    route_resolution: Resolution,
    slot_secs: i64,
}

impl CompatibilityScorer {
    pub fn new(
        scoring: ScoringConfig,
        constraints: ConstraintConfig,
        route_resolution: Resolution,
        slot_minutes: u32,
    ) -> Self {
        Self {
            scoring,
            constraints,
            route_resolution,
            slot_secs: i64::from(slot_minutes.max(1)) * 60,
        }
    }

    pub fn route_resolution(&self) -> Resolution {
        self.route_resolution
    }

    fn slot(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.slot_secs)
    }

    /// Pairwise score of two requests.
    pub fn score(&self, a: &Request, b: &Request, travel: &dyn TravelTimes) -> Score {
        self.score_members(&[a], b, travel)
    }

    /// Score of adding `candidate` to `group`. Time and budget are averaged
    /// over the current members, terminal takes the minimum, route and bags
    /// are evaluated on the combined group.
    pub fn score_join(
        &self,
        group: &CandidateGroup,
        candidate: &Request,
        travel: &dyn TravelTimes,
    ) -> Score {
        self.score_members(&group.member_refs(), candidate, travel)
    }

    fn score_members(
        &self,
        members: &[&Request],
        candidate: &Request,
        travel: &dyn TravelTimes,
    ) -> Score {
        if let Err(reason) = self.check_hard_constraints(members, candidate) {
            return Score::Infeasible(reason);
        }

        let mut combined: Vec<&Request> = members.to_vec();
        combined.push(candidate);
        combined.sort_by(|a, b| ride_order(a, b));

        let Some(route) = self.evaluate_route(&combined, travel) else {
            return Score::Infeasible(Infeasibility::Unroutable);
        };
        if route.max_detour_minutes > self.constraints.max_detour_minutes {
            return Score::Infeasible(Infeasibility::DetourExceeded {
                minutes: route.max_detour_minutes,
            });
        }

        let n = members.len() as f64;
        let time = members
            .iter()
            .map(|m| self.time_score(m, candidate))
            .sum::<f64>()
            / n;
        let budget = members
            .iter()
            .map(|m| budget_score(m.budget, candidate.budget, self.scoring.budget_scale))
            .sum::<f64>()
            / n;
        let terminal = members
            .iter()
            .map(|m| self.terminal_score(m, candidate))
            .fold(1.0, f64::min);
        let route_score = if route.degraded {
            self.scoring.degraded_route_score
        } else {
            (1.0 - route.max_detour_minutes / self.constraints.max_detour_minutes).clamp(0.0, 1.0)
        };
        let bags = combined_bags(&combined);
        let bag_score =
            (1.0 - f64::from(bags.total) / f64::from(self.constraints.bag_target_total)).clamp(0.0, 1.0);

        let parts = SubScores {
            time,
            route: route_score,
            terminal,
            budget,
            bags: bag_score,
        };
        Score::Feasible {
            total: parts.weighted(&self.scoring.weights),
            parts,
            max_detour_minutes: route.max_detour_minutes,
        }
    }

    fn check_hard_constraints(
        &self,
        members: &[&Request],
        candidate: &Request,
    ) -> Result<(), Infeasibility> {
        if members.len() + 1 > self.constraints.max_group_size {
            return Err(Infeasibility::GroupFull);
        }
        for member in members {
            if member.airport != candidate.airport {
                return Err(Infeasibility::AirportMismatch);
            }
            if member.direction != candidate.direction {
                return Err(Infeasibility::DirectionMismatch);
            }
            if self.constraints.terminal_policy == TerminalPolicy::Strict
                && member.terminal != candidate.terminal
            {
                return Err(Infeasibility::TerminalMismatch);
            }
        }

        let bags = members
            .iter()
            .fold(candidate.bags, |acc, m| acc.combined(m.bags));
        if bags.total > self.constraints.bag_target_total {
            return Err(Infeasibility::BagCapacity { total: bags.total });
        }
        if bags.large > self.constraints.bag_target_large {
            return Err(Infeasibility::LargeBagCapacity { large: bags.large });
        }

        let mut window: Option<TimeWindow> = Some(candidate.window);
        for member in members {
            window = window.and_then(|w| w.intersect(&member.window));
        }
        if window.is_none() {
            return Err(Infeasibility::NoCommonWindow);
        }
        Ok(())
    }

    /// Route the ride: all pickups in ride order, then all drop-offs in the
    /// same order. A member's detour is its in-vehicle time on the shared ride
    /// minus its direct time. `members` must already be in ride order.
    pub fn evaluate_route(
        &self,
        members: &[&Request],
        travel: &dyn TravelTimes,
    ) -> Option<RouteEvaluation> {
        let cells: Vec<(CellIndex, CellIndex)> = members
            .iter()
            .map(|m| route_cells(m, self.route_resolution))
            .collect::<Option<_>>()?;

        let mut stops: Vec<CellIndex> = cells.iter().map(|(origin, _)| *origin).collect();
        stops.extend(cells.iter().map(|(_, destination)| *destination));

        let mut degraded = false;
        let mut arrival = Vec::with_capacity(stops.len());
        let mut clock = 0.0;
        arrival.push(clock);
        for pair in stops.windows(2) {
            let leg = travel.leg(RouteKey::new(pair[0], pair[1]));
            degraded |= leg.degraded;
            clock += leg.minutes;
            arrival.push(clock);
        }

        let n = members.len();
        let mut max_detour: f64 = 0.0;
        for (i, (origin, destination)) in cells.iter().enumerate() {
            let direct = travel.leg(RouteKey::new(*origin, *destination));
            degraded |= direct.degraded;
            let shared = arrival[n + i] - arrival[i];
            max_detour = max_detour.max((shared - direct.minutes).max(0.0));
        }

        Some(RouteEvaluation {
            max_detour_minutes: max_detour,
            degraded,
        })
    }

    fn time_score(&self, a: &Request, b: &Request) -> f64 {
        let distance = (self.slot(a.scheduled_at()) - self.slot(b.scheduled_at())).abs();
        1.0 / (1.0 + distance as f64)
    }

    fn terminal_score(&self, a: &Request, b: &Request) -> f64 {
        if a.terminal == b.terminal {
            return 1.0;
        }
        match self.constraints.terminal_policy {
            TerminalPolicy::Strict => 0.0,
            TerminalPolicy::Soft => {
                let km = distance_km(a.airport_side(), b.airport_side());
                1.0 / (1.0 + km / self.scoring.terminal_scale_km)
            }
        }
    }
}

fn budget_score(a: Option<f64>, b: Option<f64>, scale: f64) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => 1.0 / (1.0 + (a - b).abs() / scale),
        _ => 1.0,
    }
}

fn combined_bags(members: &[&Request]) -> BagCount {
    members
        .iter()
        .fold(BagCount::default(), |acc, m| acc.combined(m.bags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::routing::EstimatedTravelTimes;
    use crate::test_helpers::{lax_origin, offset_origin, request_at};

    const TRAVEL: EstimatedTravelTimes = EstimatedTravelTimes { speed_kmh: 40.0 };

    fn scorer(config: &EngineConfig) -> CompatibilityScorer {
        CompatibilityScorer::new(
            config.scoring,
            config.constraints,
            config.constraints.route_h3_resolution().expect("resolution"),
            config.index.slot_minutes,
        )
    }

    #[test]
    fn nearby_same_slot_pair_scores_high() {
        let config = EngineConfig::default();
        let a = request_at(1, lax_origin(), 0);
        let b = request_at(2, offset_origin(0.002, 0.0), 5);
        let score = scorer(&config).score(&a, &b, &TRAVEL);

        let Score::Feasible { total, parts, .. } = score else {
            panic!("expected feasible, got {score:?}");
        };
        assert_eq!(parts.time, 1.0);
        assert_eq!(parts.terminal, 1.0);
        assert!(parts.route > 0.5, "route sub-score {}", parts.route);
        assert!(total > config.scoring.acceptance_threshold);
    }

    #[test]
    fn sub_scores_stay_in_unit_range() {
        let config = EngineConfig::default();
        let a = request_at(1, lax_origin(), 0);
        let mut b = request_at(2, offset_origin(0.01, 0.01), 25);
        b.budget = Some(500.0);
        let Score::Feasible { parts, .. } = scorer(&config).score(&a, &b, &TRAVEL) else {
            panic!("expected feasible");
        };
        for value in [parts.time, parts.route, parts.terminal, parts.budget, parts.bags] {
            assert!((0.0..=1.0).contains(&value), "{value} out of range");
        }
        assert!(parts.time < 1.0);
        assert!(parts.budget < 0.2);
    }

    #[test]
    fn strict_terminal_mismatch_is_infeasible_and_soft_is_penalized() {
        let mut config = EngineConfig::default();
        let a = request_at(1, lax_origin(), 0);
        let mut b = request_at(2, offset_origin(0.002, 0.0), 0);
        b.terminal = "T7".into();
        assert_eq!(
            scorer(&config).score(&a, &b, &TRAVEL),
            Score::Infeasible(Infeasibility::TerminalMismatch)
        );

        config.constraints.terminal_policy = TerminalPolicy::Soft;
        let Score::Feasible { parts, .. } = scorer(&config).score(&a, &b, &TRAVEL) else {
            panic!("soft policy tolerates the mismatch");
        };
        assert!(parts.terminal > 0.0 && parts.terminal <= 1.0);
    }

    #[test]
    fn bag_limits_are_hard() {
        let config = EngineConfig::default();
        let mut a = request_at(1, lax_origin(), 0);
        let mut b = request_at(2, offset_origin(0.002, 0.0), 0);
        a.bags = BagCount { total: 6, large: 1 };
        b.bags = BagCount { total: 5, large: 1 };
        assert_eq!(
            scorer(&config).score(&a, &b, &TRAVEL),
            Score::Infeasible(Infeasibility::BagCapacity { total: 11 })
        );

        a.bags = BagCount { total: 3, large: 3 };
        b.bags = BagCount { total: 2, large: 2 };
        assert_eq!(
            scorer(&config).score(&a, &b, &TRAVEL),
            Score::Infeasible(Infeasibility::LargeBagCapacity { large: 5 })
        );
    }

    #[test]
    fn long_detour_is_infeasible() {
        let config = EngineConfig::default();
        let a = request_at(1, lax_origin(), 0);
        // ~25 km away: the pickup detour alone dwarfs the 20 minute limit.
        let b = request_at(2, offset_origin(0.22, 0.05), 0);
        let score = scorer(&config).score(&a, &b, &TRAVEL);
        assert!(matches!(
            score,
            Score::Infeasible(Infeasibility::DetourExceeded { .. })
        ));
        assert_eq!(score.value(), f64::NEG_INFINITY);
    }

    #[test]
    fn disjoint_windows_are_infeasible() {
        let config = EngineConfig::default();
        let a = request_at(1, lax_origin(), 0);
        let b = request_at(2, lax_origin(), 45);
        assert_eq!(
            scorer(&config).score(&a, &b, &TRAVEL),
            Score::Infeasible(Infeasibility::NoCommonWindow)
        );
    }

    #[test]
    fn route_of_colocated_members_has_no_detour() {
        let config = EngineConfig::default();
        let a = request_at(1, lax_origin(), 0);
        let b = request_at(2, lax_origin(), 0);
        let route = scorer(&config)
            .evaluate_route(&[&a, &b], &TRAVEL)
            .expect("routable");
        assert!(route.max_detour_minutes.abs() < 1e-9);
        assert!(!route.degraded);
    }
}
