//! Greedy grouping pass over one batch of admitted requests.
//!
//! Requests are visited in ride order (scheduled time, then id). Each one
//! joins the best-scoring open group that holds a request from its
//! spatial-temporal neighbourhood, or starts a new group. The pass is a pure
//! function of its inputs: the same requests and travel times always produce
//! the same groups.

use std::collections::{BTreeSet, HashMap, HashSet};

use h3o::CellIndex;
use tracing::{debug, warn};

use crate::cache::RouteKey;
use crate::config::EngineConfig;
use crate::error::ConfigError;
use crate::request::{Request, RequestId};
use crate::routing::TravelTimes;
use crate::spatial::{BucketKey, SpatialTemporalIndex};

use super::group::CandidateGroup;
use super::scoring::{ride_order, CompatibilityScorer, Score};

/// Batch grouping strategy.
pub trait Grouping: Send + Sync {
    /// Partition `requests` into candidate groups. Every request ends up in
    /// exactly one group; unmatched requests become singletons.
    fn plan(&self, requests: &[Request], travel: &dyn TravelTimes) -> GroupingOutcome;

    /// Route legs `plan` may consult for this batch.
    fn required_legs(&self, requests: &[Request]) -> BTreeSet<RouteKey>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Placement {
    Started,
    /// `lookahead` is set when the join scored below the acceptance threshold
    /// but the request had no feasible unassigned partner left to wait for.
    Joined { score: f64, lookahead: bool },
}

/// Why one request ended up where it did.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringDecision {
    pub request: RequestId,
    pub group: usize,
    pub placement: Placement,
    pub groups_considered: usize,
    pub feasible_groups: usize,
}

#[derive(Debug, Clone, Default)]
pub struct GroupingOutcome {
    pub groups: Vec<CandidateGroup>,
    pub decisions: Vec<ScoringDecision>,
}

impl GroupingOutcome {
    pub fn multi_member(&self) -> impl Iterator<Item = &CandidateGroup> {
        self.groups.iter().filter(|g| g.len() > 1)
    }

    pub fn singletons(&self) -> impl Iterator<Item = &CandidateGroup> {
        self.groups.iter().filter(|g| g.is_singleton())
    }

    pub fn group_of(&self, id: RequestId) -> Option<&CandidateGroup> {
        self.groups.iter().find(|g| g.contains(id))
    }

    pub fn request_count(&self) -> usize {
        self.groups.iter().map(CandidateGroup::len).sum()
    }
}

/// Greedy grouping with a one-step lookahead over unassigned neighbours.
#[derive(Debug, Clone)]
pub struct GroupingEngine {
    scorer: CompatibilityScorer,
    empty_index: SpatialTemporalIndex,
    acceptance_threshold: f64,
    bag_target_total: u32,
    bag_target_large: u32,
    max_group_size: usize,
}

impl GroupingEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            scorer: CompatibilityScorer::new(
                config.scoring,
                config.constraints,
                config.constraints.route_h3_resolution()?,
                config.index.slot_minutes,
            ),
            empty_index: SpatialTemporalIndex::new(&config.index)?,
            acceptance_threshold: config.scoring.acceptance_threshold,
            bag_target_total: config.constraints.bag_target_total,
            bag_target_large: config.constraints.bag_target_large,
            max_group_size: config.constraints.max_group_size,
        })
    }

    pub fn scorer(&self) -> &CompatibilityScorer {
        &self.scorer
    }

    /// Requests in ride order with duplicate ids dropped (first occurrence wins).
    fn ride_ordered<'a>(&self, requests: &'a [Request]) -> Vec<&'a Request> {
        let mut seen = HashSet::with_capacity(requests.len());
        let mut ordered: Vec<&Request> = requests
            .iter()
            .filter(|r| {
                let fresh = seen.insert(r.id());
                if !fresh {
                    warn!(flight_id = %r.id(), "duplicate request in batch ignored");
                }
                fresh
            })
            .collect();
        ordered.sort_by(|a, b| ride_order(a, b));
        ordered
    }

    fn has_feasible_partner(
        &self,
        request: &Request,
        unassigned: &SpatialTemporalIndex,
        by_id: &HashMap<RequestId, &Request>,
        travel: &dyn TravelTimes,
    ) -> bool {
        unassigned
            .candidates(request)
            .iter()
            .filter_map(|id| by_id.get(id))
            .any(|other| self.scorer.score(request, other, travel).is_feasible())
    }

    fn is_saturated(&self, group: &CandidateGroup) -> bool {
        let bags = group.bags();
        group.len() >= self.max_group_size
            || bags.total >= self.bag_target_total
            || bags.large >= self.bag_target_large
    }
}

impl Grouping for GroupingEngine {
    fn plan(&self, requests: &[Request], travel: &dyn TravelTimes) -> GroupingOutcome {
        let ordered = self.ride_ordered(requests);
        let by_id: HashMap<RequestId, &Request> = ordered.iter().map(|r| (r.id(), *r)).collect();

        let mut unassigned = self.empty_index.clone();
        for request in &ordered {
            unassigned.insert(request);
        }

        let mut groups: Vec<CandidateGroup> = Vec::new();
        let mut placed: HashMap<BucketKey, Vec<usize>> = HashMap::new();
        let mut decisions = Vec::with_capacity(ordered.len());

        for request in ordered.iter().copied() {
            unassigned.remove(request.id());
            let key = unassigned.bucket_of(request);

            let nearby: BTreeSet<usize> = key
                .map(|key| unassigned.neighbors(key, unassigned.rings()))
                .unwrap_or_default()
                .iter()
                .filter_map(|k| placed.get(k))
                .flatten()
                .copied()
                .filter(|g| !groups[*g].is_closed())
                .collect();

            // Ascending group order with a strict comparison keeps ties on the
            // earliest-created group.
            let mut best: Option<(usize, f64)> = None;
            let mut feasible_groups = 0;
            for &g in &nearby {
                let score = self.scorer.score_join(&groups[g], request, travel);
                if let Score::Feasible { total, .. } = score {
                    feasible_groups += 1;
                    if best.map_or(true, |(_, s)| total > s) {
                        best = Some((g, total));
                    }
                }
            }

            let placement = match best {
                Some((g, score)) if score > self.acceptance_threshold => {
                    Some((g, Placement::Joined { score, lookahead: false }))
                }
                Some((g, score))
                    if !self.has_feasible_partner(request, &unassigned, &by_id, travel) =>
                {
                    Some((g, Placement::Joined { score, lookahead: true }))
                }
                _ => None,
            };

            let (group, placement) = match placement {
                Some((g, placement @ Placement::Joined { score, .. })) => {
                    groups[g].admit(request.clone(), score);
                    if self.is_saturated(&groups[g]) {
                        groups[g].close();
                    }
                    (g, placement)
                }
                _ => {
                    let g = groups.len();
                    groups.push(CandidateGroup::start(g, request.clone()));
                    (g, Placement::Started)
                }
            };
            if let Some(key) = key {
                placed.entry(key).or_default().push(group);
            }

            debug!(
                flight_id = %request.id(),
                group,
                ?placement,
                considered = nearby.len(),
                feasible_groups,
                "request placed"
            );
            decisions.push(ScoringDecision {
                request: request.id(),
                group,
                placement,
                groups_considered: nearby.len(),
                feasible_groups,
            });
        }

        GroupingOutcome { groups, decisions }
    }

    /// For every pair of requests close enough to share a group, the legs the
    /// shared route walks: origin to origin, later origin to earlier
    /// destination, destination to destination; plus each direct leg.
    /// Pairs are taken over twice the grouping radius so members of one group
    /// that are not direct neighbours are still covered.
    fn required_legs(&self, requests: &[Request]) -> BTreeSet<RouteKey> {
        let ordered = self.ride_ordered(requests);
        let resolution = self.scorer.route_resolution();

        let mut index = self.empty_index.clone();
        let mut cells: HashMap<RequestId, (usize, CellIndex, CellIndex)> = HashMap::new();
        for (position, request) in ordered.iter().enumerate() {
            index.insert(request);
            if let (Some(o), Some(d)) = (
                request.origin.cell(resolution),
                request.destination.cell(resolution),
            ) {
                cells.insert(request.id(), (position, o, d));
            }
        }

        let mut legs = BTreeSet::new();
        for request in &ordered {
            let Some(&(position, origin, destination)) = cells.get(&request.id()) else {
                continue;
            };
            legs.insert(RouteKey::new(origin, destination));
            let partners =
                index.candidates_within(request, index.rings() * 2, index.adjacent_slots() * 2);
            for partner in partners {
                let Some(&(other_position, other_origin, other_destination)) = cells.get(&partner)
                else {
                    continue;
                };
                if other_position <= position {
                    continue;
                }
                legs.insert(RouteKey::new(origin, other_origin));
                legs.insert(RouteKey::new(other_origin, destination));
                legs.insert(RouteKey::new(destination, other_destination));
            }
        }
        legs.retain(|leg| !leg.is_trivial());
        legs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::BagCount;
    use crate::routing::EstimatedTravelTimes;
    use crate::request::FlightId;
    use crate::test_helpers::{lax_origin, neighbor_origin, offset_origin, request_at};

    const TRAVEL: EstimatedTravelTimes = EstimatedTravelTimes { speed_kmh: 40.0 };

    fn engine() -> GroupingEngine {
        GroupingEngine::new(&EngineConfig::default()).expect("engine")
    }

    #[test]
    fn every_request_lands_in_exactly_one_group() {
        let requests = vec![
            request_at(1, lax_origin(), 0),
            request_at(2, neighbor_origin(0), 3),
            request_at(3, neighbor_origin(1), 6),
            request_at(4, offset_origin(0.3, 0.3), 0),
        ];
        let outcome = engine().plan(&requests, &TRAVEL);
        assert_eq!(outcome.request_count(), requests.len());
        for request in &requests {
            let holding = outcome.groups.iter().filter(|g| g.contains(request.id())).count();
            assert_eq!(holding, 1, "request {}", request.id());
        }
        assert_eq!(outcome.decisions.len(), requests.len());
        assert_eq!(outcome.group_of(requests[0].id()).map(|g| g.len()), Some(3));
        assert!(outcome.group_of(requests[3].id()).is_some_and(|g| g.is_singleton()));
    }

    #[test]
    fn ties_go_to_the_earliest_group() {
        // Two identical singleton groups; the third request scores the same
        // against both.
        let mut a = request_at(1, lax_origin(), 0);
        let mut b = request_at(2, lax_origin(), 0);
        a.bags = BagCount { total: 6, large: 0 };
        b.bags = BagCount { total: 6, large: 0 };
        let c = request_at(3, lax_origin(), 0);

        let outcome = engine().plan(&[c.clone(), b, a], &TRAVEL);
        let joined = outcome.group_of(c.id()).expect("placed");
        assert_eq!(joined.index(), 0);
        assert_eq!(joined.member_ids(), vec![FlightId(1), c.id()]);
    }

    #[test]
    fn groups_close_at_max_size() {
        let requests: Vec<_> = (1..=6).map(|i| request_at(i, lax_origin(), 0)).collect();
        let outcome = engine().plan(&requests, &TRAVEL);
        let sizes: Vec<usize> = outcome.groups.iter().map(CandidateGroup::len).collect();
        assert_eq!(sizes, vec![4, 2]);
        assert!(outcome.groups[0].is_closed());
    }

    #[test]
    fn duplicate_ids_are_grouped_once() {
        let a = request_at(1, lax_origin(), 0);
        let outcome = engine().plan(&[a.clone(), a], &TRAVEL);
        assert_eq!(outcome.request_count(), 1);
    }

    #[test]
    fn plan_is_deterministic_under_input_order() {
        let requests: Vec<_> = (1..=8)
            .map(|i| request_at(i, offset_origin(0.001 * i as f64, 0.0), (i as i64 * 3) % 20))
            .collect();
        let mut reversed = requests.clone();
        reversed.reverse();
        let engine = engine();
        let forward: Vec<_> = engine.plan(&requests, &TRAVEL).groups.iter().map(|g| g.member_ids()).collect();
        let backward: Vec<_> = engine.plan(&reversed, &TRAVEL).groups.iter().map(|g| g.member_ids()).collect();
        assert_eq!(forward, backward);
    }

    #[test]
    fn required_legs_cover_pair_routes() {
        let a = request_at(1, lax_origin(), 0);
        let b = request_at(2, offset_origin(0.002, 0.0), 0);
        let engine = engine();
        let legs = engine.required_legs(&[a.clone(), b.clone()]);
        let res = engine.scorer().route_resolution();
        let cell = |c: crate::request::Coordinate| c.cell(res).expect("cell");

        assert!(legs.contains(&RouteKey::new(cell(a.origin), cell(a.destination))));
        assert!(legs.contains(&RouteKey::new(cell(a.origin), cell(b.origin))));
        assert!(legs.contains(&RouteKey::new(cell(b.origin), cell(a.destination))));
        assert!(legs.iter().all(|leg| !leg.is_trivial()));
    }
}
