use std::collections::BTreeSet;

use crate::request::{BagCount, Request, RequestId, TimeWindow};

use super::scoring::ride_order;

/// Tentative grouping built during one grouping pass.
///
/// Members are kept in ride order. The aggregate score is the sum of the join
/// scores each later member was admitted with; a singleton scores zero.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateGroup {
    index: usize,
    members: Vec<Request>,
    bags: BagCount,
    window: TimeWindow,
    score: f64,
    closed: bool,
}

impl CandidateGroup {
    pub(crate) fn start(index: usize, request: Request) -> Self {
        Self {
            index,
            bags: request.bags,
            window: request.window,
            members: vec![request],
            score: 0.0,
            closed: false,
        }
    }

    /// Adds a member. Callers must have checked feasibility with the scorer.
    pub(crate) fn admit(&mut self, request: Request, join_score: f64) {
        self.bags = self.bags.combined(request.bags);
        if let Some(window) = self.window.intersect(&request.window) {
            self.window = window;
        }
        self.score += join_score;
        let at = self
            .members
            .partition_point(|m| ride_order(m, &request).is_lt());
        self.members.insert(at, request);
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    /// Creation order within the pass; ties between groups go to the lowest.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn members(&self) -> &[Request] {
        &self.members
    }

    pub fn member_refs(&self) -> Vec<&Request> {
        self.members.iter().collect()
    }

    pub fn member_ids(&self) -> Vec<RequestId> {
        self.members.iter().map(Request::id).collect()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.members.iter().any(|m| m.id() == id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_singleton(&self) -> bool {
        self.members.len() == 1
    }

    pub fn bags(&self) -> BagCount {
        self.bags
    }

    pub fn terminals(&self) -> BTreeSet<&str> {
        self.members.iter().map(|m| m.terminal.as_str()).collect()
    }

    /// Intersection of every member's pickup window.
    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
