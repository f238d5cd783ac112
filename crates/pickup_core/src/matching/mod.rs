//! Grouping of admitted requests into shared rides.

pub mod group;
pub mod grouping;
pub mod scoring;

pub use group::CandidateGroup;
pub use grouping::{Grouping, GroupingEngine, GroupingOutcome, Placement, ScoringDecision};
pub use scoring::{CompatibilityScorer, Infeasibility, Score, SubScores};
