//! Audit trail of grouping decisions.
//!
//! Audit is best-effort: a failing sink is logged and the run goes on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::AuditError;
use crate::request::FlightId;
use crate::ride::RideId;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditRecord {
    RunStarted {
        run_id: u64,
        attempt: u32,
        at: DateTime<Utc>,
    },
    RequestRejected {
        run_id: u64,
        flight_id: Option<FlightId>,
        reason: String,
    },
    ScoringDecision {
        run_id: u64,
        flight_id: FlightId,
        group: usize,
        joined: bool,
        score: Option<f64>,
    },
    GroupCommitted {
        run_id: u64,
        ride_id: RideId,
        flight_ids: Vec<FlightId>,
        score: f64,
    },
    RunFinished {
        run_id: u64,
        attempts: u32,
        committed: usize,
        unmatched: usize,
    },
    RunFailed {
        run_id: u64,
        attempt: u32,
        error: String,
        retryable: bool,
    },
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError>;
}

/// Emits each record as a JSON line on the `pickup_core::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(&record).map_err(|e| AuditError(e.to_string()))?;
        info!(target: "pickup_core::audit", "{line}");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _record: AuditRecord) -> Result<(), AuditError> {
        Ok(())
    }
}
