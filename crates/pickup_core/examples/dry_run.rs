//! Plan one batch against in-memory collaborators and print the groups.
//!
//! ```text
//! RUST_LOG=pickup_core=debug cargo run -p pickup_core --example dry_run
//! ```

use std::sync::Arc;

use pickup_core::audit::TracingAuditSink;
use pickup_core::cache::LookupCaches;
use pickup_core::test_helpers::{
    base_time, lax_terminal, neighbor_origin, raw_at, raw_request, sfo_origin, sfo_raw_at,
    InMemoryRideStore, ScriptedRouter, StaticGeocoder,
};
use pickup_core::{BatchScheduler, EngineConfig, TickOutcome};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store = Arc::new(InMemoryRideStore::new());
    store.insert_flights([
        raw_request(1, 0),
        raw_at(2, neighbor_origin(0), 4),
        raw_at(3, neighbor_origin(2), 8),
        sfo_raw_at(4, sfo_origin(), 20),
        raw_request(5, 50),
    ]);

    let config = EngineConfig::default();
    let scheduler = BatchScheduler::new(
        config,
        store.clone(),
        Arc::new(StaticGeocoder::new().with("LAX airport terminal T4", lax_terminal())),
        Arc::new(ScriptedRouter::new()),
        Arc::new(LookupCaches::new(&config.cache)),
        Arc::new(TracingAuditSink),
    )
    .expect("default config is valid");

    let dry = scheduler.dry_run(base_time()).await.expect("dry run");
    println!("dry run: {} admitted, {} rejected", dry.admitted.len(), dry.rejected.len());
    for group in &dry.outcome.groups {
        println!(
            "  group {:>2}: {:?} bags={} score={:.2}",
            group.index(),
            group.member_ids(),
            group.bags().total,
            group.score()
        );
    }

    match scheduler.tick(base_time()).await {
        TickOutcome::Completed(report) => {
            println!(
                "run {}: committed {} rides, {} unmatched, sizes {:?}",
                report.run_id,
                report.committed.len(),
                report.unmatched.len(),
                report.size_distribution
            );
        }
        other => println!("run did not complete: {other:?}"),
    }
}
