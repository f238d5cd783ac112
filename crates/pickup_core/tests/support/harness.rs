#![allow(dead_code)]

use std::sync::Arc;

use pickup_core::audit::{AuditSink, NoopAuditSink};
use pickup_core::cache::LookupCaches;
use pickup_core::test_helpers::{InMemoryRideStore, ScriptedRouter, StaticGeocoder};
use pickup_core::{BatchScheduler, EngineConfig};

/// Install a `RUST_LOG`-filtered subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Scheduler wired to in-memory collaborators.
pub struct Harness {
    pub store: Arc<InMemoryRideStore>,
    pub scheduler: Arc<BatchScheduler>,
}

pub struct HarnessBuilder {
    config: EngineConfig,
    router: ScriptedRouter,
    geocoder: StaticGeocoder,
    audit: Arc<dyn AuditSink>,
    store: Arc<InMemoryRideStore>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            router: ScriptedRouter::new(),
            geocoder: StaticGeocoder::new(),
            audit: Arc::new(NoopAuditSink),
            store: Arc::new(InMemoryRideStore::new()),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn router(mut self, router: ScriptedRouter) -> Self {
        self.router = router;
        self
    }

    pub fn geocoder(mut self, geocoder: StaticGeocoder) -> Self {
        self.geocoder = geocoder;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn build(self) -> Harness {
        init_tracing();
        let scheduler = BatchScheduler::new(
            self.config,
            self.store.clone(),
            Arc::new(self.geocoder),
            Arc::new(self.router),
            Arc::new(LookupCaches::new(&self.config.cache)),
            self.audit,
        )
        .expect("valid config");
        Harness {
            store: self.store,
            scheduler: Arc::new(scheduler),
        }
    }
}
