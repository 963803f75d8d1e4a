//! Reservation engine.
//!
//! Hands each worker the best-ranked eligible job, locked to that worker,
//! using the claim strategy picked for the store when the engine was built.

use chrono::TimeDelta;
use std::sync::Arc;

use crate::clock::{SharedClock, SystemClock};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::JobRecord;
use crate::predicate::EligibilityPredicate;
use crate::store::{JobStore, SharedStore};
use crate::strategy::{ClaimStrategy, StrategyKind, StrategyRegistry};
use crate::worker::Worker;

/// Claims jobs for workers.
#[derive(Clone)]
pub struct ReservationEngine {
    store: SharedStore,
    strategy: Arc<dyn ClaimStrategy>,
    lock_timeout: TimeDelta,
    clock: SharedClock,
}

impl ReservationEngine {
    /// Build an engine, selecting a strategy from the store's capabilities.
    ///
    /// A strategy forced in `config` is the only one considered.
    pub fn new(store: SharedStore, config: &QueueConfig) -> Result<Self> {
        let registry = match config.strategy {
            Some(kind) => StrategyRegistry::only(kind, config.optimistic_max_retries),
            None => StrategyRegistry::builtin(config.optimistic_max_retries),
        };
        Self::with_registry(store, config, &registry)
    }

    /// Build an engine from an explicit strategy registry.
    ///
    /// Fails with `NoStrategyConfigured` when nothing in `registry` fits the store.
    pub fn with_registry(
        store: SharedStore,
        config: &QueueConfig,
        registry: &StrategyRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let strategy = registry.select(store.name(), store.capabilities())?;

        tracing::info!(
            store = store.name(),
            strategy = %strategy.kind(),
            lock_timeout_secs = config.lock_timeout.as_secs(),
            "Selected claim strategy"
        );

        Ok(Self {
            store,
            strategy,
            lock_timeout: config.lock_timeout_delta()?,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy.kind()
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Claim the best eligible job for `worker`, or `None` if there is none.
    ///
    /// The returned record is locked by `worker` at the instant the claim was
    /// evaluated. Jobs the worker already holds stay eligible for it regardless
    /// of their `run_at`, ranked with everything else.
    pub async fn reserve(&self, worker: &Worker) -> Result<Option<JobRecord>> {
        let now = self.clock.now();
        let predicate = EligibilityPredicate::new(worker, now, self.lock_timeout);

        let claimed = self
            .strategy
            .claim(self.store.inner().as_ref(), &predicate)
            .await?;

        match &claimed {
            Some(record) => tracing::debug!(
                job_id = %record.id,
                worker = %worker,
                strategy = %self.strategy.kind(),
                handler = %record.handler,
                "Job reserved"
            ),
            None => tracing::trace!(worker = %worker, "No job available"),
        }
        Ok(claimed)
    }
}

impl std::fmt::Debug for ReservationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservationEngine")
            .field("store", &self.store)
            .field("strategy", &self.strategy.kind())
            .field("lock_timeout", &self.lock_timeout)
            .finish()
    }
}
