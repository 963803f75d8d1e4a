//! Claim strategies.
//!
//! A claim strategy selects the best-ranked eligible job and locks it for one
//! worker such that no concurrent claimant, in any process, can lock the same
//! job during the same lock epoch. Each strategy is built on one store
//! primitive:
//!
//! - [`AtomicUpdateStrategy`]: a single conditional "update top-1" statement.
//! - [`RowLockStrategy`]: select-for-update inside a transaction.
//! - [`OptimisticStrategy`]: read a candidate, then compare-and-swap its lock
//!   fields; retry a bounded number of times on conflict.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{JobrowError, Result};
use crate::job::JobRecord;
use crate::predicate::EligibilityPredicate;
use crate::store::{Capabilities, Capability, JobStore};

/// Identifies a claim strategy in configuration and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyKind {
    AtomicUpdate,
    RowLock,
    Optimistic,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AtomicUpdate => "atomic-update",
            Self::RowLock => "row-lock",
            Self::Optimistic => "optimistic",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = JobrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "atomic-update" | "atomic" => Ok(Self::AtomicUpdate),
            "row-lock" | "rowlock" => Ok(Self::RowLock),
            "optimistic" | "optimistic-retry" => Ok(Self::Optimistic),
            other => Err(JobrowError::Config(format!(
                "unknown claim strategy {:?}",
                other
            ))),
        }
    }
}

/// An atomic claim algorithm.
#[async_trait]
pub trait ClaimStrategy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// The store primitive this strategy is built on.
    fn required_capability(&self) -> Capability;

    /// Claim the top-ranked job matching `predicate`, or return `None`.
    ///
    /// A returned record has `locked_at = predicate.now()` and
    /// `locked_by = predicate.worker_id()` persisted.
    async fn claim(
        &self,
        store: &dyn JobStore,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>>;
}

/// Claims with the store's single-statement "update top-1" primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomicUpdateStrategy;

#[async_trait]
impl ClaimStrategy for AtomicUpdateStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AtomicUpdate
    }

    fn required_capability(&self) -> Capability {
        Capability::AtomicUpdate
    }

    async fn claim(
        &self,
        store: &dyn JobStore,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        store.claim_top_atomic(predicate).await
    }
}

/// Claims by locking the top-ranked row inside a transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowLockStrategy;

#[async_trait]
impl ClaimStrategy for RowLockStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RowLock
    }

    fn required_capability(&self) -> Capability {
        Capability::RowLock
    }

    async fn claim(
        &self,
        store: &dyn JobStore,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        store.claim_top_locked(predicate).await
    }
}

/// Claims by compare-and-swap on the candidate's lock fields.
#[derive(Debug, Clone, Copy)]
pub struct OptimisticStrategy {
    max_retries: u32,
}

impl OptimisticStrategy {
    /// Give up after `max_retries` lost races (at least one selection is made).
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn try_claim(
        &self,
        store: &dyn JobStore,
        candidate: &JobRecord,
        predicate: &EligibilityPredicate,
    ) -> Result<JobRecord> {
        store
            .compare_and_lock(candidate, predicate)
            .await?
            .ok_or(JobrowError::ClaimConflict(candidate.id))
    }
}

impl Default for OptimisticStrategy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_OPTIMISTIC_RETRIES)
    }
}

#[async_trait]
impl ClaimStrategy for OptimisticStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Optimistic
    }

    fn required_capability(&self) -> Capability {
        Capability::CompareAndSwap
    }

    async fn claim(
        &self,
        store: &dyn JobStore,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        for attempt in 1..=self.max_retries {
            let candidate = match store.select_top(predicate).await? {
                Some(candidate) => candidate,
                None => return Ok(None),
            };

            match self.try_claim(store, &candidate, predicate).await {
                Ok(record) => return Ok(Some(record)),
                Err(JobrowError::ClaimConflict(job_id)) => {
                    tracing::trace!(
                        job_id = %job_id,
                        worker = predicate.worker_id(),
                        attempt,
                        "Lost claim race, selecting again"
                    );
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e),
            }
        }

        tracing::warn!(
            worker = predicate.worker_id(),
            max_retries = self.max_retries,
            "Claim retries exhausted under contention"
        );
        Ok(None)
    }
}

/// Ordered set of strategies considered when an engine starts.
#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ClaimStrategy>>,
    default: Option<Arc<dyn ClaimStrategy>>,
}

impl StrategyRegistry {
    /// A registry with no strategies and no default.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Atomic update, then row lock, with optimistic retry as the default.
    pub fn builtin(optimistic_max_retries: u32) -> Self {
        Self::empty()
            .register(AtomicUpdateStrategy)
            .register(RowLockStrategy)
            .with_default(OptimisticStrategy::new(optimistic_max_retries))
    }

    /// Only the built-in strategy of `kind`, without a fallback.
    pub fn only(kind: StrategyKind, optimistic_max_retries: u32) -> Self {
        match kind {
            StrategyKind::AtomicUpdate => Self::empty().register(AtomicUpdateStrategy),
            StrategyKind::RowLock => Self::empty().register(RowLockStrategy),
            StrategyKind::Optimistic => {
                Self::empty().register(OptimisticStrategy::new(optimistic_max_retries))
            }
        }
    }

    /// Append a strategy. Earlier registrations are preferred.
    pub fn register(mut self, strategy: impl ClaimStrategy + 'static) -> Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    /// Set the strategy used when no registered one fits the store.
    pub fn with_default(mut self, strategy: impl ClaimStrategy + 'static) -> Self {
        self.default = Some(Arc::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty() && self.default.is_none()
    }

    /// Pick the first registered strategy the store supports, else the default.
    pub fn select(&self, store_name: &str, caps: Capabilities) -> Result<Arc<dyn ClaimStrategy>> {
        if self.is_empty() {
            return Err(JobrowError::NoStrategyConfigured(
                "strategy registry is empty".to_string(),
            ));
        }

        if let Some(strategy) = self
            .strategies
            .iter()
            .find(|s| caps.supports(s.required_capability()))
        {
            return Ok(strategy.clone());
        }

        match &self.default {
            Some(strategy) if caps.supports(strategy.required_capability()) => {
                Ok(strategy.clone())
            }
            Some(strategy) => Err(JobrowError::NoStrategyConfigured(format!(
                "store {} lacks {} required by default strategy {}",
                store_name,
                strategy.required_capability(),
                strategy.kind()
            ))),
            None => Err(JobrowError::NoStrategyConfigured(format!(
                "no registered strategy fits store {} ({:?}) and no default is set",
                store_name, caps
            ))),
        }
    }
}
