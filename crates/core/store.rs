//! Store abstraction for job persistence.
//!
//! A store persists job rows and exposes the atomic primitives the claim
//! strategies are built from. Stores differ in what they can do atomically,
//! so each one declares its [`Capabilities`] and the reservation engine picks
//! a strategy the store supports when it is constructed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{JobrowError, Result};
use crate::job::{ClaimToken, JobId, JobInsert, JobRecord};
use crate::predicate::EligibilityPredicate;

/// Atomic primitives a store offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// A single statement can update the top-ranked row matching a predicate.
    pub atomic_update: bool,
    /// Transactions can take an exclusive lock on a selected row.
    pub row_lock: bool,
    /// A conditional update reports whether it affected the row.
    pub compare_and_swap: bool,
}

impl Capabilities {
    /// Every primitive.
    pub const ALL: Self = Self {
        atomic_update: true,
        row_lock: true,
        compare_and_swap: true,
    };

    /// Only compare-and-swap, the baseline every store must offer.
    pub const COMPARE_AND_SWAP: Self = Self {
        atomic_update: false,
        row_lock: false,
        compare_and_swap: true,
    };

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::AtomicUpdate => self.atomic_update,
            Capability::RowLock => self.row_lock,
            Capability::CompareAndSwap => self.compare_and_swap,
        }
    }
}

/// A single store primitive, as required by a claim strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    AtomicUpdate,
    RowLock,
    CompareAndSwap,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AtomicUpdate => "atomic top-1 updates",
            Self::RowLock => "row locks",
            Self::CompareAndSwap => "compare-and-swap updates",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job counts at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Due, unlocked (or stale-locked), not failed.
    pub ready: u64,
    /// Not yet due, unlocked, not failed.
    pub scheduled: u64,
    /// Holding a lock that has not expired, not failed.
    pub locked: u64,
    /// Terminally failed.
    pub failed: u64,
}

/// Store trait for job persistence and claiming.
///
/// Implementations must be thread-safe (Send + Sync) and must not rely on
/// in-process state for claim correctness: claimants may live in different
/// processes.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Short name for logs, e.g. `postgres`.
    fn name(&self) -> &'static str;

    /// Primitives this store offers.
    fn capabilities(&self) -> Capabilities;

    // ========== Rows ==========

    /// Insert a new job row and return it with its assigned id.
    async fn insert(&self, job: &JobInsert) -> Result<JobRecord>;

    /// Load a job by id.
    async fn find(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Delete a job still held under `held`.
    ///
    /// Returns whether a row was removed; `false` if the row is already gone.
    /// Returns `LockLost` if the row exists under different lock fields.
    async fn delete(&self, id: JobId, held: &ClaimToken) -> Result<bool>;

    /// Persist the failure-path fields of `record`: `attempts`, `last_error`,
    /// `run_at`, `locked_at`, `locked_by`, `failed_at` and `updated_at`,
    /// only while the row is still held under `held`.
    ///
    /// Returns `JobNotFound` if the row no longer exists and `LockLost` if it
    /// is held under different lock fields.
    async fn persist_failure(&self, record: &JobRecord, held: &ClaimToken) -> Result<()>;

    // ========== Claim primitives ==========

    /// Atomically lock the top-ranked row matching `predicate` with one
    /// conditional update and return it.
    ///
    /// Requires [`Capabilities::atomic_update`].
    async fn claim_top_atomic(
        &self,
        _predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        Err(JobrowError::UnsupportedCapability(
            Capability::AtomicUpdate.as_str(),
        ))
    }

    /// Lock the top-ranked row matching `predicate` inside a transaction that
    /// holds an exclusive row lock, update it, commit and return it.
    ///
    /// Requires [`Capabilities::row_lock`].
    async fn claim_top_locked(
        &self,
        _predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        Err(JobrowError::UnsupportedCapability(Capability::RowLock.as_str()))
    }

    /// Read (without locking) the top-ranked row matching `predicate`.
    async fn select_top(&self, predicate: &EligibilityPredicate) -> Result<Option<JobRecord>>;

    /// Claim `candidate` for the predicate's worker only if its lock fields
    /// still equal the ones read and it still matches `predicate`.
    ///
    /// Returns the claimed record, or `None` if another claimant got there
    /// first.
    async fn compare_and_lock(
        &self,
        candidate: &JobRecord,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>>;

    // ========== Inspection ==========

    /// Terminally failed jobs, most recent failure first.
    async fn list_failed(
        &self,
        queue: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>>;

    /// Job counts as of `now`, treating locks older than `lock_cutoff` as expired.
    async fn stats(
        &self,
        queue: Option<&str>,
        now: DateTime<Utc>,
        lock_cutoff: DateTime<Utc>,
    ) -> Result<QueueStats>;
}

/// A type-erased store that can be shared across threads.
pub type DynStore = Arc<dyn JobStore>;

/// Wrapper around Arc<dyn JobStore> for convenience.
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any JobStore implementation.
    pub fn new<S: JobStore + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Wrap an already shared store.
    pub fn from_arc(inner: DynStore) -> Self {
        Self { inner }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("name", &self.inner.name())
            .field("capabilities", &self.inner.capabilities())
            .finish()
    }
}

#[async_trait]
impl JobStore for SharedStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    async fn insert(&self, job: &JobInsert) -> Result<JobRecord> {
        self.inner.insert(job).await
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.inner.find(id).await
    }

    async fn delete(&self, id: JobId, held: &ClaimToken) -> Result<bool> {
        self.inner.delete(id, held).await
    }

    async fn persist_failure(&self, record: &JobRecord, held: &ClaimToken) -> Result<()> {
        self.inner.persist_failure(record, held).await
    }

    async fn claim_top_atomic(
        &self,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        self.inner.claim_top_atomic(predicate).await
    }

    async fn claim_top_locked(
        &self,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        self.inner.claim_top_locked(predicate).await
    }

    async fn select_top(&self, predicate: &EligibilityPredicate) -> Result<Option<JobRecord>> {
        self.inner.select_top(predicate).await
    }

    async fn compare_and_lock(
        &self,
        candidate: &JobRecord,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        self.inner.compare_and_lock(candidate, predicate).await
    }

    async fn list_failed(
        &self,
        queue: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>> {
        self.inner.list_failed(queue, limit, offset).await
    }

    async fn stats(
        &self,
        queue: Option<&str>,
        now: DateTime<Utc>,
        lock_cutoff: DateTime<Utc>,
    ) -> Result<QueueStats> {
        self.inner.stats(queue, now, lock_cutoff).await
    }
}
