//! In-process store.
//!
//! Keeps every row behind one `tokio::sync::Mutex`, so each primitive is
//! trivially atomic. Useful for tests and demos; claimants must share the
//! same `MemoryStore` value (clones share state).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{JobrowError, Result};
use crate::job::{ClaimToken, JobId, JobInsert, JobRecord};
use crate::predicate::{claim_order, EligibilityPredicate};
use crate::store::{Capabilities, JobStore, QueueStats};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    jobs: BTreeMap<JobId, JobRecord>,
}

impl MemoryState {
    fn top(&self, predicate: &EligibilityPredicate) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|record| predicate.matches(record))
            .min_by(|a, b| claim_order(a, b))
            .map(|record| record.id)
    }

    fn lock_row(&mut self, id: JobId, predicate: &EligibilityPredicate) -> Option<JobRecord> {
        let record = self.jobs.get_mut(&id)?;
        record.lock(predicate.worker_id(), predicate.now());
        record.updated_at = predicate.now();
        Some(record.clone())
    }
}

/// A [`JobStore`] held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    capabilities: Capabilities,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    /// A store offering every primitive.
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::ALL)
    }

    /// A store that declares only `capabilities`.
    ///
    /// Primitives it does not declare return `UnsupportedCapability`.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            capabilities,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable` (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows, including failed ones.
    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(JobrowError::store("memory store", "connection refused"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn insert(&self, job: &JobInsert) -> Result<JobRecord> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let record = job.clone().into_record(JobId(state.next_id));
        state.jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.check_available()?;
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn delete(&self, id: JobId, held: &ClaimToken) -> Result<bool> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let still_held = match state.jobs.get(&id) {
            Some(current) => held.holds(current),
            None => return Ok(false),
        };
        if !still_held {
            return Err(JobrowError::LockLost(id));
        }
        Ok(state.jobs.remove(&id).is_some())
    }

    async fn persist_failure(&self, record: &JobRecord, held: &ClaimToken) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let stored = state
            .jobs
            .get_mut(&record.id)
            .ok_or(JobrowError::JobNotFound(record.id))?;
        if !held.holds(stored) {
            return Err(JobrowError::LockLost(record.id));
        }
        stored.attempts = record.attempts;
        stored.last_error = record.last_error.clone();
        stored.run_at = record.run_at;
        stored.locked_at = record.locked_at;
        stored.locked_by = record.locked_by.clone();
        stored.failed_at = record.failed_at;
        stored.updated_at = record.updated_at;
        Ok(())
    }

    async fn claim_top_atomic(
        &self,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        if !self.capabilities.atomic_update {
            return Err(JobrowError::UnsupportedCapability("atomic top-1 updates"));
        }
        self.check_available()?;
        let mut state = self.state.lock().await;
        Ok(state.top(predicate).and_then(|id| state.lock_row(id, predicate)))
    }

    async fn claim_top_locked(
        &self,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        if !self.capabilities.row_lock {
            return Err(JobrowError::UnsupportedCapability("row locks"));
        }
        self.check_available()?;
        // The store mutex is the row lock.
        let mut state = self.state.lock().await;
        Ok(state.top(predicate).and_then(|id| state.lock_row(id, predicate)))
    }

    async fn select_top(&self, predicate: &EligibilityPredicate) -> Result<Option<JobRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .top(predicate)
            .and_then(|id| state.jobs.get(&id).cloned()))
    }

    async fn compare_and_lock(
        &self,
        candidate: &JobRecord,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        if !self.capabilities.compare_and_swap {
            return Err(JobrowError::UnsupportedCapability("compare-and-swap updates"));
        }
        self.check_available()?;
        let mut state = self.state.lock().await;
        let unchanged = match state.jobs.get(&candidate.id) {
            Some(current) => {
                current.locked_at == candidate.locked_at
                    && current.locked_by == candidate.locked_by
                    && predicate.matches(current)
            }
            None => false,
        };
        if !unchanged {
            return Ok(None);
        }
        Ok(state.lock_row(candidate.id, predicate))
    }

    async fn list_failed(
        &self,
        queue: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut failed: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|r| r.failed_at.is_some())
            .filter(|r| queue.map_or(true, |q| r.queue == q))
            .cloned()
            .collect();
        failed.sort_by(|a, b| b.failed_at.cmp(&a.failed_at).then_with(|| b.id.cmp(&a.id)));
        Ok(failed.into_iter().skip(offset).take(limit).collect())
    }

    async fn stats(
        &self,
        queue: Option<&str>,
        now: DateTime<Utc>,
        lock_cutoff: DateTime<Utc>,
    ) -> Result<QueueStats> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for record in state
            .jobs
            .values()
            .filter(|r| queue.map_or(true, |q| r.queue == q))
        {
            let lock_live = matches!(record.locked_at, Some(at) if at >= lock_cutoff);
            if record.failed_at.is_some() {
                stats.failed += 1;
            } else if lock_live {
                stats.locked += 1;
            } else if record.run_at <= now {
                stats.ready += 1;
            } else {
                stats.scheduled += 1;
            }
        }
        Ok(stats)
    }
}
