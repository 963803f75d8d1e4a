//! Client for enqueueing jobs.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{from_millis, to_millis, SharedClock, SystemClock};
use crate::config::QueueConfig;
use crate::error::{JobrowError, Result};
use crate::job::{encode_payload, JobInsert, JobRecord, NewJob};
use crate::store::{JobStore, SharedStore};

/// Client for enqueueing jobs to the queue.
///
/// Rows are created in the initial state: zero attempts, unlocked, not failed.
#[derive(Clone)]
pub struct Client {
    store: SharedStore,
    default_queue: String,
    clock: SharedClock,
}

impl Client {
    /// Create a new client over a shared store.
    pub fn new(store: SharedStore, config: &QueueConfig) -> Self {
        Self {
            store,
            default_queue: config.default_queue.clone(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for default run times.
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Enqueue a job.
    ///
    /// Without an explicit `run_at` the job is due immediately.
    pub async fn enqueue(&self, job: NewJob) -> Result<JobRecord> {
        job.validate()?;
        let now = self.clock.now();
        let run_at = job.run_at.unwrap_or(now);
        self.insert(job, run_at, now).await
    }

    /// Enqueue a job that becomes due after `delay`.
    pub async fn enqueue_in(&self, job: NewJob, delay: Duration) -> Result<JobRecord> {
        job.validate()?;
        let delay = TimeDelta::from_std(delay)
            .map_err(|e| JobrowError::Config(format!("Delay out of range: {}", e)))?;
        let now = self.clock.now();
        let run_at = now
            .checked_add_signed(delay)
            .ok_or_else(|| JobrowError::Config("Delay out of range".to_string()))?;
        self.insert(job, run_at, now).await
    }

    async fn insert(
        &self,
        job: NewJob,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord> {
        let insert = JobInsert {
            payload: encode_payload(&job.payload)?,
            handler: job.handler,
            priority: job.priority,
            queue: job.queue.unwrap_or_else(|| self.default_queue.clone()),
            // Stores keep millisecond precision.
            run_at: from_millis(to_millis(run_at)),
            created_at: now,
        };

        let record = self.store.insert(&insert).await?;

        tracing::debug!(
            job_id = %record.id,
            handler = %record.handler,
            queue = %record.queue,
            run_at = %record.run_at,
            "Job enqueued"
        );
        Ok(record)
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }
}
