//! # jobrow-client - Inspection client for the job queue
//!
//! This crate provides an `AdminClient` for monitoring a jobrow queue.
//!
//! ## Features
//!
//! - **Statistics**: ready, scheduled, locked and failed counts per queue
//! - **Failed Jobs**: list terminally failed jobs with their last error
//! - **Lookup**: load any job by id
//!
//! The client never changes lock or schedule fields; those belong to the
//! reservation engine and lifecycle operations.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jobrow_client::AdminClient;
//! use jobrow_core::{QueueConfig, SharedStore};
//! use jobrow_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> jobrow_core::Result<()> {
//!     let store = SqliteStore::new("sqlite:jobs.db", "myapp").await?;
//!     let admin = AdminClient::new(SharedStore::new(store), &QueueConfig::default())?;
//!
//!     let stats = admin.stats(None).await?;
//!     println!("ready={} failed={}", stats.ready, stats.failed);
//!
//!     for job in admin.list_failed(None, 20, 0).await? {
//!         println!("{} {}: {:?}", job.id, job.handler, job.last_error);
//!     }
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use jobrow_core::{JobStore, QueueConfig, SharedClock, SharedStore, SystemClock};

pub use jobrow_core::{JobId, JobRecord, JobrowError, QueueStats, Result};

/// A terminally failed job with its diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJob {
    /// Job ID.
    pub id: JobId,
    /// Handler name.
    pub handler: String,
    pub queue: String,
    /// Job payload as JSON value.
    pub payload: serde_json::Value,
    /// Last error message.
    pub last_error: Option<String>,
    /// Number of failed attempts.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
    /// Worker holding the job when it failed for the last time.
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl FailedJob {
    /// Build from a record, or `None` if the record has not failed.
    pub fn from_record(record: JobRecord) -> Option<Self> {
        let failed_at = record.failed_at?;
        let payload = match record.decoded_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(
                    job_id = %record.id,
                    error = %e,
                    "Failed job has an undecodable payload"
                );
                serde_json::Value::String(record.payload.clone().unwrap_or_default())
            }
        };

        Some(Self {
            id: record.id,
            handler: record.handler,
            queue: record.queue,
            payload,
            last_error: record.last_error,
            attempts: record.attempts,
            created_at: record.created_at,
            failed_at,
            locked_by: record.locked_by,
            locked_at: record.locked_at,
        })
    }
}

/// Admin client for monitoring the job queue.
///
/// This client provides methods for:
/// - Getting queue statistics (per queue or overall)
/// - Listing failed jobs
/// - Looking up individual jobs
#[derive(Clone)]
pub struct AdminClient {
    store: SharedStore,
    lock_timeout: TimeDelta,
    clock: SharedClock,
}

impl AdminClient {
    /// Create a new admin client over a shared store.
    ///
    /// `config.lock_timeout` decides which locks count as live in statistics.
    pub fn new(store: SharedStore, config: &QueueConfig) -> Result<Self> {
        Ok(Self {
            store,
            lock_timeout: config.lock_timeout_delta()?,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Get a reference to the underlying store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    // ========== Statistics ==========

    /// Job counts for `queue`, or for every queue when `None`.
    pub async fn stats(&self, queue: Option<&str>) -> Result<QueueStats> {
        let now = self.clock.now();
        let cutoff = now
            .checked_sub_signed(self.lock_timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.stats(queue, now, cutoff).await
    }

    // ========== Failed Jobs ==========

    /// List failed jobs with pagination, most recent failure first.
    pub async fn list_failed(
        &self,
        queue: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<FailedJob>> {
        let records = self.store.list_failed(queue, limit, offset).await?;
        Ok(records.into_iter().filter_map(FailedJob::from_record).collect())
    }

    /// Get a failed job by its ID.
    ///
    /// Returns `None` if the job does not exist or has not failed.
    pub async fn failed_job(&self, id: JobId) -> Result<Option<FailedJob>> {
        let record = self.store.find(id).await?;
        Ok(record.and_then(FailedJob::from_record))
    }

    // ========== Lookup ==========

    /// Load any job by its ID.
    pub async fn find(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.store.find(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobrow_core::{
        from_millis, Client, HandlerFailure, Lifecycle, ManualClock, MemoryStore, NewJob,
        ReservationEngine, Worker,
    };
    use serde_json::json;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        memory: MemoryStore,
        clock: ManualClock,
        client: Client,
        engine: ReservationEngine,
        lifecycle: Lifecycle,
        admin: AdminClient,
    }

    fn harness() -> Harness {
        let config = QueueConfig::builder()
            .max_attempts(1)
            .lock_timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        let memory = MemoryStore::new();
        let store = SharedStore::new(memory.clone());
        let clock = ManualClock::new(from_millis(NOW));
        let shared_clock: SharedClock = Arc::new(clock.clone());

        Harness {
            client: Client::new(store.clone(), &config).with_clock(shared_clock.clone()),
            engine: ReservationEngine::new(store.clone(), &config)
                .unwrap()
                .with_clock(shared_clock.clone()),
            lifecycle: Lifecycle::new(store.clone(), &config).with_clock(shared_clock.clone()),
            admin: AdminClient::new(store, &config)
                .unwrap()
                .with_clock(shared_clock),
            memory,
            clock,
        }
    }

    async fn fail_next(h: &Harness, message: &str) -> JobRecord {
        let claimed = h
            .engine
            .reserve(&Worker::new("w1").unwrap())
            .await
            .unwrap()
            .unwrap();
        h.lifecycle
            .fail(&claimed, &HandlerFailure::new(message))
            .await
            .unwrap()
            .into_record()
    }

    #[tokio::test]
    async fn test_stats() {
        let h = harness();
        h.client.enqueue(NewJob::new("a")).await.unwrap();
        h.client.enqueue(NewJob::new("b")).await.unwrap();
        h.client
            .enqueue_in(NewJob::new("c"), Duration::from_secs(30))
            .await
            .unwrap();
        h.client
            .enqueue(NewJob::new("d").queue("mail"))
            .await
            .unwrap();

        h.engine
            .reserve(&Worker::new("w1").unwrap())
            .await
            .unwrap()
            .unwrap();

        let stats = h.admin.stats(None).await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                ready: 2,
                scheduled: 1,
                locked: 1,
                failed: 0
            }
        );

        let mail = h.admin.stats(Some("mail")).await.unwrap();
        assert_eq!(mail.ready + mail.locked, 1);

        // After the lock timeout the claimed job is ready again.
        h.clock.advance(chrono::TimeDelta::seconds(61));
        let stats = h.admin.stats(None).await.unwrap();
        assert_eq!(stats.locked, 0);
        assert_eq!(stats.ready, 4);
    }

    #[tokio::test]
    async fn test_list_failed_newest_first() {
        let h = harness();
        h.client
            .enqueue(NewJob::new("first").payload(json!({"n": 1})))
            .await
            .unwrap();
        h.client
            .enqueue(NewJob::new("second").payload(json!({"n": 2})))
            .await
            .unwrap();

        fail_next(&h, "one").await;
        h.clock.advance(chrono::TimeDelta::seconds(1));
        fail_next(&h, "two").await;

        let failed = h.admin.list_failed(None, 10, 0).await.unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].handler, "second");
        assert_eq!(failed[0].last_error.as_deref(), Some("two"));
        assert_eq!(failed[0].payload, json!({"n": 2}));
        assert_eq!(failed[0].attempts, 1);
        assert_eq!(failed[0].locked_by.as_deref(), Some("w1"));
        assert_eq!(failed[1].handler, "first");

        let page = h.admin.list_failed(None, 1, 1).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].handler, "first");

        assert!(h.admin.list_failed(Some("mail"), 10, 0).await.unwrap().is_empty());
        assert_eq!(h.admin.stats(None).await.unwrap().failed, 2);
    }

    #[tokio::test]
    async fn test_failed_job_and_find() {
        let h = harness();
        let pending = h.client.enqueue(NewJob::new("pending")).await.unwrap();
        assert!(h.admin.failed_job(pending.id).await.unwrap().is_none());
        assert_eq!(h.admin.find(pending.id).await.unwrap(), Some(pending.clone()));

        let failed = fail_next(&h, "boom").await;
        let job = h.admin.failed_job(failed.id).await.unwrap().unwrap();
        assert_eq!(job.failed_at, from_millis(NOW));
        assert_eq!(job.last_error.as_deref(), Some("boom"));

        assert!(h.admin.find(JobId(999)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_kept_raw() {
        let h = harness();
        let mut record = h.client.enqueue(NewJob::new("bad")).await.unwrap();
        record.payload = Some("{broken".to_string());
        record.failed_at = Some(from_millis(NOW));

        let job = FailedJob::from_record(record).unwrap();
        assert_eq!(job.payload, json!("{broken"));
        assert!(h.memory.len().await == 1);
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let h = harness();
        h.memory.set_unavailable(true);
        let err = h.admin.stats(None).await.unwrap_err();
        assert!(matches!(err, JobrowError::StoreUnavailable(_)));
    }
}
