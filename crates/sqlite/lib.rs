//! SQLite store for the jobrow job queue.
//!
//! SQLite serializes writers, so a single `UPDATE ... RETURNING` over a
//! ranked subquery is an atomic claim. It has no row locks; forcing the
//! row-lock strategy on this store fails at startup.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jobrow_core::{Client, NewJob, QueueConfig, SharedStore};
//! use jobrow_sqlite::SqliteStore;
//!
//! #[tokio::main]
//! async fn main() -> jobrow_core::Result<()> {
//!     let store = SqliteStore::new("sqlite:jobs.db", "myapp").await?;
//!     let client = Client::new(SharedStore::new(store), &QueueConfig::default());
//!     client.enqueue(NewJob::new("send_email")).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrow_core::{
    from_millis, to_millis, Capabilities, ClaimToken, EligibilityPredicate, JobId, JobInsert,
    JobRecord, JobStore, JobrowError, ParamStyle, PredicateParam, QueueStats, Result,
    CLAIM_ORDER,
};
use sqlx::query::QueryAs;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use std::str::FromStr;

const COLUMNS: &str = "id, priority, handler, payload, last_error, attempts, created_at, \
                       updated_at, run_at, locked_at, locked_by, failed_at, queue";

/// SQLite store for job rows.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    namespace: String,
}

impl SqliteStore {
    /// Open (creating if missing) a SQLite database.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| JobrowError::Config(format!("Invalid SQLite URL: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite works best with single connection for writes
            // An in-memory database lives only as long as its connection.
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| JobrowError::store("Failed to connect to SQLite", e))?;

        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_tables().await?;
        Ok(store)
    }

    /// Create an in-memory SQLite store (useful for testing).
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        Self::new("sqlite::memory:", namespace).await
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                priority INTEGER NOT NULL DEFAULT 0,
                handler TEXT NOT NULL,
                payload TEXT,
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                run_at INTEGER NOT NULL,
                locked_at INTEGER,
                locked_by TEXT,
                failed_at INTEGER,
                queue TEXT NOT NULL DEFAULT 'default'
            )
            "#,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to create jobs table", e))?;

        // Claim ordering
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_jobs_claim ON {} (priority DESC, run_at, id)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to create claim index", e))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_jobs_locked_by ON {} (locked_by)",
            self.namespace,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to create locked_by index", e))?;

        tracing::debug!(table = %self.jobs_table(), "SQLite jobs table ready");
        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    priority: i32,
    handler: String,
    payload: Option<String>,
    last_error: Option<String>,
    attempts: i64,
    created_at: i64,
    updated_at: i64,
    run_at: i64,
    locked_at: Option<i64>,
    locked_by: Option<String>,
    failed_at: Option<i64>,
    queue: String,
}

impl From<JobRow> for JobRecord {
    fn from(row: JobRow) -> Self {
        JobRecord {
            id: JobId(row.id),
            priority: row.priority,
            handler: row.handler,
            payload: row.payload,
            last_error: row.last_error,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            run_at: from_millis(row.run_at),
            locked_at: row.locked_at.map(from_millis),
            locked_by: row.locked_by,
            failed_at: row.failed_at.map(from_millis),
            queue: row.queue,
        }
    }
}

fn bind_predicate<'q>(
    mut query: QueryAs<'q, Sqlite, JobRow, SqliteArguments<'q>>,
    predicate: &'q EligibilityPredicate,
) -> QueryAs<'q, Sqlite, JobRow, SqliteArguments<'q>> {
    for param in predicate.params() {
        query = match param {
            PredicateParam::Text(text) => query.bind(text),
            PredicateParam::Millis(millis) => query.bind(millis),
        };
    }
    query
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl JobStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            atomic_update: true,
            row_lock: false,
            compare_and_swap: true,
        }
    }

    async fn insert(&self, job: &JobInsert) -> Result<JobRecord> {
        let created_at = to_millis(job.created_at);
        let row: JobRow = sqlx::query_as(&format!(
            "INSERT INTO {} (priority, handler, payload, attempts, created_at, updated_at, run_at, queue) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?) RETURNING {}",
            self.jobs_table(),
            COLUMNS
        ))
        .bind(job.priority)
        .bind(&job.handler)
        .bind(&job.payload)
        .bind(created_at)
        .bind(created_at)
        .bind(to_millis(job.run_at))
        .bind(&job.queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to insert job", e))?;
        Ok(row.into())
    }

    async fn find(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            COLUMNS,
            self.jobs_table()
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to load job", e))?;
        Ok(row.map(Into::into))
    }

    async fn delete(&self, id: JobId, held: &ClaimToken) -> Result<bool> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE id = ? AND locked_at IS ? AND locked_by IS ?",
            self.jobs_table()
        ))
        .bind(id.0)
        .bind(held.locked_at.map(to_millis))
        .bind(held.locked_by.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to delete job", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.find(id).await? {
            Some(_) => Err(JobrowError::LockLost(id)),
            None => Ok(false),
        }
    }

    async fn persist_failure(&self, record: &JobRecord, held: &ClaimToken) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET attempts = ?, last_error = ?, run_at = ?, locked_at = ?, \
             locked_by = ?, failed_at = ?, updated_at = ? \
             WHERE id = ? AND locked_at IS ? AND locked_by IS ?",
            self.jobs_table()
        ))
        .bind(i64::from(record.attempts))
        .bind(record.last_error.as_deref())
        .bind(to_millis(record.run_at))
        .bind(record.locked_at.map(to_millis))
        .bind(record.locked_by.as_deref())
        .bind(record.failed_at.map(to_millis))
        .bind(to_millis(record.updated_at))
        .bind(record.id.0)
        .bind(held.locked_at.map(to_millis))
        .bind(held.locked_by.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to persist job failure", e))?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        match self.find(record.id).await? {
            Some(_) => Err(JobrowError::LockLost(record.id)),
            None => Err(JobrowError::JobNotFound(record.id)),
        }
    }

    async fn claim_top_atomic(
        &self,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        let table = self.jobs_table();
        let sql = format!(
            "UPDATE {table} SET locked_at = ?, locked_by = ?, updated_at = ? \
             WHERE id = (SELECT id FROM {table} WHERE {} ORDER BY {} LIMIT 1) \
             RETURNING {}",
            predicate.to_sql(ParamStyle::Question, 1),
            CLAIM_ORDER,
            COLUMNS,
        );

        let now = to_millis(predicate.now());
        let query = sqlx::query_as(&sql)
            .bind(now)
            .bind(predicate.worker_id())
            .bind(now);
        let row: Option<JobRow> = bind_predicate(query, predicate)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobrowError::store("Failed to claim job", e))?;
        Ok(row.map(Into::into))
    }

    async fn select_top(&self, predicate: &EligibilityPredicate) -> Result<Option<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1",
            COLUMNS,
            self.jobs_table(),
            predicate.to_sql(ParamStyle::Question, 1),
            CLAIM_ORDER
        );
        let row: Option<JobRow> = bind_predicate(sqlx::query_as(&sql), predicate)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobrowError::store("Failed to select job", e))?;
        Ok(row.map(Into::into))
    }

    async fn compare_and_lock(
        &self,
        candidate: &JobRecord,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        let sql = format!(
            "UPDATE {} SET locked_at = ?, locked_by = ?, updated_at = ? \
             WHERE id = ? AND locked_at IS ? AND locked_by IS ? AND {} RETURNING {}",
            self.jobs_table(),
            predicate.to_sql(ParamStyle::Question, 1),
            COLUMNS
        );

        let now = to_millis(predicate.now());
        let query = sqlx::query_as(&sql)
            .bind(now)
            .bind(predicate.worker_id())
            .bind(now)
            .bind(candidate.id.0)
            .bind(candidate.locked_at.map(to_millis))
            .bind(candidate.locked_by.as_deref());
        let row: Option<JobRow> = bind_predicate(query, predicate)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobrowError::store("Failed to claim job", e))?;
        Ok(row.map(Into::into))
    }

    async fn list_failed(
        &self,
        queue: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE failed_at IS NOT NULL AND (? IS NULL OR queue = ?) \
             ORDER BY failed_at DESC, id DESC LIMIT ? OFFSET ?",
            COLUMNS,
            self.jobs_table()
        ))
        .bind(queue)
        .bind(queue)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to list failed jobs", e))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn stats(
        &self,
        queue: Option<&str>,
        now: DateTime<Utc>,
        lock_cutoff: DateTime<Utc>,
    ) -> Result<QueueStats> {
        let now = to_millis(now);
        let cutoff = to_millis(lock_cutoff);
        let (ready, scheduled, locked, failed): (i64, i64, i64, i64) = sqlx::query_as(&format!(
            r#"
            SELECT
                COUNT(CASE WHEN failed_at IS NULL AND (locked_at IS NULL OR locked_at < ?) AND run_at <= ? THEN 1 END),
                COUNT(CASE WHEN failed_at IS NULL AND (locked_at IS NULL OR locked_at < ?) AND run_at > ? THEN 1 END),
                COUNT(CASE WHEN failed_at IS NULL AND locked_at >= ? THEN 1 END),
                COUNT(CASE WHEN failed_at IS NOT NULL THEN 1 END)
            FROM {}
            WHERE ? IS NULL OR queue = ?
            "#,
            self.jobs_table()
        ))
        .bind(cutoff)
        .bind(now)
        .bind(cutoff)
        .bind(now)
        .bind(cutoff)
        .bind(queue)
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to count jobs", e))?;

        Ok(QueueStats {
            ready: to_count(ready),
            scheduled: to_count(scheduled),
            locked: to_count(locked),
            failed: to_count(failed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use jobrow_core::{
        Client, HandlerFailure, Lifecycle, ManualClock, NewJob, QueueConfig, ReservationEngine,
        SharedClock, SharedStore, StrategyKind, Worker,
    };
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        store: SqliteStore,
        clock: ManualClock,
        client: Client,
        engine: ReservationEngine,
        lifecycle: Lifecycle,
    }

    async fn harness(config: QueueConfig) -> Harness {
        let store = SqliteStore::in_memory("test").await.unwrap();
        let clock = ManualClock::new(from_millis(NOW));
        let shared: SharedStore = SharedStore::new(store.clone());
        let shared_clock: SharedClock = Arc::new(clock.clone());
        Harness {
            client: Client::new(shared.clone(), &config).with_clock(shared_clock.clone()),
            engine: ReservationEngine::new(shared.clone(), &config)
                .unwrap()
                .with_clock(shared_clock.clone()),
            lifecycle: Lifecycle::new(shared, &config).with_clock(shared_clock),
            store,
            clock,
        }
    }

    fn worker(id: &str) -> Worker {
        Worker::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_insert_find_delete() {
        let h = harness(QueueConfig::default()).await;
        let payload = json!({"user": {"id": 7, "tags": ["a", "b"]}, "note": null});
        let record = h
            .client
            .enqueue(NewJob::new("send_email").payload(payload.clone()).priority(3))
            .await
            .unwrap();

        let found = h.store.find(record.id).await.unwrap().unwrap();
        assert_eq!(found, record);
        assert_eq!(found.decoded_payload().unwrap(), payload);
        assert_eq!(found.run_at, from_millis(NOW));
        assert_eq!(found.attempts, 0);

        let held = record.claim_token();
        assert!(h.store.delete(record.id, &held).await.unwrap());
        assert!(!h.store.delete(record.id, &held).await.unwrap());
        assert!(h.store.find(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_strategy_selection() {
        let h = harness(QueueConfig::default()).await;
        assert_eq!(h.engine.strategy(), StrategyKind::AtomicUpdate);

        let store = SharedStore::new(SqliteStore::in_memory("test").await.unwrap());
        let config = QueueConfig::builder()
            .strategy(StrategyKind::RowLock)
            .build()
            .unwrap();
        let err = ReservationEngine::new(store, &config).unwrap_err();
        assert!(matches!(err, JobrowError::NoStrategyConfigured(_)));
    }

    #[tokio::test]
    async fn test_priority_then_run_at_then_id() {
        for kind in [StrategyKind::AtomicUpdate, StrategyKind::Optimistic] {
            let config = QueueConfig::builder().strategy(kind).build().unwrap();
            let h = harness(config).await;
            let a = h
                .client
                .enqueue(NewJob::new("a").run_at(from_millis(NOW - 10)))
                .await
                .unwrap();
            let b = h.client.enqueue(NewJob::new("b").priority(5)).await.unwrap();
            let c = h
                .client
                .enqueue(NewJob::new("c").run_at(from_millis(NOW - 20)))
                .await
                .unwrap();
            let d = h
                .client
                .enqueue(NewJob::new("d").run_at(from_millis(NOW - 10)))
                .await
                .unwrap();

            let mut order = Vec::new();
            for i in 0..4 {
                let record = h
                    .engine
                    .reserve(&worker(&format!("w{}", i)))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(record.locked_at, Some(from_millis(NOW)));
                order.push(record.id);
            }
            assert_eq!(order, vec![b.id, c.id, a.id, d.id], "{}", kind);
            assert!(h.engine.reserve(&worker("w9")).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_stale_lock_boundary() {
        let config = QueueConfig::builder()
            .lock_timeout(Duration::from_secs(300))
            .build()
            .unwrap();
        let h = harness(config).await;
        let job = h.client.enqueue(NewJob::new("slow")).await.unwrap();
        h.engine.reserve(&worker("w1")).await.unwrap().unwrap();

        h.clock.advance(TimeDelta::seconds(300));
        assert!(h.engine.reserve(&worker("w2")).await.unwrap().is_none());

        h.clock.advance(TimeDelta::milliseconds(1));
        let reclaimed = h.engine.reserve(&worker("w2")).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.locked_by.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_owner_reclaims_fresh_lock() {
        let h = harness(QueueConfig::default()).await;
        let job = h.client.enqueue(NewJob::new("mine")).await.unwrap();
        h.engine.reserve(&worker("w1")).await.unwrap().unwrap();
        assert!(h.engine.reserve(&worker("w2")).await.unwrap().is_none());

        h.clock.advance(TimeDelta::seconds(1));
        let again = h.engine.reserve(&worker("w1")).await.unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.locked_at, Some(from_millis(NOW + 1_000)));
    }

    #[tokio::test]
    async fn test_compare_and_lock_conflict() {
        let h = harness(QueueConfig::default()).await;
        h.client.enqueue(NewJob::new("race")).await.unwrap();

        let p1 = EligibilityPredicate::new(&worker("w1"), from_millis(NOW), TimeDelta::hours(1));
        let p2 = EligibilityPredicate::new(&worker("w2"), from_millis(NOW), TimeDelta::hours(1));
        let candidate = h.store.select_top(&p1).await.unwrap().unwrap();

        let won = h.store.compare_and_lock(&candidate, &p2).await.unwrap();
        assert_eq!(won.unwrap().locked_by.as_deref(), Some("w2"));
        assert!(h.store.compare_and_lock(&candidate, &p1).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reserves_are_exclusive() {
        let h = harness(QueueConfig::default()).await;
        for i in 0..8 {
            h.client.enqueue(NewJob::new(format!("job-{}", i))).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..24 {
            let engine = h.engine.clone();
            handles.push(tokio::spawn(async move {
                engine.reserve(&Worker::new(format!("w{}", i)).unwrap()).await
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            if let Some(record) = handle.await.unwrap().unwrap() {
                assert!(ids.insert(record.id), "job {} claimed twice", record.id);
            }
        }
        assert_eq!(ids.len(), 8);
    }

    #[tokio::test]
    async fn test_failures_until_terminal() {
        let config = QueueConfig::builder().max_attempts(3).build().unwrap();
        let h = harness(config).await;
        let job = h.client.enqueue(NewJob::new("flaky")).await.unwrap();

        let claimed = h.engine.reserve(&worker("w1")).await.unwrap().unwrap();
        h.lifecycle
            .fail(&claimed, &HandlerFailure::new("first"))
            .await
            .unwrap();

        let stored = h.store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.run_at, from_millis(NOW + 6_000));
        assert!(stored.locked_at.is_none());
        assert!(stored.locked_by.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("first"));

        for attempt in 2..=3 {
            h.clock.advance(TimeDelta::hours(1));
            let claimed = h.engine.reserve(&worker("w1")).await.unwrap().unwrap();
            let outcome = h
                .lifecycle
                .fail(&claimed, &HandlerFailure::new(format!("attempt {}", attempt)))
                .await
                .unwrap();
            assert_eq!(outcome.is_terminal(), attempt == 3);
        }

        let stored = h.store.find(job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert!(stored.failed_at.is_some());
        assert_eq!(stored.locked_by.as_deref(), Some("w1"));

        h.clock.advance(TimeDelta::days(7));
        assert!(h.engine.reserve(&worker("w1")).await.unwrap().is_none());

        let failed = h.store.list_failed(None, 10, 0).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("attempt 3"));
    }

    #[tokio::test]
    async fn test_complete_removes_row() {
        let h = harness(QueueConfig::default()).await;
        let job = h.client.enqueue(NewJob::new("once")).await.unwrap();
        let claimed = h.engine.reserve(&worker("w1")).await.unwrap().unwrap();
        h.lifecycle.complete(&claimed).await.unwrap();

        assert!(h.store.find(job.id).await.unwrap().is_none());
        assert!(h.engine.reserve(&worker("w1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_persist_failure_missing_row() {
        let h = harness(QueueConfig::default()).await;
        let job = h.client.enqueue(NewJob::new("gone")).await.unwrap();
        let held = job.claim_token();
        h.store.delete(job.id, &held).await.unwrap();
        let err = h.store.persist_failure(&job, &held).await.unwrap_err();
        assert!(matches!(err, JobrowError::JobNotFound(id) if id == job.id));
    }

    #[tokio::test]
    async fn test_late_fail_from_expired_lock_is_rejected() {
        let h = harness(QueueConfig::default()).await;
        h.client.enqueue(NewJob::new("slow")).await.unwrap();
        let stale = h.engine.reserve(&worker("w1")).await.unwrap().unwrap();

        h.clock.advance(TimeDelta::minutes(61));
        let held = h.engine.reserve(&worker("w2")).await.unwrap().unwrap();
        h.lifecycle
            .fail(&held, &HandlerFailure::new("w2 failed"))
            .await
            .unwrap();
        h.clock.advance(TimeDelta::hours(1));
        let current = h.engine.reserve(&worker("w2")).await.unwrap().unwrap();
        assert_eq!(current.attempts, 1);

        let err = h
            .lifecycle
            .fail(&stale, &HandlerFailure::new("w1 failed"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobrowError::LockLost(id) if id == stale.id));
        let err = h.lifecycle.complete(&stale).await.unwrap_err();
        assert!(matches!(err, JobrowError::LockLost(_)));

        let stored = h.store.find(stale.id).await.unwrap().unwrap();
        assert_eq!(stored, current);
        assert_eq!(stored.last_error.as_deref(), Some("w2 failed"));
    }

    #[tokio::test]
    async fn test_stats_by_queue() {
        let h = harness(QueueConfig::default()).await;
        h.client.enqueue(NewJob::new("ready")).await.unwrap();
        h.client
            .enqueue_in(NewJob::new("later"), Duration::from_secs(60))
            .await
            .unwrap();
        h.client
            .enqueue(NewJob::new("mail").queue("mail").priority(10))
            .await
            .unwrap();
        h.engine.reserve(&worker("w1")).await.unwrap().unwrap();

        let now = from_millis(NOW);
        let cutoff = now - TimeDelta::hours(1);
        let all = h.store.stats(None, now, cutoff).await.unwrap();
        assert_eq!(
            all,
            QueueStats {
                ready: 1,
                scheduled: 1,
                locked: 1,
                failed: 0
            }
        );

        let mail = h.store.stats(Some("mail"), now, cutoff).await.unwrap();
        assert_eq!(mail.locked, 1);
        assert_eq!(mail.ready, 0);

        // Once the lock is stale the job counts as ready again.
        let later = now + TimeDelta::hours(2);
        let stale = h
            .store
            .stats(Some("mail"), later, later - TimeDelta::hours(1))
            .await
            .unwrap();
        assert_eq!(stale.ready, 1);
        assert_eq!(stale.locked, 0);
    }
}
