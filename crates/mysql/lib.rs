//! MySQL store for the jobrow job queue.
//!
//! Requires MySQL 8.0 or later for `SKIP LOCKED`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use jobrow_core::{QueueConfig, ReservationEngine, SharedStore, Worker};
//! use jobrow_mysql::MySqlStore;
//!
//! #[tokio::main]
//! async fn main() -> jobrow_core::Result<()> {
//!     let store = MySqlStore::new("mysql://root@localhost/mydb", "myapp").await?;
//!     let engine = ReservationEngine::new(SharedStore::new(store), &QueueConfig::default())?;
//!     let job = engine.reserve(&Worker::generated()).await?;
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
use sqlx::mysql::{MySqlArguments, MySqlPool, MySqlPoolOptions};
use sqlx::query::{Query, QueryAs};
use sqlx::MySql;

const COLUMNS: &str = "id, priority, handler, payload, last_error, attempts, created_at, \
                       updated_at, run_at, locked_at, locked_by, failed_at, queue";

/// MySQL store for job rows.
#[derive(Clone)]
pub struct MySqlStore {
    pool: MySqlPool,
    namespace: String,
}

impl MySqlStore {
    /// Connect and create the jobs table if needed.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| JobrowError::store("Failed to connect to MySQL", e))?;

        Self::with_pool(pool, namespace).await
    }

    /// Use an existing pool.
    pub async fn with_pool(pool: MySqlPool, namespace: &str) -> Result<Self> {
        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_tables().await?;
        Ok(store)
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        // MySQL has no CREATE INDEX IF NOT EXISTS, so indexes are declared inline.
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGINT AUTO_INCREMENT PRIMARY KEY,
                priority INT NOT NULL DEFAULT 0,
                handler VARCHAR(255) NOT NULL,
                payload LONGTEXT,
                last_error TEXT,
                attempts INT NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                run_at BIGINT NOT NULL,
                locked_at BIGINT NULL,
                locked_by VARCHAR(255) NULL,
                failed_at BIGINT NULL,
                queue VARCHAR(255) NOT NULL DEFAULT 'default',
                INDEX idx_claim (priority, run_at, id),
                INDEX idx_locked_by (locked_by)
            )
            "#,
            self.jobs_table()
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to create jobs table", e))?;

        tracing::debug!(table = %self.jobs_table(), "MySQL jobs table ready");
        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn find_locked(&self, predicate: &EligibilityPredicate) -> Result<Option<JobRecord>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE locked_by = ? AND locked_at = ? AND failed_at IS NULL \
             ORDER BY {} LIMIT 1",
            COLUMNS,
            self.jobs_table(),
            CLAIM_ORDER
        ))
        .bind(predicate.worker_id())
        .bind(to_millis(predicate.now()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to load claimed job", e))?;
        Ok(row.map(Into::into))
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    priority: i32,
    handler: String,
    payload: Option<String>,
    last_error: Option<String>,
    attempts: i32,
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
    mut query: Query<'q, MySql, MySqlArguments>,
    predicate: &'q EligibilityPredicate,
) -> Query<'q, MySql, MySqlArguments> {
    for param in predicate.params() {
        query = match param {
            PredicateParam::Text(text) => query.bind(text),
            PredicateParam::Millis(millis) => query.bind(millis),
        };
    }
    query
}

fn bind_predicate_as<'q>(
    mut query: QueryAs<'q, MySql, JobRow, MySqlArguments>,
    predicate: &'q EligibilityPredicate,
) -> QueryAs<'q, MySql, JobRow, MySqlArguments> {
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
impl JobStore for MySqlStore {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn insert(&self, job: &JobInsert) -> Result<JobRecord> {
        let created_at = to_millis(job.created_at);
        let run_at = to_millis(job.run_at);
        let result = sqlx::query(&format!(
            "INSERT INTO {} (priority, handler, payload, attempts, created_at, updated_at, run_at, queue) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?)",
            self.jobs_table()
        ))
        .bind(job.priority)
        .bind(&job.handler)
        .bind(&job.payload)
        .bind(created_at)
        .bind(created_at)
        .bind(run_at)
        .bind(&job.queue)
        .execute(&self.pool)
        .await
        .map_err(|e| JobrowError::store("Failed to insert job", e))?;

        let id = i64::try_from(result.last_insert_id())
            .map_err(|e| JobrowError::store("Invalid job id", e))?;
        let mut record = job.clone().into_record(JobId(id));
        record.created_at = from_millis(created_at);
        record.updated_at = record.created_at;
        record.run_at = from_millis(run_at);
        Ok(record)
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
            "DELETE FROM {} WHERE id = ? AND locked_at <=> ? AND locked_by <=> ?",
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
             WHERE id = ? AND locked_at <=> ? AND locked_by <=> ?",
            self.jobs_table()
        ))
        .bind(i32::try_from(record.attempts).unwrap_or(i32::MAX))
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
        // Zero counts changed rows, so a matched write of identical values
        // also lands here; such a row still carries the held lock fields.
        match self.find(record.id).await? {
            Some(current) if held.holds(&current) => Ok(()),
            Some(_) => Err(JobrowError::LockLost(record.id)),
            None => Err(JobrowError::JobNotFound(record.id)),
        }
    }

    async fn claim_top_atomic(
        &self,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        let now = to_millis(predicate.now());
        let sql = format!(
            "UPDATE {} SET locked_at = ?, locked_by = ?, updated_at = ? WHERE {} ORDER BY {} LIMIT 1",
            self.jobs_table(),
            predicate.to_sql(ParamStyle::Question, 1),
            CLAIM_ORDER
        );

        let query = sqlx::query(&sql)
            .bind(now)
            .bind(predicate.worker_id())
            .bind(now);
        let result = bind_predicate(query, predicate)
            .execute(&self.pool)
            .await
            .map_err(|e| JobrowError::store("Failed to claim job", e))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_locked(predicate).await
    }

    async fn claim_top_locked(
        &self,
        predicate: &EligibilityPredicate,
    ) -> Result<Option<JobRecord>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| JobrowError::store("Failed to begin transaction", e))?;

        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1 FOR UPDATE SKIP LOCKED",
            COLUMNS,
            self.jobs_table(),
            predicate.to_sql(ParamStyle::Question, 1),
            CLAIM_ORDER
        );
        let row: Option<JobRow> = bind_predicate_as(sqlx::query_as(&sql), predicate)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| JobrowError::store("Failed to select job", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| JobrowError::store("Failed to rollback", e))?;
            return Ok(None);
        };

        let now = to_millis(predicate.now());
        sqlx::query(&format!(
            "UPDATE {} SET locked_at = ?, locked_by = ?, updated_at = ? WHERE id = ?",
            self.jobs_table()
        ))
        .bind(now)
        .bind(predicate.worker_id())
        .bind(now)
        .bind(row.id)
        .execute(&mut *tx)
        .await
        .map_err(|e| JobrowError::store("Failed to lock job", e))?;

        tx.commit()
            .await
            .map_err(|e| JobrowError::store("Failed to commit", e))?;

        let mut record = JobRecord::from(row);
        record.locked_at = Some(predicate.now());
        record.locked_by = Some(predicate.worker_id().to_string());
        record.updated_at = predicate.now();
        Ok(Some(record))
    }

    async fn select_top(&self, predicate: &EligibilityPredicate) -> Result<Option<JobRecord>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1",
            COLUMNS,
            self.jobs_table(),
            predicate.to_sql(ParamStyle::Question, 1),
            CLAIM_ORDER
        );
        let row: Option<JobRow> = bind_predicate_as(sqlx::query_as(&sql), predicate)
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
        let now = to_millis(predicate.now());
        let sql = format!(
            "UPDATE {} SET locked_at = ?, locked_by = ?, updated_at = ? \
             WHERE id = ? AND locked_at <=> ? AND locked_by <=> ? AND {}",
            self.jobs_table(),
            predicate.to_sql(ParamStyle::Question, 1)
        );

        let query = sqlx::query(&sql)
            .bind(now)
            .bind(predicate.worker_id())
            .bind(now)
            .bind(candidate.id.0)
            .bind(candidate.locked_at.map(to_millis))
            .bind(candidate.locked_by.as_deref());
        let result = bind_predicate(query, predicate)
            .execute(&self.pool)
            .await
            .map_err(|e| JobrowError::store("Failed to claim job", e))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let mut record = candidate.clone();
        record.locked_at = Some(predicate.now());
        record.locked_by = Some(predicate.worker_id().to_string());
        record.updated_at = predicate.now();
        Ok(Some(record))
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
