//! PostgreSQL store for the jobrow job queue.
//!
//! Jobs live in a single `<namespace>_jobs` table. PostgreSQL offers every
//! claim primitive, so the reservation engine picks the atomic-update
//! strategy for this store unless another one is forced.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use jobrow_core::{Client, NewJob, QueueConfig, SharedStore};
//! use jobrow_postgres::PostgresStore;
//!
//! #[tokio::main]
//! async fn main() -> jobrow_core::Result<()> {
//!     let store = PostgresStore::new("postgres://localhost/mydb", "myapp").await?;
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
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::QueryAs;
use sqlx::Postgres;

const COLUMNS: &str = "id, priority, handler, payload, last_error, attempts, created_at, \
                       updated_at, run_at, locked_at, locked_by, failed_at, queue";

/// PostgreSQL store for job rows.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    namespace: String,
}

impl PostgresStore {
    /// Connect and create the jobs table if needed.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| JobrowError::store("Failed to connect to PostgreSQL", e))?;

        Self::with_pool(pool, namespace).await
    }

    /// Use an existing pool.
    pub async fn with_pool(pool: PgPool, namespace: &str) -> Result<Self> {
        let store = Self {
            pool,
            namespace: namespace.to_string(),
        };
        store.init_tables().await?;
        Ok(store)
    }

    /// Initialize the required tables.
    async fn init_tables(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                priority INTEGER NOT NULL DEFAULT 0,
                handler TEXT NOT NULL,
                payload TEXT,
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                run_at BIGINT NOT NULL,
                locked_at BIGINT,
                locked_by TEXT,
                failed_at BIGINT,
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

        tracing::debug!(table = %self.jobs_table(), "PostgreSQL jobs table ready");
        Ok(())
    }

    fn jobs_table(&self) -> String {
        format!("{}_jobs", self.namespace)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
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
    mut query: QueryAs<'q, Postgres, JobRow, PgArguments>,
    predicate: &'q EligibilityPredicate,
) -> QueryAs<'q, Postgres, JobRow, PgArguments> {
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
impl JobStore for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    async fn insert(&self, job: &JobInsert) -> Result<JobRecord> {
        let created_at = to_millis(job.created_at);
        let row: JobRow = sqlx::query_as(&format!(
            "INSERT INTO {} (priority, handler, payload, attempts, created_at, updated_at, run_at, queue) \
             VALUES ($1, $2, $3, 0, $4, $4, $5, $6) RETURNING {}",
            self.jobs_table(),
            COLUMNS
        ))
        .bind(job.priority)
        .bind(&job.handler)
        .bind(&job.payload)
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
            "SELECT {} FROM {} WHERE id = $1",
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
            "DELETE FROM {} WHERE id = $1 \
             AND locked_at IS NOT DISTINCT FROM $2 AND locked_by IS NOT DISTINCT FROM $3",
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
            "UPDATE {} SET attempts = $1, last_error = $2, run_at = $3, locked_at = $4, \
             locked_by = $5, failed_at = $6, updated_at = $7 WHERE id = $8 \
             AND locked_at IS NOT DISTINCT FROM $9 AND locked_by IS NOT DISTINCT FROM $10",
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
            "UPDATE {table} SET locked_at = $1, locked_by = $2, updated_at = $1 \
             WHERE id = (SELECT id FROM {table} WHERE {} ORDER BY {} LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {}",
            predicate.to_sql(ParamStyle::Dollar, 3),
            CLAIM_ORDER,
            COLUMNS,
        );

        let query = sqlx::query_as(&sql)
            .bind(to_millis(predicate.now()))
            .bind(predicate.worker_id());
        let row: Option<JobRow> = bind_predicate(query, predicate)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobrowError::store("Failed to claim job", e))?;
        Ok(row.map(Into::into))
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
            predicate.to_sql(ParamStyle::Dollar, 1),
            CLAIM_ORDER
        );
        let row: Option<JobRow> = bind_predicate(sqlx::query_as(&sql), predicate)
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
            "UPDATE {} SET locked_at = $1, locked_by = $2, updated_at = $1 WHERE id = $3",
            self.jobs_table()
        ))
        .bind(now)
        .bind(predicate.worker_id())
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
            predicate.to_sql(ParamStyle::Dollar, 1),
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
            "UPDATE {} SET locked_at = $1, locked_by = $2, updated_at = $1 \
             WHERE id = $3 AND locked_at IS NOT DISTINCT FROM $4 \
             AND locked_by IS NOT DISTINCT FROM $5 AND {} RETURNING {}",
            self.jobs_table(),
            predicate.to_sql(ParamStyle::Dollar, 6),
            COLUMNS
        );

        let query = sqlx::query_as(&sql)
            .bind(to_millis(predicate.now()))
            .bind(predicate.worker_id())
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
            "SELECT {} FROM {} WHERE failed_at IS NOT NULL AND ($1::TEXT IS NULL OR queue = $1) \
             ORDER BY failed_at DESC, id DESC LIMIT $2 OFFSET $3",
            COLUMNS,
            self.jobs_table()
        ))
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
        let (ready, scheduled, locked, failed): (i64, i64, i64, i64) = sqlx::query_as(&format!(
            r#"
            SELECT
                COUNT(CASE WHEN failed_at IS NULL AND (locked_at IS NULL OR locked_at < $2) AND run_at <= $1 THEN 1 END),
                COUNT(CASE WHEN failed_at IS NULL AND (locked_at IS NULL OR locked_at < $2) AND run_at > $1 THEN 1 END),
                COUNT(CASE WHEN failed_at IS NULL AND locked_at >= $2 THEN 1 END),
                COUNT(CASE WHEN failed_at IS NOT NULL THEN 1 END)
            FROM {}
            WHERE $3::TEXT IS NULL OR queue = $3
            "#,
            self.jobs_table()
        ))
        .bind(to_millis(now))
        .bind(to_millis(lock_cutoff))
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
