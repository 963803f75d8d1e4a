//! Completion and failure transitions for claimed jobs.

use std::sync::Arc;

use crate::backoff::BackoffPolicy;
use crate::clock::{SharedClock, SystemClock};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::JobRecord;
use crate::store::{JobStore, SharedStore};

/// Longest `last_error` text persisted, in bytes.
pub const MAX_ERROR_LEN: usize = 4096;

/// Diagnostic of a failed handler run.
///
/// Built from any error value (its `source()` chain is kept) or from a plain
/// message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    message: String,
}

impl HandlerFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Describe `err` and every error in its source chain.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut message = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            message.push_str("\ncaused by: ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The text stored in `last_error`.
    pub fn diagnostic(&self) -> String {
        truncate(&self.message, MAX_ERROR_LEN).to_string()
    }
}

impl<E: std::error::Error + 'static> From<E> for HandlerFailure {
    fn from(err: E) -> Self {
        Self::from_error(&err)
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Result of a failure transition.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Unlocked and due again at `record.run_at`.
    Rescheduled(JobRecord),
    /// Retries exhausted; `failed_at` is set and the job is never claimed again.
    Failed(JobRecord),
}

impl FailureOutcome {
    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Rescheduled(record) | Self::Failed(record) => record,
        }
    }

    pub fn into_record(self) -> JobRecord {
        match self {
            Self::Rescheduled(record) | Self::Failed(record) => record,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Applies completion and failure transitions to claimed records.
#[derive(Clone)]
pub struct Lifecycle {
    store: SharedStore,
    policy: BackoffPolicy,
    clock: SharedClock,
}

impl Lifecycle {
    pub fn new(store: SharedStore, config: &QueueConfig) -> Self {
        Self {
            store,
            policy: config.backoff(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Delete a successfully executed job.
    ///
    /// Fails with `LockLost` if the job has since been reclaimed by another
    /// worker; the row is left to its new holder.
    pub async fn complete(&self, record: &JobRecord) -> Result<()> {
        if self.store.delete(record.id, &record.claim_token()).await? {
            tracing::debug!(job_id = %record.id, handler = %record.handler, "Job completed");
        } else {
            tracing::warn!(job_id = %record.id, "Completed job was already gone");
        }
        Ok(())
    }

    /// Record `failure` as the job's last error, then reschedule it.
    pub async fn fail(
        &self,
        record: &JobRecord,
        failure: &HandlerFailure,
    ) -> Result<FailureOutcome> {
        let mut record = record.clone();
        record.last_error = Some(failure.diagnostic());
        self.reschedule(record).await
    }

    /// Count a failed attempt and either push the job back or mark it failed.
    ///
    /// A rescheduled job is unlocked and due at the backoff time. A job that
    /// has used up its attempts keeps its lock fields as evidence.
    ///
    /// Nothing is written if the job has been reclaimed since `record` was
    /// claimed; the call fails with `LockLost`.
    pub async fn reschedule(&self, mut record: JobRecord) -> Result<FailureOutcome> {
        let held = record.claim_token();
        let now = self.clock.now();
        record.attempts = record.attempts.saturating_add(1);
        record.updated_at = now;

        if self.policy.is_terminal(record.attempts) {
            record.failed_at = Some(now);
            self.store.persist_failure(&record, &held).await?;

            tracing::warn!(
                job_id = %record.id,
                handler = %record.handler,
                attempts = record.attempts,
                last_error = record.last_error.as_deref().unwrap_or(""),
                "Job failed permanently"
            );
            return Ok(FailureOutcome::Failed(record));
        }

        record.run_at = record.run_at.max(self.policy.next_run_at(now, record.attempts));
        record.unlock();
        self.store.persist_failure(&record, &held).await?;

        tracing::info!(
            job_id = %record.id,
            handler = %record.handler,
            attempts = record.attempts,
            run_at = %record.run_at,
            "Job rescheduled"
        );
        Ok(FailureOutcome::Rescheduled(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{from_millis, Clock, ManualClock};
    use crate::error::JobrowError;
    use crate::job::{JobInsert, JobRecord};
    use crate::memory::MemoryStore;
    use crate::predicate::EligibilityPredicate;
    use crate::worker::Worker;
    use chrono::{DateTime, TimeDelta, Utc};

    const NOW: i64 = 1_700_000_000_000;

    #[derive(Debug, thiserror::Error)]
    #[error("smtp rejected message")]
    struct SmtpError {
        #[source]
        source: std::io::Error,
    }

    async fn claim(memory: &MemoryStore, worker: &str, now: DateTime<Utc>) -> JobRecord {
        let predicate =
            EligibilityPredicate::new(&Worker::new(worker).unwrap(), now, TimeDelta::minutes(60));
        memory.claim_top_atomic(&predicate).await.unwrap().unwrap()
    }

    async fn setup(max_attempts: u32) -> (Lifecycle, MemoryStore, ManualClock, JobRecord) {
        let memory = MemoryStore::new();
        let clock = ManualClock::new(from_millis(NOW));
        let config = QueueConfig::builder()
            .max_attempts(max_attempts)
            .build()
            .unwrap();
        let lifecycle = Lifecycle::new(SharedStore::new(memory.clone()), &config)
            .with_clock(Arc::new(clock.clone()));

        memory
            .insert(&JobInsert {
                handler: "send_email".to_string(),
                payload: "{}".to_string(),
                priority: 0,
                queue: "default".to_string(),
                run_at: from_millis(NOW - 1_000),
                created_at: from_millis(NOW - 1_000),
            })
            .await
            .unwrap();
        let record = claim(&memory, "w1", from_millis(NOW)).await;
        (lifecycle, memory, clock, record)
    }

    #[test]
    fn test_failure_from_error_chain() {
        let err = SmtpError {
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        };
        let failure = HandlerFailure::from(err);
        assert_eq!(failure.message(), "smtp rejected message\ncaused by: timed out");
    }

    #[test]
    fn test_diagnostic_truncates_on_char_boundary() {
        let failure = HandlerFailure::new("é".repeat(MAX_ERROR_LEN));
        let text = failure.diagnostic();
        assert!(text.len() <= MAX_ERROR_LEN);
        assert_eq!(text.len(), MAX_ERROR_LEN);
        assert!(text.chars().all(|c| c == 'é'));

        let odd = HandlerFailure::new(format!("a{}", "é".repeat(MAX_ERROR_LEN)));
        assert_eq!(odd.diagnostic().len(), MAX_ERROR_LEN - 1);

        assert_eq!(HandlerFailure::new("short").diagnostic(), "short");
    }

    #[tokio::test]
    async fn test_complete_deletes() {
        let (lifecycle, memory, _, record) = setup(25).await;
        lifecycle.complete(&record).await.unwrap();
        assert!(memory.find(record.id).await.unwrap().is_none());

        // Completing again is harmless.
        lifecycle.complete(&record).await.unwrap();
    }

    #[tokio::test]
    async fn test_fail_reschedules_with_backoff() {
        let (lifecycle, memory, _, mut record) = setup(25).await;
        record.attempts = 2;

        let outcome = lifecycle
            .fail(&record, &HandlerFailure::new("boom"))
            .await
            .unwrap();
        assert!(!outcome.is_terminal());

        let stored = memory.find(record.id).await.unwrap().unwrap();
        assert_eq!(&stored, outcome.record());
        assert_eq!(stored.attempts, 3);
        // 3^4 + 5 = 86 seconds
        assert_eq!(stored.run_at, from_millis(NOW + 86_000));
        assert!(stored.locked_at.is_none());
        assert!(stored.locked_by.is_none());
        assert!(stored.failed_at.is_none());
        assert_eq!(stored.last_error.as_deref(), Some("boom"));
        assert_eq!(stored.updated_at, from_millis(NOW));
    }

    #[tokio::test]
    async fn test_fail_at_last_attempt_is_terminal() {
        let (lifecycle, memory, _, mut record) = setup(5).await;
        record.attempts = 4;

        let outcome = lifecycle
            .fail(&record, &HandlerFailure::new("still broken"))
            .await
            .unwrap();
        assert!(outcome.is_terminal());

        let stored = memory.find(record.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 5);
        assert_eq!(stored.failed_at, Some(from_millis(NOW)));
        // Lock fields stay as evidence of the last claim.
        assert_eq!(stored.locked_by.as_deref(), Some("w1"));
        assert_eq!(stored.locked_at, Some(from_millis(NOW)));
        assert_eq!(stored.run_at, from_millis(NOW - 1_000));
    }

    #[tokio::test]
    async fn test_reschedule_never_moves_run_at_backwards() {
        let (lifecycle, memory, _, mut record) = setup(25).await;
        record.run_at = from_millis(NOW + 3_600_000);

        lifecycle.reschedule(record.clone()).await.unwrap();
        let stored = memory.find(record.id).await.unwrap().unwrap();
        assert_eq!(stored.run_at, from_millis(NOW + 3_600_000));
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_persist_on_deleted_row() {
        let (lifecycle, memory, _, record) = setup(25).await;
        memory.delete(record.id, &record.claim_token()).await.unwrap();
        let err = lifecycle
            .fail(&record, &HandlerFailure::new("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobrowError::JobNotFound(id) if id == record.id));
    }

    #[tokio::test]
    async fn test_attempts_progression() {
        let (lifecycle, memory, clock, mut record) = setup(25).await;
        for expected in [6, 21, 86, 261, 630] {
            let now = clock.now();
            let outcome = lifecycle.reschedule(record.clone()).await.unwrap();
            let rescheduled = outcome.into_record();
            assert_eq!(rescheduled.run_at, now + TimeDelta::seconds(expected));
            clock.advance(TimeDelta::seconds(expected));
            record = claim(&memory, "w1", clock.now()).await;
        }
        assert_eq!(record.attempts, 5);
    }

    #[tokio::test]
    async fn test_fail_after_lock_was_reclaimed_changes_nothing() {
        let (lifecycle, memory, clock, stale) = setup(25).await;

        // w1 overruns its lock; w2 reclaims and fails the job twice.
        clock.advance(TimeDelta::minutes(61));
        for _ in 0..2 {
            let held = claim(&memory, "w2", clock.now()).await;
            lifecycle
                .fail(&held, &HandlerFailure::new("w2 failed"))
                .await
                .unwrap();
            clock.advance(TimeDelta::hours(1));
        }
        let current = claim(&memory, "w2", clock.now()).await;
        assert_eq!(current.attempts, 2);

        let err = lifecycle
            .fail(&stale, &HandlerFailure::new("w1 finally failed"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobrowError::LockLost(id) if id == stale.id));

        let stored = memory.find(stale.id).await.unwrap().unwrap();
        assert_eq!(stored, current);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("w2 failed"));
    }

    #[tokio::test]
    async fn test_complete_after_lock_was_reclaimed_keeps_row() {
        let (lifecycle, memory, clock, stale) = setup(25).await;
        clock.advance(TimeDelta::minutes(61));
        let current = claim(&memory, "w2", clock.now()).await;

        let err = lifecycle.complete(&stale).await.unwrap_err();
        assert!(matches!(err, JobrowError::LockLost(_)));
        assert_eq!(memory.find(stale.id).await.unwrap(), Some(current.clone()));

        lifecycle.complete(&current).await.unwrap();
        assert!(memory.is_empty().await);
    }
}
