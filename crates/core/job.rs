//! Job record definition and payload encoding.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JobrowError, Result};

/// Store-assigned identifier of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One persisted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Unique job identifier.
    pub id: JobId,
    /// Higher priorities are claimed first.
    pub priority: i32,
    /// Name of the behavior that executes this job.
    pub handler: String,
    /// Encoded JSON arguments. Use [`JobRecord::decoded_payload`] to read.
    pub payload: Option<String>,
    /// Diagnostic text from the most recent failed attempt.
    pub last_error: Option<String>,
    /// Number of failed execution attempts so far.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest time the job is eligible to run.
    pub run_at: DateTime<Utc>,
    /// When a worker claimed the job.
    pub locked_at: Option<DateTime<Utc>>,
    /// Which worker claimed the job.
    pub locked_by: Option<String>,
    /// Set once retries are exhausted. Failed jobs are never claimed again.
    pub failed_at: Option<DateTime<Utc>>,
    /// Logical partition the job belongs to.
    pub queue: String,
}

impl JobRecord {
    /// Decode the payload into a JSON value.
    ///
    /// An absent or empty payload decodes to an empty object.
    pub fn decoded_payload(&self) -> Result<Value> {
        decode_payload(self.payload.as_deref())
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.decoded_payload()?)?)
    }

    /// Whether a worker currently holds (or last held) a claim on this record.
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some() && self.locked_by.is_some()
    }

    /// Whether the job has failed terminally.
    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// The lock fields this copy was read with.
    pub fn claim_token(&self) -> ClaimToken {
        ClaimToken {
            locked_at: self.locked_at,
            locked_by: self.locked_by.clone(),
        }
    }

    /// Mark the record as claimed by `worker` at `now`.
    pub(crate) fn lock(&mut self, worker: &str, now: DateTime<Utc>) {
        self.locked_at = Some(now);
        self.locked_by = Some(worker.to_string());
    }

    pub(crate) fn unlock(&mut self) {
        self.locked_at = None;
        self.locked_by = None;
    }
}

/// Lock fields a record was claimed with.
///
/// Completion and failure writes apply only while the stored row still
/// carries the same values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken {
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
}

impl ClaimToken {
    /// Whether `record` is still held under this token.
    pub fn holds(&self, record: &JobRecord) -> bool {
        record.locked_at == self.locked_at && record.locked_by == self.locked_by
    }
}

/// A job to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub handler: String,
    pub payload: Value,
    pub priority: i32,
    /// Queue name. `None` uses the configured default queue.
    pub queue: Option<String>,
    /// Earliest run time. `None` means immediately.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Create a job for `handler` with an empty payload.
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            payload: Value::Object(Default::default()),
            priority: 0,
            queue: None,
            run_at: None,
        }
    }

    /// Set the payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the payload from any serializable value.
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Set the priority.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Set the earliest run time.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.handler.trim().is_empty() {
            return Err(JobrowError::Config("Job handler must not be empty".to_string()));
        }
        if matches!(&self.queue, Some(queue) if queue.is_empty()) {
            return Err(JobrowError::Config("Queue name must not be empty".to_string()));
        }
        Ok(())
    }
}

/// A fully resolved row ready for insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInsert {
    pub handler: String,
    pub payload: String,
    pub priority: i32,
    pub queue: String,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl JobInsert {
    /// Build the initial-state record a store returns after inserting with `id`.
    pub fn into_record(self, id: JobId) -> JobRecord {
        JobRecord {
            id,
            priority: self.priority,
            handler: self.handler,
            payload: Some(self.payload),
            last_error: None,
            attempts: 0,
            created_at: self.created_at,
            updated_at: self.created_at,
            run_at: self.run_at,
            locked_at: None,
            locked_by: None,
            failed_at: None,
            queue: self.queue,
        }
    }
}

/// Encode a payload for storage.
pub fn encode_payload(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a stored payload.
///
/// `None` and blank strings decode to an empty object.
pub fn decode_payload(raw: Option<&str>) -> Result<Value> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Value::Object(Default::default())),
        Some(raw) => Ok(serde_json::from_str(raw)?),
    }
}
