//! Worker identity as seen by the reservation engine.

use crate::error::{JobrowError, Result};

/// The claimant passed to [`ReservationEngine::reserve`](crate::ReservationEngine::reserve).
///
/// `id` must be unique among concurrently running workers: it is written to
/// `locked_by` and lets a worker re-claim jobs it already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Worker {
    id: String,
    queue: Option<String>,
}

impl Worker {
    /// Create a worker with the given identity, reserving from every queue.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(JobrowError::Config("Worker id must not be empty".to_string()));
        }
        Ok(Self { id, queue: None })
    }

    /// Create a worker with a generated identity.
    pub fn generated() -> Self {
        Self {
            id: generate_worker_id(),
            queue: None,
        }
    }

    /// Only reserve jobs from `queue`.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_filter(&self) -> Option<&str> {
        self.queue.as_deref()
    }
}

impl std::fmt::Display for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Generate a worker identity from the host name and process id.
pub fn generate_worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("host:{} pid:{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_worker_id() {
        let id = generate_worker_id();
        assert!(id.starts_with("host:"));
        assert!(id.ends_with(&format!("pid:{}", std::process::id())));
    }

    #[test]
    fn test_worker_new_rejects_blank_id() {
        assert!(Worker::new("").is_err());
        assert!(Worker::new("   ").is_err());
    }

    #[test]
    fn test_worker_queue_filter() {
        let worker = Worker::new("w1").unwrap();
        assert_eq!(worker.id(), "w1");
        assert!(worker.queue_filter().is_none());

        let worker = worker.queue("mail");
        assert_eq!(worker.queue_filter(), Some("mail"));
        assert_eq!(worker.to_string(), "w1");
    }

    #[test]
    fn test_generated_worker() {
        let worker = Worker::generated();
        assert!(!worker.id().is_empty());
        assert!(worker.queue_filter().is_none());
    }
}
