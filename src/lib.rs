//! # jobrow - Persistent multi-worker job queue
//!
//! A Rust library for running background jobs stored as rows in a relational
//! table, shared by any number of worker processes.
//!
//! ## Features
//!
//! - **Exclusive claims**: a job is held by at most one worker per lock epoch
//! - **Capability-selected claim strategies**: atomic update, row lock or
//!   optimistic compare-and-swap, picked from what the store supports
//! - **Priorities and scheduling**: higher priority first, then earliest `run_at`
//! - **Retries with backoff**: failed jobs come back after `attempts^4 + 5` seconds
//! - **Terminal failures kept**: exhausted jobs stay in the table for inspection
//! - **Abandoned locks self-heal** after the configured lock timeout
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jobrow::{
//!     Client, HandlerFailure, Lifecycle, NewJob, QueueConfig, ReservationEngine, SharedStore,
//!     Worker,
//! };
//! use jobrow::sqlite::SqliteStore;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> jobrow::Result<()> {
//!     let config = QueueConfig::from_env()?;
//!     let store = SharedStore::new(SqliteStore::new("sqlite:jobs.db", "myapp").await?);
//!
//!     let client = Client::new(store.clone(), &config);
//!     client
//!         .enqueue(NewJob::new("send_email").payload(json!({"to": "alice@example.com"})))
//!         .await?;
//!
//!     let engine = ReservationEngine::new(store.clone(), &config)?;
//!     let lifecycle = Lifecycle::new(store, &config);
//!     let worker = Worker::generated();
//!
//!     while let Some(job) = engine.reserve(&worker).await? {
//!         match job.handler.as_str() {
//!             "send_email" => lifecycle.complete(&job).await?,
//!             other => {
//!                 let failure = HandlerFailure::new(format!("unknown handler {}", other));
//!                 lifecycle.fail(&job, &failure).await?;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub use jobrow_core::*;

pub use jobrow_client::{AdminClient, FailedJob};

#[cfg(feature = "postgres")]
pub use jobrow_postgres as postgres;

#[cfg(feature = "mysql")]
pub use jobrow_mysql as mysql;

#[cfg(feature = "sqlite")]
pub use jobrow_sqlite as sqlite;
