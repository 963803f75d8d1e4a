//! # jobrow-core - Core types and traits for the job queue
//!
//! This crate provides the core abstractions for the jobrow job queue:
//! - `JobStore` trait for storage implementations, with declared `Capabilities`
//! - `JobRecord`, `JobId`, `NewJob` types
//! - `ReservationEngine` and the `ClaimStrategy` implementations it selects from
//! - `Lifecycle` for completing and failing claimed jobs
//! - `Client` for enqueueing jobs
//! - Error types

mod backoff;
mod client;
mod clock;
mod config;
mod error;
mod job;
mod lifecycle;
mod memory;
mod predicate;
mod reserve;
mod store;
mod strategy;
mod worker;

// Re-export main types
pub use backoff::{is_terminal, next_run_at, retry_delay_secs, BackoffPolicy, DEFAULT_MAX_ATTEMPTS};
pub use client::Client;
pub use clock::{from_millis, to_millis, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    QueueConfig, QueueConfigBuilder, DEFAULT_LOCK_TIMEOUT, DEFAULT_OPTIMISTIC_RETRIES,
    DEFAULT_QUEUE,
};
pub use error::{JobrowError, Result};
pub use job::{
    decode_payload, encode_payload, ClaimToken, JobId, JobInsert, JobRecord, NewJob,
};
pub use lifecycle::{FailureOutcome, HandlerFailure, Lifecycle, MAX_ERROR_LEN};
pub use memory::MemoryStore;
pub use predicate::{claim_order, EligibilityPredicate, ParamStyle, PredicateParam, CLAIM_ORDER};
pub use reserve::ReservationEngine;
pub use store::{Capabilities, Capability, DynStore, JobStore, QueueStats, SharedStore};
pub use strategy::{
    AtomicUpdateStrategy, ClaimStrategy, OptimisticStrategy, RowLockStrategy, StrategyKind,
    StrategyRegistry,
};
pub use worker::{generate_worker_id, Worker};
