//! Basic example using the SQLite in-memory store.
//!
//! This example demonstrates:
//! - Creating a job queue with SQLite in-memory storage
//! - Enqueueing jobs from a client
//! - Reserving, running and completing or failing jobs from two workers
//! - Inspecting the queue with the admin client
//!
//! Run with: `RUST_LOG=debug cargo run -p demo-basic`

use serde::{Deserialize, Serialize};
use std::time::Duration;

use jobrow_client::AdminClient;
use jobrow_core::{
    generate_worker_id, Client, HandlerFailure, JobRecord, Lifecycle, NewJob, QueueConfig,
    ReservationEngine, SharedStore, Worker,
};
use jobrow_sqlite::SqliteStore;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

/// Email notification job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
}

/// Run the job's handler by name.
async fn perform(job: &JobRecord) -> std::result::Result<(), HandlerFailure> {
    match job.handler.as_str() {
        "send_email" => {
            let email: EmailJob = job
                .payload_as()
                .map_err(|e| HandlerFailure::new(format!("bad payload: {}", e)))?;
            println!("[email] sending to: {} ({})", email.to, email.subject);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
        "flaky" => Err(HandlerFailure::new("upstream returned 503")),
        other => Err(HandlerFailure::new(format!("no handler named {}", other))),
    }
}

async fn run_worker(
    worker: Worker,
    engine: ReservationEngine,
    lifecycle: Lifecycle,
) -> jobrow_core::Result<usize> {
    let mut processed = 0;
    while let Some(job) = engine.reserve(&worker).await? {
        match perform(&job).await {
            Ok(()) => lifecycle.complete(&job).await?,
            Err(failure) => {
                let outcome = lifecycle.fail(&job, &failure).await?;
                println!(
                    "[{}] job {} failed, next run at {}",
                    worker,
                    job.id,
                    outcome.record().run_at
                );
            }
        }
        processed += 1;
    }
    Ok(processed)
}

#[tokio::main]
async fn main() -> jobrow_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("jobrow example\n");

    let config = QueueConfig::from_env()?;

    // Create SQLite in-memory store (no setup required)
    let store = SharedStore::new(SqliteStore::in_memory("example").await?);

    let client = Client::new(store.clone(), &config);
    let engine = ReservationEngine::new(store.clone(), &config)?;
    let lifecycle = Lifecycle::new(store.clone(), &config);
    let admin = AdminClient::new(store, &config)?;

    let emails = vec![
        EmailJob {
            to: "alice@example.com".to_string(),
            subject: "Welcome!".to_string(),
        },
        EmailJob {
            to: "bob@example.com".to_string(),
            subject: "Your order shipped".to_string(),
        },
        EmailJob {
            to: "charlie@example.com".to_string(),
            subject: "Password reset".to_string(),
        },
    ];

    println!("Enqueueing {} jobs...\n", emails.len() + 2);
    for (i, email) in emails.iter().enumerate() {
        let job = NewJob::new("send_email")
            .with_payload(email)?
            .priority(i as i32);
        let record = client.enqueue(job).await?;
        println!("  enqueued: {}", record.id);
    }
    client.enqueue(NewJob::new("flaky")).await?;
    client
        .enqueue_in(NewJob::new("send_email"), Duration::from_secs(3600))
        .await?;

    let stats = admin.stats(None).await?;
    println!(
        "\nBefore: ready={} scheduled={} locked={} failed={}\n",
        stats.ready, stats.scheduled, stats.locked, stats.failed
    );

    let mut workers = JoinSet::new();
    for i in 0..2 {
        let worker = Worker::new(format!("{} worker:{}", generate_worker_id(), i))?;
        workers.spawn(run_worker(worker, engine.clone(), lifecycle.clone()));
    }

    let mut processed = 0;
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(count) => processed += count?,
            Err(e) => eprintln!("worker task failed: {}", e),
        }
    }

    tracing::info!(processed, "Workers finished");

    let stats = admin.stats(None).await?;
    println!(
        "\nProcessed {} jobs. After: ready={} scheduled={} locked={} failed={}",
        processed, stats.ready, stats.scheduled, stats.locked, stats.failed
    );

    Ok(())
}
