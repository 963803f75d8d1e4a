//! Contention example: many workers race to reserve from one store, and every
//! job must be claimed exactly once.
//!
//! Env vars:
//! - JOBROW_DEMO_DATABASE (optional; default: sqlite::memory:)
//! - JOBROW_DEMO_JOBS (optional; default: 500)
//! - JOBROW_DEMO_WORKERS (optional; default: 16)
//! - JOBROW_STRATEGY and the other `JOBROW_*` queue settings
//!
//! Run with: `JOBROW_STRATEGY=optimistic cargo run -p demo-contention`

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use jobrow_client::AdminClient;
use jobrow_core::{
    Client, JobId, Lifecycle, NewJob, QueueConfig, ReservationEngine, SharedStore, Worker,
};
use jobrow_sqlite::SqliteStore;
use tracing_subscriber::EnvFilter;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

type Claims = Arc<Mutex<HashMap<JobId, Vec<String>>>>;

async fn run_worker(
    worker: Worker,
    engine: ReservationEngine,
    lifecycle: Lifecycle,
    remaining: Arc<AtomicUsize>,
    claims: Claims,
) -> jobrow_core::Result<usize> {
    let mut processed = 0;
    while remaining.load(Ordering::SeqCst) > 0 {
        let Some(job) = engine.reserve(&worker).await? else {
            // Lost every race this round, or the rest is held by others.
            tokio::time::sleep(Duration::from_millis(5)).await;
            continue;
        };

        claims
            .lock()
            .await
            .entry(job.id)
            .or_default()
            .push(worker.id().to_string());

        lifecycle.complete(&job).await?;
        remaining.fetch_sub(1, Ordering::SeqCst);
        processed += 1;
    }
    Ok(processed)
}

#[tokio::main]
async fn main() -> jobrow_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let database = env_string("JOBROW_DEMO_DATABASE", "sqlite::memory:");
    let jobs = env_usize("JOBROW_DEMO_JOBS", 500);
    let workers = env_usize("JOBROW_DEMO_WORKERS", 16);

    let config = QueueConfig::from_env()?;
    let store = SharedStore::new(SqliteStore::new(&database, "contention").await?);
    let client = Client::new(store.clone(), &config);
    let engine = ReservationEngine::new(store.clone(), &config)?;
    let lifecycle = Lifecycle::new(store.clone(), &config);
    let admin = AdminClient::new(store, &config)?;

    println!(
        "store={} strategy={} jobs={} workers={}",
        database,
        engine.strategy(),
        jobs,
        workers
    );

    for i in 0..jobs {
        client
            .enqueue(NewJob::new("noop").priority((i % 3) as i32))
            .await?;
    }

    let remaining = Arc::new(AtomicUsize::new(jobs));
    let claims: Claims = Arc::new(Mutex::new(HashMap::new()));
    let started = Instant::now();

    let mut set = JoinSet::new();
    for i in 0..workers {
        let worker = Worker::new(format!("contention-{}", i))?;
        set.spawn(run_worker(
            worker,
            engine.clone(),
            lifecycle.clone(),
            remaining.clone(),
            claims.clone(),
        ));
    }

    let mut per_worker = Vec::with_capacity(workers);
    while let Some(res) = set.join_next().await {
        match res {
            Ok(count) => per_worker.push(count?),
            Err(e) => eprintln!("worker task failed: {}", e),
        }
    }

    let elapsed = started.elapsed();
    let claims = claims.lock().await;
    let duplicates: Vec<_> = claims.iter().filter(|(_, by)| by.len() > 1).collect();

    println!(
        "claimed {} distinct jobs in {:.2?} ({:.0} jobs/s)",
        claims.len(),
        elapsed,
        claims.len() as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("per worker: {:?}", per_worker);

    let stats = admin.stats(None).await?;
    println!(
        "left: ready={} scheduled={} locked={} failed={}",
        stats.ready, stats.scheduled, stats.locked, stats.failed
    );

    if !duplicates.is_empty() || claims.len() != jobs {
        for (id, by) in &duplicates {
            tracing::error!(job_id = %id, workers = ?by, "Job claimed more than once");
        }
        eprintln!(
            "FAILED: {} duplicate claims, {} of {} jobs claimed",
            duplicates.len(),
            claims.len(),
            jobs
        );
        std::process::exit(1);
    }

    println!("OK: every job claimed exactly once");
    Ok(())
}
