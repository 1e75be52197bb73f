//! Paymirror Background Worker
//!
//! Runs full reconciliation of the billing mirror against Stripe:
//! - Once at startup (unless `SYNC_ON_STARTUP=false`)
//! - On `SYNC_SCHEDULE` (default every 15 minutes)
//!
//! Passes never overlap; a tick that fires while one is running is skipped.

use std::sync::Arc;
use std::time::Duration;

use paymirror_billing::{BillingMirror, EventBus, Reconciler, SyncError, SyncReport};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const DEFAULT_SYNC_SCHEDULE: &str = "0 */15 * * * *";

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let max_connections = match std::env::var("DATABASE_MAX_CONNECTIONS") {
        Ok(raw) => raw.parse()?,
        Err(_) => paymirror_shared::DEFAULT_MAX_CONNECTIONS,
    };

    let pool = paymirror_shared::connect(&database_url, max_connections, false).await?;
    info!("Database pool created");
    Ok(pool)
}

/// Log results of a reconciliation pass
fn log_sync_report(report: &SyncReport) {
    let changed = report.entities.iter().filter(|e| e.has_changes()).count();
    info!(
        entity_types = report.entities.len(),
        changed = changed,
        "Billing mirror sync cycle complete"
    );

    for entity in &report.entities {
        if entity.failed > 0 {
            warn!(kind = %entity.kind, failed = entity.failed, "Records skipped during sync");
        }
    }
}

fn log_sync_error(err: &SyncError) {
    for (kind, cause) in &err.failures {
        error!(kind = %kind, error = %cause, "Failed to sync entity type");
    }
    log_sync_report(&err.report);
}

/// Runs one pass unless another is still in progress.
async fn run_sync(reconciler: &Reconciler, guard: &Mutex<()>, trigger: &str) {
    let Ok(_running) = guard.try_lock() else {
        warn!(trigger = trigger, "Previous sync still running, skipping this tick");
        return;
    };

    info!(trigger = trigger, "Running billing mirror sync");
    match reconciler.sync().await {
        Ok(report) => log_sync_report(&report),
        Err(err) => log_sync_error(&err),
    }
}

/// Minimal mode is reserved for deployments without Stripe credentials
fn stripe_configured() -> bool {
    std::env::var("STRIPE_SECRET_KEY").is_ok_and(|key| !key.trim().is_empty())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    init_tracing();

    info!("Starting Paymirror Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    if !stripe_configured() {
        warn!("STRIPE_SECRET_KEY not set - running in minimal mode");
        info!("Worker running without Stripe integration");

        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            info!("Worker heartbeat (minimal mode)");
        }
    }

    // Any other configuration problem is fatal
    let billing =
        BillingMirror::read_only_from_env(pool.clone(), EventBus::new().with_change_logging())?;

    let reconciler = Arc::new(billing.reconciler());
    let guard = Arc::new(Mutex::new(()));

    let sync_on_startup = match std::env::var("SYNC_ON_STARTUP") {
        Ok(raw) => raw.parse()?,
        Err(_) => true,
    };
    if sync_on_startup {
        run_sync(&reconciler, &guard, "startup").await;
    }

    // Create scheduler
    let mut scheduler = JobScheduler::new().await?;

    let schedule =
        std::env::var("SYNC_SCHEDULE").unwrap_or_else(|_| DEFAULT_SYNC_SCHEDULE.to_string());
    let job_reconciler = reconciler.clone();
    let job_guard = guard.clone();
    scheduler
        .add(Job::new_async(schedule.as_str(), move |_uuid, _l| {
            let reconciler = job_reconciler.clone();
            let guard = job_guard.clone();
            Box::pin(async move {
                run_sync(&reconciler, &guard, "schedule").await;
            })
        })?)
        .await?;
    info!(schedule = %schedule, "Scheduled: Billing mirror sync");

    scheduler.start().await?;
    info!("Paymirror Worker started successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down worker");
    scheduler.shutdown().await?;

    // Let an in-flight pass finish before the pool goes away
    let _finished = guard.lock().await;
    pool.close().await;
    Ok(())
}
