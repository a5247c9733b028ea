//! Recall Background Worker
//!
//! Runs the scheduled jobs of the reconciliation engine:
//! - Expiration sweep for lapsed scheduled cancellations (hourly)
//!
//! The sweep is the safety net for provider deletion events that never
//! arrive; running it more often than strictly needed is harmless because
//! it is idempotent and skips overlapping runs.

use std::sync::Arc;
use std::time::Duration;

use recall_billing::BillingService;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Recall Worker");

    // Create database pool
    let pool = create_db_pool().await?;

    // Create billing service
    let billing = Arc::new(BillingService::from_env(pool)?);

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job: expiration sweep at the top of every hour.
    // Overlap protection lives in the coordinator, so a slow sweep and the
    // next tick cannot run concurrently.
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running scheduled expiration sweep");
                match billing.coordinator.run_sweep().await {
                    Ok(summary) => {
                        if summary.skipped {
                            info!("Sweep skipped (previous run still in progress)");
                        } else {
                            info!(
                                examined = summary.examined,
                                expired = summary.expired,
                                errors = summary.errors,
                                "Sweep complete"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: expiration sweep (hourly)");

    // Run one sweep at startup to catch anything that lapsed while the
    // worker was down
    match billing.coordinator.run_sweep().await {
        Ok(summary) => info!(
            examined = summary.examined,
            expired = summary.expired,
            "Startup sweep complete"
        ),
        Err(e) => error!(error = %e, "Startup sweep failed"),
    }

    // Start the scheduler
    scheduler.start().await?;
    info!("Worker scheduler started");

    // Keep the process alive with a periodic heartbeat
    loop {
        tokio::time::sleep(Duration::from_secs(300)).await;
        info!("Worker heartbeat");
    }
}
