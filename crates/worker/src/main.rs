//! Sheet Tools lifecycle worker
//!
//! Cron-driven binary that advances subscription states, sends retention
//! emails, and revokes expired restoration windows. Every run injects the
//! wall clock at the edge so the job itself stays testable.

use std::sync::Arc;

use anyhow::Context;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sheettools_billing::{
    ArchiveService, AuditLogger, RetentionEmailService, SnapshotCrypto, SubscriptionStore,
    TransitionJob,
};
use sheettools_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "sheettools_worker=info,sheettools_billing=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let crypto = SnapshotCrypto::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let pool = db::create_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let store = SubscriptionStore::new(pool.clone());
    let audit = AuditLogger::new(pool.clone());
    let email = RetentionEmailService::from_env();
    let archive = ArchiveService::new(pool.clone(), crypto);

    let job = Arc::new(TransitionJob::new(store, audit, email, archive.clone()));
    let archive = Arc::new(archive);

    // Catch up immediately on startup before the first cron tick
    run_transition_pass(&job).await;

    let scheduler = JobScheduler::new().await?;

    let hourly_job = job.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _lock| {
            let job = hourly_job.clone();
            Box::pin(async move {
                run_transition_pass(&job).await;
            })
        })?)
        .await?;

    let cleanup_archive = archive.clone();
    scheduler
        .add(Job::new_async("0 30 2 * * *", move |_uuid, _lock| {
            let archive = cleanup_archive.clone();
            Box::pin(async move {
                if let Err(e) = archive.purge_expired_restores(OffsetDateTime::now_utc()).await {
                    tracing::error!(error = %e, "Restoration cleanup failed");
                }
            })
        })?)
        .await?;

    scheduler.start().await?;
    tracing::info!("Lifecycle worker started, transitions hourly");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down lifecycle worker");

    Ok(())
}

async fn run_transition_pass(job: &TransitionJob) {
    let summary = job.run(OffsetDateTime::now_utc()).await;
    if !summary.errors.is_empty() {
        for failure in &summary.errors {
            tracing::warn!(user_id = %failure.user_id, error = %failure.error, "Tenant failed in transition pass");
        }
    }
}
