use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use mailroom::blob::LocalBlobStore;
use mailroom::config::{AppConfig, PlainCipher};
use mailroom::mail::imap::{ImapClient, ImapTimeouts};
use mailroom::mail::smtp::SmtpMailer;
use mailroom::store::{Database, LibSqlBackend};
use mailroom::sync::{JobRunner, SyncOrchestrator, spawn_scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    eprintln!("📬 mailroom v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Blob dir: {}", config.blob_dir);
    eprintln!("   Schedule: {}", config.scheduler_schedule);

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(Path::new(&config.db_path))
            .await
            .context("failed to open database")?,
    );

    let blobs = Arc::new(LocalBlobStore::new(&config.blob_dir));
    let mail = Arc::new(ImapClient::new(ImapTimeouts::from_config(&config)));
    let mailer = Arc::new(SmtpMailer::new());
    // Swap in the platform key-management cipher in production wiring.
    let cipher = Arc::new(PlainCipher);

    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::clone(&db),
        mail,
        mailer,
        blobs,
        cipher,
    ));

    let (runner, runner_handle) =
        JobRunner::spawn(Arc::clone(&db), orchestrator, config.job_concurrency);

    let schedule = cron::Schedule::from_str(&config.scheduler_schedule)
        .context("invalid sync schedule")?;
    let (scheduler_handle, shutdown) = spawn_scheduler(Arc::clone(&db), runner, schedule);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    eprintln!("Shutting down…");

    shutdown.store(true, Ordering::Relaxed);
    scheduler_handle.abort();
    runner_handle.abort();

    Ok(())
}
