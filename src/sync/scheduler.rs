//! Scheduler — fixed-cadence scan of sync-enabled accounts.
//!
//! The scheduler itself ticks on a cron expression; each tick enqueues a
//! job for every account whose per-inbox interval has elapsed since its
//! last attempted sync. Accounts that are not due are skipped without any
//! status writes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::Database;
use crate::sync::jobs::{JobRunner, SyncJob};
use crate::sync::SyncTrigger;

/// Spawn the scheduler loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop after
/// the next fire.
pub fn spawn_scheduler(
    db: Arc<dyn Database>,
    runner: JobRunner,
    schedule: cron::Schedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(schedule = %schedule, "Scheduler started");
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Schedule has no future fire times; scheduler stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Scheduler shutting down");
                return;
            }
            tick(&db, &runner).await;
        }
    });

    (handle, shutdown_flag)
}

/// One scheduler pass: enqueue every due account.
pub async fn tick(db: &Arc<dyn Database>, runner: &JobRunner) {
    let accounts = match db.list_sync_enabled_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            error!(error = %e, "Could not list sync-enabled accounts");
            return;
        }
    };

    let now = Utc::now();
    for account in accounts {
        let inbox = match db.get_inbox(&account.inbox_id).await {
            Ok(Some(inbox)) => inbox,
            Ok(None) => {
                warn!(account_id = %account.id, "Account has no inbox; skipping");
                continue;
            }
            Err(e) => {
                error!(account_id = %account.id, error = %e, "Inbox lookup failed");
                continue;
            }
        };

        if !account.sync_due(inbox.sync_interval_minutes, now) {
            debug!(account_id = %account.id, "Not due; skipping");
            continue;
        }

        if let Err(e) = runner.enqueue(SyncJob {
            project_id: inbox.project_id.clone(),
            user_id: None,
            trigger: SyncTrigger::Scheduled,
        }) {
            error!(account_id = %account.id, error = %e, "Could not enqueue sync job");
        }
    }
}
