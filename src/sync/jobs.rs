//! Job runner — bounded-concurrency execution of sync jobs.
//!
//! Periodic and manual triggers produce the same job type and drain
//! through the same queue, so at most `concurrency` account syncs run in
//! parallel regardless of trigger overlap.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{JobError, SyncError};
use crate::store::Database;
use crate::sync::orchestrator::SyncOrchestrator;
use crate::sync::{SyncReport, SyncTrigger};

/// Queue job payload.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub project_id: String,
    pub user_id: Option<String>,
    pub trigger: SyncTrigger,
}

/// Terminal job record handed back to manual callers.
#[derive(Debug, Clone)]
pub struct SyncJobResult {
    pub success: bool,
    pub project_id: String,
    pub sync_start_time: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
}

struct QueuedJob {
    job: SyncJob,
    result_tx: Option<oneshot::Sender<SyncJobResult>>,
}

/// Handle for enqueueing sync jobs.
#[derive(Clone)]
pub struct JobRunner {
    tx: mpsc::UnboundedSender<QueuedJob>,
}

impl JobRunner {
    /// Spawn the worker loop. Jobs queue without bound; execution holds a
    /// semaphore permit, capping parallel syncs at `concurrency`.
    pub fn spawn(
        db: Arc<dyn Database>,
        orchestrator: Arc<SyncOrchestrator>,
        concurrency: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedJob>();
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));

        let handle = tokio::spawn(async move {
            info!(concurrency, "Job runner started");
            while let Some(queued) = rx.recv().await {
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    return;
                };
                let db = Arc::clone(&db);
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    let result = run_job(db, orchestrator, &queued.job).await;
                    if let Some(result_tx) = queued.result_tx {
                        let _ = result_tx.send(result);
                    }
                    drop(permit);
                });
            }
            info!("Job runner queue closed");
        });

        (Self { tx }, handle)
    }

    /// Fire-and-forget enqueue, used by the scheduler.
    pub fn enqueue(&self, job: SyncJob) -> Result<(), JobError> {
        self.tx
            .send(QueuedJob {
                job,
                result_tx: None,
            })
            .map_err(|_| JobError::QueueClosed)
    }

    /// On-demand sync entrypoint: resolve the project's account, run the
    /// orchestrator through the queue, and wait for the result.
    pub async fn run_manual(
        &self,
        project_id: &str,
        user_id: Option<String>,
    ) -> Result<SyncJobResult, JobError> {
        let (result_tx, result_rx) = oneshot::channel();
        self.tx
            .send(QueuedJob {
                job: SyncJob {
                    project_id: project_id.to_string(),
                    user_id,
                    trigger: SyncTrigger::Manual,
                },
                result_tx: Some(result_tx),
            })
            .map_err(|_| JobError::QueueClosed)?;
        result_rx.await.map_err(|_| JobError::ResultDropped)
    }
}

async fn run_job(
    db: Arc<dyn Database>,
    orchestrator: Arc<SyncOrchestrator>,
    job: &SyncJob,
) -> SyncJobResult {
    let sync_start_time = Utc::now();
    let fail = |error: String| SyncJobResult {
        success: false,
        project_id: job.project_id.clone(),
        sync_start_time,
        completed_at: Utc::now(),
        report: None,
        error: Some(error),
    };

    let account = match db.get_account_by_project(&job.project_id).await {
        Ok(Some(account)) => account,
        Ok(None) => {
            let e = SyncError::AccountNotFound {
                project_id: job.project_id.clone(),
            };
            error!(project_id = %job.project_id, "{e}");
            return fail(e.to_string());
        }
        Err(e) => {
            error!(project_id = %job.project_id, error = %e, "Account lookup failed");
            return fail(e.to_string());
        }
    };

    match orchestrator.sync_account(&account, job.trigger).await {
        Ok(report) => SyncJobResult {
            success: true,
            project_id: job.project_id.clone(),
            sync_start_time,
            completed_at: Utc::now(),
            report: Some(report),
            error: None,
        },
        Err(e) => {
            error!(project_id = %job.project_id, error = %e, "Sync job failed");
            fail(e.to_string())
        }
    }
}
