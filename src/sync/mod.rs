//! Sync machinery — orchestrator, scheduler, and the job runner.

pub mod jobs;
pub mod orchestrator;
pub mod scheduler;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use jobs::{JobRunner, SyncJob, SyncJobResult};
pub use orchestrator::SyncOrchestrator;
pub use scheduler::spawn_scheduler;

/// What started a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Manual,
    Scheduled,
}

impl SyncTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => Self::Manual,
            _ => Self::Scheduled,
        }
    }
}

/// Terminal and in-flight states of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Running,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// One row of the sync log.
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: String,
    pub account_id: String,
    pub trigger: SyncTrigger,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: i64,
    pub tasks_created: i64,
    pub comments_created: i64,
    pub skipped: i64,
    pub error: Option<String>,
}

impl SyncRun {
    /// Fresh RUNNING row for an account.
    pub fn started(account_id: &str, trigger: SyncTrigger, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            trigger,
            status: SyncStatus::Running,
            started_at: now,
            finished_at: None,
            fetched: 0,
            tasks_created: 0,
            comments_created: 0,
            skipped: 0,
            error: None,
        }
    }
}

/// Summary counts for one completed sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Messages the adapter returned.
    pub fetched: usize,
    /// Newly persisted inbox messages.
    pub ingested: usize,
    /// Messages skipped because their message-id was already known.
    pub duplicates: usize,
    /// Messages a rule marked as spam.
    pub ignored: usize,
    pub tasks_created: usize,
    pub comments_created: usize,
    /// Messages that failed to parse or materialize.
    pub failed_messages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_roundtrip() {
        assert_eq!(SyncTrigger::parse("manual"), SyncTrigger::Manual);
        assert_eq!(SyncTrigger::parse("scheduled"), SyncTrigger::Scheduled);
        assert_eq!(SyncTrigger::Manual.as_str(), "manual");
    }

    #[test]
    fn status_roundtrip() {
        for status in [SyncStatus::Running, SyncStatus::Success, SyncStatus::Failed] {
            assert_eq!(SyncStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn started_run_is_running_with_zero_counts() {
        let run = SyncRun::started("acc-1", SyncTrigger::Scheduled, Utc::now());
        assert_eq!(run.status, SyncStatus::Running);
        assert_eq!(run.fetched, 0);
        assert!(run.finished_at.is_none());
        assert!(run.error.is_none());
    }
}
