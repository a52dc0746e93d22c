//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::DatabaseError;
use crate::inbox::{Inbox, MailAccount};
use crate::message::model::{InboxMessage, MessageAttachment};
use crate::rules::model::Rule;
use crate::sync::{SyncReport, SyncRun, SyncStatus};
use crate::tasks::model::{
    MembershipScope, Project, Sprint, Task, TaskAttachment, TaskComment, User,
};

/// Backend-agnostic database trait covering accounts, messages, rules,
/// the task graph, and the sync log.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Projects & setup surface ────────────────────────────────────

    async fn insert_project(&self, project: &Project) -> Result<(), DatabaseError>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>, DatabaseError>;

    async fn insert_sprint(&self, sprint: &Sprint) -> Result<(), DatabaseError>;

    /// The project's default sprint, if one is flagged.
    async fn default_sprint(&self, project_id: &str) -> Result<Option<Sprint>, DatabaseError>;

    // ── Inboxes & mail accounts ─────────────────────────────────────

    async fn insert_inbox(&self, inbox: &Inbox) -> Result<(), DatabaseError>;

    async fn get_inbox(&self, id: &str) -> Result<Option<Inbox>, DatabaseError>;

    async fn insert_account(&self, account: &MailAccount) -> Result<(), DatabaseError>;

    async fn get_account(&self, id: &str) -> Result<Option<MailAccount>, DatabaseError>;

    /// Resolve the account monitored for a project's inbox.
    async fn get_account_by_project(
        &self,
        project_id: &str,
    ) -> Result<Option<MailAccount>, DatabaseError>;

    /// All accounts with syncing enabled.
    async fn list_sync_enabled_accounts(&self) -> Result<Vec<MailAccount>, DatabaseError>;

    /// Record the outcome of a sync attempt on the account itself.
    async fn update_account_sync_state(
        &self,
        account_id: &str,
        last_sync_at: DateTime<Utc>,
        last_sync_error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    // ── Inbox messages ──────────────────────────────────────────────

    /// Insert a message. A duplicate message-id surfaces as
    /// [`DatabaseError::Constraint`] from the UNIQUE index — the
    /// race-safe dedup point for the whole pipeline.
    async fn insert_inbox_message(&self, msg: &InboxMessage) -> Result<(), DatabaseError>;

    async fn get_message_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<InboxMessage>, DatabaseError>;

    /// PENDING → CONVERTED, recording the produced task. Fails if the
    /// message already left PENDING; the transition happens exactly once.
    async fn mark_message_converted(
        &self,
        id: &str,
        task_id: &str,
        converted_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// PENDING → IGNORED. Same exactly-once guarantee.
    async fn mark_message_ignored(&self, id: &str) -> Result<(), DatabaseError>;

    async fn insert_message_attachment(
        &self,
        attachment: &MessageAttachment,
    ) -> Result<(), DatabaseError>;

    async fn list_message_attachments(
        &self,
        inbox_message_id: &str,
    ) -> Result<Vec<MessageAttachment>, DatabaseError>;

    // ── Rules ───────────────────────────────────────────────────────

    async fn insert_rule(&self, rule: &Rule) -> Result<(), DatabaseError>;

    /// Enabled rules for an inbox, priority DESC then created-at ASC —
    /// already in evaluation order.
    async fn list_rules(&self, inbox_id: &str) -> Result<Vec<Rule>, DatabaseError>;

    // ── Tasks & comments ────────────────────────────────────────────

    /// Non-deleted task in the project anchoring the given email thread.
    async fn find_task_by_email_thread(
        &self,
        project_id: &str,
        thread_id: &str,
    ) -> Result<Option<Task>, DatabaseError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Next sequential task number within a project.
    async fn next_task_number(&self, project_id: &str) -> Result<i64, DatabaseError>;

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn list_tasks_by_project(&self, project_id: &str) -> Result<Vec<Task>, DatabaseError>;

    /// Recently created email-threaded tasks, for unmatched-reply
    /// diagnostics.
    async fn recent_email_threads(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    async fn insert_task_comment(&self, comment: &TaskComment) -> Result<(), DatabaseError>;

    /// Comment materialized from the given email message-id, if any.
    async fn find_comment_by_email_message_id(
        &self,
        email_message_id: &str,
    ) -> Result<Option<TaskComment>, DatabaseError>;

    async fn list_task_comments(&self, task_id: &str) -> Result<Vec<TaskComment>, DatabaseError>;

    async fn insert_task_attachment(
        &self,
        attachment: &TaskAttachment,
    ) -> Result<(), DatabaseError>;

    async fn list_task_attachments(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskAttachment>, DatabaseError>;

    // ── Users & memberships ─────────────────────────────────────────

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError>;

    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError>;

    /// Idempotently grant a role at a scope.
    async fn ensure_membership(
        &self,
        user_id: &str,
        scope: MembershipScope,
        scope_id: &str,
        role: &str,
    ) -> Result<(), DatabaseError>;

    /// Oldest member of a project — the author of last resort.
    async fn first_project_member(
        &self,
        project_id: &str,
    ) -> Result<Option<User>, DatabaseError>;

    // ── Sync log ────────────────────────────────────────────────────

    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), DatabaseError>;

    /// Close a run with its terminal status and counts.
    async fn finish_sync_run(
        &self,
        id: &str,
        status: SyncStatus,
        finished_at: DateTime<Utc>,
        report: &SyncReport,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn list_sync_runs(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncRun>, DatabaseError>;
}
