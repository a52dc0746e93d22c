//! Materialization — persisted inbox messages become tasks or comments.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::inbox::Inbox;
use crate::message::model::{InboxMessage, MessageStatus};
use crate::rules::model::RuleOutcome;
use crate::store::Database;
use crate::tasks::accounts::AccountResolver;
use crate::tasks::model::{Project, Task, TaskAttachment, TaskComment, User};

/// What materialization did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeResult {
    TaskCreated { task_id: String },
    CommentAppended { task_id: String },
    Skipped,
}

/// Turns ingested messages into tasks and comments.
pub struct Materializer {
    db: Arc<dyn Database>,
    accounts: AccountResolver,
}

impl Materializer {
    pub fn new(db: Arc<dyn Database>) -> Self {
        let accounts = AccountResolver::new(Arc::clone(&db));
        Self { db, accounts }
    }

    /// Materialize one message, routing it onto an existing task when the
    /// conversation is known and creating a task otherwise.
    ///
    /// The rule outcome carries suggested priority/assignee/labels; the
    /// message itself is never annotated.
    pub async fn materialize(
        &self,
        message: &InboxMessage,
        inbox: &Inbox,
        outcome: &RuleOutcome,
    ) -> Result<MaterializeResult, DatabaseError> {
        if !inbox.auto_create_tasks || message.status != MessageStatus::Pending {
            return Ok(MaterializeResult::Skipped);
        }

        let project = self
            .db
            .get_project(&inbox.project_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "project".into(),
                id: inbox.project_id.clone(),
            })?;

        match self.find_parent_task(message, &project.id).await? {
            Some(parent) => self.append_comment(message, &project, &parent).await,
            None => self.create_task(message, inbox, &project, outcome).await,
        }
    }

    /// Locate the task this message belongs to, if any.
    ///
    /// Three strategies, each tried only when the previous found nothing:
    /// the thread id against the project's tasks; the in-reply-to id
    /// against comment provenance (replies to a comment notification); and
    /// the in-reply-to id against an already-converted sibling message
    /// (the parent arrived in an earlier sync).
    async fn find_parent_task(
        &self,
        message: &InboxMessage,
        project_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        if let Some(task) = self
            .db
            .find_task_by_email_thread(project_id, &message.thread_id)
            .await?
        {
            return Ok(Some(task));
        }

        let Some(in_reply_to) = message.in_reply_to.as_deref() else {
            return Ok(None);
        };

        if let Some(comment) = self.db.find_comment_by_email_message_id(in_reply_to).await?
            && let Some(task) = self.db.get_task(&comment.task_id).await?
            && !task.deleted
        {
            debug!(
                message_id = %message.message_id,
                task_id = %task.id,
                "Parent resolved through comment provenance"
            );
            return Ok(Some(task));
        }

        if let Some(sibling) = self.db.get_message_by_message_id(in_reply_to).await?
            && sibling.status == MessageStatus::Converted
            && let Some(task_id) = sibling.task_id.as_deref()
            && let Some(task) = self.db.get_task(task_id).await?
            && !task.deleted
        {
            debug!(
                message_id = %message.message_id,
                task_id = %task.id,
                "Parent resolved through converted sibling message"
            );
            return Ok(Some(task));
        }

        Ok(None)
    }

    async fn append_comment(
        &self,
        message: &InboxMessage,
        project: &Project,
        task: &Task,
    ) -> Result<MaterializeResult, DatabaseError> {
        let author = self.resolve_author(message, project).await;

        let comment = TaskComment {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            author_id: author.map(|u| u.id),
            author_display_name: Some(
                message
                    .from_name
                    .clone()
                    .unwrap_or_else(|| message.from_email.clone()),
            ),
            body: comment_body(message),
            email_message_id: Some(message.message_id.clone()),
            created_at: Utc::now(),
        };
        self.db.insert_task_comment(&comment).await?;
        self.copy_attachments(message, &task.id).await?;
        self.db
            .mark_message_converted(&message.id, &task.id, Utc::now())
            .await?;

        info!(
            message_id = %message.message_id,
            task = %task.slug,
            "Comment appended from email"
        );
        Ok(MaterializeResult::CommentAppended {
            task_id: task.id.clone(),
        })
    }

    async fn create_task(
        &self,
        message: &InboxMessage,
        inbox: &Inbox,
        project: &Project,
        outcome: &RuleOutcome,
    ) -> Result<MaterializeResult, DatabaseError> {
        if message.in_reply_to.is_some() || !message.references.is_empty() {
            // A reply that matched nothing still becomes a task: dropping
            // it silently would lose the message.
            let recent: Vec<String> = self
                .db
                .recent_email_threads(&project.id, 5)
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|t| format!("{}:{}", t.slug, t.email_thread_id.unwrap_or_default()))
                .collect();
            warn!(
                message_id = %message.message_id,
                thread_id = %message.thread_id,
                in_reply_to = ?message.in_reply_to,
                references = ?message.references,
                recent_threads = ?recent,
                "Reply did not match any task; creating a new one"
            );
        }

        let author = self.resolve_author(message, project).await;
        let number = self.db.next_task_number(&project.id).await?;
        let sprint = self.db.default_sprint(&project.id).await?;

        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4().to_string(),
            project_id: project.id.clone(),
            number,
            slug: format!("{}-{}", project.key, number),
            title: message.subject.clone(),
            description: comment_body(message),
            task_type: inbox.default_task_type.clone(),
            status: inbox.default_status.clone(),
            priority: outcome.priority.unwrap_or(inbox.default_priority),
            labels: outcome.labels.clone(),
            assignee_id: outcome
                .assignee
                .clone()
                .or_else(|| inbox.default_assignee.clone()),
            reporter_id: author.map(|u| u.id),
            sprint_id: sprint.map(|s| s.id),
            start_date: Some(now),
            due_date: Some(now + Duration::days(7)),
            email_thread_id: Some(message.thread_id.clone()),
            allow_email_replies: true,
            deleted: false,
            created_at: now,
        };
        self.db.insert_task(&task).await?;
        self.copy_attachments(message, &task.id).await?;
        self.db
            .mark_message_converted(&message.id, &task.id, Utc::now())
            .await?;

        info!(
            message_id = %message.message_id,
            task = %task.slug,
            thread_id = %message.thread_id,
            "Task created from email"
        );
        Ok(MaterializeResult::TaskCreated { task_id: task.id })
    }

    /// Resolver-chosen reporter, falling back to the first project member.
    async fn resolve_author(&self, message: &InboxMessage, project: &Project) -> Option<User> {
        match self
            .accounts
            .resolve(project, &message.from_email, message.from_name.as_deref())
            .await
        {
            Ok(user) => Some(user),
            Err(e) => {
                warn!(
                    from = %message.from_email,
                    error = %e,
                    "Could not resolve sender; falling back to first project member"
                );
                self.db.first_project_member(&project.id).await.ok().flatten()
            }
        }
    }

    /// Duplicate the message's attachments onto the task. The blobs are
    /// immutable, so the copy shares keys.
    async fn copy_attachments(
        &self,
        message: &InboxMessage,
        task_id: &str,
    ) -> Result<(), DatabaseError> {
        for attachment in self.db.list_message_attachments(&message.id).await? {
            self.db
                .insert_task_attachment(&TaskAttachment {
                    id: Uuid::new_v4().to_string(),
                    task_id: task_id.to_string(),
                    filename: attachment.filename,
                    mime_type: attachment.mime_type,
                    size_bytes: attachment.size_bytes,
                    blob_key: attachment.blob_key,
                })
                .await?;
        }
        Ok(())
    }
}

/// Comment/description content: HTML body, else text, else the subject.
fn comment_body(message: &InboxMessage) -> String {
    if let Some(html) = message.html_body.as_deref()
        && !html.trim().is_empty()
    {
        return html.to_string();
    }
    if !message.text_body.trim().is_empty() {
        return message.text_body.clone();
    }
    message.subject.clone()
}
