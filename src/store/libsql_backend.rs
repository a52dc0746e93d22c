//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. One connection is reused
//! for all operations; `libsql::Connection` is safe for concurrent async
//! use, and the message-id UNIQUE index is the cross-sync coordination
//! point the ingestion gate depends on.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::inbox::{Inbox, MailAccount};
use crate::message::model::{InboxMessage, MessageAttachment, MessageStatus};
use crate::rules::model::{Rule, RuleActions, RuleCondition};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::sync::{SyncReport, SyncRun, SyncStatus, SyncTrigger};
use crate::tasks::model::{
    MembershipScope, Project, Sprint, Task, TaskAttachment, TaskComment, TaskPriority, User,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to create in-memory database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(v: Option<&str>) -> libsql::Value {
    match v {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn json_list(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

/// Map an insert error, keeping uniqueness conflicts distinguishable.
fn map_insert_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| {
        let text = e.to_string();
        if text.contains("UNIQUE constraint failed") {
            DatabaseError::Constraint(text)
        } else {
            DatabaseError::Query(format!("{op}: {e}"))
        }
    }
}

// ── Row mappers ─────────────────────────────────────────────────────

const ACCOUNT_COLUMNS: &str = "id, inbox_id, imap_host, imap_port, imap_tls, smtp_host, \
     smtp_port, smtp_tls, username, secret, folder, sync_enabled, last_sync_at, last_sync_error";

fn row_to_account(row: &libsql::Row) -> Result<MailAccount, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("account row: {e}"));
    Ok(MailAccount {
        id: row.get::<String>(0).map_err(get_err)?,
        inbox_id: row.get::<String>(1).map_err(get_err)?,
        imap_host: row.get::<String>(2).map_err(get_err)?,
        imap_port: row.get::<i64>(3).map_err(get_err)? as u16,
        imap_tls: row.get::<i64>(4).map_err(get_err)? != 0,
        smtp_host: row.get::<String>(5).map_err(get_err)?,
        smtp_port: row.get::<i64>(6).map_err(get_err)? as u16,
        smtp_tls: row.get::<i64>(7).map_err(get_err)? != 0,
        username: row.get::<String>(8).map_err(get_err)?,
        secret: row.get::<String>(9).map_err(get_err)?,
        folder: row.get::<String>(10).map_err(get_err)?,
        sync_enabled: row.get::<i64>(11).map_err(get_err)? != 0,
        last_sync_at: row.get::<String>(12).ok().map(|s| parse_datetime(&s)),
        last_sync_error: row.get::<String>(13).ok(),
    })
}

const INBOX_COLUMNS: &str = "id, project_id, auto_create_tasks, default_task_type, \
     default_priority, default_status, default_assignee, sync_interval_minutes, \
     auto_reply_enabled, auto_reply_template, signature";

fn row_to_inbox(row: &libsql::Row) -> Result<Inbox, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("inbox row: {e}"));
    Ok(Inbox {
        id: row.get::<String>(0).map_err(get_err)?,
        project_id: row.get::<String>(1).map_err(get_err)?,
        auto_create_tasks: row.get::<i64>(2).map_err(get_err)? != 0,
        default_task_type: row.get::<String>(3).map_err(get_err)?,
        default_priority: TaskPriority::parse(&row.get::<String>(4).map_err(get_err)?)
            .unwrap_or(TaskPriority::Medium),
        default_status: row.get::<String>(5).map_err(get_err)?,
        default_assignee: row.get::<String>(6).ok(),
        sync_interval_minutes: row.get::<i64>(7).map_err(get_err)?,
        auto_reply_enabled: row.get::<i64>(8).map_err(get_err)? != 0,
        auto_reply_template: row.get::<String>(9).ok(),
        signature: row.get::<String>(10).ok(),
    })
}

const MESSAGE_COLUMNS: &str = "id, inbox_id, message_id, imap_uid, thread_id, in_reply_to, \
     references_json, subject, from_email, from_name, to_json, cc_json, bcc_json, text_body, \
     text_signature, html_body, html_signature, headers_json, has_attachments, status, \
     received_at, converted_at, task_id, created_at";

fn row_to_message(row: &libsql::Row) -> Result<InboxMessage, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("message row: {e}"));
    Ok(InboxMessage {
        id: row.get::<String>(0).map_err(get_err)?,
        inbox_id: row.get::<String>(1).map_err(get_err)?,
        message_id: row.get::<String>(2).map_err(get_err)?,
        imap_uid: row.get::<i64>(3).ok().map(|v| v as u32),
        thread_id: row.get::<String>(4).map_err(get_err)?,
        in_reply_to: row.get::<String>(5).ok(),
        references: json_list(&row.get::<String>(6).map_err(get_err)?),
        subject: row.get::<String>(7).map_err(get_err)?,
        from_email: row.get::<String>(8).map_err(get_err)?,
        from_name: row.get::<String>(9).ok(),
        to: json_list(&row.get::<String>(10).map_err(get_err)?),
        cc: json_list(&row.get::<String>(11).map_err(get_err)?),
        bcc: json_list(&row.get::<String>(12).map_err(get_err)?),
        text_body: row.get::<String>(13).map_err(get_err)?,
        text_signature: row.get::<String>(14).ok(),
        html_body: row.get::<String>(15).ok(),
        html_signature: row.get::<String>(16).ok(),
        headers: serde_json::from_str(&row.get::<String>(17).map_err(get_err)?)
            .unwrap_or(serde_json::Value::Null),
        has_attachments: row.get::<i64>(18).map_err(get_err)? != 0,
        status: MessageStatus::parse(&row.get::<String>(19).map_err(get_err)?),
        received_at: parse_datetime(&row.get::<String>(20).map_err(get_err)?),
        converted_at: row.get::<String>(21).ok().map(|s| parse_datetime(&s)),
        task_id: row.get::<String>(22).ok(),
        created_at: parse_datetime(&row.get::<String>(23).map_err(get_err)?),
    })
}

const RULE_COLUMNS: &str =
    "id, inbox_id, name, priority, conditions, actions, stop_on_match, enabled, created_at";

fn row_to_rule(row: &libsql::Row) -> Result<Rule, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("rule row: {e}"));
    let conditions_json = row.get::<String>(4).map_err(get_err)?;
    let actions_json = row.get::<String>(5).map_err(get_err)?;
    let conditions: RuleCondition = serde_json::from_str(&conditions_json)
        .map_err(|e| DatabaseError::Serialization(format!("rule conditions: {e}")))?;
    let actions: RuleActions = serde_json::from_str(&actions_json)
        .map_err(|e| DatabaseError::Serialization(format!("rule actions: {e}")))?;
    Ok(Rule {
        id: row.get::<String>(0).map_err(get_err)?,
        inbox_id: row.get::<String>(1).map_err(get_err)?,
        name: row.get::<String>(2).map_err(get_err)?,
        priority: row.get::<i64>(3).map_err(get_err)?,
        conditions,
        actions,
        stop_on_match: row.get::<i64>(6).map_err(get_err)? != 0,
        enabled: row.get::<i64>(7).map_err(get_err)? != 0,
        created_at: parse_datetime(&row.get::<String>(8).map_err(get_err)?),
    })
}

const TASK_COLUMNS: &str = "id, project_id, number, slug, title, description, task_type, \
     status, priority, labels_json, assignee_id, reporter_id, sprint_id, start_date, due_date, \
     email_thread_id, allow_email_replies, deleted, created_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("task row: {e}"));
    Ok(Task {
        id: row.get::<String>(0).map_err(get_err)?,
        project_id: row.get::<String>(1).map_err(get_err)?,
        number: row.get::<i64>(2).map_err(get_err)?,
        slug: row.get::<String>(3).map_err(get_err)?,
        title: row.get::<String>(4).map_err(get_err)?,
        description: row.get::<String>(5).map_err(get_err)?,
        task_type: row.get::<String>(6).map_err(get_err)?,
        status: row.get::<String>(7).map_err(get_err)?,
        priority: TaskPriority::parse(&row.get::<String>(8).map_err(get_err)?)
            .unwrap_or(TaskPriority::Medium),
        labels: json_list(&row.get::<String>(9).map_err(get_err)?),
        assignee_id: row.get::<String>(10).ok(),
        reporter_id: row.get::<String>(11).ok(),
        sprint_id: row.get::<String>(12).ok(),
        start_date: row.get::<String>(13).ok().map(|s| parse_datetime(&s)),
        due_date: row.get::<String>(14).ok().map(|s| parse_datetime(&s)),
        email_thread_id: row.get::<String>(15).ok(),
        allow_email_replies: row.get::<i64>(16).map_err(get_err)? != 0,
        deleted: row.get::<i64>(17).map_err(get_err)? != 0,
        created_at: parse_datetime(&row.get::<String>(18).map_err(get_err)?),
    })
}

const COMMENT_COLUMNS: &str =
    "id, task_id, author_id, author_display_name, body, email_message_id, created_at";

fn row_to_comment(row: &libsql::Row) -> Result<TaskComment, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("comment row: {e}"));
    Ok(TaskComment {
        id: row.get::<String>(0).map_err(get_err)?,
        task_id: row.get::<String>(1).map_err(get_err)?,
        author_id: row.get::<String>(2).ok(),
        author_display_name: row.get::<String>(3).ok(),
        body: row.get::<String>(4).map_err(get_err)?,
        email_message_id: row.get::<String>(5).ok(),
        created_at: parse_datetime(&row.get::<String>(6).map_err(get_err)?),
    })
}

const USER_COLUMNS: &str = "id, email, name, credential, created_at";

fn row_to_user(row: &libsql::Row) -> Result<User, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("user row: {e}"));
    Ok(User {
        id: row.get::<String>(0).map_err(get_err)?,
        email: row.get::<String>(1).map_err(get_err)?,
        name: row.get::<String>(2).map_err(get_err)?,
        credential: row.get::<String>(3).map_err(get_err)?,
        created_at: parse_datetime(&row.get::<String>(4).map_err(get_err)?),
    })
}

const SYNC_RUN_COLUMNS: &str = "id, account_id, trigger_type, status, started_at, finished_at, \
     fetched, tasks_created, comments_created, skipped, error";

fn row_to_sync_run(row: &libsql::Row) -> Result<SyncRun, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("sync run row: {e}"));
    Ok(SyncRun {
        id: row.get::<String>(0).map_err(get_err)?,
        account_id: row.get::<String>(1).map_err(get_err)?,
        trigger: SyncTrigger::parse(&row.get::<String>(2).map_err(get_err)?),
        status: SyncStatus::parse(&row.get::<String>(3).map_err(get_err)?),
        started_at: parse_datetime(&row.get::<String>(4).map_err(get_err)?),
        finished_at: row.get::<String>(5).ok().map(|s| parse_datetime(&s)),
        fetched: row.get::<i64>(6).map_err(get_err)?,
        tasks_created: row.get::<i64>(7).map_err(get_err)?,
        comments_created: row.get::<i64>(8).map_err(get_err)?,
        skipped: row.get::<i64>(9).map_err(get_err)?,
        error: row.get::<String>(10).ok(),
    })
}

fn row_to_message_attachment(row: &libsql::Row) -> Result<MessageAttachment, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("attachment row: {e}"));
    Ok(MessageAttachment {
        id: row.get::<String>(0).map_err(get_err)?,
        inbox_message_id: row.get::<String>(1).map_err(get_err)?,
        filename: row.get::<String>(2).map_err(get_err)?,
        mime_type: row.get::<String>(3).map_err(get_err)?,
        size_bytes: row.get::<i64>(4).map_err(get_err)?,
        content_id: row.get::<String>(5).ok(),
        blob_key: row.get::<String>(6).map_err(get_err)?,
    })
}

fn row_to_task_attachment(row: &libsql::Row) -> Result<TaskAttachment, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("task attachment row: {e}"));
    Ok(TaskAttachment {
        id: row.get::<String>(0).map_err(get_err)?,
        task_id: row.get::<String>(1).map_err(get_err)?,
        filename: row.get::<String>(2).map_err(get_err)?,
        mime_type: row.get::<String>(3).map_err(get_err)?,
        size_bytes: row.get::<i64>(4).map_err(get_err)?,
        blob_key: row.get::<String>(5).map_err(get_err)?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Projects & setup surface ────────────────────────────────────

    async fn insert_project(&self, project: &Project) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO projects (id, organization_id, workspace_id, name, key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    project.id.as_str(),
                    opt_text(project.organization_id.as_deref()),
                    opt_text(project.workspace_id.as_deref()),
                    project.name.as_str(),
                    project.key.as_str(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_project"))?;
        Ok(())
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, organization_id, workspace_id, name, key FROM projects WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_project: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let get_err = |e: libsql::Error| DatabaseError::Query(format!("project row: {e}"));
                Ok(Some(Project {
                    id: row.get::<String>(0).map_err(get_err)?,
                    organization_id: row.get::<String>(1).ok(),
                    workspace_id: row.get::<String>(2).ok(),
                    name: row.get::<String>(3).map_err(get_err)?,
                    key: row.get::<String>(4).map_err(get_err)?,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_project: {e}"))),
        }
    }

    async fn insert_sprint(&self, sprint: &Sprint) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sprints (id, project_id, name, is_default) VALUES (?1, ?2, ?3, ?4)",
                params![
                    sprint.id.as_str(),
                    sprint.project_id.as_str(),
                    sprint.name.as_str(),
                    sprint.is_default as i64,
                ],
            )
            .await
            .map_err(map_insert_err("insert_sprint"))?;
        Ok(())
    }

    async fn default_sprint(&self, project_id: &str) -> Result<Option<Sprint>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, project_id, name, is_default FROM sprints
                 WHERE project_id = ?1 AND is_default = 1 LIMIT 1",
                params![project_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("default_sprint: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => {
                let get_err = |e: libsql::Error| DatabaseError::Query(format!("sprint row: {e}"));
                Ok(Some(Sprint {
                    id: row.get::<String>(0).map_err(get_err)?,
                    project_id: row.get::<String>(1).map_err(get_err)?,
                    name: row.get::<String>(2).map_err(get_err)?,
                    is_default: row.get::<i64>(3).map_err(get_err)? != 0,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("default_sprint: {e}"))),
        }
    }

    // ── Inboxes & mail accounts ─────────────────────────────────────

    async fn insert_inbox(&self, inbox: &Inbox) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO inboxes (id, project_id, auto_create_tasks, default_task_type,
                    default_priority, default_status, default_assignee, sync_interval_minutes,
                    auto_reply_enabled, auto_reply_template, signature)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    inbox.id.as_str(),
                    inbox.project_id.as_str(),
                    inbox.auto_create_tasks as i64,
                    inbox.default_task_type.as_str(),
                    inbox.default_priority.as_str(),
                    inbox.default_status.as_str(),
                    opt_text(inbox.default_assignee.as_deref()),
                    inbox.sync_interval_minutes,
                    inbox.auto_reply_enabled as i64,
                    opt_text(inbox.auto_reply_template.as_deref()),
                    opt_text(inbox.signature.as_deref()),
                ],
            )
            .await
            .map_err(map_insert_err("insert_inbox"))?;
        Ok(())
    }

    async fn get_inbox(&self, id: &str) -> Result<Option<Inbox>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INBOX_COLUMNS} FROM inboxes WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_inbox: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_inbox(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_inbox: {e}"))),
        }
    }

    async fn insert_account(&self, account: &MailAccount) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO mail_accounts (id, inbox_id, imap_host, imap_port, imap_tls,
                    smtp_host, smtp_port, smtp_tls, username, secret, folder, sync_enabled,
                    last_sync_at, last_sync_error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    account.id.as_str(),
                    account.inbox_id.as_str(),
                    account.imap_host.as_str(),
                    account.imap_port as i64,
                    account.imap_tls as i64,
                    account.smtp_host.as_str(),
                    account.smtp_port as i64,
                    account.smtp_tls as i64,
                    account.username.as_str(),
                    account.secret.as_str(),
                    account.folder.as_str(),
                    account.sync_enabled as i64,
                    opt_text(account.last_sync_at.map(|d| d.to_rfc3339()).as_deref()),
                    opt_text(account.last_sync_error.as_deref()),
                ],
            )
            .await
            .map_err(map_insert_err("insert_account"))?;
        Ok(())
    }

    async fn get_account(&self, id: &str) -> Result<Option<MailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM mail_accounts WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_account(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account: {e}"))),
        }
    }

    async fn get_account_by_project(
        &self,
        project_id: &str,
    ) -> Result<Option<MailAccount>, DatabaseError> {
        let columns = ACCOUNT_COLUMNS
            .split(", ")
            .map(|c| format!("a.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {columns} FROM mail_accounts a
                     JOIN inboxes i ON i.id = a.inbox_id
                     WHERE i.project_id = ?1"
                ),
                params![project_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_account_by_project: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_account(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_account_by_project: {e}"))),
        }
    }

    async fn list_sync_enabled_accounts(&self) -> Result<Vec<MailAccount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM mail_accounts WHERE sync_enabled = 1"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sync_enabled_accounts: {e}")))?;
        let mut accounts = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            accounts.push(row_to_account(&row)?);
        }
        Ok(accounts)
    }

    async fn update_account_sync_state(
        &self,
        account_id: &str,
        last_sync_at: DateTime<Utc>,
        last_sync_error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE mail_accounts SET last_sync_at = ?2, last_sync_error = ?3 WHERE id = ?1",
                params![
                    account_id,
                    last_sync_at.to_rfc3339(),
                    opt_text(last_sync_error),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_account_sync_state: {e}")))?;
        Ok(())
    }

    // ── Inbox messages ──────────────────────────────────────────────

    async fn insert_inbox_message(&self, msg: &InboxMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO inbox_messages (id, inbox_id, message_id, imap_uid, thread_id,
                    in_reply_to, references_json, subject, from_email, from_name, to_json,
                    cc_json, bcc_json, text_body, text_signature, html_body, html_signature,
                    headers_json, has_attachments, status, received_at, converted_at, task_id,
                    created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
                params![
                    msg.id.as_str(),
                    msg.inbox_id.as_str(),
                    msg.message_id.as_str(),
                    opt_int(msg.imap_uid.map(i64::from)),
                    msg.thread_id.as_str(),
                    opt_text(msg.in_reply_to.as_deref()),
                    to_json(&msg.references, "references")?,
                    msg.subject.as_str(),
                    msg.from_email.as_str(),
                    opt_text(msg.from_name.as_deref()),
                    to_json(&msg.to, "to")?,
                    to_json(&msg.cc, "cc")?,
                    to_json(&msg.bcc, "bcc")?,
                    msg.text_body.as_str(),
                    opt_text(msg.text_signature.as_deref()),
                    opt_text(msg.html_body.as_deref()),
                    opt_text(msg.html_signature.as_deref()),
                    to_json(&msg.headers, "headers")?,
                    msg.has_attachments as i64,
                    msg.status.as_str(),
                    msg.received_at.to_rfc3339(),
                    opt_text(msg.converted_at.map(|d| d.to_rfc3339()).as_deref()),
                    opt_text(msg.task_id.as_deref()),
                    msg.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_inbox_message"))?;
        debug!(message_id = %msg.message_id, "Inbox message persisted");
        Ok(())
    }

    async fn get_message_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<InboxMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM inbox_messages WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_message_by_message_id: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_message(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_message_by_message_id: {e}"
            ))),
        }
    }

    async fn mark_message_converted(
        &self,
        id: &str,
        task_id: &str,
        converted_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE inbox_messages SET status = 'converted', converted_at = ?2, task_id = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![id, converted_at.to_rfc3339(), task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_message_converted: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::Constraint(format!(
                "message {id} is not pending"
            )));
        }
        Ok(())
    }

    async fn mark_message_ignored(&self, id: &str) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE inbox_messages SET status = 'ignored'
                 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_message_ignored: {e}")))?;
        if affected == 0 {
            return Err(DatabaseError::Constraint(format!(
                "message {id} is not pending"
            )));
        }
        Ok(())
    }

    async fn insert_message_attachment(
        &self,
        attachment: &MessageAttachment,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO message_attachments (id, inbox_message_id, filename, mime_type,
                    size_bytes, content_id, blob_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    attachment.id.as_str(),
                    attachment.inbox_message_id.as_str(),
                    attachment.filename.as_str(),
                    attachment.mime_type.as_str(),
                    attachment.size_bytes,
                    opt_text(attachment.content_id.as_deref()),
                    attachment.blob_key.as_str(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_message_attachment"))?;
        Ok(())
    }

    async fn list_message_attachments(
        &self,
        inbox_message_id: &str,
    ) -> Result<Vec<MessageAttachment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, inbox_message_id, filename, mime_type, size_bytes, content_id,
                    blob_key
                 FROM message_attachments WHERE inbox_message_id = ?1",
                params![inbox_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_message_attachments: {e}")))?;
        let mut attachments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            attachments.push(row_to_message_attachment(&row)?);
        }
        Ok(attachments)
    }

    // ── Rules ───────────────────────────────────────────────────────

    async fn insert_rule(&self, rule: &Rule) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO rules (id, inbox_id, name, priority, conditions, actions,
                    stop_on_match, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    rule.id.as_str(),
                    rule.inbox_id.as_str(),
                    rule.name.as_str(),
                    rule.priority,
                    to_json(&rule.conditions, "conditions")?,
                    to_json(&rule.actions, "actions")?,
                    rule.stop_on_match as i64,
                    rule.enabled as i64,
                    rule.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_rule"))?;
        Ok(())
    }

    async fn list_rules(&self, inbox_id: &str) -> Result<Vec<Rule>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RULE_COLUMNS} FROM rules
                     WHERE inbox_id = ?1 AND enabled = 1
                     ORDER BY priority DESC, created_at ASC"
                ),
                params![inbox_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_rules: {e}")))?;
        let mut rules = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            rules.push(row_to_rule(&row)?);
        }
        Ok(rules)
    }

    // ── Tasks & comments ────────────────────────────────────────────

    async fn find_task_by_email_thread(
        &self,
        project_id: &str,
        thread_id: &str,
    ) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE project_id = ?1 AND email_thread_id = ?2 AND deleted = 0
                     LIMIT 1"
                ),
                params![project_id, thread_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_task_by_email_thread: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_task_by_email_thread: {e}"
            ))),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn next_task_number(&self, project_id: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COALESCE(MAX(number), 0) + 1 FROM tasks WHERE project_id = ?1",
                params![project_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("next_task_number: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("next_task_number: {e}"))),
            Ok(None) => Ok(1),
            Err(e) => Err(DatabaseError::Query(format!("next_task_number: {e}"))),
        }
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO tasks (id, project_id, number, slug, title, description,
                    task_type, status, priority, labels_json, assignee_id, reporter_id,
                    sprint_id, start_date, due_date, email_thread_id, allow_email_replies,
                    deleted, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19)",
                params![
                    task.id.as_str(),
                    task.project_id.as_str(),
                    task.number,
                    task.slug.as_str(),
                    task.title.as_str(),
                    task.description.as_str(),
                    task.task_type.as_str(),
                    task.status.as_str(),
                    task.priority.as_str(),
                    to_json(&task.labels, "labels")?,
                    opt_text(task.assignee_id.as_deref()),
                    opt_text(task.reporter_id.as_deref()),
                    opt_text(task.sprint_id.as_deref()),
                    opt_text(task.start_date.map(|d| d.to_rfc3339()).as_deref()),
                    opt_text(task.due_date.map(|d| d.to_rfc3339()).as_deref()),
                    opt_text(task.email_thread_id.as_deref()),
                    task.allow_email_replies as i64,
                    task.deleted as i64,
                    task.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_task"))?;
        debug!(task_id = %task.id, slug = %task.slug, "Task inserted");
        Ok(())
    }

    async fn list_tasks_by_project(&self, project_id: &str) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE project_id = ?1 AND deleted = 0
                     ORDER BY number ASC"
                ),
                params![project_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_tasks_by_project: {e}")))?;
        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn recent_email_threads(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE project_id = ?1 AND email_thread_id IS NOT NULL AND deleted = 0
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![project_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_email_threads: {e}")))?;
        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn insert_task_comment(&self, comment: &TaskComment) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO task_comments (id, task_id, author_id, author_display_name,
                    body, email_message_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    comment.id.as_str(),
                    comment.task_id.as_str(),
                    opt_text(comment.author_id.as_deref()),
                    opt_text(comment.author_display_name.as_deref()),
                    comment.body.as_str(),
                    opt_text(comment.email_message_id.as_deref()),
                    comment.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_task_comment"))?;
        Ok(())
    }

    async fn find_comment_by_email_message_id(
        &self,
        email_message_id: &str,
    ) -> Result<Option<TaskComment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM task_comments
                     WHERE email_message_id = ?1 LIMIT 1"
                ),
                params![email_message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_comment_by_email_message_id: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_comment(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "find_comment_by_email_message_id: {e}"
            ))),
        }
    }

    async fn list_task_comments(&self, task_id: &str) -> Result<Vec<TaskComment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM task_comments
                     WHERE task_id = ?1 ORDER BY created_at ASC"
                ),
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_comments: {e}")))?;
        let mut comments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            comments.push(row_to_comment(&row)?);
        }
        Ok(comments)
    }

    async fn insert_task_attachment(
        &self,
        attachment: &TaskAttachment,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO task_attachments (id, task_id, filename, mime_type, size_bytes,
                    blob_key)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    attachment.id.as_str(),
                    attachment.task_id.as_str(),
                    attachment.filename.as_str(),
                    attachment.mime_type.as_str(),
                    attachment.size_bytes,
                    attachment.blob_key.as_str(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_task_attachment"))?;
        Ok(())
    }

    async fn list_task_attachments(
        &self,
        task_id: &str,
    ) -> Result<Vec<TaskAttachment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, task_id, filename, mime_type, size_bytes, blob_key
                 FROM task_attachments WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_task_attachments: {e}")))?;
        let mut attachments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            attachments.push(row_to_task_attachment(&row)?);
        }
        Ok(attachments)
    }

    // ── Users & memberships ─────────────────────────────────────────

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1 COLLATE NOCASE"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_user_by_email: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_user_by_email: {e}"))),
        }
    }

    async fn insert_user(&self, user: &User) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO users (id, email, name, credential, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id.as_str(),
                    user.email.as_str(),
                    user.name.as_str(),
                    user.credential.as_str(),
                    user.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(map_insert_err("insert_user"))?;
        Ok(())
    }

    async fn ensure_membership(
        &self,
        user_id: &str,
        scope: MembershipScope,
        scope_id: &str,
        role: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO memberships (id, user_id, scope_type, scope_id, role)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    user_id,
                    scope.as_str(),
                    scope_id,
                    role,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_membership: {e}")))?;
        Ok(())
    }

    async fn first_project_member(
        &self,
        project_id: &str,
    ) -> Result<Option<User>, DatabaseError> {
        let columns = USER_COLUMNS
            .split(", ")
            .map(|c| format!("u.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {columns} FROM users u
                     JOIN memberships m ON m.user_id = u.id
                     WHERE m.scope_type = 'project' AND m.scope_id = ?1
                     ORDER BY u.created_at ASC LIMIT 1"
                ),
                params![project_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("first_project_member: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_user(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("first_project_member: {e}"))),
        }
    }

    // ── Sync log ────────────────────────────────────────────────────

    async fn insert_sync_run(&self, run: &SyncRun) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO sync_runs (id, account_id, trigger_type, status, started_at,
                    finished_at, fetched, tasks_created, comments_created, skipped, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    run.id.as_str(),
                    run.account_id.as_str(),
                    run.trigger.as_str(),
                    run.status.as_str(),
                    run.started_at.to_rfc3339(),
                    opt_text(run.finished_at.map(|d| d.to_rfc3339()).as_deref()),
                    run.fetched,
                    run.tasks_created,
                    run.comments_created,
                    run.skipped,
                    opt_text(run.error.as_deref()),
                ],
            )
            .await
            .map_err(map_insert_err("insert_sync_run"))?;
        Ok(())
    }

    async fn finish_sync_run(
        &self,
        id: &str,
        status: SyncStatus,
        finished_at: DateTime<Utc>,
        report: &SyncReport,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE sync_runs SET status = ?2, finished_at = ?3, fetched = ?4,
                    tasks_created = ?5, comments_created = ?6, skipped = ?7, error = ?8
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    finished_at.to_rfc3339(),
                    report.fetched as i64,
                    report.tasks_created as i64,
                    report.comments_created as i64,
                    (report.duplicates + report.ignored + report.failed_messages) as i64,
                    opt_text(error),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_sync_run: {e}")))?;
        Ok(())
    }

    async fn list_sync_runs(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs
                     WHERE account_id = ?1 ORDER BY started_at DESC LIMIT ?2"
                ),
                params![account_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sync_runs: {e}")))?;
        let mut runs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            runs.push(row_to_sync_run(&row)?);
        }
        Ok(runs)
    }
}
