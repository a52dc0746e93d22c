//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            organization_id TEXT,
            workspace_id TEXT,
            name TEXT NOT NULL,
            key TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sprints (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_sprints_project ON sprints(project_id);

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            credential TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS memberships (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            scope_type TEXT NOT NULL,
            scope_id TEXT NOT NULL,
            role TEXT NOT NULL,
            UNIQUE (user_id, scope_type, scope_id)
        );
        CREATE INDEX IF NOT EXISTS idx_memberships_scope
            ON memberships(scope_type, scope_id);

        CREATE TABLE IF NOT EXISTS inboxes (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            auto_create_tasks INTEGER NOT NULL DEFAULT 1,
            default_task_type TEXT NOT NULL DEFAULT 'TASK',
            default_priority TEXT NOT NULL DEFAULT 'MEDIUM',
            default_status TEXT NOT NULL DEFAULT 'TODO',
            default_assignee TEXT,
            sync_interval_minutes INTEGER NOT NULL DEFAULT 5,
            auto_reply_enabled INTEGER NOT NULL DEFAULT 0,
            auto_reply_template TEXT,
            signature TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_inboxes_project ON inboxes(project_id);

        CREATE TABLE IF NOT EXISTS mail_accounts (
            id TEXT PRIMARY KEY,
            inbox_id TEXT NOT NULL UNIQUE REFERENCES inboxes(id) ON DELETE CASCADE,
            imap_host TEXT NOT NULL,
            imap_port INTEGER NOT NULL DEFAULT 993,
            imap_tls INTEGER NOT NULL DEFAULT 1,
            smtp_host TEXT NOT NULL,
            smtp_port INTEGER NOT NULL DEFAULT 587,
            smtp_tls INTEGER NOT NULL DEFAULT 0,
            username TEXT NOT NULL,
            secret TEXT NOT NULL,
            folder TEXT NOT NULL DEFAULT 'INBOX',
            sync_enabled INTEGER NOT NULL DEFAULT 1,
            last_sync_at TEXT,
            last_sync_error TEXT
        );

        CREATE TABLE IF NOT EXISTS inbox_messages (
            id TEXT PRIMARY KEY,
            inbox_id TEXT NOT NULL REFERENCES inboxes(id) ON DELETE CASCADE,
            message_id TEXT NOT NULL UNIQUE,
            imap_uid INTEGER,
            thread_id TEXT NOT NULL,
            in_reply_to TEXT,
            references_json TEXT NOT NULL DEFAULT '[]',
            subject TEXT NOT NULL,
            from_email TEXT NOT NULL,
            from_name TEXT,
            to_json TEXT NOT NULL DEFAULT '[]',
            cc_json TEXT NOT NULL DEFAULT '[]',
            bcc_json TEXT NOT NULL DEFAULT '[]',
            text_body TEXT NOT NULL DEFAULT '',
            text_signature TEXT,
            html_body TEXT,
            html_signature TEXT,
            headers_json TEXT NOT NULL DEFAULT '{}',
            has_attachments INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            received_at TEXT NOT NULL,
            converted_at TEXT,
            task_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_inbox_messages_thread
            ON inbox_messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_inbox_messages_status
            ON inbox_messages(status);

        CREATE TABLE IF NOT EXISTS message_attachments (
            id TEXT PRIMARY KEY,
            inbox_message_id TEXT NOT NULL
                REFERENCES inbox_messages(id) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            content_id TEXT,
            blob_key TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_message_attachments_message
            ON message_attachments(inbox_message_id);

        CREATE TABLE IF NOT EXISTS rules (
            id TEXT PRIMARY KEY,
            inbox_id TEXT NOT NULL REFERENCES inboxes(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            priority INTEGER NOT NULL DEFAULT 0,
            conditions TEXT NOT NULL,
            actions TEXT NOT NULL,
            stop_on_match INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rules_inbox ON rules(inbox_id);

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
            number INTEGER NOT NULL,
            slug TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            task_type TEXT NOT NULL DEFAULT 'TASK',
            status TEXT NOT NULL DEFAULT 'TODO',
            priority TEXT NOT NULL DEFAULT 'MEDIUM',
            labels_json TEXT NOT NULL DEFAULT '[]',
            assignee_id TEXT,
            reporter_id TEXT,
            sprint_id TEXT,
            start_date TEXT,
            due_date TEXT,
            email_thread_id TEXT,
            allow_email_replies INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_email_thread
            ON tasks(project_id, email_thread_id);

        CREATE TABLE IF NOT EXISTS task_comments (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            author_id TEXT,
            author_display_name TEXT,
            body TEXT NOT NULL,
            email_message_id TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_comments_task ON task_comments(task_id);
        CREATE INDEX IF NOT EXISTS idx_task_comments_email_message
            ON task_comments(email_message_id);

        CREATE TABLE IF NOT EXISTS task_attachments (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            filename TEXT NOT NULL,
            mime_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            blob_key TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_task_attachments_task
            ON task_attachments(task_id);

        CREATE TABLE IF NOT EXISTS sync_runs (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES mail_accounts(id) ON DELETE CASCADE,
            trigger_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            started_at TEXT NOT NULL,
            finished_at TEXT,
            fetched INTEGER NOT NULL DEFAULT 0,
            tasks_created INTEGER NOT NULL DEFAULT 0,
            comments_created INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            error TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_sync_runs_account
            ON sync_runs(account_id, started_at);
    "#,
}];

/// Apply all migrations newer than the recorded version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "record migration {}: {e}",
                migration.version
            ))
        })?;
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applied migration"
        );
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row
            .get::<i64>(0)
            .map_err(|e| DatabaseError::Migration(format!("parse version: {e}"))),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!("read version: {e}"))),
    }
}
