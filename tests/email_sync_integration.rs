//! End-to-end sync scenarios against the in-memory backend and a scripted
//! mail client.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mailroom::blob::LocalBlobStore;
use mailroom::config::PlainCipher;
use mailroom::error::MailError;
use mailroom::inbox::{Inbox, MailAccount};
use mailroom::mail::{
    ImapEndpoint, MailClient, MailCredentials, Mailer, OutgoingReply, RawMessage, SmtpEndpoint,
};
use mailroom::message::model::MessageStatus;
use mailroom::rules::model::{Rule, RuleActions, RuleCondition, RuleField, RuleOp};
use mailroom::store::{Database, LibSqlBackend};
use mailroom::sync::{JobRunner, SyncOrchestrator, SyncStatus, SyncTrigger};
use mailroom::tasks::model::{Project, TaskPriority};

// ── Scripted adapters ───────────────────────────────────────────────

/// Mail client returning one scripted batch per fetch.
struct ScriptedMail {
    batches: tokio::sync::Mutex<Vec<Vec<RawMessage>>>,
    marked: tokio::sync::Mutex<Vec<u32>>,
    fail_connect: bool,
}

impl ScriptedMail {
    fn new(batches: Vec<Vec<RawMessage>>) -> Self {
        Self {
            batches: tokio::sync::Mutex::new(batches),
            marked: tokio::sync::Mutex::new(Vec::new()),
            fail_connect: false,
        }
    }

    fn failing() -> Self {
        Self {
            batches: tokio::sync::Mutex::new(Vec::new()),
            marked: tokio::sync::Mutex::new(Vec::new()),
            fail_connect: true,
        }
    }
}

#[async_trait]
impl MailClient for ScriptedMail {
    async fn fetch_since(
        &self,
        _endpoint: &ImapEndpoint,
        _credentials: &MailCredentials,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, MailError> {
        if self.fail_connect {
            return Err(MailError::Timeout {
                op: "connect".into(),
            });
        }
        let mut batches = self.batches.lock().await;
        if batches.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(batches.remove(0))
        }
    }

    async fn mark_read(
        &self,
        _endpoint: &ImapEndpoint,
        _credentials: &MailCredentials,
        uids: &[u32],
    ) -> Result<(), MailError> {
        self.marked.lock().await.extend_from_slice(uids);
        Ok(())
    }
}

struct NullMailer;

#[async_trait]
impl Mailer for NullMailer {
    async fn send_reply(
        &self,
        _endpoint: &SmtpEndpoint,
        _credentials: &MailCredentials,
        _from: &str,
        _reply: &OutgoingReply,
    ) -> Result<(), MailError> {
        Ok(())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn raw_email(
    uid: u32,
    message_id: &str,
    in_reply_to: Option<&str>,
    references: Option<&str>,
    subject: &str,
    date: &str,
    body: &str,
) -> RawMessage {
    let mut headers = format!(
        "Message-ID: <{message_id}>\r\n\
         From: Alice Smith <alice@ex.com>\r\n\
         To: support@tool.example\r\n\
         Subject: {subject}\r\n\
         Date: {date}\r\n"
    );
    if let Some(parent) = in_reply_to {
        headers.push_str(&format!("In-Reply-To: <{parent}>\r\n"));
    }
    if let Some(refs) = references {
        headers.push_str(&format!("References: {refs}\r\n"));
    }
    headers.push_str("Content-Type: text/plain\r\n\r\n");
    RawMessage {
        uid,
        source: format!("{headers}{body}").into_bytes(),
    }
}

struct World {
    db: Arc<dyn Database>,
    orchestrator: Arc<SyncOrchestrator>,
    mail: Arc<ScriptedMail>,
    account: MailAccount,
    _blob_dir: tempfile::TempDir,
}

async fn world_with(mail: ScriptedMail) -> World {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.insert_project(&Project {
        id: "proj-1".into(),
        organization_id: None,
        workspace_id: None,
        name: "Ops".into(),
        key: "OPS".into(),
    })
    .await
    .unwrap();
    db.insert_inbox(&Inbox {
        id: "inbox-1".into(),
        project_id: "proj-1".into(),
        auto_create_tasks: true,
        default_task_type: "TASK".into(),
        default_priority: TaskPriority::Medium,
        default_status: "TODO".into(),
        default_assignee: None,
        sync_interval_minutes: 5,
        auto_reply_enabled: false,
        auto_reply_template: None,
        signature: None,
    })
    .await
    .unwrap();
    let account = MailAccount {
        id: "acc-1".into(),
        inbox_id: "inbox-1".into(),
        imap_host: "imap.example.com".into(),
        imap_port: 993,
        imap_tls: true,
        smtp_host: "smtp.example.com".into(),
        smtp_port: 587,
        smtp_tls: false,
        username: "support@tool.example".into(),
        secret: "password".into(),
        folder: "INBOX".into(),
        sync_enabled: true,
        last_sync_at: None,
        last_sync_error: None,
    };
    db.insert_account(&account).await.unwrap();

    let blob_dir = tempfile::tempdir().unwrap();
    let mail = Arc::new(mail);
    let orchestrator = Arc::new(SyncOrchestrator::new(
        Arc::clone(&db),
        Arc::clone(&mail) as Arc<dyn MailClient>,
        Arc::new(NullMailer),
        Arc::new(LocalBlobStore::new(blob_dir.path())),
        Arc::new(PlainCipher),
    ));

    World {
        db,
        orchestrator,
        mail,
        account,
        _blob_dir: blob_dir,
    }
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_root_and_reply_become_task_and_comment() {
    // Reply delivered before its root in the same fetch.
    let batch = vec![
        raw_email(
            11,
            "m2",
            Some("m1"),
            Some("<m1>"),
            "Re: Bug report",
            "Mon, 5 Jan 2026 11:00:00 +0000",
            "Reproduced on staging.",
        ),
        raw_email(
            10,
            "m1",
            None,
            None,
            "Bug report",
            "Mon, 5 Jan 2026 10:00:00 +0000",
            "The export button is broken.",
        ),
    ];
    let w = world_with(ScriptedMail::new(vec![batch])).await;

    let report = w
        .orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(report.fetched, 2);
    assert_eq!(report.ingested, 2);
    assert_eq!(report.tasks_created, 1);
    assert_eq!(report.comments_created, 1);

    let tasks = w.db.list_tasks_by_project("proj-1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].email_thread_id.as_deref(), Some("m1"));
    assert_eq!(tasks[0].title, "Bug report");

    let comments = w.db.list_task_comments(&tasks[0].id).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].body, "Reproduced on staging.");
    assert_eq!(comments[0].email_message_id.as_deref(), Some("m2"));

    for id in ["m1", "m2"] {
        let msg = w.db.get_message_by_message_id(id).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Converted, "{id} not converted");
    }

    // Both UIDs were flagged read, best-effort, after conversion.
    let marked = w.mail.marked.lock().await.clone();
    assert_eq!(marked, vec![10, 11]);

    // The sync log closed out as SUCCESS and the checkpoint advanced.
    let runs = w.db.list_sync_runs("acc-1", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, SyncStatus::Success);
    let account = w.db.get_account("acc-1").await.unwrap().unwrap();
    assert!(account.last_sync_at.is_some());
    assert!(account.last_sync_error.is_none());
}

#[tokio::test]
async fn refetching_the_same_messages_is_idempotent() {
    let make_batch = || {
        vec![raw_email(
            10,
            "m1",
            None,
            None,
            "Bug report",
            "Mon, 5 Jan 2026 10:00:00 +0000",
            "First sighting.",
        )]
    };
    let w = world_with(ScriptedMail::new(vec![make_batch(), make_batch()])).await;

    w.orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await
        .unwrap();
    let second = w
        .orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(second.duplicates, 1);
    assert_eq!(second.ingested, 0);
    assert_eq!(second.tasks_created, 0);

    // Exactly one message row and one task, no duplicate comments.
    let tasks = w.db.list_tasks_by_project("proj-1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(w.db.list_task_comments(&tasks[0].id).await.unwrap().is_empty());
}

#[tokio::test]
async fn reply_in_later_sync_attaches_to_parent_task() {
    // Sync N: the first message we ever see is itself a reply — its
    // References root (m0) was never delivered here, so the task anchors
    // on m0. Sync N+1: a further reply names m1 in In-Reply-To with no
    // References; thread resolution lands on m1, which anchors no task,
    // and only the converted-sibling fallback can find the parent.
    let batch1 = vec![raw_email(
        20,
        "m1",
        Some("m0"),
        Some("<m0>"),
        "Re: Incident 7",
        "Tue, 6 Jan 2026 09:00:00 +0000",
        "Taking a look now.",
    )];
    let batch2 = vec![raw_email(
        21,
        "m2",
        Some("m1"),
        None,
        "Re: Incident 7",
        "Tue, 6 Jan 2026 10:00:00 +0000",
        "Root cause found.",
    )];
    let w = world_with(ScriptedMail::new(vec![batch1, batch2])).await;

    let first = w
        .orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(first.tasks_created, 1);

    let second = w
        .orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(second.tasks_created, 0);
    assert_eq!(second.comments_created, 1);

    let tasks = w.db.list_tasks_by_project("proj-1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].email_thread_id.as_deref(), Some("m0"));
    let comments = w.db.list_task_comments(&tasks[0].id).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].body, "Root cause found.");
}

#[tokio::test]
async fn connection_failure_records_failed_run_and_account_error() {
    let w = world_with(ScriptedMail::failing()).await;

    let result = w
        .orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await;
    assert!(result.is_err());

    let runs = w.db.list_sync_runs("acc-1", 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, SyncStatus::Failed);
    assert!(runs[0].error.as_deref().unwrap().contains("Timed out"));

    let account = w.db.get_account("acc-1").await.unwrap().unwrap();
    assert!(account.last_sync_error.is_some());

    // Nothing was ingested.
    assert!(w.db.list_tasks_by_project("proj-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn urgent_rule_materializes_highest_priority_task() {
    let batch = vec![raw_email(
        30,
        "m1",
        None,
        None,
        "Urgent: server down",
        "Wed, 7 Jan 2026 08:00:00 +0000",
        "Production is on fire.",
    )];
    let w = world_with(ScriptedMail::new(vec![batch])).await;

    w.db.insert_rule(&Rule {
        id: "rule-1".into(),
        inbox_id: "inbox-1".into(),
        name: "urgent".into(),
        priority: 10,
        conditions: RuleCondition::All {
            all: vec![RuleCondition::field(
                RuleField::Subject,
                RuleOp::Contains,
                "urgent",
            )],
        },
        actions: RuleActions {
            set_priority: Some(TaskPriority::Highest),
            ..Default::default()
        },
        stop_on_match: true,
        enabled: true,
        created_at: Utc::now(),
    })
    .await
    .unwrap();

    w.orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await
        .unwrap();

    let tasks = w.db.list_tasks_by_project("proj-1").await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].priority, TaskPriority::Highest);
}

#[tokio::test]
async fn spam_rule_ignores_message_without_task() {
    let batch = vec![raw_email(
        40,
        "m1",
        None,
        None,
        "You won a prize",
        "Wed, 7 Jan 2026 08:00:00 +0000",
        "Click here.",
    )];
    let w = world_with(ScriptedMail::new(vec![batch])).await;

    w.db.insert_rule(&Rule {
        id: "rule-spam".into(),
        inbox_id: "inbox-1".into(),
        name: "prize-filter".into(),
        priority: 100,
        conditions: RuleCondition::field(RuleField::Subject, RuleOp::Contains, "prize"),
        actions: RuleActions {
            mark_as_spam: true,
            ..Default::default()
        },
        stop_on_match: true,
        enabled: true,
        created_at: Utc::now(),
    })
    .await
    .unwrap();

    let report = w
        .orchestrator
        .sync_account(&w.account, SyncTrigger::Scheduled)
        .await
        .unwrap();
    assert_eq!(report.ignored, 1);
    assert_eq!(report.tasks_created, 0);

    let msg = w.db.get_message_by_message_id("m1").await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Ignored);
    assert!(w.db.list_tasks_by_project("proj-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_trigger_runs_through_the_job_runner() {
    let batch = vec![raw_email(
        50,
        "m1",
        None,
        None,
        "Question",
        "Thu, 8 Jan 2026 12:00:00 +0000",
        "How do I export?",
    )];
    let w = world_with(ScriptedMail::new(vec![batch])).await;

    let (runner, handle) = JobRunner::spawn(Arc::clone(&w.db), Arc::clone(&w.orchestrator), 3);
    let result = runner
        .run_manual("proj-1", Some("user-1".into()))
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.project_id, "proj-1");
    assert!(result.completed_at >= result.sync_start_time);
    let report = result.report.unwrap();
    assert_eq!(report.tasks_created, 1);

    handle.abort();
}

#[tokio::test]
async fn manual_trigger_for_unknown_project_fails_cleanly() {
    let w = world_with(ScriptedMail::new(vec![])).await;
    let (runner, handle) = JobRunner::spawn(Arc::clone(&w.db), Arc::clone(&w.orchestrator), 3);

    let result = runner.run_manual("proj-404", None).await.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("proj-404"));

    handle.abort();
}
