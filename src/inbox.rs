//! Inbox configuration and its mail account.
//!
//! Both records are created during project setup and mutated only by
//! configuration endpoints outside this subsystem; syncs read them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::model::TaskPriority;

/// IMAP+SMTP identity monitored for one inbox.
///
/// `secret` is encrypted at rest; decryption goes through the
/// [`CredentialCipher`](crate::config::CredentialCipher) port.
#[derive(Debug, Clone)]
pub struct MailAccount {
    pub id: String,
    pub inbox_id: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub imap_tls: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_tls: bool,
    pub username: String,
    pub secret: String,
    /// Folder to monitor, usually INBOX.
    pub folder: String,
    pub sync_enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
}

impl MailAccount {
    /// Whether a scheduled sync is due, given the inbox's interval.
    ///
    /// Accounts that have never synced are always due.
    pub fn sync_due(&self, interval_minutes: i64, now: DateTime<Utc>) -> bool {
        match self.last_sync_at {
            Some(last) => now - last >= chrono::Duration::minutes(interval_minutes),
            None => true,
        }
    }
}

/// Per-project inbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbox {
    pub id: String,
    pub project_id: String,
    /// When false, messages are ingested and stored but never materialized.
    pub auto_create_tasks: bool,
    pub default_task_type: String,
    pub default_priority: TaskPriority,
    pub default_status: String,
    pub default_assignee: Option<String>,
    pub sync_interval_minutes: i64,
    pub auto_reply_enabled: bool,
    pub auto_reply_template: Option<String>,
    /// Signature appended to outbound auto-replies.
    pub signature: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(last_sync_at: Option<DateTime<Utc>>) -> MailAccount {
        MailAccount {
            id: "acc-1".into(),
            inbox_id: "inbox-1".into(),
            imap_host: "imap.example.com".into(),
            imap_port: 993,
            imap_tls: true,
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            smtp_tls: false,
            username: "support@example.com".into(),
            secret: "enc".into(),
            folder: "INBOX".into(),
            sync_enabled: true,
            last_sync_at,
            last_sync_error: None,
        }
    }

    #[test]
    fn never_synced_account_is_due() {
        assert!(account(None).sync_due(15, Utc::now()));
    }

    #[test]
    fn recently_synced_account_is_not_due() {
        let now = Utc::now();
        let acc = account(Some(now - chrono::Duration::minutes(3)));
        assert!(!acc.sync_due(15, now));
    }

    #[test]
    fn stale_account_is_due() {
        let now = Utc::now();
        let acc = account(Some(now - chrono::Duration::minutes(20)));
        assert!(acc.sync_due(15, now));
    }

    #[test]
    fn interval_boundary_is_due() {
        let now = Utc::now();
        let acc = account(Some(now - chrono::Duration::minutes(15)));
        assert!(acc.sync_due(15, now));
    }
}
