//! Mail transport — IMAP fetch and SMTP send, behind narrow ports.

pub mod imap;
pub mod smtp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;

use crate::error::MailError;
use crate::inbox::MailAccount;

/// IMAP connection coordinates for one account.
#[derive(Debug, Clone)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub folder: String,
}

impl ImapEndpoint {
    pub fn of(account: &MailAccount) -> Self {
        Self {
            host: account.imap_host.clone(),
            port: account.imap_port,
            tls: account.imap_tls,
            folder: account.folder.clone(),
        }
    }
}

/// SMTP connection coordinates for one account.
///
/// `implicit_tls` selects wrapped TLS (typically port 465) over
/// STARTTLS (typically port 587).
#[derive(Debug, Clone)]
pub struct SmtpEndpoint {
    pub host: String,
    pub port: u16,
    pub implicit_tls: bool,
}

impl SmtpEndpoint {
    pub fn of(account: &MailAccount) -> Self {
        Self {
            host: account.smtp_host.clone(),
            port: account.smtp_port,
            implicit_tls: account.smtp_tls,
        }
    }
}

/// Decrypted session credentials, scoped to one sync.
#[derive(Clone)]
pub struct MailCredentials {
    pub username: String,
    pub password: SecretString,
}

impl std::fmt::Debug for MailCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One fetched message: IMAP UID plus full RFC 822 source.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub source: Vec<u8>,
}

/// Inbound mail port.
///
/// A failed fetch carries no partial result: a broken connection cannot be
/// trusted to have enumerated the true message set. `mark_read` is cleanup
/// after messages are durably converted, so callers treat its failures as
/// log-only.
#[async_trait]
pub trait MailClient: Send + Sync {
    /// List and fetch all messages since the checkpoint (all messages when
    /// the account has never synced), in server order.
    async fn fetch_since(
        &self,
        endpoint: &ImapEndpoint,
        credentials: &MailCredentials,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, MailError>;

    /// Flag the given UIDs `\Seen`. Best-effort.
    async fn mark_read(
        &self,
        endpoint: &ImapEndpoint,
        credentials: &MailCredentials,
        uids: &[u32],
    ) -> Result<(), MailError>;
}

/// A templated reply about to be sent.
#[derive(Debug, Clone)]
pub struct OutgoingReply {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Message-id of the email being answered, without angle brackets.
    pub in_reply_to: String,
}

/// Outbound mail port, used by the rule engine's auto-reply action.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_reply(
        &self,
        endpoint: &SmtpEndpoint,
        credentials: &MailCredentials,
        from_address: &str,
        reply: &OutgoingReply,
    ) -> Result<(), MailError>;
}
