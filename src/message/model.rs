//! Message records — the normalized in-memory form and the persisted form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a persisted inbox message.
///
/// A message transitions PENDING → CONVERTED or PENDING → IGNORED exactly
/// once and never reverts; the store enforces this with guarded updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Converted,
    Ignored,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Converted => "converted",
            Self::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "converted" => Self::Converted,
            "ignored" => Self::Ignored,
            _ => Self::Pending,
        }
    }
}

/// A sender or recipient, reduced to bare email plus optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAddr {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl MailAddr {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }
}

/// A decoded attachment from one MIME part.
#[derive(Debug, Clone)]
pub struct AttachmentData {
    pub filename: String,
    pub mime_type: String,
    /// Content-ID for inline images, angle brackets stripped.
    pub content_id: Option<String>,
    pub bytes: Vec<u8>,
}

/// Canonical in-memory form of one fetched message.
///
/// Produced by the normalizer from raw RFC 822 source; pure data, no I/O.
#[derive(Debug, Clone)]
pub struct NormalizedMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    /// Chronological, oldest first, angle brackets stripped.
    pub references: Vec<String>,
    pub subject: String,
    pub from: MailAddr,
    pub to: Vec<MailAddr>,
    pub cc: Vec<MailAddr>,
    pub bcc: Vec<MailAddr>,
    /// Plain-text body with quoted history and signature stripped.
    pub text: String,
    pub text_signature: Option<String>,
    /// HTML body with quote containers and signature stripped.
    pub html: Option<String>,
    pub html_signature: Option<String>,
    pub date: DateTime<Utc>,
    /// The headers this subsystem consumes, as a JSON object.
    pub headers: serde_json::Value,
    pub attachments: Vec<AttachmentData>,
}

/// Canonical persisted record of one email.
#[derive(Debug, Clone)]
pub struct InboxMessage {
    pub id: String,
    pub inbox_id: String,
    /// Globally unique message-id — the idempotency key.
    pub message_id: String,
    pub imap_uid: Option<u32>,
    /// Resolved conversation identifier; see [`crate::message::thread`].
    pub thread_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub subject: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub text_body: String,
    pub text_signature: Option<String>,
    pub html_body: Option<String>,
    pub html_signature: Option<String>,
    pub headers: serde_json::Value,
    pub has_attachments: bool,
    pub status: MessageStatus,
    pub received_at: DateTime<Utc>,
    pub converted_at: Option<DateTime<Utc>>,
    /// Task this message produced (or commented on), once converted.
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A stored attachment owned by exactly one inbox message.
#[derive(Debug, Clone)]
pub struct MessageAttachment {
    pub id: String,
    pub inbox_message_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub content_id: Option<String>,
    /// Opaque key into the blob store.
    pub blob_key: String,
}
