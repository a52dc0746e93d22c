//! Task-graph records touched by email ingestion.
//!
//! Only the email-linked subset is modeled here; generic project/task CRUD
//! lives outside this subsystem.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task priority ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Lowest,
    Low,
    Medium,
    High,
    Highest,
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lowest => "LOWEST",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Highest => "HIGHEST",
        }
    }

    /// Parse a stored or rule-supplied priority name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOWEST" => Some(Self::Lowest),
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "HIGH" => Some(Self::High),
            "HIGHEST" => Some(Self::Highest),
            _ => None,
        }
    }
}

/// Minimal project surface needed by the materializer and account resolver.
#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub organization_id: Option<String>,
    pub workspace_id: Option<String>,
    pub name: String,
    /// Short uppercase key used in task slugs, e.g. "OPS" → "OPS-42".
    pub key: String,
}

/// A sprint; at most one per project is flagged default.
#[derive(Debug, Clone)]
pub struct Sprint {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub is_default: bool,
}

/// Email-linked task record.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub number: i64,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub status: String,
    pub priority: TaskPriority,
    pub labels: Vec<String>,
    pub assignee_id: Option<String>,
    pub reporter_id: Option<String>,
    pub sprint_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    /// Conversation this task anchors; at most one non-deleted task per
    /// project shares a value.
    pub email_thread_id: Option<String>,
    pub allow_email_replies: bool,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Comment appended to a task, possibly sourced from email.
#[derive(Debug, Clone)]
pub struct TaskComment {
    pub id: String,
    pub task_id: String,
    pub author_id: Option<String>,
    /// Display name when the comment did not originate from a platform
    /// user action (e.g. an email sender without an account).
    pub author_display_name: Option<String>,
    pub body: String,
    /// Message-id of the email this comment was materialized from.
    pub email_message_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Attachment copied onto a task from an ingested message.
#[derive(Debug, Clone)]
pub struct TaskAttachment {
    pub id: String,
    pub task_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub blob_key: String,
}

/// Platform user, as far as ingestion cares.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    /// Random placeholder credential minted at auto-creation; a real
    /// password is set through account recovery, outside this subsystem.
    pub credential: String,
    pub created_at: DateTime<Utc>,
}

/// Membership scopes the account resolver can grant viewer access at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipScope {
    Organization,
    Workspace,
    Project,
}

impl MembershipScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::Workspace => "workspace",
            Self::Project => "project",
        }
    }
}
