//! Error types for mailroom.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),

    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid schedule expression {expr:?}: {message}")]
    InvalidSchedule { expr: String, message: String },

    #[error("Credential cipher error: {0}")]
    Cipher(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Whether this error is a uniqueness-constraint conflict.
    ///
    /// The ingestion gate relies on this to turn a duplicate message-id
    /// insert into "already ingested" instead of a failure.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Constraint(_))
    }
}

/// Mail protocol errors — IMAP fetch and SMTP send.
///
/// Connection-class variants (`Connect`, `Tls`, `Auth`, `Timeout`) are fatal
/// to the sync that raised them; `Parse` is scoped to a single message.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connect to {host}:{port} failed: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed for {username}")]
    Auth { username: String },

    #[error("Timed out during {op}")]
    Timeout { op: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Failed to parse message: {0}")]
    Parse(String),

    #[error("SMTP send failed: {0}")]
    Send(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// True for errors that invalidate the whole fetch for an account.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. }
                | Self::Tls(_)
                | Self::Auth { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }
}

/// Blob store errors.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Upload of {name} failed: {reason}")]
    Upload { name: String, reason: String },

    #[error("Unknown blob key: {0}")]
    UnknownKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rule evaluation errors.
///
/// These never abort message processing — the engine logs them per rule
/// and moves on to the next rule.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("Invalid condition tree: {0}")]
    InvalidCondition(String),

    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Action failed for rule {rule}: {reason}")]
    ActionFailed { rule: String, reason: String },
}

/// Sync orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("No mail account configured for project {project_id}")]
    AccountNotFound { project_id: String },

    #[error("Inbox {inbox_id} not found for account {account_id}")]
    InboxNotFound {
        account_id: String,
        inbox_id: String,
    },

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Job runner errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job queue is closed")]
    QueueClosed,

    #[error("Job result channel dropped before completion")]
    ResultDropped,
}

/// Result type alias for mailroom.
pub type Result<T> = std::result::Result<T, Error>;
