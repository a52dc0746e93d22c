//! Ingestion gate — each message is persisted at most once.
//!
//! Dedup is anchored on the message-id UNIQUE index, not the application
//! lookup: two syncs racing on the same message both insert, one loses with
//! a constraint violation and treats the message as already ingested.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::error::DatabaseError;
use crate::inbox::Inbox;
use crate::message::model::{
    InboxMessage, MessageAttachment, MessageStatus, NormalizedMessage,
};
use crate::store::Database;

/// Outcome of offering one message to the gate.
#[derive(Debug)]
pub enum GateResult {
    /// First sighting; the persisted record is returned for the pipeline.
    Persisted(InboxMessage),
    /// The message-id is already known; skip all further processing.
    AlreadyExists,
}

/// Persists normalized messages and their attachments.
pub struct IngestionGate {
    db: Arc<dyn Database>,
    blobs: Arc<dyn BlobStore>,
}

impl IngestionGate {
    pub fn new(db: Arc<dyn Database>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { db, blobs }
    }

    /// Persist a message unless its message-id was seen before.
    ///
    /// Attachments upload after the row exists; an individual upload
    /// failure is logged and skipped and never aborts the ingestion.
    pub async fn persist_if_new(
        &self,
        inbox: &Inbox,
        msg: &NormalizedMessage,
        thread_id: &str,
        imap_uid: Option<u32>,
    ) -> Result<GateResult, DatabaseError> {
        if self
            .db
            .get_message_by_message_id(&msg.message_id)
            .await?
            .is_some()
        {
            debug!(message_id = %msg.message_id, "Message already ingested");
            return Ok(GateResult::AlreadyExists);
        }

        let record = InboxMessage {
            id: Uuid::new_v4().to_string(),
            inbox_id: inbox.id.clone(),
            message_id: msg.message_id.clone(),
            imap_uid,
            thread_id: thread_id.to_string(),
            in_reply_to: msg.in_reply_to.clone(),
            references: msg.references.clone(),
            subject: msg.subject.clone(),
            from_email: msg.from.email.clone(),
            from_name: msg.from.name.clone(),
            to: msg.to.iter().map(|a| a.email.clone()).collect(),
            cc: msg.cc.iter().map(|a| a.email.clone()).collect(),
            bcc: msg.bcc.iter().map(|a| a.email.clone()).collect(),
            text_body: msg.text.clone(),
            text_signature: msg.text_signature.clone(),
            html_body: msg.html.clone(),
            html_signature: msg.html_signature.clone(),
            headers: msg.headers.clone(),
            has_attachments: !msg.attachments.is_empty(),
            status: MessageStatus::Pending,
            received_at: msg.date,
            converted_at: None,
            task_id: None,
            created_at: Utc::now(),
        };

        match self.db.insert_inbox_message(&record).await {
            Ok(()) => {}
            // Lost the race to another sync — same as "seen before".
            Err(e) if e.is_unique_violation() => {
                debug!(message_id = %msg.message_id, "Duplicate insert; already ingested");
                return Ok(GateResult::AlreadyExists);
            }
            Err(e) => return Err(e),
        }

        for attachment in &msg.attachments {
            let prefix = format!("inbox/{}/{}", inbox.id, record.id);
            let blob = match self
                .blobs
                .save(&attachment.bytes, &prefix, &attachment.filename)
                .await
            {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(
                        message_id = %msg.message_id,
                        filename = %attachment.filename,
                        error = %e,
                        "Attachment upload failed; skipping"
                    );
                    continue;
                }
            };
            let row = MessageAttachment {
                id: Uuid::new_v4().to_string(),
                inbox_message_id: record.id.clone(),
                filename: attachment.filename.clone(),
                mime_type: attachment.mime_type.clone(),
                size_bytes: blob.size_bytes,
                content_id: attachment.content_id.clone(),
                blob_key: blob.key,
            };
            if let Err(e) = self.db.insert_message_attachment(&row).await {
                warn!(
                    message_id = %msg.message_id,
                    filename = %attachment.filename,
                    error = %e,
                    "Attachment record failed; skipping"
                );
            }
        }

        Ok(GateResult::Persisted(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{LocalBlobStore, StoredBlob};
    use crate::error::BlobError;
    use crate::message::model::{AttachmentData, MailAddr};
    use crate::store::LibSqlBackend;
    use crate::tasks::model::TaskPriority;

    fn normalized(message_id: &str) -> NormalizedMessage {
        NormalizedMessage {
            message_id: message_id.into(),
            in_reply_to: None,
            references: vec![],
            subject: "Report".into(),
            from: MailAddr::with_name("alice@ex.com", "Alice"),
            to: vec![MailAddr::new("support@tool.example")],
            cc: vec![],
            bcc: vec![],
            text: "body".into(),
            text_signature: None,
            html: None,
            html_signature: None,
            date: Utc::now(),
            headers: serde_json::json!({}),
            attachments: vec![],
        }
    }

    fn inbox() -> Inbox {
        Inbox {
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
        }
    }

    async fn seeded_db() -> Arc<dyn Database> {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_project(&crate::tasks::model::Project {
            id: "proj-1".into(),
            organization_id: None,
            workspace_id: None,
            name: "Ops".into(),
            key: "OPS".into(),
        })
        .await
        .unwrap();
        db.insert_inbox(&inbox()).await.unwrap();
        Arc::new(db)
    }

    fn local_gate(db: Arc<dyn Database>, dir: &tempfile::TempDir) -> IngestionGate {
        IngestionGate::new(db, Arc::new(LocalBlobStore::new(dir.path())))
    }

    #[tokio::test]
    async fn first_sight_persists_with_pending_status() {
        let db = seeded_db().await;
        let dir = tempfile::tempdir().unwrap();
        let gate = local_gate(Arc::clone(&db), &dir);

        let result = gate
            .persist_if_new(&inbox(), &normalized("m1@ex.com"), "m1@ex.com", Some(7))
            .await
            .unwrap();
        let GateResult::Persisted(record) = result else {
            panic!("expected persisted");
        };
        assert_eq!(record.status, MessageStatus::Pending);
        assert_eq!(record.thread_id, "m1@ex.com");
        assert_eq!(record.imap_uid, Some(7));

        let stored = db
            .get_message_by_message_id("m1@ex.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.from_email, "alice@ex.com");
    }

    #[tokio::test]
    async fn second_sight_reports_already_exists() {
        let db = seeded_db().await;
        let dir = tempfile::tempdir().unwrap();
        let gate = local_gate(Arc::clone(&db), &dir);

        let msg = normalized("m1@ex.com");
        gate.persist_if_new(&inbox(), &msg, "m1@ex.com", None)
            .await
            .unwrap();
        let second = gate
            .persist_if_new(&inbox(), &msg, "m1@ex.com", None)
            .await
            .unwrap();
        assert!(matches!(second, GateResult::AlreadyExists));
    }

    #[tokio::test]
    async fn attachments_are_uploaded_and_recorded() {
        let db = seeded_db().await;
        let dir = tempfile::tempdir().unwrap();
        let gate = local_gate(Arc::clone(&db), &dir);

        let mut msg = normalized("m2@ex.com");
        msg.attachments = vec![AttachmentData {
            filename: "log.txt".into(),
            mime_type: "text/plain".into(),
            content_id: None,
            bytes: b"boom".to_vec(),
        }];

        let GateResult::Persisted(record) = gate
            .persist_if_new(&inbox(), &msg, "m2@ex.com", None)
            .await
            .unwrap()
        else {
            panic!("expected persisted");
        };
        assert!(record.has_attachments);

        let attachments = db.list_message_attachments(&record.id).await.unwrap();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].filename, "log.txt");
        assert_eq!(attachments[0].size_bytes, 4);
    }

    struct FailingBlobStore;

    #[async_trait::async_trait]
    impl BlobStore for FailingBlobStore {
        async fn save(
            &self,
            _data: &[u8],
            _path_prefix: &str,
            filename: &str,
        ) -> Result<StoredBlob, BlobError> {
            Err(BlobError::Upload {
                name: filename.to_string(),
                reason: "store offline".into(),
            })
        }

        fn resolve_url(&self, key: &str) -> String {
            key.to_string()
        }
    }

    #[tokio::test]
    async fn failed_attachment_upload_never_aborts_ingestion() {
        let db = seeded_db().await;
        let gate = IngestionGate::new(Arc::clone(&db), Arc::new(FailingBlobStore));

        let mut msg = normalized("m3@ex.com");
        msg.attachments = vec![AttachmentData {
            filename: "huge.bin".into(),
            mime_type: "application/octet-stream".into(),
            content_id: None,
            bytes: vec![0; 16],
        }];

        let result = gate
            .persist_if_new(&inbox(), &msg, "m3@ex.com", None)
            .await
            .unwrap();
        let GateResult::Persisted(record) = result else {
            panic!("expected persisted");
        };
        assert!(db.list_message_attachments(&record.id).await.unwrap().is_empty());
        // The message itself is durably ingested.
        assert!(
            db.get_message_by_message_id("m3@ex.com")
                .await
                .unwrap()
                .is_some()
        );
    }
}
