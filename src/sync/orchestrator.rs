//! Sync orchestration — one account, one connection, strictly ordered
//! message processing.
//!
//! Messages process oldest-first and sequentially: a parent email must be
//! committed before any same-batch reply that references it. Across
//! accounts, syncs run independently; the message-id UNIQUE index is the
//! only cross-sync coordination point.

use std::sync::Arc;

use chrono::Utc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::blob::BlobStore;
use crate::config::CredentialCipher;
use crate::error::SyncError;
use crate::inbox::{Inbox, MailAccount};
use crate::ingest::{GateResult, IngestionGate};
use crate::mail::{ImapEndpoint, MailClient, MailCredentials, Mailer};
use crate::message::model::NormalizedMessage;
use crate::message::{normalize_message, resolve_thread_id};
use crate::rules::model::Rule;
use crate::rules::{RuleContext, RuleEngine};
use crate::store::Database;
use crate::sync::{SyncReport, SyncRun, SyncStatus, SyncTrigger};
use crate::tasks::{MaterializeResult, Materializer};

/// Drives one account through a full fetch-and-ingest cycle.
pub struct SyncOrchestrator {
    db: Arc<dyn Database>,
    mail: Arc<dyn MailClient>,
    cipher: Arc<dyn CredentialCipher>,
    gate: IngestionGate,
    rules: RuleEngine,
    materializer: Materializer,
}

impl SyncOrchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        mail: Arc<dyn MailClient>,
        mailer: Arc<dyn Mailer>,
        blobs: Arc<dyn BlobStore>,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Self {
        Self {
            gate: IngestionGate::new(Arc::clone(&db), blobs),
            rules: RuleEngine::new(mailer),
            materializer: Materializer::new(Arc::clone(&db)),
            db,
            mail,
            cipher,
        }
    }

    /// Run one sync for an account, recording the outcome in the sync log
    /// and on the account row.
    ///
    /// A connection-class failure aborts before any message is processed;
    /// the stored error string plus the FAILED run row are the only
    /// user-visible surface, and the next tick is the retry mechanism.
    pub async fn sync_account(
        &self,
        account: &MailAccount,
        trigger: SyncTrigger,
    ) -> Result<SyncReport, SyncError> {
        let started = Utc::now();
        let run = SyncRun::started(&account.id, trigger, started);
        self.db.insert_sync_run(&run).await?;

        let span = info_span!("sync", account_id = %account.id, run_id = %run.id);
        let result = self.run_inner(account).instrument(span).await;

        match &result {
            Ok(report) => {
                self.db
                    .finish_sync_run(&run.id, SyncStatus::Success, Utc::now(), report, None)
                    .await?;
                // Checkpoint at sync start so mail arriving mid-sync is
                // still covered by the next SINCE window.
                self.db
                    .update_account_sync_state(&account.id, started, None)
                    .await?;
            }
            Err(e) => {
                let text = e.to_string();
                if let Err(log_err) = self
                    .db
                    .finish_sync_run(
                        &run.id,
                        SyncStatus::Failed,
                        Utc::now(),
                        &SyncReport::default(),
                        Some(&text),
                    )
                    .await
                {
                    error!(error = %log_err, "Could not record failed sync run");
                }
                if let Err(log_err) = self
                    .db
                    .update_account_sync_state(&account.id, started, Some(&text))
                    .await
                {
                    error!(error = %log_err, "Could not record account sync error");
                }
            }
        }
        result
    }

    async fn run_inner(&self, account: &MailAccount) -> Result<SyncReport, SyncError> {
        let inbox = self.db.get_inbox(&account.inbox_id).await?.ok_or_else(|| {
            SyncError::InboxNotFound {
                account_id: account.id.clone(),
                inbox_id: account.inbox_id.clone(),
            }
        })?;

        let credentials = MailCredentials {
            username: account.username.clone(),
            password: self.cipher.decrypt(&account.secret)?,
        };
        let endpoint = ImapEndpoint::of(account);

        info!(host = %account.imap_host, folder = %account.folder, "Connecting");
        let raw = self
            .mail
            .fetch_since(&endpoint, &credentials, account.last_sync_at)
            .await?;
        info!(fetched = raw.len(), "Fetched");

        let mut report = SyncReport {
            fetched: raw.len(),
            ..Default::default()
        };

        // Normalize up front; a single malformed message is skipped, the
        // rest of the batch proceeds.
        let mut batch: Vec<(u32, NormalizedMessage)> = Vec::with_capacity(raw.len());
        for raw_msg in &raw {
            match normalize_message(&raw_msg.source) {
                Ok(msg) => batch.push((raw_msg.uid, msg)),
                Err(e) => {
                    warn!(uid = raw_msg.uid, error = %e, "Skipping unparseable message");
                    report.failed_messages += 1;
                }
            }
        }
        batch.sort_by_key(|(_, msg)| msg.date);

        let rules = self.db.list_rules(&inbox.id).await?;
        let mut processed_uids = Vec::with_capacity(batch.len());
        for (uid, msg) in &batch {
            if let Err(e) = self
                .process_message(account, &inbox, &rules, &credentials, *uid, msg, &mut report)
                .await
            {
                error!(
                    message_id = %msg.message_id,
                    error = %e,
                    "Message processing failed; continuing with batch"
                );
                report.failed_messages += 1;
            }
            processed_uids.push(*uid);
        }
        info!(
            ingested = report.ingested,
            tasks = report.tasks_created,
            comments = report.comments_created,
            duplicates = report.duplicates,
            "Synced"
        );

        // Messages are durably converted by now; flag state is cleanup.
        if let Err(e) = self
            .mail
            .mark_read(&endpoint, &credentials, &processed_uids)
            .await
        {
            warn!(error = %e, "Failed to mark messages read");
        }

        Ok(report)
    }

    async fn process_message(
        &self,
        account: &MailAccount,
        inbox: &Inbox,
        rules: &[Rule],
        credentials: &MailCredentials,
        uid: u32,
        msg: &NormalizedMessage,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let thread_id = resolve_thread_id(msg);
        debug!(message_id = %msg.message_id, thread_id = %thread_id, "Threaded");

        let record = match self
            .gate
            .persist_if_new(inbox, msg, &thread_id, Some(uid))
            .await?
        {
            GateResult::Persisted(record) => record,
            GateResult::AlreadyExists => {
                report.duplicates += 1;
                return Ok(());
            }
        };
        report.ingested += 1;

        let ctx = RuleContext {
            account,
            inbox,
            credentials,
        };
        let outcome = self.rules.apply(&record, rules, &ctx).await;
        if outcome.spam {
            self.db.mark_message_ignored(&record.id).await?;
            report.ignored += 1;
            return Ok(());
        }

        if !inbox.auto_create_tasks {
            return Ok(());
        }
        match self.materializer.materialize(&record, inbox, &outcome).await? {
            MaterializeResult::TaskCreated { .. } => report.tasks_created += 1,
            MaterializeResult::CommentAppended { .. } => report.comments_created += 1,
            MaterializeResult::Skipped => {}
        }
        Ok(())
    }
}
