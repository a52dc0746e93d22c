//! Rule evaluation — ordered condition trees producing a [`RuleOutcome`].

use std::sync::Arc;

use regex::RegexBuilder;
use tracing::{debug, warn};

use crate::error::RuleError;
use crate::inbox::{Inbox, MailAccount};
use crate::mail::smtp::reply_subject;
use crate::mail::{MailCredentials, Mailer, OutgoingReply, SmtpEndpoint};
use crate::message::model::InboxMessage;
use crate::rules::model::{Rule, RuleCondition, RuleField, RuleOp, RuleOutcome};

/// Connection context the auto-reply action reuses.
pub struct RuleContext<'a> {
    pub account: &'a MailAccount,
    pub inbox: &'a Inbox,
    pub credentials: &'a MailCredentials,
}

/// Evaluates an inbox's rules against persisted messages.
pub struct RuleEngine {
    mailer: Arc<dyn Mailer>,
}

impl RuleEngine {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }

    /// Evaluate rules in priority order (descending, ties by creation time)
    /// and return the accumulated outcome.
    ///
    /// Every matching rule applies its actions; a matching rule with
    /// `stop_on_match` halts evaluation after its own actions run. Rule
    /// errors are logged and skipped — one broken pattern never blocks the
    /// rest of the inbox's rules.
    pub async fn apply(
        &self,
        message: &InboxMessage,
        rules: &[Rule],
        ctx: &RuleContext<'_>,
    ) -> RuleOutcome {
        let mut ordered: Vec<&Rule> = rules.iter().filter(|r| r.enabled).collect();
        ordered.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut outcome = RuleOutcome::default();
        for rule in ordered {
            match eval_condition(&rule.conditions, message) {
                Ok(true) => {
                    debug!(rule = %rule.name, message_id = %message.message_id, "Rule matched");
                    outcome.matched.push(rule.name.clone());
                    self.apply_actions(rule, message, ctx, &mut outcome).await;
                    if rule.stop_on_match {
                        break;
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(rule = %rule.name, error = %e, "Rule evaluation failed; continuing");
                }
            }
        }
        outcome
    }

    async fn apply_actions(
        &self,
        rule: &Rule,
        message: &InboxMessage,
        ctx: &RuleContext<'_>,
        outcome: &mut RuleOutcome,
    ) {
        let actions = &rule.actions;
        if let Some(priority) = actions.set_priority {
            outcome.priority = Some(priority);
        }
        if let Some(assignee) = &actions.assign_to {
            outcome.assignee = Some(assignee.clone());
        }
        for label in &actions.add_labels {
            if !outcome.labels.contains(label) {
                outcome.labels.push(label.clone());
            }
        }
        if actions.mark_as_spam {
            outcome.spam = true;
        }
        if let Some(template) = &actions.auto_reply
            && let Err(e) = self.send_auto_reply(rule, template, message, ctx).await
        {
            warn!(rule = %rule.name, error = %e, "Auto-reply failed; continuing");
        }
    }

    /// Immediate templated reply over the sync's SMTP identity.
    async fn send_auto_reply(
        &self,
        rule: &Rule,
        template: &str,
        message: &InboxMessage,
        ctx: &RuleContext<'_>,
    ) -> Result<(), RuleError> {
        let template = if template.is_empty() {
            ctx.inbox.auto_reply_template.as_deref().unwrap_or("")
        } else {
            template
        };
        if template.is_empty() {
            warn!(rule = %rule.name, "Auto-reply requested but no template configured");
            return Ok(());
        }

        let mut body = render_template(template, message);
        if let Some(signature) = &ctx.inbox.signature {
            body.push_str("\n\n");
            body.push_str(signature);
        }

        let reply = OutgoingReply {
            to: message.from_email.clone(),
            subject: reply_subject(&message.subject),
            body,
            in_reply_to: message.message_id.clone(),
        };

        self.mailer
            .send_reply(
                &SmtpEndpoint::of(ctx.account),
                ctx.credentials,
                &ctx.account.username,
                &reply,
            )
            .await
            .map_err(|e| RuleError::ActionFailed {
                rule: rule.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// Substitute `{{subject}}` and `{{sender}}` placeholders.
fn render_template(template: &str, message: &InboxMessage) -> String {
    template
        .replace("{{subject}}", &message.subject)
        .replace(
            "{{sender}}",
            message.from_name.as_deref().unwrap_or(&message.from_email),
        )
}

/// Evaluate a condition tree against a message.
///
/// `any` short-circuits on the first true branch, `all` on the first false
/// one. A predicate with multiple operators requires all of them; fields
/// holding address lists match when any element does.
pub fn eval_condition(cond: &RuleCondition, message: &InboxMessage) -> Result<bool, RuleError> {
    match cond {
        RuleCondition::Any { any } => {
            for branch in any {
                if eval_condition(branch, message)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        RuleCondition::All { all } => {
            for branch in all {
                if !eval_condition(branch, message)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        RuleCondition::Predicate(pred) => {
            if pred.is_empty() {
                return Err(RuleError::InvalidCondition("empty predicate".into()));
            }
            for (field, ops) in pred {
                let values = field_values(message, *field);
                for (op, expected) in ops {
                    let mut matched = false;
                    for value in &values {
                        if match_op(*op, value, expected)? {
                            matched = true;
                            break;
                        }
                    }
                    if !matched {
                        return Ok(false);
                    }
                }
            }
            Ok(true)
        }
    }
}

fn field_values(message: &InboxMessage, field: RuleField) -> Vec<&str> {
    match field {
        RuleField::From => vec![message.from_email.as_str()],
        RuleField::Subject => vec![message.subject.as_str()],
        RuleField::Body => vec![message.text_body.as_str()],
        RuleField::To => message.to.iter().map(String::as_str).collect(),
        RuleField::Cc => message.cc.iter().map(String::as_str).collect(),
    }
}

fn match_op(op: RuleOp, value: &str, expected: &str) -> Result<bool, RuleError> {
    // All operators compare case-insensitively; `matches` compiles the
    // pattern with the case-insensitive flag instead of lowercasing.
    let value_lower = value.to_lowercase();
    let expected_lower = expected.to_lowercase();
    Ok(match op {
        RuleOp::Contains => value_lower.contains(&expected_lower),
        RuleOp::Equals => value_lower == expected_lower,
        RuleOp::StartsWith => value_lower.starts_with(&expected_lower),
        RuleOp::EndsWith => value_lower.ends_with(&expected_lower),
        RuleOp::Matches => RegexBuilder::new(expected)
            .case_insensitive(true)
            .build()
            .map_err(|e| RuleError::InvalidPattern {
                pattern: expected.to_string(),
                reason: e.to_string(),
            })?
            .is_match(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::model::MessageStatus;
    use crate::rules::model::RuleActions;
    use crate::tasks::model::TaskPriority;
    use chrono::Utc;

    fn message(from: &str, subject: &str, body: &str) -> InboxMessage {
        InboxMessage {
            id: "row-1".into(),
            inbox_id: "inbox-1".into(),
            message_id: "m1@ex.com".into(),
            imap_uid: Some(1),
            thread_id: "m1@ex.com".into(),
            in_reply_to: None,
            references: vec![],
            subject: subject.into(),
            from_email: from.into(),
            from_name: None,
            to: vec!["support@tool.example".into()],
            cc: vec![],
            bcc: vec![],
            text_body: body.into(),
            text_signature: None,
            html_body: None,
            html_signature: None,
            headers: serde_json::Value::Null,
            has_attachments: false,
            status: MessageStatus::Pending,
            received_at: Utc::now(),
            converted_at: None,
            task_id: None,
            created_at: Utc::now(),
        }
    }

    fn rule(name: &str, priority: i64, conditions: RuleCondition, actions: RuleActions) -> Rule {
        Rule {
            id: format!("rule-{name}"),
            inbox_id: "inbox-1".into(),
            name: name.into(),
            priority,
            conditions,
            actions,
            stop_on_match: false,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    fn context_fixtures() -> (MailAccount, Inbox) {
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
            secret: "enc".into(),
            folder: "INBOX".into(),
            sync_enabled: true,
            last_sync_at: None,
            last_sync_error: None,
        };
        let inbox = Inbox {
            id: "inbox-1".into(),
            project_id: "proj-1".into(),
            auto_create_tasks: true,
            default_task_type: "TASK".into(),
            default_priority: TaskPriority::Medium,
            default_status: "TODO".into(),
            default_assignee: None,
            sync_interval_minutes: 5,
            auto_reply_enabled: true,
            auto_reply_template: Some("We received {{subject}}".into()),
            signature: None,
        };
        (account, inbox)
    }

    struct RecordingMailer {
        sent: tokio::sync::Mutex<Vec<OutgoingReply>>,
    }

    #[async_trait::async_trait]
    impl Mailer for RecordingMailer {
        async fn send_reply(
            &self,
            _endpoint: &SmtpEndpoint,
            _credentials: &MailCredentials,
            _from: &str,
            reply: &OutgoingReply,
        ) -> Result<(), crate::error::MailError> {
            self.sent.lock().await.push(reply.clone());
            Ok(())
        }
    }

    async fn run_rules(message: &InboxMessage, rules: &[Rule]) -> (RuleOutcome, Vec<OutgoingReply>) {
        let mailer = Arc::new(RecordingMailer {
            sent: tokio::sync::Mutex::new(Vec::new()),
        });
        let engine = RuleEngine::new(Arc::clone(&mailer) as Arc<dyn Mailer>);
        let (account, inbox) = context_fixtures();
        let credentials = MailCredentials {
            username: account.username.clone(),
            password: secrecy::SecretString::from("pw".to_string()),
        };
        let ctx = RuleContext {
            account: &account,
            inbox: &inbox,
            credentials: &credentials,
        };
        let outcome = engine.apply(message, rules, &ctx).await;
        let sent = mailer.sent.lock().await.clone();
        (outcome, sent)
    }

    #[tokio::test]
    async fn urgent_subject_sets_priority() {
        let rules = vec![Rule {
            stop_on_match: true,
            ..rule(
                "urgent",
                10,
                RuleCondition::All {
                    all: vec![RuleCondition::field(
                        RuleField::Subject,
                        RuleOp::Contains,
                        "urgent",
                    )],
                },
                RuleActions {
                    set_priority: Some(TaskPriority::Highest),
                    ..Default::default()
                },
            )
        }];
        let msg = message("a@ex.com", "Urgent: server down", "prod is down");
        let (outcome, _) = run_rules(&msg, &rules).await;
        assert_eq!(outcome.priority, Some(TaskPriority::Highest));
        assert_eq!(outcome.matched, vec!["urgent"]);
    }

    #[tokio::test]
    async fn stop_on_match_halts_lower_priority_rules() {
        let high = Rule {
            stop_on_match: true,
            ..rule(
                "high",
                10,
                RuleCondition::field(RuleField::Subject, RuleOp::Contains, "report"),
                RuleActions {
                    set_priority: Some(TaskPriority::High),
                    ..Default::default()
                },
            )
        };
        let low = rule(
            "low",
            5,
            RuleCondition::field(RuleField::Subject, RuleOp::Contains, "report"),
            RuleActions {
                set_priority: Some(TaskPriority::Low),
                add_labels: vec!["late".into()],
                ..Default::default()
            },
        );
        let msg = message("a@ex.com", "Bug report", "details");
        let (outcome, _) = run_rules(&msg, &[low, high]).await;
        // Only the priority-10 rule ran.
        assert_eq!(outcome.priority, Some(TaskPriority::High));
        assert!(outcome.labels.is_empty());
        assert_eq!(outcome.matched, vec!["high"]);
    }

    #[tokio::test]
    async fn matching_rules_accumulate_without_stop() {
        let first = rule(
            "labeler",
            10,
            RuleCondition::field(RuleField::From, RuleOp::EndsWith, "@ex.com"),
            RuleActions {
                add_labels: vec!["email".into()],
                ..Default::default()
            },
        );
        let second = rule(
            "assigner",
            5,
            RuleCondition::field(RuleField::Body, RuleOp::Contains, "invoice"),
            RuleActions {
                assign_to: Some("user-7".into()),
                ..Default::default()
            },
        );
        let msg = message("billing@ex.com", "Invoice 42", "your invoice is attached");
        let (outcome, _) = run_rules(&msg, &[first, second]).await;
        assert_eq!(outcome.labels, vec!["email"]);
        assert_eq!(outcome.assignee.as_deref(), Some("user-7"));
        assert_eq!(outcome.matched, vec!["labeler", "assigner"]);
    }

    #[tokio::test]
    async fn regex_match_is_case_insensitive() {
        let rules = vec![rule(
            "sev",
            1,
            RuleCondition::field(RuleField::Subject, RuleOp::Matches, r"sev[01]\b"),
            RuleActions {
                set_priority: Some(TaskPriority::Highest),
                ..Default::default()
            },
        )];
        let msg = message("a@ex.com", "SEV0: database unreachable", "help");
        let (outcome, _) = run_rules(&msg, &rules).await;
        assert_eq!(outcome.priority, Some(TaskPriority::Highest));
    }

    #[tokio::test]
    async fn invalid_regex_skips_rule_and_continues() {
        let broken = rule(
            "broken",
            10,
            RuleCondition::field(RuleField::Subject, RuleOp::Matches, "(unclosed"),
            RuleActions {
                set_priority: Some(TaskPriority::Highest),
                ..Default::default()
            },
        );
        let working = rule(
            "working",
            5,
            RuleCondition::field(RuleField::Subject, RuleOp::Contains, "hello"),
            RuleActions {
                add_labels: vec!["ok".into()],
                ..Default::default()
            },
        );
        let msg = message("a@ex.com", "hello there", "body");
        let (outcome, _) = run_rules(&msg, &[broken, working]).await;
        assert_eq!(outcome.labels, vec!["ok"]);
        assert_eq!(outcome.matched, vec!["working"]);
    }

    #[tokio::test]
    async fn spam_rule_flags_outcome() {
        let rules = vec![rule(
            "spam",
            1,
            RuleCondition::field(RuleField::From, RuleOp::EndsWith, "@spam.example"),
            RuleActions {
                mark_as_spam: true,
                ..Default::default()
            },
        )];
        let msg = message("promo@spam.example", "Buy now", "deals");
        let (outcome, _) = run_rules(&msg, &rules).await;
        assert!(outcome.spam);
    }

    #[tokio::test]
    async fn auto_reply_sends_templated_message() {
        let rules = vec![rule(
            "ack",
            1,
            RuleCondition::field(RuleField::To, RuleOp::Equals, "support@tool.example"),
            RuleActions {
                auto_reply: Some("Thanks for {{subject}}, {{sender}}".into()),
                ..Default::default()
            },
        )];
        let msg = message("alice@ex.com", "Printer on fire", "literally");
        let (_, sent) = run_rules(&msg, &rules).await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "alice@ex.com");
        assert_eq!(sent[0].subject, "Re: Printer on fire");
        assert_eq!(sent[0].body, "Thanks for Printer on fire, alice@ex.com");
        assert_eq!(sent[0].in_reply_to, "m1@ex.com");
    }

    #[tokio::test]
    async fn empty_auto_reply_template_falls_back_to_inbox() {
        let rules = vec![rule(
            "ack",
            1,
            RuleCondition::field(RuleField::Subject, RuleOp::StartsWith, "help"),
            RuleActions {
                auto_reply: Some(String::new()),
                ..Default::default()
            },
        )];
        let msg = message("bob@ex.com", "help please", "stuck");
        let (_, sent) = run_rules(&msg, &rules).await;
        assert_eq!(sent.len(), 1);
        // Inbox template from the fixture.
        assert_eq!(sent[0].body, "We received help please");
    }

    #[tokio::test]
    async fn disabled_rules_are_skipped() {
        let mut r = rule(
            "disabled",
            1,
            RuleCondition::field(RuleField::Subject, RuleOp::Contains, "hello"),
            RuleActions {
                mark_as_spam: true,
                ..Default::default()
            },
        );
        r.enabled = false;
        let msg = message("a@ex.com", "hello", "body");
        let (outcome, _) = run_rules(&msg, &[r]).await;
        assert!(outcome.is_empty());
    }

    #[test]
    fn any_branch_short_circuits() {
        let cond = RuleCondition::Any {
            any: vec![
                RuleCondition::field(RuleField::From, RuleOp::Equals, "nobody@ex.com"),
                RuleCondition::field(RuleField::Subject, RuleOp::Contains, "question"),
            ],
        };
        let msg = message("alice@ex.com", "A question about billing", "hi");
        assert!(eval_condition(&cond, &msg).unwrap());
    }

    #[test]
    fn all_branch_requires_every_condition() {
        let cond = RuleCondition::All {
            all: vec![
                RuleCondition::field(RuleField::From, RuleOp::EndsWith, "@ex.com"),
                RuleCondition::field(RuleField::Subject, RuleOp::Contains, "missing-word"),
            ],
        };
        let msg = message("alice@ex.com", "A question", "hi");
        assert!(!eval_condition(&cond, &msg).unwrap());
    }

    #[test]
    fn list_fields_match_any_element() {
        let cond = RuleCondition::field(RuleField::To, RuleOp::Contains, "support@");
        let msg = message("a@ex.com", "s", "b");
        assert!(eval_condition(&cond, &msg).unwrap());
    }
}
