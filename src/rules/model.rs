//! Rule records — condition trees, action maps, and the evaluation outcome.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tasks::model::TaskPriority;

/// Message fields a predicate can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleField {
    From,
    Subject,
    Body,
    To,
    Cc,
}

/// Predicate operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleOp {
    Contains,
    Equals,
    /// Case-insensitive regular expression.
    Matches,
    StartsWith,
    EndsWith,
}

/// A single field→operator→value leaf, e.g. `{"subject":{"contains":"urgent"}}`.
pub type Predicate = BTreeMap<RuleField, BTreeMap<RuleOp, String>>;

/// A condition tree: OR branch, AND branch, or a leaf predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RuleCondition {
    Any { any: Vec<RuleCondition> },
    All { all: Vec<RuleCondition> },
    Predicate(Predicate),
}

impl RuleCondition {
    /// Convenience constructor for a single-field predicate.
    pub fn field(field: RuleField, op: RuleOp, value: impl Into<String>) -> Self {
        let mut ops = BTreeMap::new();
        ops.insert(op, value.into());
        let mut fields = BTreeMap::new();
        fields.insert(field, ops);
        Self::Predicate(fields)
    }
}

/// Side-effect directives attached to a rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuleActions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assign_to: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set_priority: Option<TaskPriority>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub mark_as_spam: bool,
    /// Reply template; an empty string falls back to the inbox template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reply: Option<String>,
}

/// A stored rule, ordered by priority (descending) then creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub inbox_id: String,
    pub name: String,
    pub priority: i64,
    pub conditions: RuleCondition,
    pub actions: RuleActions,
    /// Halts evaluation of lower-priority rules once this rule matches.
    pub stop_on_match: bool,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Immutable result of evaluating an inbox's rules against one message.
///
/// Threaded into the materializer as a parameter; rules never mutate the
/// persisted message beyond the spam transition applied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleOutcome {
    pub priority: Option<TaskPriority>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    pub spam: bool,
    /// Names of the rules that matched, in evaluation order.
    pub matched: Vec<String>,
}

impl RuleOutcome {
    pub fn is_empty(&self) -> bool {
        self.priority.is_none()
            && self.assignee.is_none()
            && self.labels.is_empty()
            && !self.spam
            && self.matched.is_empty()
    }
}
