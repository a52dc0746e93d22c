//! Thread resolution — a stable conversation id independent of arrival order.
//!
//! The id is the conversation *root*, not the immediate parent: replies from
//! different clients, arriving in any order, must all land on the same task.

use rand::Rng;

use crate::message::model::NormalizedMessage;

/// Resolve the conversation id for a normalized message.
///
/// Priority, strictly in this order:
/// 1. the first entry of the normalized references list (RFC 5322 orders it
///    oldest first, so this is the root of the conversation);
/// 2. `in_reply_to`, for direct replies whose client omitted the chain;
/// 3. the message's own message-id (the message starts a thread);
/// 4. a generated id, for malformed mail carrying no identifier at all.
pub fn resolve_thread_id(msg: &NormalizedMessage) -> String {
    if let Some(root) = msg.references.first() {
        return root.clone();
    }
    if let Some(parent) = msg.in_reply_to.as_deref()
        && !parent.is_empty()
    {
        return parent.to_string();
    }
    if !msg.message_id.is_empty() {
        return msg.message_id.clone();
    }
    generated_thread_id()
}

/// Fallback id for messages with no usable identifier.
pub fn generated_thread_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(9)
        .map(char::from)
        .collect();
    format!("{}-{}", chrono::Utc::now().timestamp_millis(), suffix)
}

/// Flatten raw reference entries into a clean, ordered id list.
///
/// Accepts entries that are single ids or whitespace-joined runs of ids
/// (clients disagree on how they fold the References header), strips angle
/// brackets, and discards empties. Order is preserved.
pub fn normalize_references(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split_whitespace())
        .map(clean_message_id)
        .filter(|id| !id.is_empty())
        .collect()
}

/// Strip angle brackets and surrounding whitespace from a message-id token.
pub fn clean_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::model::MailAddr;

    fn message(
        message_id: &str,
        in_reply_to: Option<&str>,
        references: &[&str],
    ) -> NormalizedMessage {
        NormalizedMessage {
            message_id: message_id.to_string(),
            in_reply_to: in_reply_to.map(String::from),
            references: references.iter().map(|s| s.to_string()).collect(),
            subject: "test".into(),
            from: MailAddr::new("a@example.com"),
            to: vec![],
            cc: vec![],
            bcc: vec![],
            text: String::new(),
            text_signature: None,
            html: None,
            html_signature: None,
            date: chrono::Utc::now(),
            headers: serde_json::Value::Null,
            attachments: vec![],
        }
    }

    #[test]
    fn references_root_wins_over_everything() {
        let msg = message("m3", Some("m2"), &["m1", "m2"]);
        assert_eq!(resolve_thread_id(&msg), "m1");
    }

    #[test]
    fn in_reply_to_wins_when_references_empty() {
        let msg = message("m2", Some("m1"), &[]);
        assert_eq!(resolve_thread_id(&msg), "m1");
    }

    #[test]
    fn own_message_id_for_thread_roots() {
        let msg = message("m1", None, &[]);
        assert_eq!(resolve_thread_id(&msg), "m1");
    }

    #[test]
    fn generated_id_for_malformed_mail() {
        let msg = message("", None, &[]);
        let id = resolve_thread_id(&msg);
        assert!(!id.is_empty());
        // timestamp-suffix shape
        assert!(id.contains('-'));
        // Two malformed messages must not collide into one thread.
        assert_ne!(id, resolve_thread_id(&msg));
    }

    #[test]
    fn empty_in_reply_to_falls_through() {
        let msg = message("m1", Some(""), &[]);
        assert_eq!(resolve_thread_id(&msg), "m1");
    }

    #[test]
    fn normalize_splits_whitespace_joined_entries() {
        let raw = vec!["<m1@x> <m2@x>".to_string(), "<m3@x>".to_string()];
        assert_eq!(normalize_references(&raw), vec!["m1@x", "m2@x", "m3@x"]);
    }

    #[test]
    fn normalize_discards_empty_entries() {
        let raw = vec!["".to_string(), "  ".to_string(), "<m1@x>".to_string()];
        assert_eq!(normalize_references(&raw), vec!["m1@x"]);
    }

    #[test]
    fn clean_message_id_strips_brackets() {
        assert_eq!(clean_message_id(" <abc@example.com> "), "abc@example.com");
        assert_eq!(clean_message_id("abc@example.com"), "abc@example.com");
    }
}
