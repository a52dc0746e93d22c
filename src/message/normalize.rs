//! Message normalization — raw RFC 822 source to [`NormalizedMessage`].
//!
//! Pure transformation, no I/O. Given identical input the output is
//! identical, except for the generated id a message receives when it
//! carries no Message-ID at all.

use std::sync::LazyLock;

use mail_parser::{HeaderValue, MessageParser, MimeHeaders};
use regex::Regex;
use uuid::Uuid;

use crate::error::MailError;
use crate::message::model::{AttachmentData, MailAddr, NormalizedMessage};
use crate::message::signature::{extract_html_signature, extract_signature};
use crate::message::thread::{clean_message_id, normalize_references};

/// Parse and normalize one raw message.
pub fn normalize_message(raw: &[u8]) -> Result<NormalizedMessage, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse("unparseable MIME structure".into()))?;

    let message_id = parsed
        .message_id()
        .map(clean_message_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let references = normalize_references(&header_id_tokens(parsed.header("References")));
    let in_reply_to = normalize_references(&header_id_tokens(parsed.header("In-Reply-To")))
        .into_iter()
        .next();

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();

    let from = extract_addr_list(parsed.from())
        .into_iter()
        .next()
        .unwrap_or_else(|| MailAddr::new("unknown"));
    let to = extract_addr_list(parsed.to());
    let cc = extract_addr_list(parsed.cc());
    let bcc = extract_addr_list(parsed.bcc());

    let date = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0))
        .unwrap_or(chrono::DateTime::UNIX_EPOCH);

    let raw_text = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .or_else(|| parsed.body_html(0).map(|h| strip_html(h.as_ref())))
        .unwrap_or_default();
    let text_split = extract_signature(&strip_quoted_text(&raw_text));

    let html_split = parsed
        .body_html(0)
        .map(|h| extract_html_signature(&strip_quoted_html(h.as_ref())));
    let (html, html_signature) = match html_split {
        Some(split) => (Some(split.body), split.signature),
        None => (None, None),
    };

    let attachments = extract_attachments(&parsed);

    let headers = serde_json::json!({
        "message_id": &message_id,
        "in_reply_to": &in_reply_to,
        "references": &references,
        "subject": &subject,
        "from": &from,
        "to": &to,
        "cc": &cc,
        "date": date.to_rfc3339(),
    });

    Ok(NormalizedMessage {
        message_id,
        in_reply_to,
        references,
        subject,
        from,
        to,
        cc,
        bcc,
        text: text_split.body,
        text_signature: text_split.signature,
        html,
        html_signature,
        date,
        headers,
        attachments,
    })
}

// ── Addresses ───────────────────────────────────────────────────────

/// Structured address extraction, keeping display names.
pub fn extract_addr_list(addr: Option<&mail_parser::Address>) -> Vec<MailAddr> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let from_entry = |a: &mail_parser::Addr| {
        a.address.as_ref().map(|email| MailAddr {
            email: email.to_string(),
            name: a
                .name
                .as_ref()
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
        })
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs.iter().filter_map(from_entry).collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(from_entry))
            .collect(),
    }
}

/// `Name <addr>` with the bracketed portion taken as the address.
static ANGLE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*"?([^"<>]*?)"?\s*<([^<>\s]+@[^<>\s]+)>\s*$"#).unwrap());

/// Bare `user@host` anywhere in the string.
static BARE_ADDR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+[A-Za-z0-9]").unwrap());

/// Two-pattern string-level address extraction, for headers that did not
/// parse into structured form.
pub fn parse_address(raw: &str) -> Option<MailAddr> {
    if let Some(caps) = ANGLE_ADDR.captures(raw) {
        let name = caps[1].trim().to_string();
        return Some(MailAddr {
            email: caps[2].to_string(),
            name: (!name.is_empty()).then_some(name),
        });
    }
    BARE_ADDR
        .find(raw)
        .map(|m| MailAddr::new(m.as_str().to_string()))
}

// ── Threading headers ───────────────────────────────────────────────

/// Raw id tokens from an id-valued header, whatever shape the parser
/// produced (single text, list, or absent).
fn header_id_tokens(value: Option<&HeaderValue>) -> Vec<String> {
    match value {
        Some(HeaderValue::Text(t)) => vec![t.to_string()],
        Some(HeaderValue::TextList(list)) => list.iter().map(|t| t.to_string()).collect(),
        _ => Vec::new(),
    }
}

// ── Quoted-reply stripping (text) ───────────────────────────────────

static QUOTE_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // "On Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:"
        Regex::new(r"(?i)^on\s.{0,200}wrote:\s*$").unwrap(),
        Regex::new(r"^-{2,}\s*Original Message\s*-{2,}").unwrap(),
        Regex::new(r"^From:\s").unwrap(),
        Regex::new(r"(?i)^-{2,}\s*Forwarded message\s*-{2,}").unwrap(),
        Regex::new(r"(?i)^begin forwarded message:").unwrap(),
        Regex::new(r"(?i)^sent from my (iphone|ipad|android|mobile)").unwrap(),
        // "2026-01-05 14:02 GMT+01:00 Alice <alice@ex.com>:"
        Regex::new(r"^\d{4}-\d{2}-\d{2}\s+\d{1,2}:\d{2}.*:\s*$").unwrap(),
    ]
});

/// Truncate a text body at the earliest quoted-history marker.
///
/// All marker patterns compete on offset; a `>`-quoted line earlier than
/// every regex match wins instead.
pub fn strip_quoted_text(body: &str) -> String {
    let mut marker_cut: Option<usize> = None;
    let mut quote_cut: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive('\n') {
        let content = line.trim_end_matches(['\r', '\n']);
        if quote_cut.is_none() && content.trim_start().starts_with('>') {
            quote_cut = Some(offset);
        }
        if marker_cut.is_none() && QUOTE_MARKERS.iter().any(|re| re.is_match(content)) {
            marker_cut = Some(offset);
        }
        if marker_cut.is_some() && quote_cut.is_some() {
            break;
        }
        offset += line.len();
    }

    let cut = match (marker_cut, quote_cut) {
        (Some(m), Some(q)) => Some(m.min(q)),
        (m, q) => m.or(q),
    };
    match cut {
        Some(pos) => body[..pos].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

// ── Quoted-reply stripping (HTML) ───────────────────────────────────

static HTML_QUOTE_CONTAINERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r#"(?i)<[^>]+class\s*=\s*["'][^"']*gmail_quote"#).unwrap(),
        Regex::new(r#"(?i)<[^>]+class\s*=\s*["'][^"']*gmail_attr"#).unwrap(),
        Regex::new(r#"(?i)<[^>]+(class|id)\s*=\s*["'][^"']*OutlookMessageHeader"#).unwrap(),
        Regex::new(r#"(?i)<[^>]+class\s*=\s*["'][^"']*yahoo_quoted"#).unwrap(),
        Regex::new(r#"(?i)<[^>]+type\s*=\s*["']cite["']"#).unwrap(),
    ]
});

static BLOCKQUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<blockquote\b[^>]*>.*</blockquote>").unwrap());
static OPEN_BLOCKQUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<blockquote\b").unwrap());
static HORIZONTAL_RULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<hr[^>]*>").unwrap());
static TRAILING_BREAKS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)(\s|<br\s*/?>|&nbsp;)+$").unwrap());

/// Remove quoted history from an HTML body.
///
/// Known quote containers truncate the document (clients append history at
/// the end); blockquotes and rules are removed wherever they sit. The
/// result may hold unbalanced tags — downstream rendering sanitizes.
pub fn strip_quoted_html(html: &str) -> String {
    let mut out = html.to_string();

    if let Some(pos) = HTML_QUOTE_CONTAINERS
        .iter()
        .filter_map(|re| re.find(&out).map(|m| m.start()))
        .min()
    {
        out.truncate(pos);
    }

    // Greedy match drops everything from the first blockquote through the
    // last close, which also swallows nested quoting in one pass.
    out = BLOCKQUOTE.replace_all(&out, "").into_owned();
    if let Some(m) = OPEN_BLOCKQUOTE.find(&out) {
        // Unclosed blockquote after truncation.
        out.truncate(m.start());
    }
    out = HORIZONTAL_RULE.replace_all(&out, "").into_owned();
    TRAILING_BREAKS.replace(&out, "").into_owned()
}

/// Strip HTML tags and collapse whitespace (fallback text for HTML-only mail).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ── Attachments ─────────────────────────────────────────────────────

fn extract_attachments(parsed: &mail_parser::Message) -> Vec<AttachmentData> {
    parsed
        .attachments()
        .map(|part| {
            let mime_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            AttachmentData {
                filename: part
                    .attachment_name()
                    .unwrap_or("attachment")
                    .to_string(),
                mime_type,
                content_id: part.content_id().map(clean_message_id),
                bytes: part.contents().to_vec(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Address extraction ──────────────────────────────────────────

    #[test]
    fn parse_address_angle_form() {
        let addr = parse_address("John Doe <john@example.com>").unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name.as_deref(), Some("John Doe"));
    }

    #[test]
    fn parse_address_quoted_angle_form() {
        let addr = parse_address(r#""Doe, John" <john@example.com>"#).unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(addr.name.as_deref(), Some("Doe, John"));
    }

    #[test]
    fn parse_address_bare_form() {
        let addr = parse_address("john@example.com").unwrap();
        assert_eq!(addr.email, "john@example.com");
        assert!(addr.name.is_none());
    }

    #[test]
    fn parse_address_rejects_garbage() {
        assert!(parse_address("not an address").is_none());
    }

    // ── Quote stripping (text) ──────────────────────────────────────

    #[test]
    fn strips_on_wrote_attribution() {
        let body = "Sounds good!\n\nOn Mon, Jan 1, 2026 at 10:00 AM Alice <alice@ex.com> wrote:\n> original";
        assert_eq!(strip_quoted_text(body), "Sounds good!");
    }

    #[test]
    fn strips_original_message_separator() {
        let body = "Reply here\n-----Original Message-----\nFrom: someone";
        assert_eq!(strip_quoted_text(body), "Reply here");
    }

    #[test]
    fn strips_from_header_line() {
        let body = "New content\nFrom: Bob <bob@ex.com>\nSent: yesterday";
        assert_eq!(strip_quoted_text(body), "New content");
    }

    #[test]
    fn strips_forwarded_message_marker() {
        let body = "FYI\n---------- Forwarded message ----------\nOld mail";
        assert_eq!(strip_quoted_text(body), "FYI");
    }

    #[test]
    fn strips_mobile_footer_marker() {
        let body = "Short answer\nSent from my iPhone";
        assert_eq!(strip_quoted_text(body), "Short answer");
    }

    #[test]
    fn strips_timestamp_quote_line() {
        let body = "Latest reply\n2026-01-05 14:02 GMT+01:00 Alice <alice@ex.com>:\n> old";
        assert_eq!(strip_quoted_text(body), "Latest reply");
    }

    #[test]
    fn earlier_quote_line_beats_marker() {
        let body = "Top\n> quoted already\nmore\nOn Mon someone wrote:\n> older";
        assert_eq!(strip_quoted_text(body), "Top");
    }

    #[test]
    fn plain_body_untouched() {
        let body = "Nothing quoted here\njust two lines";
        assert_eq!(strip_quoted_text(body), body);
    }

    // ── Quote stripping (HTML) ──────────────────────────────────────

    #[test]
    fn html_gmail_quote_container_truncates() {
        let html = r#"<div>Reply</div><div class="gmail_quote">old stuff</div>"#;
        let out = strip_quoted_html(html);
        assert!(out.contains("Reply"));
        assert!(!out.contains("old stuff"));
    }

    #[test]
    fn html_blockquote_removed() {
        let html = "<p>New</p><blockquote type=\"cite\"><p>old</p></blockquote><p>tail</p>";
        let out = strip_quoted_html(html);
        assert!(out.contains("New"));
        assert!(!out.contains("old"));
    }

    #[test]
    fn html_outlook_header_truncates() {
        let html = r#"<p>Answer</p><div id="OutlookMessageHeader">From: x</div><p>history</p>"#;
        let out = strip_quoted_html(html);
        assert_eq!(out, "<p>Answer</p>");
    }

    #[test]
    fn html_trailing_breaks_trimmed() {
        let html = "<p>Body</p><br><br/>&nbsp; \n";
        assert_eq!(strip_quoted_html(html), "<p>Body</p>");
    }

    #[test]
    fn html_hr_removed() {
        let html = "<p>Body</p><hr><p>after</p>";
        assert_eq!(strip_quoted_html(html), "<p>Body</p><p>after</p>");
    }

    // ── strip_html ──────────────────────────────────────────────────

    #[test]
    fn strip_html_collapses_whitespace() {
        assert_eq!(strip_html("<div><b>Bold</b>  and  plain</div>"), "Bold and plain");
    }

    // ── Full normalization ──────────────────────────────────────────

    fn raw_email(headers: &str, body: &str) -> Vec<u8> {
        format!("{headers}\n\n{body}").replace('\n', "\r\n").into_bytes()
    }

    #[test]
    fn normalizes_simple_message() {
        let raw = raw_email(
            "Message-ID: <m1@ex.com>\n\
             From: Alice Smith <alice@ex.com>\n\
             To: support@tool.example\n\
             Subject: Bug report\n\
             Date: Mon, 5 Jan 2026 10:00:00 +0000\n\
             Content-Type: text/plain",
            "The export button is broken.\n-- \nAlice Smith\nQA",
        );
        let msg = normalize_message(&raw).unwrap();
        assert_eq!(msg.message_id, "m1@ex.com");
        assert_eq!(msg.subject, "Bug report");
        assert_eq!(msg.from.email, "alice@ex.com");
        assert_eq!(msg.from.name.as_deref(), Some("Alice Smith"));
        assert_eq!(msg.to[0].email, "support@tool.example");
        assert_eq!(msg.text, "The export button is broken.");
        assert_eq!(msg.text_signature.as_deref(), Some("Alice Smith\nQA"));
        assert!(msg.in_reply_to.is_none());
        assert!(msg.references.is_empty());
    }

    #[test]
    fn normalizes_reply_threading_headers() {
        let raw = raw_email(
            "Message-ID: <m3@ex.com>\n\
             In-Reply-To: <m2@ex.com>\n\
             References: <m1@ex.com> <m2@ex.com>\n\
             From: bob@ex.com\n\
             Subject: Re: Bug report",
            "Reproduced it.\n\nOn Mon, Jan 5, 2026 Alice wrote:\n> The export button is broken.",
        );
        let msg = normalize_message(&raw).unwrap();
        assert_eq!(msg.message_id, "m3@ex.com");
        assert_eq!(msg.in_reply_to.as_deref(), Some("m2@ex.com"));
        assert_eq!(msg.references, vec!["m1@ex.com", "m2@ex.com"]);
        assert_eq!(msg.text, "Reproduced it.");
    }

    #[test]
    fn missing_message_id_gets_generated_one() {
        let raw = raw_email("From: x@ex.com\nSubject: hi", "body");
        let msg = normalize_message(&raw).unwrap();
        assert!(msg.message_id.starts_with("gen-"));
    }

    #[test]
    fn missing_subject_gets_placeholder() {
        let raw = raw_email("Message-ID: <m@ex.com>\nFrom: x@ex.com", "body");
        let msg = normalize_message(&raw).unwrap();
        assert_eq!(msg.subject, "(no subject)");
    }

    #[test]
    fn header_blob_carries_threading_fields() {
        let raw = raw_email(
            "Message-ID: <m2@ex.com>\nIn-Reply-To: <m1@ex.com>\nFrom: x@ex.com\nSubject: Re: hi",
            "ok",
        );
        let msg = normalize_message(&raw).unwrap();
        assert_eq!(msg.headers["message_id"], "m2@ex.com");
        assert_eq!(msg.headers["in_reply_to"], "m1@ex.com");
    }
}
