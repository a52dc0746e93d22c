//! Signature extraction — best-effort split of message body and sign-off.
//!
//! Heuristic by nature: the markers below cover the conventions of common
//! mail clients, not arbitrary output. Runs after quote stripping.

use std::sync::LazyLock;

use regex::Regex;

/// A body/signature split. `signature` is `None` when nothing looked like one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSplit {
    pub body: String,
    pub signature: Option<String>,
}

/// The conventional "-- " signature delimiter on a line of its own.
static DELIMITER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^--\s*$").unwrap());

/// Sign-off words opening a closing block.
static CLOSING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(best|regards|sincerely|thanks|cheers)\b").unwrap());

/// Mobile client footers.
static MOBILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^sent from my (iphone|ipad|android|mobile)").unwrap());

/// Loose phone-number shape for the positional heuristic.
static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+?\d[\d\s().-]{6,}\d").unwrap());

/// Split a plain-text body into content and signature.
///
/// Splits at the earliest of: a `--` delimiter line, a closing word or
/// mobile footer at line start, or — positional heuristic — a line in the
/// last 40% of the message that carries an email address or phone number
/// and opens a trailing block averaging under 60 chars per line.
pub fn extract_signature(text: &str) -> SignatureSplit {
    let lines: Vec<&str> = text.lines().collect();

    let marker = lines.iter().enumerate().skip(1).find_map(|(i, line)| {
        let content = line.trim();
        if DELIMITER.is_match(content) {
            // The delimiter itself belongs to neither side.
            Some((i, i + 1))
        } else if CLOSING.is_match(content) || MOBILE.is_match(content) {
            Some((i, i))
        } else {
            None
        }
    });

    let split = match (marker, positional_split(&lines)) {
        (Some(m), Some(h)) => Some(if h < m.0 { (h, h) } else { m }),
        (Some(m), None) => Some(m),
        (None, Some(h)) => Some((h, h)),
        (None, None) => None,
    };

    match split {
        Some((body_end, sig_start)) => {
            let body = lines[..body_end].join("\n").trim_end().to_string();
            let signature = lines[sig_start..].join("\n").trim().to_string();
            SignatureSplit {
                body,
                signature: (!signature.is_empty()).then_some(signature),
            }
        }
        None => SignatureSplit {
            body: text.trim_end().to_string(),
            signature: None,
        },
    }
}

/// Contact-looking line opening a short-lined trailing block in the last
/// 40% of the message.
fn positional_split(lines: &[&str]) -> Option<usize> {
    for i in 1..lines.len() {
        // Only the last 40% of the message qualifies.
        if i * 5 < lines.len() * 3 {
            continue;
        }
        let line = lines[i];
        if !line.contains('@') && !PHONE.is_match(line) {
            continue;
        }
        let tail = &lines[i..];
        let avg = tail.iter().map(|l| l.len()).sum::<usize>() / tail.len();
        if avg < 60 {
            return Some(i);
        }
    }
    None
}

// ── HTML ────────────────────────────────────────────────────────────

static HTML_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Gmail wraps the signature in a gmail_signature-classed div.
        Regex::new(r#"(?i)<[^>]+class\s*=\s*["'][^"']*gmail_signature"#).unwrap(),
        // Outlook uses id="Signature".
        Regex::new(r#"(?i)<[^>]+id\s*=\s*["']Signature["']"#).unwrap(),
        // A paragraph/line break immediately followed by a bare "--".
        Regex::new(r"(?is)(<br\s*/?>|</p>)\s*--\s*(<br|</p|$)").unwrap(),
    ]
});

/// Split an HTML body into content and signature.
pub fn extract_html_signature(html: &str) -> SignatureSplit {
    let first = HTML_MARKERS
        .iter()
        .filter_map(|re| re.find(html).map(|m| m.start()))
        .min();

    match first {
        Some(pos) if pos > 0 => {
            let signature = html[pos..].trim().to_string();
            SignatureSplit {
                body: html[..pos].trim_end().to_string(),
                signature: (!signature.is_empty()).then_some(signature),
            }
        }
        _ => SignatureSplit {
            body: html.trim_end().to_string(),
            signature: None,
        },
    }
}
