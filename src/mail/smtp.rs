//! SMTP mailer — outbound auto-replies via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::error::MailError;
use crate::mail::{Mailer, MailCredentials, OutgoingReply, SmtpEndpoint};

/// lettre-backed implementation of the [`Mailer`] port.
///
/// Replies go out over the inbox's own account identity with an explicit
/// `In-Reply-To` header so mail clients thread them correctly.
#[derive(Debug, Default)]
pub struct SmtpMailer;

impl SmtpMailer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send_reply(
        &self,
        endpoint: &SmtpEndpoint,
        credentials: &MailCredentials,
        from_address: &str,
        reply: &OutgoingReply,
    ) -> Result<(), MailError> {
        let endpoint = endpoint.clone();
        let credentials = credentials.clone();
        let from_address = from_address.to_string();
        let reply = reply.clone();

        tokio::task::spawn_blocking(move || send_blocking(&endpoint, &credentials, &from_address, &reply))
            .await
            .map_err(|e| MailError::Send(format!("send task panicked: {e}")))?
    }
}

fn send_blocking(
    endpoint: &SmtpEndpoint,
    credentials: &MailCredentials,
    from_address: &str,
    reply: &OutgoingReply,
) -> Result<(), MailError> {
    let creds = Credentials::new(
        credentials.username.clone(),
        credentials.password.expose_secret().to_string(),
    );

    // Implicit TLS (usually 465) or STARTTLS (usually 587).
    let builder = if endpoint.implicit_tls {
        SmtpTransport::relay(&endpoint.host)
    } else {
        SmtpTransport::starttls_relay(&endpoint.host)
    }
    .map_err(|e| MailError::Send(format!("SMTP relay setup: {e}")))?;

    let transport = builder.port(endpoint.port).credentials(creds).build();

    let email = Message::builder()
        .from(from_address
            .parse()
            .map_err(|e| MailError::Send(format!("invalid from address: {e}")))?)
        .to(reply
            .to
            .parse()
            .map_err(|e| MailError::Send(format!("invalid to address: {e}")))?)
        .subject(&reply.subject)
        .in_reply_to(format!("<{}>", reply.in_reply_to))
        .body(reply.body.clone())
        .map_err(|e| MailError::Send(format!("failed to build reply: {e}")))?;

    transport
        .send(&email)
        .map_err(|e| MailError::Send(e.to_string()))?;

    info!(to = %reply.to, in_reply_to = %reply.in_reply_to, "Auto-reply sent");
    Ok(())
}

/// Prefix a subject for a reply unless it is already a reply subject.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed.to_ascii_lowercase().starts_with("re:") {
        trimmed.to_string()
    } else {
        format!("Re: {trimmed}")
    }
}
