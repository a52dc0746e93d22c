//! IMAP client — tagged-command IMAP4rev1 over TLS.
//!
//! Deliberately small: LOGIN, SELECT, `UID SEARCH SINCE`, literal-aware
//! `UID FETCH`, `UID STORE \Seen`, LOGOUT. Blocking socket I/O runs under
//! `spawn_blocking`; every operation is bounded by socket timeouts, and a
//! process-wide lock serializes fetches against the same account folder.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::MailError;
use crate::mail::{ImapEndpoint, MailClient, MailCredentials, RawMessage};

/// Socket deadline set for one IMAP session.
#[derive(Debug, Clone, Copy)]
pub struct ImapTimeouts {
    pub connect: Duration,
    pub io: Duration,
    pub logout: Duration,
}

impl ImapTimeouts {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            connect: config.imap_connect_timeout,
            io: config.imap_io_timeout,
            logout: config.imap_logout_timeout,
        }
    }
}

impl Default for ImapTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            io: Duration::from_secs(30),
            logout: Duration::from_secs(5),
        }
    }
}

/// IMAP implementation of the [`MailClient`] port.
pub struct ImapClient {
    timeouts: ImapTimeouts,
    /// Exclusive per-(account, folder) fetch locks.
    folder_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImapClient {
    pub fn new(timeouts: ImapTimeouts) -> Self {
        Self {
            timeouts,
            folder_locks: Mutex::new(HashMap::new()),
        }
    }

    fn folder_lock(
        &self,
        endpoint: &ImapEndpoint,
        credentials: &MailCredentials,
    ) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!(
            "{}:{}/{}/{}",
            endpoint.host, endpoint.port, credentials.username, endpoint.folder
        );
        let mut locks = self.folder_locks.lock().unwrap();
        Arc::clone(locks.entry(key).or_default())
    }
}

#[async_trait]
impl MailClient for ImapClient {
    async fn fetch_since(
        &self,
        endpoint: &ImapEndpoint,
        credentials: &MailCredentials,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawMessage>, MailError> {
        let lock = self.folder_lock(endpoint, credentials);
        let _guard = lock.lock_owned().await;

        let endpoint = endpoint.clone();
        let credentials = credentials.clone();
        let timeouts = self.timeouts;
        tokio::task::spawn_blocking(move || fetch_blocking(&endpoint, &credentials, since, timeouts))
            .await
            .map_err(|e| MailError::Protocol(format!("fetch task panicked: {e}")))?
    }

    async fn mark_read(
        &self,
        endpoint: &ImapEndpoint,
        credentials: &MailCredentials,
        uids: &[u32],
    ) -> Result<(), MailError> {
        if uids.is_empty() {
            return Ok(());
        }
        let endpoint = endpoint.clone();
        let credentials = credentials.clone();
        let uids = uids.to_vec();
        let timeouts = self.timeouts;
        tokio::task::spawn_blocking(move || mark_read_blocking(&endpoint, &credentials, &uids, timeouts))
            .await
            .map_err(|e| MailError::Protocol(format!("mark-read task panicked: {e}")))?
    }
}

// ── Blocking session ────────────────────────────────────────────────

trait ImapTransport: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Duration) -> std::io::Result<()>;
}

impl ImapTransport for TcpStream {
    fn set_read_timeout(&self, timeout: Duration) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, Some(timeout))
    }
}

impl ImapTransport for rustls::StreamOwned<rustls::ClientConnection, TcpStream> {
    fn set_read_timeout(&self, timeout: Duration) -> std::io::Result<()> {
        self.sock.set_read_timeout(Some(timeout))
    }
}

struct ImapSession {
    stream: Box<dyn ImapTransport>,
    tag_counter: u32,
    timeouts: ImapTimeouts,
}

impl ImapSession {
    /// Connect, complete the TLS handshake when requested, read the server
    /// greeting, and LOGIN.
    fn connect(
        endpoint: &ImapEndpoint,
        credentials: &MailCredentials,
        timeouts: ImapTimeouts,
    ) -> Result<Self, MailError> {
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|e| MailError::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                reason: format!("address resolution failed: {e}"),
            })?
            .next()
            .ok_or_else(|| MailError::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                reason: "no address resolved".into(),
            })?;

        let tcp = TcpStream::connect_timeout(&addr, timeouts.connect).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                MailError::Timeout { op: "connect".into() }
            } else {
                MailError::Connect {
                    host: endpoint.host.clone(),
                    port: endpoint.port,
                    reason: e.to_string(),
                }
            }
        })?;
        tcp.set_read_timeout(Some(timeouts.io))?;
        tcp.set_write_timeout(Some(timeouts.io))?;

        let stream: Box<dyn ImapTransport> = if endpoint.tls {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth(),
            );
            let server_name: rustls::pki_types::ServerName<'_> =
                rustls::pki_types::ServerName::try_from(endpoint.host.clone())
                    .map_err(|e| MailError::Tls(e.to_string()))?;
            let conn = rustls::ClientConnection::new(tls_config, server_name)
                .map_err(|e| MailError::Tls(e.to_string()))?;
            Box::new(rustls::StreamOwned::new(conn, tcp))
        } else {
            Box::new(tcp)
        };

        let mut session = Self {
            stream,
            tag_counter: 1,
            timeouts,
        };

        let greeting = session.read_line("greeting")?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(MailError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }

        let login = format!(
            "LOGIN {} {}",
            quote_literal(&credentials.username),
            quote_literal(credentials.password.expose_secret()),
        );
        let (tag, lines) = session.command("login", &login)?;
        if !tagged_ok(&tag, &lines) {
            return Err(MailError::Auth {
                username: credentials.username.clone(),
            });
        }

        Ok(session)
    }

    fn select(&mut self, folder: &str) -> Result<(), MailError> {
        let cmd = format!("SELECT {}", quote_literal(folder));
        let (tag, lines) = self.command("select", &cmd)?;
        if !tagged_ok(&tag, &lines) {
            return Err(MailError::Protocol(format!("SELECT {folder} failed")));
        }
        Ok(())
    }

    /// `UID SEARCH SINCE <date>` — or ALL when no checkpoint exists.
    fn uid_search_since(&mut self, since: Option<DateTime<Utc>>) -> Result<Vec<u32>, MailError> {
        let criteria = match since {
            // IMAP date-only SINCE, e.g. 07-Aug-2026.
            Some(ts) => format!("SINCE {}", ts.format("%d-%b-%Y")),
            None => "ALL".to_string(),
        };
        let (tag, lines) = self.command("search", &format!("UID SEARCH {criteria}"))?;
        if !tagged_ok(&tag, &lines) {
            return Err(MailError::Protocol(format!("UID SEARCH {criteria} failed")));
        }

        let mut uids = Vec::new();
        for line in &lines {
            if let Some(rest) = line.strip_prefix("* SEARCH") {
                uids.extend(rest.split_whitespace().filter_map(|t| t.parse::<u32>().ok()));
            }
        }
        Ok(uids)
    }

    /// Fetch one message's full source, honoring IMAP literal syntax.
    fn uid_fetch(&mut self, uid: u32) -> Result<Option<Vec<u8>>, MailError> {
        let tag = self.next_tag();
        self.write_line(&format!("{tag} UID FETCH {uid} (RFC822)"))?;

        let mut source: Option<Vec<u8>> = None;
        loop {
            let line = self.read_line("fetch")?;
            if line.starts_with(&tag) {
                if !line[tag.len()..].trim_start().starts_with("OK") {
                    return Err(MailError::Protocol(format!(
                        "UID FETCH {uid} failed: {}",
                        line.trim_end()
                    )));
                }
                break;
            }
            // An untagged FETCH line ending in {n} announces n literal bytes.
            if let Some(len) = literal_length(&line) {
                let mut buf = vec![0u8; len];
                self.stream.read_exact(&mut buf).map_err(map_io_error("fetch"))?;
                source = Some(buf);
            }
        }
        Ok(source)
    }

    fn uid_store_seen(&mut self, uids: &[u32]) -> Result<(), MailError> {
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let (tag, lines) = self.command("store", &format!(r"UID STORE {set} +FLAGS (\Seen)"))?;
        if !tagged_ok(&tag, &lines) {
            return Err(MailError::Protocol(format!("UID STORE {set} failed")));
        }
        Ok(())
    }

    /// Always attempted, bounded by its own short timeout, never escalated.
    fn logout(mut self) {
        if let Err(e) = self.stream.set_read_timeout(self.timeouts.logout) {
            debug!(error = %e, "could not shorten timeout for logout");
        }
        let tag = self.next_tag();
        if let Err(e) = self
            .write_line(&format!("{tag} LOGOUT"))
            .and_then(|()| self.read_line("logout").map(drop))
        {
            debug!(error = %e, "IMAP logout failed");
        }
    }

    // ── Wire helpers ────────────────────────────────────────────────

    fn next_tag(&mut self) -> String {
        let tag = format!("A{}", self.tag_counter);
        self.tag_counter += 1;
        tag
    }

    fn write_line(&mut self, line: &str) -> Result<(), MailError> {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .and_then(|()| self.stream.flush())
            .map_err(map_io_error("write"))
    }

    fn read_line(&mut self, op: &str) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.stream.read(&mut byte) {
                Ok(0) => {
                    return Err(MailError::Protocol("connection closed by server".into()));
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(map_io_error(op)(e)),
            }
        }
    }

    /// Send a tagged command and collect response lines through the tagged
    /// completion line. Returns (tag, lines).
    fn command(&mut self, op: &str, cmd: &str) -> Result<(String, Vec<String>), MailError> {
        let tag = self.next_tag();
        self.write_line(&format!("{tag} {cmd}"))?;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line(op)?;
            let done = line.starts_with(&tag);
            lines.push(line);
            if done {
                return Ok((tag, lines));
            }
        }
    }
}

fn fetch_blocking(
    endpoint: &ImapEndpoint,
    credentials: &MailCredentials,
    since: Option<DateTime<Utc>>,
    timeouts: ImapTimeouts,
) -> Result<Vec<RawMessage>, MailError> {
    let mut session = ImapSession::connect(endpoint, credentials, timeouts)?;

    let result = (|| {
        session.select(&endpoint.folder)?;
        let uids = session.uid_search_since(since)?;
        debug!(folder = %endpoint.folder, matches = uids.len(), "IMAP search complete");

        let mut messages = Vec::with_capacity(uids.len());
        for uid in uids {
            match session.uid_fetch(uid)? {
                Some(source) => messages.push(RawMessage { uid, source }),
                None => warn!(uid, "UID FETCH returned no body; skipping"),
            }
        }
        Ok(messages)
    })();

    session.logout();
    result
}

fn mark_read_blocking(
    endpoint: &ImapEndpoint,
    credentials: &MailCredentials,
    uids: &[u32],
    timeouts: ImapTimeouts,
) -> Result<(), MailError> {
    let mut session = ImapSession::connect(endpoint, credentials, timeouts)?;
    let result = (|| {
        session.select(&endpoint.folder)?;
        session.uid_store_seen(uids)
    })();
    session.logout();
    result
}

// ── Parsing helpers ─────────────────────────────────────────────────

/// Quote a LOGIN/SELECT argument, escaping backslash and double-quote.
fn quote_literal(s: &str) -> String {
    let escaped = s.replace('\\', r"\\").replace('"', r#"\""#);
    format!("\"{escaped}\"")
}

/// True when the tagged completion line reports OK.
fn tagged_ok(tag: &str, lines: &[String]) -> bool {
    lines
        .last()
        .and_then(|l| l.strip_prefix(tag))
        .is_some_and(|rest| rest.trim_start().starts_with("OK"))
}

/// Extract the octet count from a line ending in `{n}`.
fn literal_length(line: &str) -> Option<usize> {
    let trimmed = line.trim_end();
    let open = trimmed.rfind('{')?;
    let close = trimmed.rfind('}')?;
    if close != trimmed.len() - 1 || close <= open {
        return None;
    }
    trimmed[open + 1..close].parse().ok()
}

fn map_io_error(op: &str) -> impl Fn(std::io::Error) -> MailError + '_ {
    move |e| match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => MailError::Timeout {
            op: op.to_string(),
        },
        _ => MailError::Io(e),
    }
}
