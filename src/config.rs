//! Application configuration and the credential-cipher port.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Application configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the local libSQL database file.
    pub db_path: String,
    /// Root directory for the local blob store.
    pub blob_dir: String,
    /// Cron expression driving the scheduler tick.
    pub scheduler_schedule: String,
    /// Maximum number of account syncs running in parallel.
    pub job_concurrency: usize,
    /// TCP connect timeout for IMAP sessions.
    pub imap_connect_timeout: Duration,
    /// Socket read/write timeout for IMAP sessions.
    pub imap_io_timeout: Duration,
    /// Short timeout bounding the best-effort LOGOUT.
    pub imap_logout_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/mailroom.db".to_string(),
            blob_dir: "./data/blobs".to_string(),
            // Every 5 minutes.
            scheduler_schedule: "0 */5 * * * *".to_string(),
            job_concurrency: 3,
            imap_connect_timeout: Duration::from_secs(30),
            imap_io_timeout: Duration::from_secs(30),
            imap_logout_timeout: Duration::from_secs(5),
        }
    }
}

impl AppConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path =
            std::env::var("MAILROOM_DB_PATH").unwrap_or(defaults.db_path);
        let blob_dir =
            std::env::var("MAILROOM_BLOB_DIR").unwrap_or(defaults.blob_dir);
        let scheduler_schedule = std::env::var("MAILROOM_SYNC_SCHEDULE")
            .unwrap_or(defaults.scheduler_schedule);

        // Validate the cron expression up front so a typo fails at startup
        // rather than on the first tick.
        use std::str::FromStr;
        cron::Schedule::from_str(&scheduler_schedule).map_err(|e| {
            ConfigError::InvalidSchedule {
                expr: scheduler_schedule.clone(),
                message: e.to_string(),
            }
        })?;

        let job_concurrency = match std::env::var("MAILROOM_JOB_CONCURRENCY") {
            Ok(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
                key: "MAILROOM_JOB_CONCURRENCY".into(),
                message: format!("not a positive integer: {s:?}"),
            })?,
            Err(_) => defaults.job_concurrency,
        };

        Ok(Self {
            db_path,
            blob_dir,
            scheduler_schedule,
            job_concurrency,
            imap_connect_timeout: defaults.imap_connect_timeout,
            imap_io_timeout: defaults.imap_io_timeout,
            imap_logout_timeout: defaults.imap_logout_timeout,
        })
    }
}

// ── Credential cipher port ──────────────────────────────────────────

/// Encrypt/decrypt service for mail-account secrets at rest.
///
/// The real implementation lives outside this subsystem; syncs only ever
/// see decrypted credentials as [`SecretString`]s scoped to one session.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String, ConfigError>;
    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, ConfigError>;
}

/// Identity cipher for development and tests.
///
/// Stores secrets verbatim. Production wiring injects the platform's
/// key-management-backed implementation instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCipher;

impl CredentialCipher for PlainCipher {
    fn encrypt(&self, plaintext: &SecretString) -> Result<String, ConfigError> {
        Ok(plaintext.expose_secret().to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<SecretString, ConfigError> {
        Ok(SecretString::from(ciphertext.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = AppConfig::default();
        assert_eq!(config.job_concurrency, 3);
        assert_eq!(config.scheduler_schedule, "0 */5 * * * *");
        assert_eq!(config.imap_connect_timeout, Duration::from_secs(30));
        assert!(config.imap_logout_timeout < config.imap_io_timeout);
    }

    #[test]
    fn default_schedule_parses() {
        use std::str::FromStr;
        let config = AppConfig::default();
        assert!(cron::Schedule::from_str(&config.scheduler_schedule).is_ok());
    }

    #[test]
    fn plain_cipher_roundtrip() {
        let cipher = PlainCipher;
        let secret = SecretString::from("hunter2".to_string());
        let stored = cipher.encrypt(&secret).unwrap();
        let restored = cipher.decrypt(&stored).unwrap();
        assert_eq!(restored.expose_secret(), "hunter2");
    }
}
