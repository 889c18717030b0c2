//! Environment-driven configuration
use anyhow::Context;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub request_prefix: String,
    pub poll_interval: Duration,
    pub collaborator_timeout: Duration,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("loan-console.db"),
            request_prefix: "TRN".to_string(),
            poll_interval: Duration::from_millis(15_000),
            collaborator_timeout: Duration::from_millis(5_000),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| -> anyhow::Result<Duration> {
            match lookup(key) {
                Some(raw) => {
                    let ms: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a whole number of milliseconds"))?;
                    if ms == 0 {
                        anyhow::bail!("{key} must be greater than zero");
                    }
                    Ok(Duration::from_millis(ms))
                }
                None => Ok(fallback),
            }
        };

        let request_prefix = lookup("LOAN_REQUEST_PREFIX")
            .map(|p| p.trim().to_string())
            .unwrap_or(defaults.request_prefix);
        if request_prefix.is_empty() {
            anyhow::bail!("LOAN_REQUEST_PREFIX cannot be empty");
        }

        Ok(Config {
            db_path: lookup("LOAN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            request_prefix,
            poll_interval: millis("LOAN_POLL_INTERVAL_MS", defaults.poll_interval)?,
            collaborator_timeout: millis(
                "LOAN_COLLABORATOR_TIMEOUT_MS",
                defaults.collaborator_timeout,
            )?,
            log_level: lookup("LOAN_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn open_db(&self) -> anyhow::Result<Arc<sled::Db>> {
        let db = sled::open(&self.db_path)
            .with_context(|| format!("opening database at {}", self.db_path.display()))?;
        Ok(Arc::new(db))
    }
}
