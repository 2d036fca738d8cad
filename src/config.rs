//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Look up and parse a setting, falling back to `default`.
fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    lookup(key)
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Read and parse an environment variable, falling back to `default`.
fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Foreground synchronization settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period before the task list is written to the store.
    pub debounce: Duration,
    /// Workflow polling interval.
    pub poll_interval: Duration,
    /// Liveness probe timeout before falling back to the direct path.
    pub probe_timeout: Duration,
    /// How long a claim waits for the bridge to report itself initialized.
    pub init_wait_timeout: Duration,
    /// How long a sent claim waits for the host's answer.
    pub claim_timeout: Duration,
    /// Consecutive persistence failures before a degraded event is emitted.
    /// `None` never escalates.
    pub persist_failure_threshold: Option<u32>,
    /// Maximum attempts for a task before it is marked failed.
    pub max_task_attempts: u32,
    /// Delay between task retry attempts.
    pub retry_delay: Duration,
    /// Terminal tasks older than this are pruned.
    pub retention: Duration,
    /// Maximum number of terminal tasks kept after pruning.
    pub max_retained_terminal: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            init_wait_timeout: Duration::from_secs(5),
            claim_timeout: Duration::from_secs(10),
            persist_failure_threshold: Some(5),
            max_task_attempts: 3,
            retry_delay: Duration::from_secs(2),
            retention: Duration::from_secs(7 * 24 * 3600), // 1 week
            max_retained_terminal: 200,
        }
    }
}

impl SyncConfig {
    /// Build config from `TASKBRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from `TASKBRIDGE_*` keys resolved by `lookup`. Missing or
    /// unparsable values keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            Duration::from_millis(parse_or(&lookup, key, default.as_millis() as u64))
        };

        let persist_failure_threshold = match lookup("TASKBRIDGE_PERSIST_FAILURE_THRESHOLD") {
            Some(s) if s == "0" || s.eq_ignore_ascii_case("never") => None,
            Some(s) => s.parse().ok().or(defaults.persist_failure_threshold),
            None => defaults.persist_failure_threshold,
        };

        Self {
            debounce: millis("TASKBRIDGE_DEBOUNCE_MS", defaults.debounce),
            poll_interval: millis("TASKBRIDGE_POLL_INTERVAL_MS", defaults.poll_interval),
            probe_timeout: millis("TASKBRIDGE_PROBE_TIMEOUT_MS", defaults.probe_timeout),
            init_wait_timeout: millis("TASKBRIDGE_INIT_WAIT_MS", defaults.init_wait_timeout),
            claim_timeout: millis("TASKBRIDGE_CLAIM_TIMEOUT_MS", defaults.claim_timeout),
            persist_failure_threshold,
            max_task_attempts: parse_or(
                &lookup,
                "TASKBRIDGE_MAX_TASK_ATTEMPTS",
                defaults.max_task_attempts,
            ),
            retry_delay: millis("TASKBRIDGE_RETRY_DELAY_MS", defaults.retry_delay),
            retention: Duration::from_secs(parse_or(
                &lookup,
                "TASKBRIDGE_RETENTION_SECS",
                defaults.retention.as_secs(),
            )),
            max_retained_terminal: parse_or(
                &lookup,
                "TASKBRIDGE_MAX_RETAINED_TASKS",
                defaults.max_retained_terminal,
            ),
        }
    }
}

/// Background host daemon settings.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub port: u16,
    pub db_path: PathBuf,
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl HostConfig {
    /// Build config from environment variables. A port that is set but not
    /// a valid number is an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = match std::env::var("TASKBRIDGE_PORT") {
            Ok(s) => s.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TASKBRIDGE_PORT".to_string(),
                message: format!("'{s}' is not a port number"),
            })?,
            Err(_) => 8787,
        };

        Ok(Self {
            port,
            db_path: std::env::var("TASKBRIDGE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/taskbridge.db")),
            log_dir: std::env::var("TASKBRIDGE_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

/// OpenAI-compatible generation endpoint settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    /// Build config from environment variables.
    /// Returns `None` if `TASKBRIDGE_API_KEY` is not set (provider disabled).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("TASKBRIDGE_API_KEY").ok()?;

        let base_url = std::env::var("TASKBRIDGE_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model =
            std::env::var("TASKBRIDGE_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        Some(Self {
            base_url,
            api_key: SecretString::from(api_key),
            model,
            max_retries: env_or("TASKBRIDGE_PROVIDER_MAX_RETRIES", 10),
            retry_delay: Duration::from_millis(env_or("TASKBRIDGE_PROVIDER_RETRY_DELAY_MS", 0)),
            request_timeout: Duration::from_secs(env_or("TASKBRIDGE_PROVIDER_TIMEOUT_SECS", 120)),
        })
    }
}
