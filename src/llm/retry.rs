//! Retry classification for upstream generation failures.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::ProviderError;

static QUOTA_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(exceeded your current quota|quota exceeded|insufficient_quota|billing details|plan and billing|rate limit|too many requests|resource.?exhausted)",
    )
    .expect("quota pattern is valid")
});

static TIMEOUT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(timeout|timed out)").expect("timeout pattern is valid"));

/// Check whether an upstream error message reports an exhausted quota.
pub(crate) fn is_quota_exceeded(message: &str) -> bool {
    QUOTA_PATTERN.is_match(message)
}

pub(crate) fn is_timeout(message: &str) -> bool {
    TIMEOUT_PATTERN.is_match(message)
}

/// Map a non-success HTTP response to a provider error.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> ProviderError {
    let reason = format!("HTTP {status}: {}", truncate(body, 300));
    if status == 429 || is_quota_exceeded(body) {
        ProviderError::QuotaExceeded {
            provider: provider.to_string(),
            reason,
        }
    } else if status == 408 || status == 504 || is_timeout(body) {
        ProviderError::Timeout {
            provider: provider.to_string(),
            timeout: Duration::ZERO,
        }
    } else if status >= 500 {
        ProviderError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    } else {
        ProviderError::InvalidResponse {
            provider: provider.to_string(),
            reason,
        }
    }
}

/// Only quota and timeout failures are retried in place; anything else is
/// handed back to the caller.
pub(crate) fn should_retry(err: &ProviderError) -> bool {
    matches!(
        err,
        ProviderError::QuotaExceeded { .. } | ProviderError::Timeout { .. }
    )
}

/// Bounded retry policy with a fixed delay.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Whether `attempt` (1-based) may be followed by another one.
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_quota_messages() {
        assert!(is_quota_exceeded("You exceeded your current quota, please check your plan"));
        assert!(is_quota_exceeded("Error: Quota Exceeded for model"));
        assert!(is_quota_exceeded("{\"code\":\"insufficient_quota\"}"));
        assert!(!is_quota_exceeded("invalid api key"));
    }

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            classify_status("p", 429, ""),
            ProviderError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify_status("p", 400, "please check your billing details"),
            ProviderError::QuotaExceeded { .. }
        ));
        assert!(matches!(
            classify_status("p", 504, ""),
            ProviderError::Timeout { .. }
        ));
        assert!(matches!(
            classify_status("p", 502, "bad gateway"),
            ProviderError::RequestFailed { .. }
        ));
        assert!(matches!(
            classify_status("p", 401, "unauthorized"),
            ProviderError::InvalidResponse { .. }
        ));
    }

    #[test]
    fn only_quota_and_timeout_retry_in_place() {
        let quota = classify_status("p", 429, "");
        let server = classify_status("p", 500, "");
        assert!(should_retry(&quota));
        assert!(!should_retry(&server));
    }

    #[test]
    fn policy_bounds_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            delay: Duration::ZERO,
        };
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
