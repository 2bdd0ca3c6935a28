//! Typed error taxonomy for the indexing/query pipeline.
//!
//! The CLI boundary still works in `anyhow::Result` for ergonomics, but
//! library code returns `IndexError` so callers can match on kind and surface
//! targeted remediation text instead of a raw error chain.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        remediation: Vec<String>,
    },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        remediation: Vec<String>,
    },

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("input error: {message}")]
    Input { message: String },

    #[error("invariant violation: {message}")]
    Invariant {
        message: String,
        remediation: Vec<String>,
    },

    #[error("all configured providers failed: tried {attempted:?}, last error: {last}")]
    AllProvidersFailed {
        attempted: Vec<String>,
        last: Box<ProviderError>,
    },
}

#[derive(Debug, thiserror::Error, Clone)]
pub enum ProviderError {
    #[error("rate limited{}", retry_after_ms.map(|ms| format!(" (retry after {ms}ms)")).unwrap_or_default())]
    RateLimit { retry_after_ms: Option<u64> },

    #[error("authentication failed")]
    Auth,

    #[error("network error: {cause}")]
    Network { cause: String },

    #[error("provider error: {message}")]
    Provider { message: String },
}

impl ProviderError {
    /// Whether the dispatcher should retry locally before escalating to fallback.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit { .. } | ProviderError::Network { .. }
        )
    }

    pub fn retry_delay(&self, attempt: u32, base_delay: Duration) -> Duration {
        match self {
            ProviderError::RateLimit {
                retry_after_ms: Some(ms),
            } => Duration::from_millis(*ms),
            _ => {
                let exp = base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
                Duration::from_millis(exp)
            }
        }
    }
}

impl IndexError {
    pub fn configuration(message: impl Into<String>) -> Self {
        IndexError::Configuration {
            message: message.into(),
            remediation: Vec::new(),
        }
    }

    pub fn configuration_with(message: impl Into<String>, remediation: Vec<String>) -> Self {
        IndexError::Configuration {
            message: message.into(),
            remediation,
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        IndexError::Storage {
            message: message.into(),
            remediation: Vec::new(),
        }
    }

    pub fn invariant(message: impl Into<String>, remediation: Vec<String>) -> Self {
        IndexError::Invariant {
            message: message.into(),
            remediation,
        }
    }

    /// Remediation suggestions surfaced to the CLI, empty when none apply.
    pub fn remediation(&self) -> &[String] {
        match self {
            IndexError::Configuration { remediation, .. } => remediation,
            IndexError::Storage { remediation, .. } => remediation,
            IndexError::Invariant { remediation, .. } => remediation,
            _ => &[],
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Provider(p) if p.is_retryable())
    }

    /// Maps a surfaced error to the documented CLI exit code (§6): 3
    /// configuration, 4 provider-exhausted, 5 storage, 1 everything else.
    /// Usage errors (exit 2) are handled by clap before an `IndexError`
    /// ever exists.
    pub fn exit_code(&self) -> u8 {
        match self {
            IndexError::Configuration { .. } => 3,
            IndexError::Storage { .. } => 5,
            IndexError::Provider(_) | IndexError::AllProvidersFailed { .. } => 4,
            IndexError::Invariant { .. } => 5,
            IndexError::Input { .. } => 1,
        }
    }
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self {
        IndexError::Storage {
            message: e.to_string(),
            remediation: Vec::new(),
        }
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(e: serde_json::Error) -> Self {
        IndexError::Storage {
            message: format!("malformed catalog: {e}"),
            remediation: vec!["the catalog may be corrupt; run `doctor` to inspect it".into()],
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ProviderError::Network {
                cause: e.to_string(),
            }
        } else if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                ProviderError::RateLimit {
                    retry_after_ms: None,
                }
            } else if status.as_u16() == 401 || status.as_u16() == 403 {
                ProviderError::Auth
            } else {
                ProviderError::Provider {
                    message: e.to_string(),
                }
            }
        } else {
            ProviderError::Network {
                cause: e.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_network_are_retryable() {
        assert!(ProviderError::RateLimit { retry_after_ms: None }.is_retryable());
        assert!(ProviderError::Network { cause: "x".into() }.is_retryable());
        assert!(!ProviderError::Auth.is_retryable());
        assert!(!ProviderError::Provider { message: "x".into() }.is_retryable());
    }

    #[test]
    fn retry_delay_honors_explicit_retry_after() {
        let e = ProviderError::RateLimit {
            retry_after_ms: Some(500),
        };
        assert_eq!(e.retry_delay(0, Duration::from_millis(100)), Duration::from_millis(500));
    }

    #[test]
    fn retry_delay_exponential_backoff_without_retry_after() {
        let e = ProviderError::Network { cause: "x".into() };
        assert_eq!(e.retry_delay(0, Duration::from_millis(100)), Duration::from_millis(100));
        assert_eq!(e.retry_delay(2, Duration::from_millis(100)), Duration::from_millis(400));
    }
}
