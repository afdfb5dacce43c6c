//! Error taxonomy for the hub
//!
//! Only configuration and duration errors are allowed to abort setup. Everything raised
//! while the hub is running is contained at the agent invocation, listener call or
//! upstream supervisor that produced it and surfaces through logging.

use thiserror::Error;

/// A throttle/period string that is not `<integer><unit>`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationParseError {
    #[error("duration string is empty")]
    Empty,

    #[error("duration '{0}' does not start with an integer")]
    MissingNumber(String),

    #[error("duration '{input}' has unknown unit '{unit}' (expected ms, s, m, h or d)")]
    UnknownUnit { input: String, unit: String },

    #[error("duration '{0}' is too large")]
    Overflow(String),
}

/// Invalid agent or hub configuration
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("required key '{key}' is missing")]
    MissingKey { key: String },

    #[error("key '{key}' is invalid: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error(transparent)]
    Duration(#[from] DurationParseError),
}

impl ConfigError {
    pub fn missing(key: &str) -> Self {
        ConfigError::MissingKey {
            key: key.to_string(),
        }
    }

    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store path is empty")]
    EmptyPath,
}

/// Failure reported by the market-data feed or the execution client
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("no execution client configured")]
    Unavailable,

    #[error("unrecoverable provider failure: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Connection(_) | ProviderError::RateLimited(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("hub has already been started")]
    AlreadyStarted,

    #[error("agent '{agent}' failed to initialize: {source}")]
    Initialization {
        agent: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("upstream feed failed: {0}")]
    Upstream(#[source] ProviderError),

    #[error("upstream feed gave up after {attempts} attempts: {last}")]
    UpstreamExhausted { attempts: u32, last: ProviderError },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::Connection("reset".into()).is_retryable());
        assert!(ProviderError::RateLimited("429".into()).is_retryable());
        assert!(!ProviderError::Rejected("bad symbol".into()).is_retryable());
        assert!(!ProviderError::Fatal("auth".into()).is_retryable());
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::missing("instruments");
        assert_eq!(err.to_string(), "required key 'instruments' is missing");

        let err: ConfigError = DurationParseError::Empty.into();
        assert_eq!(err.to_string(), "duration string is empty");
    }
}
