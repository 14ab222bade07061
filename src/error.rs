//! Crate-wide error taxonomy.
//!
//! Mirrors the provider/error classification described in the AI retry layer:
//! every failure a provider call can produce collapses into one of these
//! variants, and only `Transient` / `RateLimited` are retried by [`crate::retry`].

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PerseptorError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed for provider {provider:?}: {message}")]
    Auth {
        provider: Option<String>,
        message: String,
    },

    #[error("model not found for provider {provider:?}: {message}")]
    ModelNotFound {
        provider: Option<String>,
        message: String,
    },

    #[error("rate limited by provider {provider:?} (retry_after={retry_after_secs:?}): {message}")]
    RateLimited {
        provider: Option<String>,
        message: String,
        retry_after_secs: Option<f64>,
    },

    #[error("transient error from provider {provider:?}: {message}")]
    Transient {
        provider: Option<String>,
        message: String,
    },

    #[error("fatal error from provider {provider:?}: {message}")]
    Fatal {
        provider: Option<String>,
        message: String,
    },
}

impl PerseptorError {
    pub fn provider(&self) -> Option<&str> {
        match self {
            PerseptorError::InvalidRequest(_) => None,
            PerseptorError::Auth { provider, .. }
            | PerseptorError::ModelNotFound { provider, .. }
            | PerseptorError::RateLimited { provider, .. }
            | PerseptorError::Transient { provider, .. }
            | PerseptorError::Fatal { provider, .. } => provider.as_deref(),
        }
    }

    /// Whether [`crate::retry::with_retry`] should attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PerseptorError::RateLimited { .. } | PerseptorError::Transient { .. }
        )
    }
}

impl From<reqwest::Error> for PerseptorError {
    fn from(err: reqwest::Error) -> Self {
        let provider = None;
        if err.is_timeout() || err.is_connect() {
            return PerseptorError::Transient {
                provider,
                message: err.to_string(),
            };
        }
        if let Some(status) = err.status() {
            let code = status.as_u16();
            if code == 401 {
                return PerseptorError::Auth {
                    provider,
                    message: err.to_string(),
                };
            }
            if code == 404 {
                return PerseptorError::ModelNotFound {
                    provider,
                    message: err.to_string(),
                };
            }
            if code == 429 {
                return PerseptorError::RateLimited {
                    provider,
                    message: err.to_string(),
                    retry_after_secs: None,
                };
            }
            if code >= 500 {
                return PerseptorError::Transient {
                    provider,
                    message: err.to_string(),
                };
            }
        }
        PerseptorError::Fatal {
            provider,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PerseptorError {
    fn from(err: serde_json::Error) -> Self {
        PerseptorError::Fatal {
            provider: None,
            message: format!("JSON error: {err}"),
        }
    }
}

/// Classifies a raw vendor error message into the taxonomy above.
///
/// Rust HTTP clients don't raise typed vendor exceptions the way the Python
/// SDKs this was ported from do, so classification falls back to matching on
/// lowercased substrings of the error text, same table the original retry
/// handler used.
pub fn classify_message(message: &str, provider: Option<&str>) -> PerseptorError {
    let lower = message.to_lowercase();
    let provider = provider.map(str::to_string);

    if ["rate limit", "429", "too many requests", "quota"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return PerseptorError::RateLimited {
            provider,
            message: message.to_string(),
            retry_after_secs: None,
        };
    }
    if ["401", "unauthorized", "invalid api key", "authentication"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return PerseptorError::Auth {
            provider,
            message: message.to_string(),
        };
    }
    if ["model not found", "404", "does not exist"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return PerseptorError::ModelNotFound {
            provider,
            message: message.to_string(),
        };
    }
    if ["500", "502", "503", "504", "timeout", "connection"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return PerseptorError::Transient {
            provider,
            message: message.to_string(),
        };
    }
    PerseptorError::Fatal {
        provider,
        message: message.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, PerseptorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rate_limit() {
        let e = classify_message("429 Too Many Requests", Some("openai"));
        assert!(matches!(e, PerseptorError::RateLimited { .. }));
        assert!(e.is_retryable());
    }

    #[test]
    fn classifies_auth() {
        let e = classify_message("401 Unauthorized: invalid api key", None);
        assert!(matches!(e, PerseptorError::Auth { .. }));
        assert!(!e.is_retryable());
    }

    #[test]
    fn classifies_transient() {
        let e = classify_message("connection reset by peer", None);
        assert!(matches!(e, PerseptorError::Transient { .. }));
        assert!(e.is_retryable());
    }

    #[test]
    fn classifies_fatal_by_default() {
        let e = classify_message("something weird happened", None);
        assert!(matches!(e, PerseptorError::Fatal { .. }));
        assert!(!e.is_retryable());
    }
}
