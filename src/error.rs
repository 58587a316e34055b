// Error types shared by every layer of the analytics crate
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = AnalyticsError> = std::result::Result<T, E>;

/// Failure categories reported by the remote API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudErrorKind {
    /// Rate limiting or a 5xx response; safe to retry.
    Transient {
        status: Option<u16>,
        retry_after: Option<Duration>,
    },
    /// Any other non-success response.
    Client(u16),
    /// The request was never dispatched because its call was abandoned.
    Aborted,
}

#[derive(Debug, Error)]
pub enum AnalyticsError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("could not verify the server certificate: {0}")]
    CertificateVerification(String),

    #[error("cloud request failed ({kind:?}): {message}")]
    Cloud {
        kind: CloudErrorKind,
        message: String,
    },

    #[error("request failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<AnalyticsError>,
    },

    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    #[error("invalid usage: {0}")]
    Usage(String),

    #[error("{capability} is not available ({suggestion})")]
    MissingPackage {
        capability: String,
        suggestion: String,
    },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalyticsError {
    pub fn usage(message: impl Into<String>) -> Self {
        AnalyticsError::Usage(message.into())
    }

    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        AnalyticsError::NotFound {
            what,
            id: id.into(),
        }
    }

    pub fn transient(status: Option<u16>, retry_after: Option<Duration>, message: impl Into<String>) -> Self {
        AnalyticsError::Cloud {
            kind: CloudErrorKind::Transient {
                status,
                retry_after,
            },
            message: message.into(),
        }
    }

    /// Whether the failure may succeed if the same request is sent again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AnalyticsError::Cloud {
                kind: CloudErrorKind::Transient { .. },
                ..
            }
        )
    }

    /// Failures that abort the whole enclosing call instead of a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AnalyticsError::Authentication(_) | AnalyticsError::CertificateVerification(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AnalyticsError::Cloud {
                kind: CloudErrorKind::Transient { retry_after, .. },
                ..
            } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let rate_limited = AnalyticsError::transient(Some(429), Some(Duration::from_secs(2)), "slow down");
        assert!(rate_limited.is_transient());
        assert!(!rate_limited.is_fatal());
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(2)));

        let auth = AnalyticsError::Authentication("expired".to_string());
        assert!(auth.is_fatal());
        assert!(!auth.is_transient());

        let exhausted = AnalyticsError::RetriesExhausted {
            attempts: 3,
            last: Box::new(rate_limited),
        };
        assert!(!exhausted.is_transient());
        assert!(exhausted.to_string().contains("3 attempts"));
    }
}
