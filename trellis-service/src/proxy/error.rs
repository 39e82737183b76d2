//! Proxy failure taxonomy and HTTP status mapping

use http::StatusCode;
use std::fmt;
use thiserror::Error;

/// Which timeout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// TCP/TLS connect
    Connect,
    /// Total request budget
    Request,
    /// Gap between response chunks
    Idle,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Request => write!(f, "request"),
            Self::Idle => write!(f, "idle"),
        }
    }
}

/// Category of a proxy failure, used for circuit-breaker trigger matching
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyErrorKind {
    /// Could not reach the upstream
    Connect,
    /// A proxy timeout fired
    Timeout,
    /// Admission refused by the circuit breaker
    CircuitOpen,
    /// Request body over the configured limit
    BodyTooLarge,
    /// TLS-level failure
    Ssl,
    /// Upstream response could not be interpreted
    InvalidResponse,
    /// Redirect budget exhausted
    TooManyRedirects,
    /// The client abandoned the request
    Cancelled,
    /// Anything else upstream-side
    Upstream,
}

/// Proxy operation failure
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Could not reach the upstream
    #[error("failed to connect to upstream {upstream}: {message}")]
    Connect {
        /// Upstream authority
        upstream: String,
        /// Underlying connect error
        message: String,
    },

    /// One of the proxy timeouts fired
    #[error("upstream {upstream} {phase} timeout")]
    Timeout {
        /// Upstream authority
        upstream: String,
        /// Which timeout fired
        phase: TimeoutPhase,
    },

    /// Admission refused; no upstream request was made
    #[error("circuit open for upstream {upstream}")]
    CircuitOpen {
        /// Upstream authority
        upstream: String,
    },

    /// Request body over the configured limit
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured limit
        limit: u64,
    },

    /// TLS-level failure
    #[error("TLS failure talking to upstream {upstream}: {message}")]
    Ssl {
        /// Upstream authority
        upstream: String,
        /// Underlying TLS error
        message: String,
    },

    /// Upstream response could not be interpreted
    #[error("invalid response from upstream {upstream}: {message}")]
    InvalidResponse {
        /// Upstream authority
        upstream: String,
        /// What was wrong
        message: String,
    },

    /// Redirect budget exhausted
    #[error("too many redirects from upstream {upstream}")]
    TooManyRedirects {
        /// Upstream authority
        upstream: String,
    },

    /// The client abandoned the request; propagated, no status
    #[error("client cancelled the request")]
    Cancelled,

    /// Anything else upstream-side
    #[error("upstream {upstream} error: {message}")]
    Upstream {
        /// Upstream authority
        upstream: String,
        /// Underlying error
        message: String,
    },
}

impl ProxyError {
    /// The failure's category
    pub fn kind(&self) -> ProxyErrorKind {
        match self {
            Self::Connect { .. } => ProxyErrorKind::Connect,
            Self::Timeout { .. } => ProxyErrorKind::Timeout,
            Self::CircuitOpen { .. } => ProxyErrorKind::CircuitOpen,
            Self::BodyTooLarge { .. } => ProxyErrorKind::BodyTooLarge,
            Self::Ssl { .. } => ProxyErrorKind::Ssl,
            Self::InvalidResponse { .. } => ProxyErrorKind::InvalidResponse,
            Self::TooManyRedirects { .. } => ProxyErrorKind::TooManyRedirects,
            Self::Cancelled => ProxyErrorKind::Cancelled,
            Self::Upstream { .. } => ProxyErrorKind::Upstream,
        }
    }

    /// Outer response status for this failure
    ///
    /// `None` for client cancellation: the error propagates and nothing is
    /// written.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self.kind() {
            ProxyErrorKind::Connect
            | ProxyErrorKind::Ssl
            | ProxyErrorKind::InvalidResponse
            | ProxyErrorKind::TooManyRedirects
            | ProxyErrorKind::Upstream => Some(StatusCode::BAD_GATEWAY),
            ProxyErrorKind::Timeout => Some(StatusCode::GATEWAY_TIMEOUT),
            ProxyErrorKind::CircuitOpen => Some(StatusCode::SERVICE_UNAVAILABLE),
            ProxyErrorKind::BodyTooLarge => Some(StatusCode::PAYLOAD_TOO_LARGE),
            ProxyErrorKind::Cancelled => None,
        }
    }

    /// Classify a reqwest error against the upstream it targeted
    pub(crate) fn from_reqwest(err: &reqwest::Error, upstream: &str) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            Self::Timeout {
                upstream: upstream.to_string(),
                phase: TimeoutPhase::Request,
            }
        } else if err.is_redirect() {
            Self::TooManyRedirects {
                upstream: upstream.to_string(),
            }
        } else if err.is_connect() {
            let lowered = message.to_ascii_lowercase();
            if lowered.contains("tls") || lowered.contains("certificate") || lowered.contains("ssl")
            {
                Self::Ssl {
                    upstream: upstream.to_string(),
                    message,
                }
            } else {
                Self::Connect {
                    upstream: upstream.to_string(),
                    message,
                }
            }
        } else if err.is_decode() || err.is_body() {
            Self::InvalidResponse {
                upstream: upstream.to_string(),
                message,
            }
        } else {
            Self::Upstream {
                upstream: upstream.to_string(),
                message,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ProxyError::Connect {
                    upstream: "a:1".into(),
                    message: "refused".into(),
                },
                Some(StatusCode::BAD_GATEWAY),
            ),
            (
                ProxyError::Timeout {
                    upstream: "a:1".into(),
                    phase: TimeoutPhase::Idle,
                },
                Some(StatusCode::GATEWAY_TIMEOUT),
            ),
            (
                ProxyError::CircuitOpen {
                    upstream: "a:1".into(),
                },
                Some(StatusCode::SERVICE_UNAVAILABLE),
            ),
            (
                ProxyError::BodyTooLarge { limit: 1024 },
                Some(StatusCode::PAYLOAD_TOO_LARGE),
            ),
            (ProxyError::Cancelled, None),
        ];

        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected, "{err}");
        }
    }

    #[test]
    fn test_circuit_open_names_upstream() {
        let err = ProxyError::CircuitOpen {
            upstream: "api.internal:8443".into(),
        };
        assert!(err.to_string().contains("api.internal:8443"));
    }
}
