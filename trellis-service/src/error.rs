//! Error types and HTTP status mapping

use http::StatusCode;
use thiserror::Error;

use crate::proxy::ProxyError;
use crate::tasks::StoreError;

/// Result type alias using the framework error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the framework
///
/// Large error variants are boxed to reduce stack size
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP protocol error
    #[error("HTTP error: {0}")]
    Http(Box<http::Error>),

    /// Route table construction error (duplicate parameter children, bad pattern)
    #[error("Route conflict: {0}")]
    RouteConflict(String),

    /// Proxy error with its failure taxonomy
    #[error("{0}")]
    Proxy(#[from] ProxyError),

    /// Task store error
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Enqueue for a task name with no registered handler
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    /// JWT error
    #[error("JWT error: {0}")]
    Jwt(Box<jsonwebtoken::errors::Error>),

    /// Authentication error (password hashing, token generation, etc.)
    #[error("Auth error: {0}")]
    Auth(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// Authorization error
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Validation error (422)
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Response already committed; status line can no longer change
    #[error("Response already committed")]
    ResponseCommitted,

    /// Client went away mid-response
    #[error("Client disconnected")]
    ClientDisconnected,

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Internal server error
    #[error("Internal server error: {0}")]
    Internal(String),

    /// Handler-level error carrying arbitrary context
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl Error {
    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Create a bad-request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Error::BadRequest(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Error::Unauthorized(msg.into())
    }

    /// HTTP status this error maps to when it escapes to the server loop
    /// with an uncommitted response
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Proxy(e) => e
                .status_code()
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Unauthorized(_) | Error::Jwt(_) | Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Manual From implementations for boxed errors
impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Http(Box::new(err))
    }
}

impl From<jsonwebtoken::errors::Error> for Error {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Error::Jwt(Box::new(err))
    }
}
