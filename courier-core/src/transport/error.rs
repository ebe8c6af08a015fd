//! Transport error taxonomy.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

const MAX_MESSAGE_CHARS: usize = 256;

/// Closed classification of request failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 401 - credentials missing or expired.
    Unauthorized,
    /// 403
    Forbidden,
    /// 404
    NotFound,
    /// 409 - server state moved on.
    Conflict,
    /// 429
    RateLimited,
    /// 5xx
    ServerError,
    /// Connect or receive timeout.
    Timeout,
    /// No route to the server.
    NetworkUnreachable,
    /// Anything else, including unexpected statuses and malformed bodies.
    Unknown,
}

impl ErrorClass {
    /// Classifies an HTTP status. Returns `None` for success statuses.
    pub fn from_status(status: StatusCode) -> Option<Self> {
        if status.is_success() {
            return None;
        }
        let class = match status.as_u16() {
            401 => ErrorClass::Unauthorized,
            403 => ErrorClass::Forbidden,
            404 => ErrorClass::NotFound,
            409 => ErrorClass::Conflict,
            429 => ErrorClass::RateLimited,
            500..=599 => ErrorClass::ServerError,
            _ => ErrorClass::Unknown,
        };
        Some(class)
    }

    /// Classifies a client-side failure reported by reqwest.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            ErrorClass::Timeout
        } else if err.is_connect() || err.is_request() {
            ErrorClass::NetworkUnreachable
        } else if let Some(status) = err.status() {
            ErrorClass::from_status(status).unwrap_or(ErrorClass::Unknown)
        } else {
            ErrorClass::Unknown
        }
    }

    /// Whether failures of this class are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimited
                | ErrorClass::ServerError
                | ErrorClass::Timeout
                | ErrorClass::NetworkUnreachable
                | ErrorClass::Unknown
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::Unauthorized => "unauthorized",
            ErrorClass::Forbidden => "forbidden",
            ErrorClass::NotFound => "not found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::RateLimited => "rate limited",
            ErrorClass::ServerError => "server error",
            ErrorClass::Timeout => "timeout",
            ErrorClass::NetworkUnreachable => "network unreachable",
            ErrorClass::Unknown => "unknown error",
        };
        write!(f, "{}", name)
    }
}

/// Errors returned by [`Transport::send`](super::Transport::send).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The request failed with a classified error.
    #[error("{class}{}: {message}", .status.map(|s| format!(" ({})", s)).unwrap_or_default())]
    Http {
        /// Failure class.
        class: ErrorClass,
        /// HTTP status, when the server answered.
        status: Option<u16>,
        /// Server body preview or client error text.
        message: String,
    },

    /// The refresh token was rejected; the driver must sign in again.
    #[error("session expired, sign in again")]
    SessionExpired,

    /// The request was abandoned because the session was torn down.
    #[error("request cancelled")]
    Cancelled,

    /// The response body did not match the expected shape.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    Build(String),
}

impl TransportError {
    pub(crate) fn http(class: ErrorClass, status: Option<u16>, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.chars().count() > MAX_MESSAGE_CHARS {
            message = message.chars().take(MAX_MESSAGE_CHARS).collect::<String>() + "...";
        }
        TransportError::Http {
            class,
            status,
            message,
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        let class = ErrorClass::from_reqwest(&err);
        let status = err.status().map(|s| s.as_u16());
        Self::http(class, status, err.to_string())
    }

    /// Failure class of this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Http { class, .. } => *class,
            TransportError::SessionExpired => ErrorClass::Unauthorized,
            TransportError::Cancelled | TransportError::Decode(_) | TransportError::Build(_) => {
                ErrorClass::Unknown
            }
        }
    }

    /// Whether the error is transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::SessionExpired | TransportError::Cancelled => false,
            TransportError::Build(_) => false,
            _ => self.class().is_retryable(),
        }
    }

    /// Whether the error means the session is gone and nothing else will
    /// succeed until the driver signs in again.
    pub fn ends_session(&self) -> bool {
        matches!(
            self,
            TransportError::SessionExpired | TransportError::Cancelled
        )
    }
}
