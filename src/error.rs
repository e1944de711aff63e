//! Error taxonomy for the engine.
//!
//! Everything fallible in the crate flows through [`EngineError`]. Transport
//! faults from the HTTP adapter and terminal non-2xx responses get their own
//! types so that retry triggers and rate-limit adaptation can match on them
//! without string inspection.

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;
use url::Url;

use crate::response::parse_retry_after;

/// Classification of a transport failure, used for retry and rate-limit
/// trigger matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Connection could not be established (DNS, refused, TLS handshake).
    Connect,
    /// The request or body read exceeded its deadline.
    Timeout,
    /// The exchange started but violated the protocol (bad frame, decode).
    Protocol,
}

/// A failure below the HTTP layer: the exchange produced no usable response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportError::Connect(_) => TransportKind::Connect,
            TransportError::Timeout(_) => TransportKind::Timeout,
            TransportError::Protocol(_) => TransportKind::Protocol,
        }
    }
}

/// A terminal non-2xx response. Carries enough of the exchange for error
/// handlers and the retry middleware (status, headers, body snippet).
#[derive(Debug, Error)]
#[error("{method} {url}: {status}")]
pub struct HttpError {
    pub method: Method,
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpError {
    /// The `Retry-After` header as a duration, when present and parseable.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        parse_retry_after(&self.headers)
    }
}

/// Umbrella error for everything the engine can surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Terminal non-2xx response (after retries, if any, are exhausted).
    #[error("http error: {0}")]
    Http(#[from] HttpError),

    /// Connection, timeout, or protocol failure from the HTTP adapter.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A handler asked for a dependency that was never registered, or
    /// registered under a different type.
    #[error("missing dependency `{0}`")]
    DependencyMissing(String),

    /// Strict-mode pipeline dispatch for an item type with no pipelines.
    #[error("no pipeline registered for item type `{0}`")]
    UnknownItem(String),

    /// Malformed request data supplied by user code.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A pipeline or pipeline middleware failed while processing an item.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Submission was attempted after the scheduler closed.
    #[error("scheduler is shutting down")]
    ShutdownInProgress,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Escape hatch for user callbacks and lifespan hooks.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<url::ParseError> for EngineError {
    fn from(e: url::ParseError) -> Self {
        EngineError::InvalidRequest(format!("invalid URL: {e}"))
    }
}

impl EngineError {
    /// True for misuse errors that should surface to the caller of the entry
    /// function and make the runner exit non-zero.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::DependencyMissing(_)
                | EngineError::UnknownItem(_)
                | EngineError::InvalidRequest(_)
                | EngineError::Config(_)
        )
    }
}

/// Configuration errors name the offending key so that a bad environment
/// variable is diagnosable without a debugger.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {value:?} (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("`{key}` must be greater than zero")]
    NotPositive { key: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_matches_variant() {
        assert_eq!(
            TransportError::Timeout("deadline".into()).kind(),
            TransportKind::Timeout
        );
        assert_eq!(
            TransportError::Connect("refused".into()).kind(),
            TransportKind::Connect
        );
    }

    #[test]
    fn client_error_classification() {
        assert!(EngineError::DependencyMissing("db".into()).is_client_error());
        assert!(EngineError::UnknownItem("Quote".into()).is_client_error());
        assert!(!EngineError::ShutdownInProgress.is_client_error());
        assert!(!EngineError::Transport(TransportError::Timeout("t".into())).is_client_error());
    }

    #[test]
    fn http_error_exposes_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "120".parse().unwrap());
        let err = HttpError {
            method: Method::GET,
            url: Url::parse("https://example.com/a").unwrap(),
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: Bytes::new(),
        };
        assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(120)));
    }
}
