//! The result of a successful network exchange.
//!
//! A [`Response`] lives for the duration of the callback that receives it.
//! The body is held as one immutable byte buffer read exactly once by the
//! adapter; `text` and `json` decode it on demand.

use std::borrow::Cow;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::EngineError;

pub struct Response {
    method: Method,
    request_url: Url,
    final_url: Url,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Assembles a response. Called by HTTP adapters and test fixtures.
    pub fn new(
        method: Method,
        request_url: Url,
        final_url: Url,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Response {
            method,
            request_url,
            final_url,
            status,
            headers,
            body,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL the originating request asked for.
    pub fn request_url(&self) -> &Url {
        &self.request_url
    }

    /// The URL the exchange ended on, after redirects.
    pub fn url(&self) -> &Url {
        &self.final_url
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// A single header as text, when present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(http::header::CONTENT_TYPE.as_str())
    }

    /// True when the status is below 400.
    pub fn ok(&self) -> bool {
        self.status.as_u16() < 400
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Body decoded as JSON into `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, EngineError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| anyhow::anyhow!("response body is not valid JSON: {e}").into())
    }

    /// The `Retry-After` header as a duration, when present and parseable.
    pub fn retry_after(&self) -> Option<Duration> {
        parse_retry_after(&self.headers)
    }

    /// Consumes the response, returning the body buffer.
    pub fn into_bytes(self) -> Bytes {
        self.body
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("method", &self.method)
            .field("url", &self.final_url.as_str())
            .field("status", &self.status)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Parses `Retry-After` in its delta-seconds form (integer or fractional).
/// HTTP-date values are not interpreted; callers treat absence and
/// unparseable values the same way.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;
    let seconds: f64 = raw.trim().parse().ok()?;
    if seconds.is_finite() && seconds >= 0.0 {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}
