//! The unit of outbound work.
//!
//! A [`Request`] carries everything needed to execute one HTTP exchange and
//! route its outcome: target and payload, per-request transport options, an
//! optional callback and errback, an extras bag forwarded to both, a
//! priority, and engine-internal annotations (identity, retry attempt,
//! rate-limit group override). Requests are built with consuming setter
//! methods and are immutable from the scheduler's point of view; only the
//! engine touches the annotations.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::engine::context::{AnyMap, RequestContext};
use crate::error::EngineError;
use crate::response::Response;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Handler invoked with a successful response.
pub type Callback =
    Arc<dyn Fn(Response, RequestContext) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

/// Handler invoked with a failure outcome.
pub type Errback =
    Arc<dyn Fn(EngineError, RequestContext) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

/// A query parameter value: scalar or repeated.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    Float(f64),
    List(Vec<String>),
}

impl ParamValue {
    /// Renders this value into flat `(key, value)` pairs; lists repeat the key.
    pub(crate) fn append_pairs(&self, key: &str, out: &mut Vec<(String, String)>) {
        match self {
            ParamValue::Str(s) => out.push((key.to_string(), s.clone())),
            ParamValue::Int(i) => out.push((key.to_string(), i.to_string())),
            ParamValue::Float(f) => out.push((key.to_string(), f.to_string())),
            ParamValue::List(items) => {
                for item in items {
                    out.push((key.to_string(), item.clone()));
                }
            }
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(v: Vec<String>) -> Self {
        ParamValue::List(v)
    }
}

/// Request payload.
#[derive(Debug, Clone)]
pub enum Body {
    Bytes(Bytes),
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Multipart(Vec<FormPart>),
}

/// One field of a multipart form.
#[derive(Debug, Clone)]
pub struct FormPart {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub content: Bytes,
}

/// Per-request rate-limit group override.
#[derive(Debug, Clone)]
pub struct GroupOverride {
    pub key: String,
    /// When set, replaces the group's interval for this dispatch only.
    pub interval: Option<Duration>,
}

/// Engine-internal annotations. User code reads these for diagnostics but
/// only middlewares and the retry subsystem write them.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Monotonic identity used in log lines. Retries keep the id of the
    /// original request.
    pub id: u64,
    /// Number of retry attempts already used (0 on first dispatch).
    pub attempt: u32,
    pub group: Option<GroupOverride>,
}

#[derive(Clone)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub params: Vec<(String, ParamValue)>,
    pub body: Option<Body>,
    pub headers: HeaderMap,
    pub proxy: Option<String>,
    pub verify_tls: Option<bool>,
    pub timeout: Option<Duration>,
    pub callback: Option<Callback>,
    pub errback: Option<Errback>,
    pub extras: AnyMap,
    /// Lower values dispatch earlier.
    pub priority: i32,
    pub meta: RequestMeta,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            url,
            method,
            params: Vec::new(),
            body: None,
            headers: HeaderMap::new(),
            proxy: None,
            verify_tls: None,
            timeout: None,
            callback: None,
            errback: None,
            extras: AnyMap::new(),
            priority: 0,
            meta: RequestMeta {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                attempt: 0,
                group: None,
            },
        }
    }

    pub fn get(url: Url) -> Self {
        Request::new(Method::GET, url)
    }

    pub fn post(url: Url) -> Self {
        Request::new(Method::POST, url)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Some(Body::Json(value));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = Some(Body::Form(fields));
        self
    }

    pub fn body_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.body = Some(Body::Bytes(bytes.into()));
        self
    }

    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = Some(Body::Multipart(parts));
        self
    }

    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = Some(verify);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Attaches a value to the extras bag, readable from the callback and
    /// errback context under `name`.
    pub fn extra<T: Send + Sync + 'static>(mut self, name: impl Into<String>, value: T) -> Self {
        self.extras.insert(name, value);
        self
    }

    /// Forces the rate-limit group for this request.
    pub fn rate_group(mut self, key: impl Into<String>) -> Self {
        self.meta.group = Some(GroupOverride {
            key: key.into(),
            interval: None,
        });
        self
    }

    /// Forces the rate-limit group and the interval used for this dispatch.
    pub fn rate_group_interval(mut self, key: impl Into<String>, interval: Duration) -> Self {
        self.meta.group = Some(GroupOverride {
            key: key.into(),
            interval: Some(interval),
        });
        self
    }

    pub fn callback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Response, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.callback = Some(Arc::new(move |resp, cx| {
            let fut: BoxFuture<'static, Result<(), EngineError>> = Box::pin(f(resp, cx));
            fut
        }));
        self
    }

    pub fn errback<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(EngineError, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.errback = Some(Arc::new(move |err, cx| {
            let fut: BoxFuture<'static, Result<(), EngineError>> = Box::pin(f(err, cx));
            fut
        }));
        self
    }

    /// The target URL with query parameters appended.
    pub fn url_with_params(&self) -> Url {
        if self.params.is_empty() {
            return self.url.clone();
        }
        let mut pairs = Vec::new();
        for (key, value) in &self.params {
            value.append_pairs(key, &mut pairs);
        }
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .extend_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        url
    }

    /// Rendered query pairs, for adapters that take them separately.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (key, value) in &self.params {
            value.append_pairs(key, &mut pairs);
        }
        pairs
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.meta.id)
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("priority", &self.priority)
            .field("attempt", &self.meta.attempt)
            .field("has_callback", &self.callback.is_some())
            .field("has_errback", &self.errback.is_some())
            .finish()
    }
}
