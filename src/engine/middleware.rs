//! Phase-tagged request middlewares.
//!
//! A middleware is a named hook with an integer priority attached to one of
//! four lifecycle phases: outer-request (at submission), inner-request
//! (just before dispatch), response, and request-exception. Hooks return a
//! [`Control`] value: phase-local short-circuits are part of the protocol,
//! not errors, so they live in the signature rather than the error type.
//!
//! Within a phase, middlewares run in ascending priority order; ties keep
//! registration order.

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::engine::context::RequestContext;
use crate::error::EngineError;
use crate::request::Request;
use crate::response::Response;

/// Outcome of one middleware invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Proceed to the next middleware in the phase.
    Continue,
    /// Skip the remaining middlewares of this phase.
    SkipPhase,
    /// Abort the whole dispatch. In the exception phase this also
    /// suppresses the errback.
    StopRequest,
}

/// Hook for the outer- and inner-request phases. May mutate the request.
#[async_trait]
pub trait RequestMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "request-middleware"
    }

    async fn handle(
        &self,
        request: &mut Request,
        cx: &RequestContext,
    ) -> Result<Control, EngineError>;
}

/// Hook for the response phase.
#[async_trait]
pub trait ResponseMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "response-middleware"
    }

    async fn handle(
        &self,
        request: &Request,
        response: &Response,
        cx: &RequestContext,
    ) -> Result<Control, EngineError>;
}

/// Hook for the request-exception phase.
#[async_trait]
pub trait ExceptionMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "exception-middleware"
    }

    async fn handle(
        &self,
        request: &Request,
        error: &EngineError,
        cx: &RequestContext,
    ) -> Result<Control, EngineError>;
}

pub(crate) struct Registered<M: ?Sized> {
    pub(crate) priority: i32,
    pub(crate) seq: usize,
    pub(crate) middleware: Box<M>,
}

/// All registered middlewares, bucketed by phase and kept sorted.
#[derive(Default)]
pub struct MiddlewareStack {
    outer: Vec<Registered<dyn RequestMiddleware>>,
    inner: Vec<Registered<dyn RequestMiddleware>>,
    response: Vec<Registered<dyn ResponseMiddleware>>,
    exception: Vec<Registered<dyn ExceptionMiddleware>>,
    next_seq: usize,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        MiddlewareStack::default()
    }

    pub fn add_outer(&mut self, priority: i32, middleware: impl RequestMiddleware + 'static) {
        let seq = self.bump();
        insert_sorted(&mut self.outer, priority, seq, Box::new(middleware));
    }

    pub fn add_inner(&mut self, priority: i32, middleware: impl RequestMiddleware + 'static) {
        let seq = self.bump();
        insert_sorted(&mut self.inner, priority, seq, Box::new(middleware));
    }

    pub fn add_response(&mut self, priority: i32, middleware: impl ResponseMiddleware + 'static) {
        let seq = self.bump();
        insert_sorted(&mut self.response, priority, seq, Box::new(middleware));
    }

    pub fn add_exception(&mut self, priority: i32, middleware: impl ExceptionMiddleware + 'static) {
        let seq = self.bump();
        insert_sorted(&mut self.exception, priority, seq, Box::new(middleware));
    }

    pub(crate) fn outer(&self) -> &[Registered<dyn RequestMiddleware>] {
        &self.outer
    }

    pub(crate) fn inner(&self) -> &[Registered<dyn RequestMiddleware>] {
        &self.inner
    }

    pub(crate) fn response(&self) -> &[Registered<dyn ResponseMiddleware>] {
        &self.response
    }

    pub(crate) fn exception(&self) -> &[Registered<dyn ExceptionMiddleware>] {
        &self.exception
    }

    fn bump(&mut self) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn insert_sorted<M: ?Sized>(
    bucket: &mut Vec<Registered<M>>,
    priority: i32,
    seq: usize,
    middleware: Box<M>,
) {
    bucket.push(Registered {
        priority,
        seq,
        middleware,
    });
    bucket.sort_by_key(|r| (r.priority, r.seq));
}

/// Wraps a closure as a named [`RequestMiddleware`].
pub fn request_fn<F>(name: impl Into<String>, f: F) -> impl RequestMiddleware
where
    F: for<'a> Fn(&'a mut Request, &'a RequestContext) -> BoxFuture<'a, Result<Control, EngineError>>
        + Send
        + Sync
        + 'static,
{
    FnRequestMiddleware {
        name: name.into(),
        f,
    }
}

struct FnRequestMiddleware<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> RequestMiddleware for FnRequestMiddleware<F>
where
    F: for<'a> Fn(&'a mut Request, &'a RequestContext) -> BoxFuture<'a, Result<Control, EngineError>>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        request: &mut Request,
        cx: &RequestContext,
    ) -> Result<Control, EngineError> {
        (self.f)(request, cx).await
    }
}

/// Wraps a closure as a named [`ResponseMiddleware`].
pub fn response_fn<F>(name: impl Into<String>, f: F) -> impl ResponseMiddleware
where
    F: for<'a> Fn(
            &'a Request,
            &'a Response,
            &'a RequestContext,
        ) -> BoxFuture<'a, Result<Control, EngineError>>
        + Send
        + Sync
        + 'static,
{
    FnResponseMiddleware {
        name: name.into(),
        f,
    }
}

struct FnResponseMiddleware<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> ResponseMiddleware for FnResponseMiddleware<F>
where
    F: for<'a> Fn(
            &'a Request,
            &'a Response,
            &'a RequestContext,
        ) -> BoxFuture<'a, Result<Control, EngineError>>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        request: &Request,
        response: &Response,
        cx: &RequestContext,
    ) -> Result<Control, EngineError> {
        (self.f)(request, response, cx).await
    }
}

/// Wraps a closure as a named [`ExceptionMiddleware`].
pub fn exception_fn<F>(name: impl Into<String>, f: F) -> impl ExceptionMiddleware
where
    F: for<'a> Fn(
            &'a Request,
            &'a EngineError,
            &'a RequestContext,
        ) -> BoxFuture<'a, Result<Control, EngineError>>
        + Send
        + Sync
        + 'static,
{
    FnExceptionMiddleware {
        name: name.into(),
        f,
    }
}

struct FnExceptionMiddleware<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F> ExceptionMiddleware for FnExceptionMiddleware<F>
where
    F: for<'a> Fn(
            &'a Request,
            &'a EngineError,
            &'a RequestContext,
        ) -> BoxFuture<'a, Result<Control, EngineError>>
        + Send
        + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        request: &Request,
        error: &EngineError,
        cx: &RequestContext,
    ) -> Result<Control, EngineError> {
        (self.f)(request, error, cx).await
    }
}
