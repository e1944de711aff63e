//! Executes one dispatch.
//!
//! For a single request the order is: inner-request middlewares, rate-limit
//! acquire, the HTTP adapter call (latency measured around it), outcome
//! report to the limiter, then the response phase and callback. When the
//! adapter failed or the status is 400+, the exception phase and the
//! errback run instead. Control signals short-circuit phases as documented
//! on [`Control`]; real middleware errors divert the dispatch into the
//! failure path, mirroring what a thrown error would do.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::client::HttpClient;
use crate::engine::context::{AnyMap, EngineHandles, RequestContext};
use crate::engine::middleware::Control;
use crate::error::{EngineError, HttpError};
use crate::rate_limit::{RateLimiter, RequestOutcome};
use crate::request::Request;
use crate::response::Response;
use crate::stats::StatCollector;

pub(crate) struct RequestManager {
    client: Arc<dyn HttpClient>,
    limiter: Arc<RateLimiter>,
    handles: Arc<EngineHandles>,
}

impl RequestManager {
    pub(crate) fn new(
        client: Arc<dyn HttpClient>,
        limiter: Arc<RateLimiter>,
        handles: Arc<EngineHandles>,
    ) -> Self {
        RequestManager {
            client,
            limiter,
            handles,
        }
    }

    pub(crate) fn stats(&self) -> &StatCollector {
        &self.handles.stats
    }

    /// Context without request extras, for entry functions and lifespan.
    pub(crate) fn root_context(&self) -> RequestContext {
        RequestContext::new(Arc::clone(&self.handles), AnyMap::new())
    }

    fn context_for(&self, request: &Request) -> RequestContext {
        RequestContext::new(Arc::clone(&self.handles), request.extras.clone())
    }

    /// Runs one request to its settled outcome. Never returns an error:
    /// every failure is routed through the exception phase and errback.
    pub(crate) async fn execute(&self, mut request: Request) {
        let cx = self.context_for(&request);

        // Inner-request phase.
        for registered in self.handles.stack.inner() {
            match registered.middleware.handle(&mut request, &cx).await {
                Ok(Control::Continue) => {}
                Ok(Control::SkipPhase) => {
                    debug!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        "inner phase skipped"
                    );
                    break;
                }
                Ok(Control::StopRequest) => {
                    debug!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        "dispatch dropped by inner middleware"
                    );
                    self.handles.stats.increment_requests_dropped();
                    return;
                }
                Err(e) => {
                    self.handles.stats.increment_requests_failed();
                    self.fail(request, e, &cx).await;
                    return;
                }
            }
        }

        let group_key = self.limiter.acquire(&request).await;

        trace!(id = request.meta.id, method = %request.method, url = %request.url, "dispatching");
        self.handles.stats.increment_requests_dispatched();
        let started = Instant::now();
        let result = self.client.dispatch(&request).await;
        let latency = started.elapsed();

        let outcome = match &result {
            Ok(response) => RequestOutcome::from_status(
                response.status().as_u16(),
                response.retry_after(),
                latency,
            ),
            Err(transport) => RequestOutcome::from_transport(transport.kind(), latency),
        };
        self.limiter.record_outcome(&group_key, outcome);

        match result {
            Err(transport) => {
                self.handles.stats.increment_requests_failed();
                self.fail(request, EngineError::Transport(transport), &cx).await;
            }
            Ok(response) => {
                self.handles
                    .stats
                    .record_response(response.status().as_u16(), response.bytes().len());

                if response.status().as_u16() >= 400 {
                    self.handles.stats.increment_requests_failed();
                    let error = EngineError::Http(HttpError {
                        method: request.method.clone(),
                        url: response.url().clone(),
                        status: response.status(),
                        headers: response.headers().clone(),
                        body: response.bytes().clone(),
                    });
                    self.fail(request, error, &cx).await;
                } else {
                    self.handles.stats.increment_requests_succeeded();
                    self.succeed(request, response, cx).await;
                }
            }
        }
    }

    async fn succeed(&self, request: Request, response: Response, cx: RequestContext) {
        // Response phase.
        for registered in self.handles.stack.response() {
            match registered.middleware.handle(&request, &response, &cx).await {
                Ok(Control::Continue) => {}
                Ok(Control::SkipPhase) => {
                    debug!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        "response phase skipped"
                    );
                    break;
                }
                Ok(Control::StopRequest) => {
                    debug!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        "dispatch stopped by response middleware"
                    );
                    return;
                }
                Err(e) => {
                    self.fail(request, e, &cx).await;
                    return;
                }
            }
        }

        if let Some(callback) = request.callback.clone() {
            if let Err(e) = callback.as_ref()(response, cx.clone()).await {
                warn!(id = request.meta.id, error = %e, "callback failed");
                self.fail(request, e, &cx).await;
            }
        }
    }

    /// Exception phase, then the errback.
    async fn fail(&self, request: Request, error: EngineError, cx: &RequestContext) {
        for registered in self.handles.stack.exception() {
            match registered.middleware.handle(&request, &error, cx).await {
                Ok(Control::Continue) => {}
                Ok(Control::SkipPhase) => {
                    debug!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        "exception phase skipped; errback still runs"
                    );
                    break;
                }
                Ok(Control::StopRequest) => {
                    debug!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        "failure suppressed by exception middleware"
                    );
                    return;
                }
                Err(e) => {
                    // Mirrors a re-raise: the failure ends here and the
                    // errback never sees it.
                    error!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        error = %e,
                        "exception middleware failed"
                    );
                    return;
                }
            }
        }

        match request.errback.clone() {
            Some(errback) => {
                if let Err(errback_error) = errback.as_ref()(error, cx.clone()).await {
                    error!(
                        id = request.meta.id,
                        error = %errback_error,
                        "errback failed"
                    );
                }
            }
            None => {
                warn!(
                    id = request.meta.id,
                    method = %request.method,
                    url = %request.url,
                    error = %error,
                    "request failed with no errback"
                );
            }
        }
    }
}
