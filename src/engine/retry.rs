//! Automatic retries for failed dispatches.
//!
//! Registered in the request-exception phase when `retry.enabled` is set.
//! A trigger outcome (configured status, configured transport kind) starts
//! a detached timer task that sleeps out the backoff delay and re-submits a
//! clone of the request with its attempt counter incremented, directly to
//! the scheduler so the re-submission keeps the original request identity
//! and skips the outer-request phase. The timer is tracked in
//! [`EngineState::pending_retries`], which keeps the drain condition honest
//! and shields the delay from shutdown cancellation.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::engine::context::RequestContext;
use crate::engine::middleware::{Control, ExceptionMiddleware};
use crate::error::EngineError;
use crate::rate_limit::RETRY_AFTER_CAP;
use crate::request::Request;
use crate::scheduler::Scheduler;
use crate::state::EngineState;
use crate::stats::StatCollector;

pub struct RetryMiddleware {
    config: RetryConfig,
    scheduler: Arc<Scheduler>,
    state: Arc<EngineState>,
    stats: Arc<StatCollector>,
}

impl RetryMiddleware {
    pub(crate) fn new(
        config: RetryConfig,
        scheduler: Arc<Scheduler>,
        state: Arc<EngineState>,
        stats: Arc<StatCollector>,
    ) -> Self {
        if config.enabled {
            info!(
                attempts = config.attempts,
                backoff = ?config.backoff,
                "retry middleware enabled"
            );
        }
        RetryMiddleware {
            config,
            scheduler,
            state,
            stats,
        }
    }

    fn should_retry(&self, error: &EngineError) -> bool {
        match error {
            EngineError::Http(http) => self.config.statuses.contains(&http.status.as_u16()),
            EngineError::Transport(transport) => self.config.kinds.contains(&transport.kind()),
            _ => false,
        }
    }

    fn delay_for(&self, error: &EngineError, attempt: u32) -> std::time::Duration {
        if let EngineError::Http(http) = error {
            let status = http.status.as_u16();
            if status == 429 || status == 503 {
                if let Some(retry_after) = http.retry_after() {
                    return retry_after.min(RETRY_AFTER_CAP);
                }
            }
        }
        self.config
            .backoff
            .delay(self.config.base_delay, self.config.max_delay, attempt)
    }
}

#[async_trait]
impl ExceptionMiddleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(
        &self,
        request: &Request,
        error: &EngineError,
        _cx: &RequestContext,
    ) -> Result<Control, EngineError> {
        if !self.config.enabled || !self.should_retry(error) {
            return Ok(Control::Continue);
        }

        let attempt = request.meta.attempt;
        if attempt >= self.config.attempts {
            debug!(
                id = request.meta.id,
                attempts = attempt,
                "retries exhausted; passing failure through"
            );
            return Ok(Control::Continue);
        }

        let delay = self.delay_for(error, attempt);
        let mut retry = request.clone();
        retry.meta.attempt = attempt + 1;

        debug!(
            id = retry.meta.id,
            attempt = retry.meta.attempt,
            delay = ?delay,
            "retry scheduled"
        );
        self.stats.increment_requests_retried();

        // The timer runs detached so shutdown cancellation cannot clip the
        // delay; pending_retries keeps the drain condition aware of it.
        self.state
            .pending_retries
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let scheduler = Arc::clone(&self.scheduler);
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let id = retry.meta.id;
            // Straight to the scheduler: the re-submission preserves the
            // request identity and skips the outer-request phase.
            if let Err(e) = scheduler.submit(retry).await {
                warn!(id, error = %e, "retry re-enqueue failed");
            }
            state
                .pending_retries
                .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        });

        if self.config.stop_processing {
            Ok(Control::StopRequest)
        } else {
            Ok(Control::Continue)
        }
    }
}
