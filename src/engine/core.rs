//! The engine orchestrator.
//!
//! `Engine::build` wires the registry into running components; `run` drives
//! a complete execution: lifespan setup, worker pool start, entry
//! functions, the drain watch, and the shutdown sequence. Two cancellation
//! tokens separate "stop waiting and close up" (graceful shutdown) from
//! "cut in-flight work now" (forced); the runner escalates from one to the
//! other on repeated signals or an expired grace period.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::client::build_http_client;
use crate::config::Config;
use crate::engine::context::{Dependencies, EngineHandles};
use crate::engine::pipeline::PipelineDispatcher;
use crate::engine::request_manager::RequestManager;
use crate::engine::retry::RetryMiddleware;
use crate::error::EngineError;
use crate::rate_limit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::scraper::{EntryFn, Lifespan, Scraper};
use crate::state::{ActivityGuard, EngineState};
use crate::stats::StatCollector;

pub(crate) struct Engine {
    config: Config,
    scheduler: Arc<Scheduler>,
    limiter: Arc<RateLimiter>,
    manager: Arc<RequestManager>,
    dispatcher: Arc<PipelineDispatcher>,
    state: Arc<EngineState>,
    stats: Arc<StatCollector>,
    entries: Vec<EntryFn>,
    lifespan: Option<Arc<dyn Lifespan>>,
    shutdown: CancellationToken,
    force: CancellationToken,
}

impl Engine {
    pub(crate) fn build(scraper: Scraper) -> Result<Engine, EngineError> {
        let Scraper {
            config,
            entries,
            mut middlewares,
            pipelines,
            dependencies,
            lifespan,
            client,
            group_by,
        } = scraper;
        config.validate()?;

        let state = EngineState::new();
        let stats = Arc::new(StatCollector::new());
        let scheduler = Scheduler::new(&config.scheduler);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit, &config.retry, group_by));

        if config.retry.enabled {
            middlewares.add_exception(
                config.retry.priority,
                RetryMiddleware::new(
                    config.retry.clone(),
                    Arc::clone(&scheduler),
                    Arc::clone(&state),
                    Arc::clone(&stats),
                ),
            );
        }

        let dispatcher = Arc::new(PipelineDispatcher::new(
            pipelines,
            &config.pipeline,
            Arc::clone(&state),
            Arc::clone(&stats),
        ));

        let handles = Arc::new(EngineHandles {
            scheduler: Arc::clone(&scheduler),
            stack: Arc::new(middlewares),
            dispatcher: Arc::clone(&dispatcher),
            stats: Arc::clone(&stats),
            deps: Arc::new(dependencies),
        });

        let client = client.unwrap_or_else(|| build_http_client(&config.session));
        let manager = Arc::new(RequestManager::new(client, Arc::clone(&limiter), handles));

        Ok(Engine {
            config,
            scheduler,
            limiter,
            manager,
            dispatcher,
            state,
            stats,
            entries,
            lifespan,
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
        })
    }

    /// Token that ends the drain watch and starts the shutdown sequence.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token that cancels in-flight dispatches.
    pub(crate) fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    pub(crate) fn shutdown_grace(&self) -> Duration {
        self.config.execution.shutdown_timeout
    }

    pub(crate) async fn run(&self) -> Result<(), EngineError> {
        info!(
            concurrent_requests = self.config.scheduler.concurrent_requests,
            rate_limit = self.config.rate_limit.enabled,
            retry = self.config.retry.enabled,
            "engine starting"
        );

        let cx = self.manager.root_context();
        if let Some(lifespan) = &self.lifespan {
            lifespan.setup(&cx).await?;
            debug!("lifespan setup complete");
        }

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.scheduler.concurrent_requests {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&self.scheduler),
                Arc::clone(&self.manager),
                Arc::clone(&self.state),
                self.force.clone(),
            ));
        }
        let sweeper = self.limiter.spawn_sweeper(self.shutdown.clone());

        let mut entry_error: Option<EngineError> = None;
        let results = join_all(self.entries.iter().map(|entry| entry.as_ref()(cx.clone()))).await;
        for result in results {
            if let Err(e) = result {
                error!(error = %e, "entry function failed");
                entry_error.get_or_insert(e);
            }
        }

        if entry_error.is_none() {
            self.wait_for_drain().await;
        } else {
            warn!("starting shutdown after entry failure");
        }

        self.shutdown_sequence(workers, sweeper).await;

        match entry_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn drained(&self) -> bool {
        self.scheduler.outstanding() == 0 && self.state.is_idle()
    }

    /// Blocks until everything submitted has settled, the shutdown token
    /// fires, or the execution timeout elapses.
    async fn wait_for_drain(&self) {
        let check_interval = self.config.execution.shutdown_check_interval;
        let watch = async {
            loop {
                if self.drained() {
                    // Settle briefly and confirm; a worker may be between
                    // taking a request and recording it as in-flight.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    if self.drained() {
                        break;
                    }
                    continue;
                }
                tokio::time::sleep(check_interval).await;
            }
        };
        let watch = async {
            tokio::select! {
                _ = watch => info!("all work drained"),
                _ = self.shutdown.cancelled() => info!("shutdown requested"),
            }
        };

        match self.config.execution.timeout {
            Some(limit) => {
                if tokio::time::timeout(limit, watch).await.is_err() {
                    log_timeout(self.config.execution.timeout_log_level, limit);
                    self.shutdown.cancel();
                }
            }
            None => watch.await,
        }
    }

    async fn shutdown_sequence(&self, mut workers: JoinSet<()>, sweeper: JoinHandle<()>) {
        self.scheduler.close();

        let close_timeout = self.config.scheduler.close_timeout;
        let joined = tokio::time::timeout(close_timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            warn!(
                timeout = ?close_timeout,
                "in-flight dispatches did not finish in time; cancelling"
            );
            self.force.cancel();
            while workers.join_next().await.is_some() {}
        }
        sweeper.abort();

        let dropped = self.scheduler.drain();
        if dropped > 0 {
            warn!(dropped, "queued requests dropped at shutdown");
            self.stats.add_requests_dropped(dropped);
        }

        // Pipeline close runs in its own task so a force-cancelled caller
        // cannot clip it.
        let dispatcher = Arc::clone(&self.dispatcher);
        if tokio::spawn(async move { dispatcher.close().await })
            .await
            .is_err()
        {
            error!("pipeline close task panicked");
        }

        // Lifespan teardown is shielded the same way; its failure is logged
        // and never masks the run result.
        if let Some(lifespan) = self.lifespan.clone() {
            match tokio::spawn(async move { lifespan.teardown().await }).await {
                Ok(Ok(())) => debug!("lifespan teardown complete"),
                Ok(Err(e)) => error!(error = %e, "lifespan teardown failed"),
                Err(_) => error!("lifespan teardown panicked"),
            }
        }

        info!("{}", self.stats);
    }
}

async fn worker_loop(
    worker_id: usize,
    scheduler: Arc<Scheduler>,
    manager: Arc<RequestManager>,
    state: Arc<EngineState>,
    force: CancellationToken,
) {
    trace!(worker_id, "worker started");
    while let Some(queued) = scheduler.take_next().await {
        let crate::scheduler::QueuedRequest {
            request, permit, ..
        } = queued;
        let id = request.meta.id;
        let guard = ActivityGuard::enter(&state.in_flight_requests);
        tokio::select! {
            _ = manager.execute(request) => {}
            _ = force.cancelled() => {
                // Taken but never settled: dropped, not silently re-queued.
                warn!(worker_id, id, "dispatch cancelled during shutdown; request dropped");
                manager.stats().increment_requests_dropped();
            }
        }
        drop(guard);
        drop(permit);
    }
    trace!(worker_id, "worker stopped");
}

fn log_timeout(level: tracing::Level, limit: Duration) {
    match level {
        tracing::Level::TRACE => trace!(?limit, "execution timeout reached; shutting down"),
        tracing::Level::DEBUG => debug!(?limit, "execution timeout reached; shutting down"),
        tracing::Level::INFO => info!(?limit, "execution timeout reached; shutting down"),
        tracing::Level::WARN => warn!(?limit, "execution timeout reached; shutting down"),
        tracing::Level::ERROR => error!(?limit, "execution timeout reached; shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{Exchange, ScriptedClient};
    use crate::config::{AdaptiveConfig, Backoff};
    use crate::engine::middleware::{request_fn, Control};
    use crate::engine::pipeline::{ItemFlow, Pipeline, PipelineMiddleware};
    use crate::request::Request;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;
    use url::Url;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://api.example.com{path}")).unwrap()
    }

    fn base_config(concurrent: usize, pending: usize) -> Config {
        let mut config = Config::default();
        config.scheduler.concurrent_requests = concurrent;
        config.scheduler.pending_requests = pending;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn burst_respects_concurrency_bound_and_pacing() {
        let client = ScriptedClient::new(vec![]);
        let completed = Arc::new(AtomicUsize::new(0));

        let mut config = base_config(10, 200);
        config.rate_limit.enabled = true;
        config.rate_limit.default_interval = Duration::from_millis(100);

        let completed_in = Arc::clone(&completed);
        let scraper = Scraper::new(config)
            .http_client(client.clone())
            .entry(move |cx| {
                let completed = Arc::clone(&completed_in);
                async move {
                    for i in 0..100 {
                        let completed = Arc::clone(&completed);
                        cx.send_request(Request::get(url(&format!("/item/{i}"))).callback(
                            move |_response, _cx| {
                                let completed = Arc::clone(&completed);
                                async move {
                                    completed.fetch_add(1, Ordering::SeqCst);
                                    Ok(())
                                }
                            },
                        ))
                        .await?;
                    }
                    Ok(())
                }
            });

        let started = Instant::now();
        let engine = Engine::build(scraper).unwrap();
        engine.run().await.unwrap();

        assert_eq!(completed.load(Ordering::SeqCst), 100);
        assert_eq!(client.call_count(), 100);
        assert!(client.max_in_flight.load(Ordering::SeqCst) <= 10);
        // One group at 100ms per slot: the 100th dispatch waits 9.9s.
        assert!(started.elapsed() >= Duration::from_millis(9_900));
        assert!(engine.state.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_interval_follows_outcome_sequence() {
        let client = ScriptedClient::new(vec![
            Exchange::Status(429),
            Exchange::Status(503),
            Exchange::Status(200),
            Exchange::Status(200),
            Exchange::Status(200),
            Exchange::Status(200),
            Exchange::Status(200),
        ]);

        let mut config = base_config(1, 10);
        config.rate_limit.enabled = true;
        config.rate_limit.default_interval = Duration::from_millis(100);
        config.rate_limit.adaptive = Some(AdaptiveConfig {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(10),
            increase_factor: 2.0,
            decrease_step: Duration::from_millis(50),
            success_threshold: 5,
            inherit_retry_triggers: false,
            ..AdaptiveConfig::default()
        });

        let scraper = Scraper::new(config)
            .http_client(client.clone())
            .entry(move |cx| async move {
                for i in 0..7 {
                    cx.send_request(Request::get(url(&format!("/seq/{i}")))).await?;
                }
                Ok(())
            });

        let engine = Engine::build(scraper).unwrap();
        engine.run().await.unwrap();

        // 100ms doubled twice by the failures, then cut by one decrease
        // step when the fifth straight success lands.
        let snapshot = engine.limiter.group_snapshot("api.example.com").unwrap();
        assert_eq!(snapshot.interval, Duration::from_millis(350));
        assert_eq!(snapshot.successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outer_stop_prevents_enqueue() {
        let client = ScriptedClient::new(vec![]);
        let scraper = Scraper::new(base_config(1, 10))
            .http_client(client.clone())
            .outer_middleware(
                10,
                request_fn("gate", |_req, _cx| {
                    Box::pin(async { Ok(Control::StopRequest) })
                }),
            )
            .entry(move |cx| async move {
                cx.send_request(Request::get(url("/blocked"))).await
            });

        let engine = Engine::build(scraper).unwrap();
        engine.run().await.unwrap();
        assert_eq!(client.call_count(), 0, "stopped submission must not dispatch");
        assert_eq!(engine.stats.requests_enqueued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outer_middleware_error_surfaces_to_sender() {
        let client = ScriptedClient::new(vec![]);
        let scraper = Scraper::new(base_config(1, 10))
            .http_client(client.clone())
            .outer_middleware(
                10,
                request_fn("broken", |_req, _cx| {
                    Box::pin(async { Err(EngineError::InvalidRequest("rejected".into())) })
                }),
            )
            .entry(move |cx| async move { cx.send_request(Request::get(url("/x"))).await });

        let engine = Engine::build(scraper).unwrap();
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidRequest(_)));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_delays_next_dispatch_in_group() {
        let client = ScriptedClient::new(vec![
            Exchange::StatusWithHeaders(429, vec![("retry-after", "3".to_string())]),
            Exchange::Status(200),
        ]);

        let mut config = base_config(1, 10);
        config.rate_limit.enabled = true;
        config.rate_limit.default_interval = Duration::from_millis(100);
        config.rate_limit.adaptive = Some(AdaptiveConfig {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(60),
            inherit_retry_triggers: false,
            ..AdaptiveConfig::default()
        });

        let scraper = Scraper::new(config)
            .http_client(client.clone())
            .entry(move |cx| async move {
                cx.send_request(Request::get(url("/a"))).await?;
                cx.send_request(Request::get(url("/b"))).await?;
                Ok(())
            });

        let started = Instant::now();
        let engine = Engine::build(scraper).unwrap();
        engine.run().await.unwrap();

        // The server's 3s Retry-After becomes the group interval, so the
        // second dispatch waits it out.
        assert!(started.elapsed() >= Duration::from_secs(3));
        let snapshot = engine.limiter.group_snapshot("api.example.com").unwrap();
        assert_eq!(snapshot.interval, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn lower_priority_value_dispatches_first() {
        let client = ScriptedClient::new(vec![]);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let order_in = Arc::clone(&order);
        let scraper = Scraper::new(base_config(1, 10))
            .http_client(client.clone())
            .entry(move |cx| {
                let order = Arc::clone(&order_in);
                async move {
                    for (marker, priority) in [("first", 0), ("low", 5), ("high", 1)] {
                        let order = Arc::clone(&order);
                        cx.send_request(
                            Request::get(url(&format!("/{marker}")))
                                .priority(priority)
                                .callback(move |_response, _cx| {
                                    let order = Arc::clone(&order);
                                    async move {
                                        order.lock().push(marker);
                                        Ok(())
                                    }
                                }),
                        )
                        .await?;
                    }
                    Ok(())
                }
            });

        Engine::build(scraper).unwrap().run().await.unwrap();
        assert_eq!(*order.lock(), vec!["first", "high", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_and_calls_callback_exactly_once() {
        let client = ScriptedClient::new(vec![
            Exchange::Status(500),
            Exchange::Status(500),
            Exchange::Status(200),
        ]);
        let callbacks = Arc::new(AtomicUsize::new(0));
        let errbacks = Arc::new(AtomicUsize::new(0));

        let mut config = base_config(1, 10);
        config.retry.enabled = true;
        config.retry.attempts = 2;
        config.retry.backoff = Backoff::Constant;
        config.retry.base_delay = Duration::from_millis(50);

        let callbacks_in = Arc::clone(&callbacks);
        let errbacks_in = Arc::clone(&errbacks);
        let scraper = Scraper::new(config)
            .http_client(client.clone())
            .entry(move |cx| {
                let callbacks = Arc::clone(&callbacks_in);
                let errbacks = Arc::clone(&errbacks_in);
                async move {
                    let callbacks = Arc::clone(&callbacks);
                    let errbacks = Arc::clone(&errbacks);
                    cx.send_request(
                        Request::get(url("/flaky"))
                            .callback(move |response, _cx| {
                                let callbacks = Arc::clone(&callbacks);
                                async move {
                                    assert_eq!(response.status().as_u16(), 200);
                                    callbacks.fetch_add(1, Ordering::SeqCst);
                                    Ok(())
                                }
                            })
                            .errback(move |_error, _cx| {
                                let errbacks = Arc::clone(&errbacks);
                                async move {
                                    errbacks.fetch_add(1, Ordering::SeqCst);
                                    Ok(())
                                }
                            }),
                    )
                    .await
                }
            });

        Engine::build(scraper).unwrap().run().await.unwrap();
        assert_eq!(client.call_count(), 3);
        assert_eq!(callbacks.load(Ordering::SeqCst), 1);
        assert_eq!(errbacks.load(Ordering::SeqCst), 0);
    }

    #[derive(Debug)]
    struct Page {
        title: String,
    }

    struct TitleCase {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Pipeline<Page> for TitleCase {
        fn name(&self) -> &str {
            "title-case"
        }

        async fn accept(&self, item: Page) -> Result<Page, EngineError> {
            Ok(Page {
                title: item.title.to_uppercase(),
            })
        }

        async fn close(&self) -> Result<(), EngineError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Observe {
        seen: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PipelineMiddleware<Page> for Observe {
        async fn handle(&self, item: Page) -> Result<ItemFlow<Page>, EngineError> {
            self.seen.lock().push(item.title.clone());
            Ok(ItemFlow::Continue(item))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn items_flow_through_pipelines_and_close_runs_once() {
        let closes = Arc::new(AtomicUsize::new(0));
        let client = ScriptedClient::new(vec![]);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let scraper = Scraper::new(base_config(1, 10))
            .http_client(client.clone())
            .pipeline(TitleCase {
                closes: Arc::clone(&closes),
            })
            .pipeline_post_middleware(Observe {
                seen: Arc::clone(&seen),
            })
            .entry(move |cx| async move {
                cx.send_request(Request::get(url("/page")).callback(|_response, cx| async move {
                    let page = cx
                        .dispatch_item(Page {
                            title: "deep work".into(),
                        })
                        .await?;
                    assert_eq!(page.title, "DEEP WORK");
                    Ok(())
                }))
                .await
            });

        Engine::build(scraper).unwrap().run().await.unwrap();
        // The post middleware observes the transformed item.
        assert_eq!(*seen.lock(), vec!["DEEP WORK".to_string()]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_finishes_in_flight_and_drops_queued() {
        let closes = Arc::new(AtomicUsize::new(0));
        let client = ScriptedClient::new(
            (0..5)
                .map(|_| Exchange::Slow(Duration::from_secs(1), 200))
                .collect(),
        );

        let scraper = Scraper::new(base_config(2, 10))
            .http_client(client.clone())
            .pipeline(TitleCase {
                closes: Arc::clone(&closes),
            })
            .entry(move |cx| async move {
                for i in 0..5 {
                    cx.send_request(Request::get(url(&format!("/slow/{i}")))).await?;
                }
                Ok(())
            });

        let engine = Arc::new(Engine::build(scraper).unwrap());
        let shutdown = engine.shutdown_token();
        let run = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        run.await.unwrap().unwrap();

        // Two in-flight dispatches finish inside the close timeout; the
        // three still queued are dropped with a diagnostic.
        assert_eq!(engine.stats.requests_succeeded.load(Ordering::SeqCst), 2);
        assert_eq!(engine.stats.requests_dropped.load(Ordering::SeqCst), 3);
        assert!(engine.scheduler.is_closed());
        assert!(engine.state.is_idle());
        assert_eq!(closes.load(Ordering::SeqCst), 1, "pipeline close must run");
    }

    #[tokio::test(start_paused = true)]
    async fn entry_failure_shuts_down_and_surfaces_error() {
        let client = ScriptedClient::new(vec![]);
        let scraper = Scraper::new(base_config(1, 10))
            .http_client(client.clone())
            .entry(|cx| async move {
                cx.dependency::<String>("missing_database")?;
                Ok(())
            });

        let engine = Engine::build(scraper).unwrap();
        let err = engine.run().await.unwrap_err();
        assert!(err.is_client_error());
        assert!(engine.scheduler.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn execution_timeout_forces_shutdown() {
        let client = ScriptedClient::new(vec![Exchange::Slow(Duration::from_secs(60), 200)]);

        let mut config = base_config(1, 10);
        config.execution.timeout = Some(Duration::from_millis(500));
        config.scheduler.close_timeout = Duration::from_millis(200);

        let scraper = Scraper::new(config)
            .http_client(client.clone())
            .entry(move |cx| async move {
                cx.send_request(Request::get(url("/forever"))).await
            });

        let started = Instant::now();
        let engine = Engine::build(scraper).unwrap();
        engine.run().await.unwrap();

        // Shutdown began at the 500ms cap and the close timeout cancelled
        // the stuck dispatch shortly after.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(engine.stats.requests_dropped.load(Ordering::SeqCst) >= 1);
        assert!(engine.state.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn lifespan_wraps_the_run() {
        struct Recorder {
            events: Arc<parking_lot::Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl Lifespan for Recorder {
            async fn setup(&self, _cx: &crate::engine::context::RequestContext) -> Result<(), EngineError> {
                self.events.lock().push("setup");
                Ok(())
            }

            async fn teardown(&self) -> Result<(), EngineError> {
                self.events.lock().push("teardown");
                Ok(())
            }
        }

        let client = ScriptedClient::new(vec![]);
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let events_cb = Arc::clone(&events);

        let scraper = Scraper::new(base_config(1, 10))
            .http_client(client.clone())
            .lifespan(Recorder {
                events: Arc::clone(&events),
            })
            .entry(move |cx| {
                let events = Arc::clone(&events_cb);
                async move {
                    let events = Arc::clone(&events);
                    cx.send_request(Request::get(url("/once")).callback(move |_response, _cx| {
                        let events = Arc::clone(&events);
                        async move {
                            events.lock().push("callback");
                            Ok(())
                        }
                    }))
                    .await
                }
            });

        Engine::build(scraper).unwrap().run().await.unwrap();
        assert_eq!(*events.lock(), vec!["setup", "callback", "teardown"]);
    }
}

