//! # Scraper Module
//!
//! The registration surface of the crate.
//!
//! A [`Scraper`] collects everything a run needs before the engine starts:
//! entry functions that seed the initial requests, phase-tagged request
//! middlewares, typed pipelines with their pre/post/global middlewares,
//! named dependencies, and an optional lifespan wrapping the run with a
//! setup/teardown pair. `run` assembles the engine from the registry and
//! drives it until drained.
//!
//! ## Example
//!
//! ```rust,ignore
//! use forager::prelude::*;
//!
//! let scraper = Scraper::from_env()?
//!     .dependency("api_base", "https://api.example.com".to_string())
//!     .entry(|cx| async move {
//!         let base = cx.dependency::<String>("api_base")?;
//!         let url = url::Url::parse(&format!("{base}/users"))?;
//!         cx.send_request(Request::get(url).callback(handle_users)).await
//!     });
//! scraper.run().await?;
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::client::HttpClient;
use crate::config::Config;
use crate::engine::context::{Dependencies, RequestContext};
use crate::engine::core::Engine;
use crate::engine::middleware::{
    ExceptionMiddleware, MiddlewareStack, RequestMiddleware, ResponseMiddleware,
};
use crate::engine::pipeline::{
    GlobalPipelineMiddleware, Pipeline, PipelineMiddleware, PipelineRegistry,
};
use crate::error::EngineError;
use crate::rate_limit::GroupBy;
use crate::request::Request;

/// An entry function: runs once at startup with the engine context and
/// typically submits the initial requests.
pub type EntryFn =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

/// Two-phase hook wrapping the run: `setup` before the entry functions,
/// `teardown` after shutdown (shielded from cancellation).
#[async_trait]
pub trait Lifespan: Send + Sync {
    async fn setup(&self, cx: &RequestContext) -> Result<(), EngineError> {
        let _ = cx;
        Ok(())
    }

    async fn teardown(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Registry of entry functions, middlewares, pipelines, and dependencies.
pub struct Scraper {
    pub(crate) config: Config,
    pub(crate) entries: Vec<EntryFn>,
    pub(crate) middlewares: MiddlewareStack,
    pub(crate) pipelines: PipelineRegistry,
    pub(crate) dependencies: Dependencies,
    pub(crate) lifespan: Option<Arc<dyn Lifespan>>,
    pub(crate) client: Option<Arc<dyn HttpClient>>,
    pub(crate) group_by: Option<GroupBy>,
}

impl Scraper {
    pub fn new(config: Config) -> Self {
        Scraper {
            config,
            entries: Vec::new(),
            middlewares: MiddlewareStack::new(),
            pipelines: PipelineRegistry::new(),
            dependencies: Dependencies::new(),
            lifespan: None,
            client: None,
            group_by: None,
        }
    }

    /// Builds a scraper configured from the environment.
    pub fn from_env() -> Result<Self, EngineError> {
        Ok(Scraper::new(Config::from_env()?))
    }

    /// Registers an entry function.
    pub fn entry<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        self.entries.push(Arc::new(move |cx| {
            let fut: BoxFuture<'static, Result<(), EngineError>> = Box::pin(f(cx));
            fut
        }));
        self
    }

    /// Registers an outer-request middleware, run when a request is
    /// submitted through `send_request`.
    pub fn outer_middleware(
        mut self,
        priority: i32,
        middleware: impl RequestMiddleware + 'static,
    ) -> Self {
        self.middlewares.add_outer(priority, middleware);
        self
    }

    /// Registers an inner-request middleware, run just before dispatch.
    pub fn inner_middleware(
        mut self,
        priority: i32,
        middleware: impl RequestMiddleware + 'static,
    ) -> Self {
        self.middlewares.add_inner(priority, middleware);
        self
    }

    pub fn response_middleware(
        mut self,
        priority: i32,
        middleware: impl ResponseMiddleware + 'static,
    ) -> Self {
        self.middlewares.add_response(priority, middleware);
        self
    }

    pub fn exception_middleware(
        mut self,
        priority: i32,
        middleware: impl ExceptionMiddleware + 'static,
    ) -> Self {
        self.middlewares.add_exception(priority, middleware);
        self
    }

    /// Registers a pipeline for items of type `T`.
    pub fn pipeline<T, P>(mut self, pipeline: P) -> Self
    where
        T: Send + 'static,
        P: Pipeline<T> + 'static,
    {
        self.pipelines.register(pipeline);
        self
    }

    pub fn pipeline_pre_middleware<T, M>(mut self, middleware: M) -> Self
    where
        T: Send + 'static,
        M: PipelineMiddleware<T> + 'static,
    {
        self.pipelines.register_pre(middleware);
        self
    }

    pub fn pipeline_post_middleware<T, M>(mut self, middleware: M) -> Self
    where
        T: Send + 'static,
        M: PipelineMiddleware<T> + 'static,
    {
        self.pipelines.register_post(middleware);
        self
    }

    pub fn global_pipeline_middleware(
        mut self,
        middleware: impl GlobalPipelineMiddleware + 'static,
    ) -> Self {
        self.pipelines.register_global(middleware);
        self
    }

    /// Registers a named dependency resolvable from handler contexts.
    pub fn dependency<T: Send + Sync + 'static>(
        mut self,
        name: impl Into<String>,
        value: T,
    ) -> Self {
        self.dependencies.insert(name, value);
        self
    }

    pub fn lifespan(mut self, lifespan: impl Lifespan + 'static) -> Self {
        self.lifespan = Some(Arc::new(lifespan));
        self
    }

    /// Overrides the HTTP adapter (the default is built from the session
    /// configuration).
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Overrides how requests map to rate-limit groups.
    pub fn rate_limit_group_by<F>(mut self, f: F) -> Self
    where
        F: Fn(&Request) -> (String, Duration) + Send + Sync + 'static,
    {
        self.group_by = Some(Arc::new(f));
        self
    }

    /// Runs to completion: lifespan setup, worker start, entry functions,
    /// drain, then the shutdown sequence.
    pub async fn run(self) -> Result<(), EngineError> {
        Engine::build(self)?.run().await
    }
}
