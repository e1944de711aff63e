//! # forager
//!
//! Asynchronous orchestration engine for high-volume outbound HTTP.
//!
//! Provides the main components: `Scraper`, `Scheduler`, `RateLimiter`,
//! the request middleware chain with automatic retries, and the typed item
//! pipeline dispatcher.
//!
//! ## Example
//!
//! ```rust,ignore
//! use forager::prelude::*;
//! use forager::engine::pipeline::Pipeline;
//!
//! #[derive(Debug)]
//! struct Repo {
//!     name: String,
//!     stars: u64,
//! }
//!
//! struct ConsoleWriter;
//!
//! #[forager::async_trait]
//! impl Pipeline<Repo> for ConsoleWriter {
//!     async fn accept(&self, item: Repo) -> Result<Repo, EngineError> {
//!         println!("{} ({} stars)", item.name, item.stars);
//!         Ok(item)
//!     }
//! }
//!
//! async fn collect() -> Result<(), EngineError> {
//!     let scraper = Scraper::from_env()?
//!         .pipeline(ConsoleWriter)
//!         .entry(|cx| async move {
//!             let url = url::Url::parse("https://api.github.com/repos/rust-lang/rust")?;
//!             cx.send_request(Request::get(url).callback(|response, cx| async move {
//!                 let data: serde_json::Value = response.json()?;
//!                 cx.dispatch_item(Repo {
//!                     name: data["full_name"].as_str().unwrap_or_default().to_string(),
//!                     stars: data["stargazers_count"].as_u64().unwrap_or(0),
//!                 })
//!                 .await?;
//!                 Ok(())
//!             }))
//!             .await
//!         });
//!     scraper.run().await
//! }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod prelude;
pub mod rate_limit;
pub mod request;
pub mod response;
pub mod runner;
pub mod scheduler;
pub mod scraper;
pub mod state;
pub mod stats;

mod env;

pub use client::{build_http_client, HttpClient, ReqwestClient};
pub use config::{
    AdaptiveConfig, Backoff, Config, ExecutionConfig, HttpBackend, PipelineConfig, ProxyConfig,
    RateLimitConfig, RetryConfig, SchedulerConfig, SessionConfig, TlsConfig,
};
pub use engine::context::{AnyMap, Dependencies, RequestContext};
pub use engine::middleware::{
    exception_fn, request_fn, response_fn, Control, ExceptionMiddleware, MiddlewareStack,
    RequestMiddleware, ResponseMiddleware,
};
pub use engine::pipeline::{
    GlobalPipelineMiddleware, ItemFlow, Pipeline, PipelineMiddleware,
};
pub use engine::RetryMiddleware;
pub use error::{ConfigError, EngineError, HttpError, TransportError, TransportKind};
pub use rate_limit::{GroupSnapshot, RateLimiter, RequestOutcome};
pub use request::{Body, FormPart, ParamValue, Request};
pub use response::Response;
pub use scheduler::Scheduler;
pub use scraper::{Lifespan, Scraper};
pub use state::EngineState;
pub use stats::StatCollector;

pub use async_trait::async_trait;
pub use tokio;
pub use url;
