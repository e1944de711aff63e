//! Convenience re-exports for building collection workers.

pub use crate::config::Config;
pub use crate::engine::context::RequestContext;
pub use crate::engine::middleware::Control;
pub use crate::engine::pipeline::{ItemFlow, Pipeline, PipelineMiddleware};
pub use crate::error::EngineError;
pub use crate::request::Request;
pub use crate::response::Response;
pub use crate::runner::run;
pub use crate::scraper::{Lifespan, Scraper};
pub use async_trait::async_trait;
