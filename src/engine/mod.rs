//! # Engine Module
//!
//! The orchestration half of the crate: everything between a submitted
//! request and its settled outcome.
//!
//! ## Key Components
//!
//! - **Core**: spawns the worker pool, runs entry functions, watches the
//!   drain condition, and executes the shutdown sequence
//! - **Request Manager**: executes one dispatch through the middleware
//!   phases, the rate limiter, and the HTTP adapter
//! - **Middleware Stack**: phase-tagged hooks ordered by priority
//! - **Retry**: exception-phase middleware re-enqueueing failed requests
//! - **Pipeline Dispatcher**: routes items to their type's pipelines
//! - **Context**: the uniform handler context carrying `send_request`,
//!   item dispatch, extras, and registered dependencies

pub mod context;
pub mod middleware;
pub mod pipeline;
pub mod retry;

pub(crate) mod core;
pub(crate) mod request_manager;

pub use context::{AnyMap, Dependencies, RequestContext};
pub use middleware::{
    Control, ExceptionMiddleware, MiddlewareStack, RequestMiddleware, ResponseMiddleware,
};
pub use pipeline::{
    GlobalPipelineMiddleware, ItemFlow, Next, Pipeline, PipelineDispatcher, PipelineMiddleware,
    PipelineRegistry,
};
pub use retry::RetryMiddleware;
