//! Handler context and dependency resolution.
//!
//! Handlers (entry functions, callbacks, errbacks, middlewares) all receive
//! a [`RequestContext`]: a uniform object carrying the `send_request`
//! capability, item dispatch into the pipelines, the originating request's
//! extras bag, and the scraper-level dependency registry. Handlers
//! destructure what they need; a lookup for a name that was never
//! registered (or registered under a different type) fails with
//! [`EngineError::DependencyMissing`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::engine::middleware::{Control, MiddlewareStack};
use crate::engine::pipeline::PipelineDispatcher;
use crate::error::EngineError;
use crate::request::Request;
use crate::scheduler::Scheduler;
use crate::stats::StatCollector;

/// A name-keyed bag of shared values, each stored behind `Arc<dyn Any>`.
/// Used for both the request extras bag and the dependency registry.
#[derive(Clone, Default)]
pub struct AnyMap {
    map: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl AnyMap {
    pub fn new() -> Self {
        AnyMap::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: T) {
        self.map.insert(name.into(), Arc::new(value));
    }

    /// Typed lookup. `None` covers both "absent" and "different type".
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.map
            .get(name)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl std::fmt::Debug for AnyMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

/// Scraper-level dependencies, read-only after startup.
#[derive(Debug, Default)]
pub struct Dependencies {
    map: AnyMap,
}

impl Dependencies {
    pub fn new() -> Self {
        Dependencies::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, name: impl Into<String>, value: T) {
        self.map.insert(name, value);
    }

    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, EngineError> {
        self.map
            .get(name)
            .ok_or_else(|| EngineError::DependencyMissing(name.to_string()))
    }
}

// Everything a context needs to reach, wired once at engine build.
pub(crate) struct EngineHandles {
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) stack: Arc<MiddlewareStack>,
    pub(crate) dispatcher: Arc<PipelineDispatcher>,
    pub(crate) stats: Arc<StatCollector>,
    pub(crate) deps: Arc<Dependencies>,
}

/// The uniform context handed to every handler.
#[derive(Clone)]
pub struct RequestContext {
    handles: Arc<EngineHandles>,
    extras: AnyMap,
}

impl RequestContext {
    pub(crate) fn new(handles: Arc<EngineHandles>, extras: AnyMap) -> Self {
        RequestContext { handles, extras }
    }

    /// Submits a request to the scheduler, first running outer-request
    /// middlewares. An outer middleware may stop the submission with a
    /// non-continue [`Control`]; the request is then never enqueued.
    /// Suspends while the queue is at capacity.
    pub async fn send_request(&self, mut request: Request) -> Result<(), EngineError> {
        let cx = RequestContext::new(Arc::clone(&self.handles), request.extras.clone());
        for registered in self.handles.stack.outer() {
            match registered.middleware.handle(&mut request, &cx).await {
                Ok(Control::Continue) => {}
                Ok(control) => {
                    debug!(
                        id = request.meta.id,
                        middleware = registered.middleware.name(),
                        ?control,
                        "submission stopped by outer middleware"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        middleware = registered.middleware.name(),
                        error = %e,
                        "outer middleware failed"
                    );
                    return Err(e);
                }
            }
        }

        self.handles.scheduler.submit(request).await?;
        self.handles.stats.increment_requests_enqueued();
        Ok(())
    }

    /// Runs an item through the pipelines registered for its type and
    /// returns the final item value.
    pub async fn dispatch_item<T: Send + 'static>(&self, item: T) -> Result<T, EngineError> {
        self.handles.dispatcher.dispatch(item).await
    }

    /// A scraper-level dependency registered under `name`.
    pub fn dependency<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, EngineError> {
        self.handles.deps.get(name)
    }

    /// A value from the originating request's extras bag.
    pub fn extra<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>, EngineError> {
        self.extras
            .get(name)
            .ok_or_else(|| EngineError::DependencyMissing(name.to_string()))
    }

    pub fn extras(&self) -> &AnyMap {
        &self.extras
    }

    /// Live engine counters, for diagnostics from user code.
    pub fn stats(&self) -> &StatCollector {
        &self.handles.stats
    }

    pub(crate) fn handles(&self) -> &Arc<EngineHandles> {
        &self.handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anymap_typed_lookup() {
        let mut map = AnyMap::new();
        map.insert("count", 7usize);
        map.insert("label", "quotes".to_string());

        assert_eq!(*map.get::<usize>("count").unwrap(), 7);
        assert_eq!(*map.get::<String>("label").unwrap(), "quotes");
        // Wrong type behaves like absence.
        assert!(map.get::<i32>("count").is_none());
        assert!(map.get::<usize>("missing").is_none());
    }

    #[test]
    fn dependencies_report_missing_by_name() {
        let mut deps = Dependencies::new();
        deps.insert("database", "postgres://localhost".to_string());

        assert!(deps.get::<String>("database").is_ok());
        let err = deps.get::<String>("cache").unwrap_err();
        assert!(matches!(err, EngineError::DependencyMissing(name) if name == "cache"));
        // Registered under another type: same failure mode.
        let err = deps.get::<usize>("database").unwrap_err();
        assert!(matches!(err, EngineError::DependencyMissing(_)));
    }
}
