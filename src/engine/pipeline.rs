//! Type-keyed item pipelines.
//!
//! Items are routed by their runtime type: registering a
//! [`Pipeline<T>`] attaches it to `T`'s container, and `dispatch` looks the
//! container up by `TypeId`. One dispatch runs, in order: the global
//! middlewares (each wrapping the rest of the chain through [`Next`]), the
//! type's pre-middlewares, its pipelines, and its post-middlewares, each
//! stage receiving the value produced by the previous one. The final item
//! value is returned to the caller.
//!
//! On shutdown, `close` runs every registered pipeline's `close` exactly
//! once, in registration order, isolating failures so one bad pipeline
//! cannot starve its siblings.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use log::{debug, error, warn};

use crate::config::PipelineConfig;
use crate::error::EngineError;
use crate::state::{ActivityGuard, EngineState};
use crate::stats::StatCollector;

/// A type-erased item moving through the dispatcher.
pub type ItemBox = Box<dyn Any + Send>;

/// A processor for items of type `T`. `accept` returns the possibly
/// transformed item handed to the next pipeline in registration order.
#[async_trait]
pub trait Pipeline<T: Send + 'static>: Send + Sync {
    fn name(&self) -> &str {
        "pipeline"
    }

    async fn accept(&self, item: T) -> Result<T, EngineError>;

    /// Invoked exactly once on shutdown, after in-flight items drain.
    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Outcome of a pre/post pipeline middleware.
pub enum ItemFlow<T> {
    /// Hand the item to the next middleware of the phase.
    Continue(T),
    /// Skip the remaining middlewares of this phase.
    SkipPhase(T),
    /// Abort the dispatch, returning this item value to the caller.
    Stop(T),
}

/// A per-type hook running before (pre) or after (post) the pipelines.
#[async_trait]
pub trait PipelineMiddleware<T: Send + 'static>: Send + Sync {
    fn name(&self) -> &str {
        "item-middleware"
    }

    async fn handle(&self, item: T) -> Result<ItemFlow<T>, EngineError>;
}

/// Continuation handed to a global middleware; `run` advances the chain.
pub struct Next<'a> {
    dispatcher: &'a PipelineDispatcher,
    index: usize,
}

impl Next<'_> {
    pub async fn run(self, item: ItemBox) -> Result<ItemBox, EngineError> {
        self.dispatcher.invoke(self.index, item).await
    }
}

/// A hook wrapping every dispatch, regardless of item type. Runs in
/// registration order, outermost first.
#[async_trait]
pub trait GlobalPipelineMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "global-middleware"
    }

    async fn handle(&self, item: ItemBox, next: Next<'_>) -> Result<ItemBox, EngineError>;
}

// ---- type erasure ----------------------------------------------------------

#[async_trait]
trait ErasedPipeline: Send + Sync {
    fn name(&self) -> &str;
    async fn accept(&self, item: ItemBox) -> Result<ItemBox, EngineError>;
    async fn close(&self) -> Result<(), EngineError>;
}

struct TypedPipeline<T, P> {
    pipeline: P,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, P> ErasedPipeline for TypedPipeline<T, P>
where
    T: Send + 'static,
    P: Pipeline<T>,
{
    fn name(&self) -> &str {
        self.pipeline.name()
    }

    async fn accept(&self, item: ItemBox) -> Result<ItemBox, EngineError> {
        let item = item
            .downcast::<T>()
            .map_err(|_| EngineError::Pipeline("item changed type mid-chain".into()))?;
        let out = self.pipeline.accept(*item).await?;
        Ok(Box::new(out))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pipeline.close().await
    }
}

enum ErasedFlow {
    Continue(ItemBox),
    SkipPhase(ItemBox),
    Stop(ItemBox),
}

#[async_trait]
trait ErasedItemMiddleware: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, item: ItemBox) -> Result<ErasedFlow, EngineError>;
}

struct TypedItemMiddleware<T, M> {
    middleware: M,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, M> ErasedItemMiddleware for TypedItemMiddleware<T, M>
where
    T: Send + 'static,
    M: PipelineMiddleware<T>,
{
    fn name(&self) -> &str {
        self.middleware.name()
    }

    async fn handle(&self, item: ItemBox) -> Result<ErasedFlow, EngineError> {
        let item = item
            .downcast::<T>()
            .map_err(|_| EngineError::Pipeline("item changed type mid-chain".into()))?;
        Ok(match self.middleware.handle(*item).await? {
            ItemFlow::Continue(next) => ErasedFlow::Continue(Box::new(next)),
            ItemFlow::SkipPhase(next) => ErasedFlow::SkipPhase(Box::new(next)),
            ItemFlow::Stop(next) => ErasedFlow::Stop(Box::new(next)),
        })
    }
}

// ---- registry --------------------------------------------------------------

struct TypeContainer {
    type_name: &'static str,
    pipelines: Vec<Box<dyn ErasedPipeline>>,
    pre: Vec<Box<dyn ErasedItemMiddleware>>,
    post: Vec<Box<dyn ErasedItemMiddleware>>,
}

/// Registration-time collection of pipelines and pipeline middlewares.
#[derive(Default)]
pub struct PipelineRegistry {
    containers: Vec<TypeContainer>,
    index: HashMap<TypeId, usize>,
    globals: Vec<Box<dyn GlobalPipelineMiddleware>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        PipelineRegistry::default()
    }

    pub fn register<T, P>(&mut self, pipeline: P)
    where
        T: Send + 'static,
        P: Pipeline<T> + 'static,
    {
        self.container_mut::<T>().pipelines.push(Box::new(TypedPipeline {
            pipeline,
            _marker: PhantomData,
        }));
    }

    pub fn register_pre<T, M>(&mut self, middleware: M)
    where
        T: Send + 'static,
        M: PipelineMiddleware<T> + 'static,
    {
        self.container_mut::<T>().pre.push(Box::new(TypedItemMiddleware {
            middleware,
            _marker: PhantomData,
        }));
    }

    pub fn register_post<T, M>(&mut self, middleware: M)
    where
        T: Send + 'static,
        M: PipelineMiddleware<T> + 'static,
    {
        self.container_mut::<T>().post.push(Box::new(TypedItemMiddleware {
            middleware,
            _marker: PhantomData,
        }));
    }

    pub fn register_global<M: GlobalPipelineMiddleware + 'static>(&mut self, middleware: M) {
        self.globals.push(Box::new(middleware));
    }

    pub fn pipeline_count(&self) -> usize {
        self.containers.iter().map(|c| c.pipelines.len()).sum()
    }

    fn container_mut<T: 'static>(&mut self) -> &mut TypeContainer {
        let type_id = TypeId::of::<T>();
        if let Some(&index) = self.index.get(&type_id) {
            return &mut self.containers[index];
        }
        self.containers.push(TypeContainer {
            type_name: std::any::type_name::<T>(),
            pipelines: Vec::new(),
            pre: Vec::new(),
            post: Vec::new(),
        });
        let index = self.containers.len() - 1;
        self.index.insert(type_id, index);
        &mut self.containers[index]
    }
}

// ---- dispatcher ------------------------------------------------------------

/// Routes items to their type's pipelines and owns the close protocol.
pub struct PipelineDispatcher {
    registry: PipelineRegistry,
    strict: bool,
    state: Arc<EngineState>,
    stats: Arc<StatCollector>,
    closed: AtomicBool,
}

impl PipelineDispatcher {
    pub(crate) fn new(
        registry: PipelineRegistry,
        config: &PipelineConfig,
        state: Arc<EngineState>,
        stats: Arc<StatCollector>,
    ) -> Self {
        PipelineDispatcher {
            registry,
            strict: config.strict,
            state,
            stats,
            closed: AtomicBool::new(false),
        }
    }

    /// Runs `item` through the chain for its type and returns the final
    /// item value. With strict mode off, an unregistered type logs a
    /// warning and comes back unmodified.
    pub async fn dispatch<T: Send + 'static>(&self, item: T) -> Result<T, EngineError> {
        if !self.registry.index.contains_key(&TypeId::of::<T>()) {
            let type_name = std::any::type_name::<T>();
            if self.strict {
                return Err(EngineError::UnknownItem(type_name.to_string()));
            }
            warn!("no pipelines registered for item type {type_name}");
            return Ok(item);
        }

        let _guard = ActivityGuard::enter(&self.state.processing_items);
        self.stats.increment_items_dispatched();

        match self.invoke(0, Box::new(item)).await {
            Ok(boxed) => match boxed.downcast::<T>() {
                Ok(item) => {
                    self.stats.increment_items_completed();
                    Ok(*item)
                }
                Err(_) => {
                    self.stats.increment_items_dropped();
                    Err(EngineError::Pipeline(
                        "global middleware returned a different item type".into(),
                    ))
                }
            },
            Err(e) => {
                self.stats.increment_items_dropped();
                Err(e)
            }
        }
    }

    // Advances the global-middleware chain; past its end, runs the core
    // per-type chain.
    fn invoke<'a>(&'a self, index: usize, item: ItemBox) -> BoxFuture<'a, Result<ItemBox, EngineError>> {
        Box::pin(async move {
            match self.registry.globals.get(index) {
                Some(middleware) => {
                    let next = Next {
                        dispatcher: self,
                        index: index + 1,
                    };
                    middleware.handle(item, next).await
                }
                None => self.run_chain(item).await,
            }
        })
    }

    async fn run_chain(&self, mut item: ItemBox) -> Result<ItemBox, EngineError> {
        let type_id = (*item).type_id();
        let Some(&index) = self.registry.index.get(&type_id) else {
            // Only reachable when a global middleware substituted an item
            // of an unregistered type.
            if self.strict {
                return Err(EngineError::UnknownItem(format!("{type_id:?}")));
            }
            return Ok(item);
        };
        let container = &self.registry.containers[index];

        let mut stopped = false;
        for middleware in &container.pre {
            match middleware.handle(item).await? {
                ErasedFlow::Continue(next) => item = next,
                ErasedFlow::SkipPhase(next) => {
                    debug!("pre middleware {} skipped rest of phase", middleware.name());
                    item = next;
                    break;
                }
                ErasedFlow::Stop(next) => {
                    debug!("pre middleware {} stopped item processing", middleware.name());
                    item = next;
                    stopped = true;
                    break;
                }
            }
        }
        if stopped {
            return Ok(item);
        }

        for pipeline in &container.pipelines {
            item = pipeline.accept(item).await.map_err(|e| {
                error!(
                    "pipeline {} failed for {}: {e}",
                    pipeline.name(),
                    container.type_name
                );
                e
            })?;
        }

        for middleware in &container.post {
            match middleware.handle(item).await? {
                ErasedFlow::Continue(next) => item = next,
                ErasedFlow::SkipPhase(next) => {
                    debug!("post middleware {} skipped rest of phase", middleware.name());
                    item = next;
                    break;
                }
                ErasedFlow::Stop(next) => {
                    debug!("post middleware {} stopped item processing", middleware.name());
                    item = next;
                    break;
                }
            }
        }

        Ok(item)
    }

    /// Closes every registered pipeline exactly once, in registration
    /// order. A failing close is logged and does not stop the others.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("pipeline close called again; already closed");
            return;
        }
        for container in &self.registry.containers {
            for pipeline in &container.pipelines {
                if let Err(e) = pipeline.close().await {
                    error!(
                        "pipeline {} close failed for {}: {e}",
                        pipeline.name(),
                        container.type_name
                    );
                }
            }
        }
        debug!("all pipelines closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, PartialEq)]
    struct Quote {
        text: String,
    }

    #[derive(Debug, PartialEq)]
    struct Author {
        name: String,
    }

    struct Uppercase;

    #[async_trait]
    impl Pipeline<Quote> for Uppercase {
        fn name(&self) -> &str {
            "uppercase"
        }

        async fn accept(&self, item: Quote) -> Result<Quote, EngineError> {
            Ok(Quote {
                text: item.text.to_uppercase(),
            })
        }
    }

    struct Suffix {
        suffix: &'static str,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Pipeline<Quote> for Suffix {
        async fn accept(&self, item: Quote) -> Result<Quote, EngineError> {
            Ok(Quote {
                text: format!("{}{}", item.text, self.suffix),
            })
        }

        async fn close(&self) -> Result<(), EngineError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn dispatcher(registry: PipelineRegistry, strict: bool) -> PipelineDispatcher {
        PipelineDispatcher::new(
            registry,
            &PipelineConfig { strict },
            EngineState::new(),
            Arc::new(StatCollector::new()),
        )
    }

    #[tokio::test]
    async fn pipelines_run_in_registration_order() {
        let mut registry = PipelineRegistry::new();
        registry.register(Uppercase);
        registry.register(Suffix {
            suffix: "!",
            closes: Arc::new(AtomicUsize::new(0)),
        });
        let dispatcher = dispatcher(registry, true);

        let out = dispatcher
            .dispatch(Quote {
                text: "hello".into(),
            })
            .await
            .unwrap();
        assert_eq!(out.text, "HELLO!");
    }

    #[tokio::test]
    async fn routing_is_by_runtime_type() {
        struct NameTag;

        #[async_trait]
        impl Pipeline<Author> for NameTag {
            async fn accept(&self, item: Author) -> Result<Author, EngineError> {
                Ok(Author {
                    name: format!("by {}", item.name),
                })
            }
        }

        let mut registry = PipelineRegistry::new();
        registry.register(Uppercase);
        registry.register(NameTag);
        let dispatcher = dispatcher(registry, true);

        let quote = dispatcher
            .dispatch(Quote { text: "a".into() })
            .await
            .unwrap();
        let author = dispatcher
            .dispatch(Author { name: "bob".into() })
            .await
            .unwrap();
        assert_eq!(quote.text, "A");
        assert_eq!(author.name, "by bob");
    }

    #[tokio::test]
    async fn strict_mode_rejects_unknown_items() {
        let dispatcher = dispatcher(PipelineRegistry::new(), true);
        let err = dispatcher
            .dispatch(Quote { text: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownItem(name) if name.contains("Quote")));
    }

    #[tokio::test]
    async fn lenient_mode_returns_item_unmodified() {
        let dispatcher = dispatcher(PipelineRegistry::new(), false);
        let out = dispatcher
            .dispatch(Quote { text: "x".into() })
            .await
            .unwrap();
        assert_eq!(out.text, "x");
    }

    struct StopEarly;

    #[async_trait]
    impl PipelineMiddleware<Quote> for StopEarly {
        async fn handle(&self, item: Quote) -> Result<ItemFlow<Quote>, EngineError> {
            Ok(ItemFlow::Stop(item))
        }
    }

    #[tokio::test]
    async fn stop_in_pre_phase_skips_pipelines() {
        let mut registry = PipelineRegistry::new();
        registry.register_pre(StopEarly);
        registry.register(Uppercase);
        let dispatcher = dispatcher(registry, true);

        let out = dispatcher
            .dispatch(Quote { text: "kept".into() })
            .await
            .unwrap();
        assert_eq!(out.text, "kept");
    }

    struct Trim;

    #[async_trait]
    impl PipelineMiddleware<Quote> for Trim {
        async fn handle(&self, item: Quote) -> Result<ItemFlow<Quote>, EngineError> {
            Ok(ItemFlow::Continue(Quote {
                text: item.text.trim().to_string(),
            }))
        }
    }

    #[tokio::test]
    async fn pre_and_post_middlewares_transform_in_order() {
        struct Exclaim;

        #[async_trait]
        impl PipelineMiddleware<Quote> for Exclaim {
            async fn handle(&self, item: Quote) -> Result<ItemFlow<Quote>, EngineError> {
                Ok(ItemFlow::Continue(Quote {
                    text: format!("{}?", item.text),
                }))
            }
        }

        let mut registry = PipelineRegistry::new();
        registry.register_pre(Trim);
        registry.register(Uppercase);
        registry.register_post(Exclaim);
        let dispatcher = dispatcher(registry, true);

        let out = dispatcher
            .dispatch(Quote {
                text: "  deep  ".into(),
            })
            .await
            .unwrap();
        assert_eq!(out.text, "DEEP?");
    }

    struct Counting {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GlobalPipelineMiddleware for Counting {
        async fn handle(&self, item: ItemBox, next: Next<'_>) -> Result<ItemBox, EngineError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            next.run(item).await
        }
    }

    #[tokio::test]
    async fn global_middlewares_wrap_every_dispatch() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = PipelineRegistry::new();
        registry.register_global(Counting {
            seen: Arc::clone(&seen),
        });
        registry.register(Uppercase);
        let dispatcher = dispatcher(registry, true);

        dispatcher.dispatch(Quote { text: "a".into() }).await.unwrap();
        dispatcher.dispatch(Quote { text: "b".into() }).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn close_runs_exactly_once_per_pipeline() {
        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = PipelineRegistry::new();
        registry.register(Suffix {
            suffix: "!",
            closes: Arc::clone(&closes),
        });
        registry.register(Suffix {
            suffix: "?",
            closes: Arc::clone(&closes),
        });
        let dispatcher = dispatcher(registry, true);

        dispatcher.close().await;
        dispatcher.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failing_close_does_not_stop_siblings() {
        struct FailingClose;

        #[async_trait]
        impl Pipeline<Quote> for FailingClose {
            async fn accept(&self, item: Quote) -> Result<Quote, EngineError> {
                Ok(item)
            }

            async fn close(&self) -> Result<(), EngineError> {
                Err(EngineError::Pipeline("flush failed".into()))
            }
        }

        let closes = Arc::new(AtomicUsize::new(0));
        let mut registry = PipelineRegistry::new();
        registry.register(FailingClose);
        registry.register(Suffix {
            suffix: "!",
            closes: Arc::clone(&closes),
        });
        let dispatcher = dispatcher(registry, true);

        dispatcher.close().await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
