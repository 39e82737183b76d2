//! Composable middleware pipeline
//!
//! Middlewares run in registration order on the way in and reverse order on
//! the way out. A middleware short-circuits by writing a response and not
//! invoking [`Next::run`]. `Next` is consumed by `run`, so a middleware
//! cannot continue the chain twice; the invariant the pipeline contract
//! requires is enforced at compile time.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;
use crate::exchange::Exchange;

/// Terminal request handler
///
/// Implemented for any `Fn(Arc<Exchange>) -> Future<Output = Result<()>>`
/// closure, and by the router's matched-route dispatch.
pub trait Handler: Send + Sync + 'static {
    /// Handle the exchange
    fn call(&self, exchange: Arc<Exchange>) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Arc<Exchange>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn call(&self, exchange: Arc<Exchange>) -> BoxFuture<'static, Result<()>> {
        Box::pin((self)(exchange))
    }
}

/// A unit of the middleware chain
///
/// May modify the exchange before or after `next.run(...)`, short-circuit by
/// not running `next`, or wrap `next` for post-processing.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Process the exchange, optionally continuing the chain
    async fn handle(&self, exchange: Arc<Exchange>, next: Next) -> Result<()>;
}

/// Continuation into the rest of the chain
///
/// Consumed by [`Next::run`]; dropping it without running short-circuits the
/// remaining middlewares and the terminal.
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    terminal: Arc<dyn Handler>,
}

impl Next {
    /// Run the rest of the chain, ending with the terminal handler
    pub async fn run(mut self, exchange: Arc<Exchange>) -> Result<()> {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                self.index += 1;
                middleware.handle(exchange, self).await
            }
            None => self.terminal.call(exchange).await,
        }
    }
}

/// Builder for an immutable [`Pipeline`]
#[derive(Default)]
pub struct PipelineBuilder {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl PipelineBuilder {
    /// Append a middleware
    #[must_use]
    pub fn with(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Append an already-shared middleware
    #[must_use]
    pub fn with_arc(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Freeze the chain
    #[must_use]
    pub fn build(self) -> Pipeline {
        Pipeline {
            chain: self.middlewares.into(),
        }
    }
}

/// Immutable middleware chain, shared across requests
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<[Arc<dyn Middleware>]>,
}

impl Pipeline {
    /// Start building a pipeline
    #[must_use]
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// An empty pipeline: `execute` goes straight to the terminal
    #[must_use]
    pub fn empty() -> Self {
        PipelineBuilder::default().build()
    }

    /// Number of middlewares in the chain
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// True when the chain is empty
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run the chain against an exchange, ending with `terminal`
    pub async fn execute(&self, exchange: Arc<Exchange>, terminal: Arc<dyn Handler>) -> Result<()> {
        Next {
            chain: Arc::clone(&self.chain),
            index: 0,
            terminal,
        }
        .run(exchange)
        .await
    }
}

/// Wrap a closure as a [`Middleware`]
pub fn middleware_fn<F, Fut>(f: F) -> impl Middleware
where
    F: Fn(Arc<Exchange>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    struct FnMiddleware<F>(F);

    #[async_trait]
    impl<F, Fut> Middleware for FnMiddleware<F>
    where
        F: Fn(Arc<Exchange>, Next) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        async fn handle(&self, exchange: Arc<Exchange>, next: Next) -> Result<()> {
            (self.0)(exchange, next).await
        }
    }

    FnMiddleware(f)
}
