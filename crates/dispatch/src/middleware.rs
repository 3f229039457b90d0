//! Handler and middleware traits, explicit chaining and the default filters.

use std::future::Future;
use std::sync::Arc;

use crate::{Request, Response};

#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request, resp: Response) -> anyhow::Result<()>;
}

/// A chain stage. Call `next.run(..)` to forward, or return without it to short-circuit.
#[async_trait::async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn call(&self, req: Request, resp: Response, next: Next) -> anyhow::Result<()>;
}

/// The remainder of a chain.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    handler: Arc<dyn Handler>,
}

impl Next {
    pub fn new(chain: Arc<[Arc<dyn Middleware>]>, handler: Arc<dyn Handler>) -> Self {
        Self { chain, index: 0, handler }
    }

    pub async fn run(self, req: Request, resp: Response) -> anyhow::Result<()> {
        match self.chain.get(self.index).cloned() {
            Some(mw) => {
                let next = Next { chain: self.chain, index: self.index + 1, handler: self.handler };
                mw.call(req, resp, next).await
            }
            None => self.handler.handle(req, resp).await,
        }
    }
}

struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, req: Request, resp: Response) -> anyhow::Result<()> { (self.0)(req, resp).await }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnMiddleware<F>(F);

#[async_trait::async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, req: Request, resp: Response, next: Next) -> anyhow::Result<()> {
        (self.0)(req, resp, next).await
    }
}

pub fn middleware_fn<F, Fut>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(Request, Response, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnMiddleware(f))
}

/// Skip requests without an object.
pub struct IgnoreNil;

#[async_trait::async_trait]
impl Middleware for IgnoreNil {
    async fn call(&self, req: Request, resp: Response, next: Next) -> anyhow::Result<()> {
        if req.object.is_none() {
            return Ok(());
        }
        next.run(req, resp).await
    }
}

/// Skip requests for objects that are gone from the store.
pub struct IgnoreRemoved;

#[async_trait::async_trait]
impl Middleware for IgnoreRemoved {
    async fn call(&self, req: Request, resp: Response, next: Next) -> anyhow::Result<()> {
        if req.removed {
            return Ok(());
        }
        next.run(req, resp).await
    }
}

/// Skip requests for objects marked for deletion.
pub struct IgnoreFinalizing;

#[async_trait::async_trait]
impl Middleware for IgnoreFinalizing {
    async fn call(&self, req: Request, resp: Response, next: Next) -> anyhow::Result<()> {
        if req.is_finalizing() {
            return Ok(());
        }
        next.run(req, resp).await
    }
}

/// Prefix every error coming out of the rest of the chain.
pub struct ErrorPrefix(pub String);

#[async_trait::async_trait]
impl Middleware for ErrorPrefix {
    async fn call(&self, req: Request, resp: Response, next: Next) -> anyhow::Result<()> {
        next.run(req, resp).await.map_err(|e| e.context(self.0.clone()))
    }
}
