//! Middleware pipeline: composable before/after request handler logic.
//!
//! This module defines the core types for building an ordered middleware stack.
//! Each middleware wraps the next layer, enabling request inspection, short-circuit
//! responses, and response decoration without coupling handlers to infrastructure
//! concerns.
//!
//! ## Core types
//!
//! - [`Middleware`]: trait implemented by all middleware.
//! - [`Next`]: cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`]: type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`]: converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`from_handler`]: turns an async request handler into the terminal layer.
//! - [`OutputCacheMiddleware`]: serves and stores responses through an
//!   [`OutputCache`].

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::time::Instant;
use tracing::error;

use crate::cache::{BackendError, CachePolicy, CachingContext, OutputCache};
use crate::{Request, Response, StatusCode, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is passed to each middleware's [`Middleware::handle`] implementation.
/// Calling [`Next::run`] advances the cursor by one position and invokes the next
/// middleware (or returns a fallback `500` response when the chain is exhausted
/// without any middleware generating a response).
///
/// `Next` is consumed on each call to [`run`](Self::run), so it cannot be called
/// more than once per middleware invocation.
///
/// # Examples
///
/// ```rust,no_run
/// use std::pin::Pin;
/// use outcache::{Response, context::Context, middleware::{Middleware, Next}};
///
/// struct PassThrough;
///
/// impl Middleware for PassThrough {
///     fn handle(
///         &self,
///         ctx: Context,
///         next: Next,
///     ) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> {
///         Box::pin(async move { next.run(ctx).await })
///     }
/// }
/// ```
pub struct Next {
    middlewares: Vec<MiddlewareHandler>,
    // Tracks which middleware to invoke on the next `run` call.
    index: usize,
}

/// A type-erased, reference-counted middleware function.
///
/// Every entry in the middleware stack is stored as a `MiddlewareHandler`.
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
///
/// Construct one with [`from_middleware`] or [`from_handler`].
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
///
/// # Arguments
///
/// - `middleware`: a reference-counted [`Middleware`] to wrap.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use outcache::cache::{OutputCache, OutputCacheOptions};
/// use outcache::middleware::{OutputCacheMiddleware, from_middleware};
///
/// let cache = Arc::new(OutputCache::new(OutputCacheOptions::default()));
/// let handler = from_middleware(Arc::new(OutputCacheMiddleware::new(cache)));
/// ```
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

/// Wraps an async handler as the last layer of a chain.
///
/// The handler never sees the rest of the chain; it only produces a response.
///
/// # Examples
///
/// ```rust
/// use outcache::{Response, StatusCode, context::Context, middleware::from_handler};
///
/// let endpoint = from_handler(|_ctx: Context| async { Response::new(StatusCode::Ok).body("hi") });
/// ```
pub fn from_handler<H, Fut>(handler: H) -> MiddlewareHandler
where
    H: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(
        move |ctx: Context, _next: Next| -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(handler(ctx))
        },
    )
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    ///
    /// # Arguments
    ///
    /// - `middlewares`: the ordered list of handlers that make up the pipeline.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
    ///
    /// Advances the internal cursor by one, clones the handler at the current
    /// position, and awaits it. If no handler remains (i.e. the chain is
    /// exhausted without producing a response), a `500 Internal Server Error`
    /// response is returned as a fallback.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`] to pass to the next middleware.
    pub async fn run(mut self, ctx: Context) -> Response {
        if self.index < self.middlewares.len() {
            let handler = self.middlewares[self.index].clone();
            self.index += 1;
            handler(ctx, self).await
        } else {
            Response::new(StatusCode::InternalServerError)
                .body("No response generated by middleware pipeline")
        }
    }
}

/// The core trait for all middleware.
///
/// Implementors receive a [`Context`] and a [`Next`] cursor. They may:
///
/// - **Pass through**: call `next.run(ctx).await` without modification.
/// - **Short-circuit**: return a [`Response`] directly without calling `next`.
/// - **Decorate**: call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future so it can be awaited across
///   `.await` points in multi-threaded runtimes.
/// - Implementations **should not** hold `&mut` references to shared state across
///   an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    ///
    /// # Arguments
    ///
    /// - `ctx`: the per-request [`Context`] carrying the request and extensions.
    /// - `next`: cursor into the remainder of the middleware chain; call
    ///   [`Next::run`] to forward the request.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// Point in time after which a request stops waiting on other in-flight
/// requests. Insert it into the [`Context`] extensions upstream of
/// [`OutputCacheMiddleware`].
#[derive(Debug, Clone, Copy)]
pub struct RequestDeadline(pub Instant);

/// Middleware that answers from an [`OutputCache`] and stores what the rest
/// of the chain produces.
///
/// The route policy comes from the cache's options. A [`CachePolicy`] found
/// in the request extensions replaces it for that request only, and a
/// [`RequestDeadline`] bounds lock waits. Everything else in the extensions
/// is handed to the downstream layers untouched.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use outcache::{Method, Request, Response, StatusCode, context::Context};
/// use outcache::cache::{CachePolicy, OutputCache, OutputCacheOptions};
/// use outcache::middleware::{Next, OutputCacheMiddleware, from_handler, from_middleware};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let options = OutputCacheOptions::default().route("/items", CachePolicy::new().vary_by_query("category"));
/// let cache = Arc::new(OutputCache::new(options));
/// let chain = vec![
///     from_middleware(Arc::new(OutputCacheMiddleware::new(cache))),
///     from_handler(|_ctx: Context| async { Response::new(StatusCode::Ok).body("shoes") }),
/// ];
///
/// let request = Request::new(Method::Get, "/items?category=shoes");
/// let response = Next::new(chain).run(Context::new(request)).await;
/// assert_eq!(response.status(), StatusCode::Ok);
/// # }
/// ```
pub struct OutputCacheMiddleware {
    cache: Arc<OutputCache>,
}

impl OutputCacheMiddleware {
    pub fn new(cache: Arc<OutputCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<OutputCache> {
        &self.cache
    }
}

impl Middleware for OutputCacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let cache = Arc::clone(&self.cache);
        Box::pin(async move {
            let (request, mut extensions) = ctx.into_parts();
            let policy = extensions.remove::<CachePolicy>();
            let mut caching = match extensions.get::<RequestDeadline>() {
                Some(RequestDeadline(deadline)) => CachingContext::with_deadline(*deadline),
                None => CachingContext::new(),
            };

            let backend = move |request: Request| async move {
                Ok::<_, BackendError>(next.run(Context::from_parts(request, extensions)).await)
            };

            let result = match &policy {
                Some(policy) => {
                    cache
                        .execute_with_policy(&mut caching, policy, request, backend)
                        .await
                }
                None => cache.execute_in(&mut caching, request, backend).await,
            };

            result.unwrap_or_else(|err| {
                error!(error = %err, "downstream handler failed");
                Response::new(StatusCode::InternalServerError)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::Method;
    use crate::cache::OutputCacheOptions;

    struct Tenant(&'static str);

    fn chain(cache: Arc<OutputCache>, calls: Arc<AtomicUsize>) -> Vec<MiddlewareHandler> {
        vec![
            from_middleware(Arc::new(OutputCacheMiddleware::new(cache))),
            from_handler(move |ctx: Context| {
                let calls = Arc::clone(&calls);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    let tenant = ctx.extensions().get::<Tenant>().map_or("none", |t| t.0);
                    Response::new(StatusCode::Ok).body(format!("{tenant}#{n}"))
                }
            }),
        ]
    }

    fn cache() -> Arc<OutputCache> {
        let options = OutputCacheOptions::default()
            .route("/items", CachePolicy::new().expire(Duration::from_secs(60)));
        Arc::new(OutputCache::new(options))
    }

    async fn send(chain: &[MiddlewareHandler], ctx: Context) -> Response {
        Next::new(chain.to_vec()).run(ctx).await
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain(cache(), calls.clone());

        let first = send(&chain, Context::new(Request::new(Method::Get, "/items"))).await;
        let second = send(&chain, Context::new(Request::new(Method::Get, "/items"))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.body_bytes().as_ref(), b"none#1");
        assert_eq!(second.body_bytes().as_ref(), b"none#1");
        assert!(second.headers().contains("age"));
    }

    #[tokio::test]
    async fn policy_in_extensions_overrides_route_policy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain(cache(), calls.clone());

        for _ in 0..2 {
            let mut ctx = Context::new(Request::new(Method::Get, "/items"));
            ctx.extensions_mut().insert(CachePolicy::disabled());
            send(&chain, ctx).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn downstream_still_sees_extensions() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = chain(cache(), calls);

        let mut ctx = Context::new(Request::new(Method::Get, "/items"));
        ctx.extensions_mut().insert(Tenant("acme"));
        ctx.extensions_mut()
            .insert(RequestDeadline(Instant::now() + Duration::from_secs(1)));
        let response = send(&chain, ctx).await;
        assert_eq!(response.body_bytes().as_ref(), b"acme#1");
    }

    #[tokio::test]
    async fn exhausted_chain_falls_back_to_500() {
        let response = Next::new(Vec::new())
            .run(Context::new(Request::new(Method::Get, "/")))
            .await;
        assert_eq!(response.status(), StatusCode::InternalServerError);
    }
}
