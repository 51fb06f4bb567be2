//! Middleware pipeline — composable before/after request handler logic.
//!
//! Each middleware wraps the next layer, so a stage can inspect the request,
//! short-circuit with its own response, or decorate the downstream response.
//! The last layer of a [`Pipeline`] is its endpoint: the step that actually
//! generates responses.
//!
//! ## Core types
//!
//! - [`Middleware`] — trait implemented by all middleware.
//! - [`Next`] — cursor into the remaining middleware chain; call [`Next::run`] to
//!   advance to the next layer.
//! - [`MiddlewareHandler`] — type-erased, cheaply-cloneable middleware function.
//! - [`from_middleware`] — converts a [`Middleware`] into a [`MiddlewareHandler`].
//! - [`Pipeline`] — an ordered stack of middleware ending in an endpoint.
//! - [`LoggerMiddleware`] — built-in request/response logger.

use std::{future::Future, pin::Pin, sync::Arc};
use tokio::time::Instant;

use crate::{Response, StatusCode, cache::CACHE_STATUS_HEADER, context::Context};

/// A cursor into the remaining middleware chain for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so each middleware can forward a
/// request at most once. When the chain is exhausted without any layer
/// producing a response, `run` answers `500 Internal Server Error`.
///
/// # Examples
///
/// ```rust,no_run
/// use std::pin::Pin;
/// use corral::{Response, context::Context, middleware::{Middleware, Next}};
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
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type MiddlewareHandler = Arc<
    dyn Fn(Context, Next) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static,
>;

/// Converts a [`Middleware`] implementation into a [`MiddlewareHandler`].
pub fn from_middleware<M>(middleware: Arc<M>) -> MiddlewareHandler
where
    M: Middleware + 'static,
{
    Arc::new(move |ctx: Context, next: Next| middleware.handle(ctx, next))
}

impl Next {
    /// Creates a new `Next` positioned at the start of the given middleware stack.
    pub fn new(middlewares: Vec<MiddlewareHandler>) -> Self {
        Self {
            middlewares,
            index: 0,
        }
    }

    /// Invokes the next middleware in the chain and returns its response.
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
/// Implementors may:
///
/// - **Pass through** — call `next.run(ctx).await` without modification.
/// - **Short-circuit** — return a [`Response`] directly without calling `next`.
/// - **Decorate** — call `next.run(ctx).await`, inspect the response, and return
///   a modified copy.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync` because middleware is shared across
///   Tokio tasks.
/// - `handle` **must** return a pinned, `Send` future.
/// - Implementations **should not** hold `&mut` references to shared state across
///   an `.await` point.
pub trait Middleware: Send + Sync {
    /// Handle the request and optionally delegate to the next middleware.
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>>;
}

/// An ordered middleware stack terminated by an endpoint.
///
/// Layers run in the order they were added; the endpoint runs last and never
/// sees a `Next`.
///
/// # Examples
///
/// ```rust
/// use corral::{Response, StatusCode, context::Context, middleware::{LoggerMiddleware, Pipeline}};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pipeline = Pipeline::new()
///     .with(LoggerMiddleware)
///     .endpoint(|_ctx: Context| async { Response::new(StatusCode::Ok).body("feed") });
///
/// let (req, _) = corral::Request::parse(b"GET /feed HTTP/1.1\r\n\r\n").unwrap();
/// let res = pipeline.handle(Context::new(req)).await;
/// assert_eq!(res.status(), StatusCode::Ok);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<MiddlewareHandler>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a middleware layer.
    #[must_use]
    pub fn with<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middlewares.push(from_middleware(Arc::new(middleware)));
        self
    }

    /// Appends the terminal handler.
    #[must_use]
    pub fn endpoint<H, F>(mut self, handler: H) -> Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let layer: MiddlewareHandler = Arc::new(move |ctx: Context, _next: Next| {
            Box::pin(handler(ctx)) as Pin<Box<dyn Future<Output = Response> + Send>>
        });
        self.middlewares.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Runs `ctx` through every layer.
    pub async fn handle(&self, ctx: Context) -> Response {
        Next::new(self.middlewares.clone()).run(ctx).await
    }
}

/// Built-in middleware that logs each request's method, path, status,
/// cache status, and duration.
///
/// Mount it before the cache stage so the logged status includes cache hits.
pub struct LoggerMiddleware;

impl Middleware for LoggerMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        Box::pin(async move {
            let start = Instant::now();
            let method = ctx.request().method().as_str().to_string();
            let path = ctx.request().path().to_string();

            let response = next.run(ctx).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();
            let cache = response.headers().get(CACHE_STATUS_HEADER).unwrap_or("-");

            tracing::info!(cache, "{} {} - {} ({:?})", method, path, status, duration);

            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Request;

    fn ctx(path: &str) -> Context {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        Context::new(req)
    }

    struct Tag(&'static str);

    impl Middleware for Tag {
        fn handle(
            &self,
            ctx: Context,
            next: Next,
        ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            let tag = self.0;
            Box::pin(async move {
                let mut res = next.run(ctx).await;
                res.add_header("X-Layer", tag);
                res
            })
        }
    }

    struct Deny;

    impl Middleware for Deny {
        fn handle(
            &self,
            _ctx: Context,
            _next: Next,
        ) -> Pin<Box<dyn Future<Output = Response> + Send>> {
            Box::pin(async { Response::new(StatusCode::Forbidden) })
        }
    }

    #[tokio::test]
    async fn empty_pipeline_returns_500() {
        let res = Pipeline::new().handle(ctx("/")).await;
        assert_eq!(res.status(), StatusCode::InternalServerError);
    }

    #[tokio::test]
    async fn layers_wrap_endpoint_in_order() {
        let pipeline = Pipeline::new()
            .with(Tag("outer"))
            .with(Tag("inner"))
            .endpoint(|_ctx| async { Response::new(StatusCode::Ok) });
        assert_eq!(pipeline.len(), 3);

        let res = pipeline.handle(ctx("/feed")).await;
        let layers: Vec<_> = res.headers().get_all("x-layer").collect();
        assert_eq!(layers, vec!["inner", "outer"]);
    }

    #[tokio::test]
    async fn short_circuit_skips_endpoint() {
        let pipeline = Pipeline::new()
            .with(Deny)
            .endpoint(|_ctx| async { Response::new(StatusCode::Ok) });
        let res = pipeline.handle(ctx("/feed")).await;
        assert_eq!(res.status(), StatusCode::Forbidden);
    }

    #[tokio::test]
    async fn endpoint_sees_extensions() {
        let pipeline = Pipeline::new().endpoint(|ctx: Context| async move {
            let label = ctx.extensions().get::<&str>().copied().unwrap_or("none");
            Response::new(StatusCode::Ok).body(label)
        });
        let mut c = ctx("/feed");
        c.extensions_mut().insert("tagged");
        let res = pipeline.handle(c).await;
        assert_eq!(res.payload(), b"tagged");
    }

    #[tokio::test]
    async fn logger_passes_response_through() {
        let pipeline = Pipeline::new()
            .with(LoggerMiddleware)
            .endpoint(|_ctx| async { Response::new(StatusCode::Accepted) });
        let res = pipeline.handle(ctx("/feed")).await;
        assert_eq!(res.status(), StatusCode::Accepted);
    }
}
