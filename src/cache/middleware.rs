//! The cache orchestrator mounted as a pipeline stage.

use std::{future::Future, pin::Pin, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    CacheConfig, CacheError, CacheOrchestrator, CacheStatus, CacheStore, Generated, Outcome,
    RequestIdentity,
};
use crate::{
    Method, Response, StatusCode,
    context::Context,
    http::Headers,
    middleware::{Middleware, Next},
};

/// Response header carrying `HIT` or `MISS`.
pub const CACHE_STATUS_HEADER: &str = "X-Cache-Status";

// Regenerated for every response and never stored.
const UNSTORED_HEADERS: [&str; 3] = ["connection", "content-length", CACHE_STATUS_HEADER];

/// A generated response in its stored form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedBody {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl CachedBody {
    /// Captures a downstream response.
    ///
    /// Non-2xx responses, and bodies that are not UTF-8, are handed back as
    /// `Err` so the cache stage returns them untouched and stores nothing.
    /// A `Cache-Control: no-cache` header suppresses the write-back.
    pub fn capture(response: Response) -> Result<Generated<Self>, Response> {
        if !response.status().is_success() {
            return Err(response);
        }
        let keep_alive = response.is_keep_alive();
        let (status, headers, body) = response.into_parts();

        let body = match String::from_utf8(body) {
            Ok(body) => body,
            Err(e) => {
                debug!("response body is not UTF-8, not caching");
                let response = Response::from_parts(status, headers, e.into_bytes());
                return Err(response.keep_alive(keep_alive));
            }
        };
        let cache_control = headers.get("cache-control").map(str::to_owned);

        let captured = Self {
            status: status.as_u16(),
            headers: headers.without(&UNSTORED_HEADERS).into_pairs(),
            body,
        };
        Ok(Generated::new(captured).with_cache_control(cache_control.as_deref()))
    }

    /// Rebuilds a response, tagging it with `status` unless it bypassed the cache.
    pub fn into_response(self, status: CacheStatus) -> Response {
        let code = StatusCode::from_u16(self.status).unwrap_or(StatusCode::Ok);
        let mut headers: Headers = self.headers.into_iter().collect();
        if status != CacheStatus::Bypass {
            headers.set(CACHE_STATUS_HEADER, status.as_str());
        }
        Response::from_parts(code, headers, self.body.into_bytes())
    }
}

/// Middleware that caches successful downstream responses by request
/// identity and coalesces concurrent requests for the same identity.
///
/// Error mapping:
///
/// | Condition                     | Response                                   |
/// |-------------------------------|--------------------------------------------|
/// | non-GET or bypassed path      | downstream response, no marker             |
/// | hit                           | stored response + `X-Cache-Status: HIT`    |
/// | miss                          | fresh response + `X-Cache-Status: MISS`    |
/// | downstream non-2xx            | downstream response, unchanged             |
/// | leader did not finish in time | `503` with `Retry-After`                   |
/// | request cancelled             | `503`, connection closed                   |
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use corral::cache::{CacheConfig, CacheMiddleware, MemoryStore};
/// use corral::middleware::Pipeline;
/// use corral::{Response, StatusCode};
///
/// let pipeline = Pipeline::new()
///     .with(CacheMiddleware::new(CacheConfig::default(), Arc::new(MemoryStore::new())))
///     .endpoint(|_ctx| async { Response::new(StatusCode::Ok).body("<rss/>") });
/// ```
#[derive(Clone)]
pub struct CacheMiddleware {
    orchestrator: CacheOrchestrator,
}

impl CacheMiddleware {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        Self::from_orchestrator(CacheOrchestrator::new(config, store))
    }

    pub fn from_orchestrator(orchestrator: CacheOrchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &CacheOrchestrator {
        &self.orchestrator
    }
}

fn outcome_response(outcome: Outcome<CachedBody>) -> Response {
    outcome.payload.into_response(outcome.status)
}

impl Middleware for CacheMiddleware {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let cache = self.orchestrator.clone();

        Box::pin(async move {
            // Only GET responses are reusable for later requests.
            let request = ctx.request();
            if *request.method() != Method::Get || cache.config().is_bypassed(request.path()) {
                return next.run(ctx).await;
            }

            let identity =
                RequestIdentity::from_request(ctx.request(), &cache.config().default_format);
            let cancel = ctx.cancellation();
            let retry_after = cache.config().request_timeout().as_secs();

            let result = cache
                .handle(&identity, &cancel, move || async move {
                    CachedBody::capture(next.run(ctx).await)
                })
                .await;

            match result {
                Ok(outcome) => outcome_response(outcome),
                Err(CacheError::Generation(response)) => response,
                Err(CacheError::InProgressTimeout { key }) => {
                    debug!(key = %key, "answering 503 for in-progress generation");
                    Response::new(StatusCode::ServiceUnavailable)
                        .header("Retry-After", retry_after.to_string())
                        .body("This resource is being generated, please try again later")
                }
                Err(CacheError::Cancelled) => Response::new(StatusCode::ServiceUnavailable)
                    .body("Request cancelled")
                    .keep_alive(false),
            }
        })
    }
}
