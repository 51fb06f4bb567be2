//! # corral
//!
//! Stampede-protected response caching for async HTTP/1.1 services.
//!
//! The [`cache`] stage sits in front of an expensive response-generation
//! step. It memoizes responses keyed by normalized request identity and
//! coordinates concurrent requests for the same identity through a shared
//! key-value store, so a burst of identical requests triggers one
//! generation instead of many.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use corral::cache::{CacheConfig, CacheMiddleware, MemoryStore};
//! use corral::middleware::{LoggerMiddleware, Pipeline};
//! use corral::server::Server;
//! use corral::{Response, StatusCode};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipeline = Pipeline::new()
//!         .with(LoggerMiddleware)
//!         .with(CacheMiddleware::new(CacheConfig::default(), Arc::new(MemoryStore::new())))
//!         .endpoint(|_ctx| async {
//!             Response::new(StatusCode::Ok)
//!                 .header("Content-Type", "application/rss+xml")
//!                 .body("<rss version=\"2.0\"/>")
//!         });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(pipeline, CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod context;
pub mod http;
pub mod middleware;
pub mod server;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
