//! Response caching with stampede protection.
//!
//! Sits in front of an expensive response-generation step, memoizes results
//! keyed by normalized request identity, and keeps concurrent requests for
//! the same identity from all generating at once.
//!
//! ## Core types
//!
//! - [`RequestIdentity`] / [`Fingerprint`] / [`CacheKeys`] — stable keys
//!   derived from the path, `format`, and `limit` of a request.
//! - [`CacheStore`] — the async key-value contract; [`MemoryStore`] is the
//!   in-process implementation.
//! - [`InFlightCoordinator`] — the per-fingerprint in-progress marker.
//! - [`WaitStrategy`] — bounded, cancellable follower polling.
//! - [`CacheOrchestrator`] — the full lifecycle: bypass, lookup, coordinate,
//!   generate, write back.
//! - [`CacheMiddleware`] — the orchestrator mounted in a middleware pipeline.
//!
//! This is a best-effort stampede reducer, not a distributed lock. Every
//! store write carries a TTL, so state leaked by a crashed process heals once
//! the TTL elapses.

mod config;
mod coordinator;
mod error;
mod fingerprint;
mod memory;
mod middleware;
mod orchestrator;
mod store;
mod wait;

pub use config::{CacheConfig, ConfigError};
pub use coordinator::{Claim, ControlState, InFlightCoordinator, ReleaseGuard};
pub use error::CacheError;
pub use fingerprint::{CacheKeys, Fingerprint, RequestIdentity};
pub use memory::MemoryStore;
pub use middleware::{CACHE_STATUS_HEADER, CacheMiddleware, CachedBody};
pub use orchestrator::{CacheOrchestrator, CacheStatus, Generated, Outcome};
pub use store::{CacheStore, StoreError, StoreFuture, StoreResult};
pub use wait::{WaitError, WaitStrategy};
