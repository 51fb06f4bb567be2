//! The key-value store contract the cache stage is written against.
//!
//! The store is the only shared mutable resource: every process running the
//! cache stage coordinates exclusively through it. Implementations carry no
//! retry logic; degraded paths are decided by the callers.

use std::{future::Future, pin::Pin, time::Duration};

use thiserror::Error;

/// Errors reported by a [`CacheStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store is unavailable")]
    Unavailable,

    #[error("cache store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed, `Send` future returned by [`CacheStore`] operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = StoreResult<T>> + Send + 'a>>;

/// Minimal async key-value contract.
///
/// Values are strings; every write carries an explicit TTL after which the
/// entry reads as absent.
///
/// # Contract
///
/// - `available` is a cheap, synchronous health flag. When it is `false` the
///   cache stage runs in pass-through mode and issues no other calls.
/// - `get` returns `Ok(None)` for absent or expired keys.
/// - `set` overwrites unconditionally.
/// - `set_unless` writes only if the current value is not `busy`. The default
///   implementation is a plain read followed by a write and is therefore
///   racy; stores with an atomic primitive should override it.
pub trait CacheStore: Send + Sync {
    fn available(&self) -> bool;

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Writes `value` unless the key currently holds `busy`.
    ///
    /// Returns `Ok(true)` if the write happened.
    fn set_unless<'a>(
        &'a self,
        key: &'a str,
        busy: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            if self.get(key).await?.as_deref() == Some(busy) {
                return Ok(false);
            }
            self.set(key, value, ttl).await?;
            Ok(true)
        })
    }
}
