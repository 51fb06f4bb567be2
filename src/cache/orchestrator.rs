//! The cache stage's request lifecycle.
//!
//! ```text
//! BYPASS ─────────────────────────────────────────────► generate ► DONE
//! CHECK_INFLIGHT ─► WAIT ─► LOOKUP ─► HIT ────────────────────────► DONE
//!        └──────────────────►   └───► MISS ─► claim ─► generate ─► WRITE ─► release ─► DONE
//!                                                          └─► release ─► error
//! ```
//!
//! Coordination between processes happens only through the store. The claim
//! is as strong as the store's [`CacheStore::set_unless`]; with a non-atomic
//! store two callers can both lead, and the last write to the data key wins.

use std::{
    future::Future,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    CacheConfig, CacheError, CacheKeys, CacheStore, RequestIdentity,
    coordinator::{Claim, InFlightCoordinator},
    wait::{WaitError, WaitStrategy},
};

/// Output of the generation step.
#[derive(Debug, Clone)]
pub struct Generated<T> {
    payload: T,
    cacheable: bool,
}

impl<T> Generated<T> {
    /// A cacheable result.
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            cacheable: true,
        }
    }

    /// Marks the result as not to be written back.
    #[must_use]
    pub fn no_cache(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Applies a cache-control signal; the literal `no-cache` suppresses write-back.
    #[must_use]
    pub fn with_cache_control(self, cache_control: Option<&str>) -> Self {
        match cache_control {
            Some(value) if value.trim().eq_ignore_ascii_case("no-cache") => self.no_cache(),
            _ => self,
        }
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// How a response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from the store.
    Hit,
    /// Freshly generated with the cache engaged.
    Miss,
    /// Generated without touching the store.
    Bypass,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

/// A payload plus how it was obtained.
#[derive(Debug, Clone)]
pub struct Outcome<T> {
    pub payload: T,
    pub status: CacheStatus,
    /// Unix milliseconds at which the stored copy was written, if any.
    pub last_build_date: Option<u64>,
}

/// Stored form of a payload under its data key.
#[derive(Debug, Serialize, Deserialize)]
struct CachedResponse<T> {
    payload: T,
    #[serde(rename = "lastBuildDate")]
    last_build_date: u64,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Memoizes generation results by request identity and keeps concurrent
/// requests for the same identity from generating at the same time.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use corral::cache::{CacheConfig, CacheOrchestrator, CacheStatus, Generated, MemoryStore, RequestIdentity};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = CacheOrchestrator::new(CacheConfig::testing(), Arc::new(MemoryStore::new()));
/// let id = RequestIdentity::new("/feed", "rss", None);
/// let token = CancellationToken::new();
///
/// let first = cache
///     .handle(&id, &token, || async { Ok::<_, std::io::Error>(Generated::new("items".to_string())) })
///     .await
///     .unwrap();
/// assert_eq!(first.status, CacheStatus::Miss);
///
/// let second = cache
///     .handle(&id, &token, || async { Ok::<_, std::io::Error>(Generated::new(String::new())) })
///     .await
///     .unwrap();
/// assert_eq!(second.status, CacheStatus::Hit);
/// assert_eq!(second.payload, "items");
/// # }
/// ```
#[derive(Clone)]
pub struct CacheOrchestrator {
    config: Arc<CacheConfig>,
    store: Arc<dyn CacheStore>,
    coordinator: InFlightCoordinator,
    wait: WaitStrategy,
}

impl CacheOrchestrator {
    /// Builds an orchestrator over `store`.
    ///
    /// A config that fails [`CacheConfig::validate`] is logged and used with
    /// its timing floors (one second timeout, one millisecond poll), so a
    /// claim always leaves a live in-progress marker behind.
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Self {
        if let Err(e) = config.validate() {
            warn!(error = %e, "cache config out of range, using minimum timings");
        }
        let coordinator = InFlightCoordinator::new(Arc::clone(&store), config.request_timeout());
        let wait = WaitStrategy::new(config.poll_interval(), config.request_timeout());
        Self {
            config: Arc::new(config),
            store,
            coordinator,
            wait,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &InFlightCoordinator {
        &self.coordinator
    }

    pub fn keys(&self, identity: &RequestIdentity) -> CacheKeys {
        CacheKeys::derive(&self.config, identity)
    }

    /// Runs one request through the cache.
    ///
    /// `generate` is invoked at most once, and only on a bypass or a miss.
    ///
    /// # Errors
    ///
    /// - [`CacheError::InProgressTimeout`] — another caller held the control
    ///   key for the whole request timeout.
    /// - [`CacheError::Cancelled`] — `cancel` fired while waiting or
    ///   generating. The control key is released first if we held it.
    /// - [`CacheError::Generation`] — `generate` failed. The control key is
    ///   released before the error is returned.
    pub async fn handle<T, E, F, Fut>(
        &self,
        identity: &RequestIdentity,
        cancel: &CancellationToken,
        generate: F,
    ) -> Result<Outcome<T>, CacheError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Generated<T>, E>>,
    {
        if self.config.is_bypassed(identity.path()) || !self.store.available() {
            debug!(path = identity.path(), "cache bypassed");
            let generated = generate().await.map_err(CacheError::Generation)?;
            return Ok(Outcome {
                payload: generated.payload,
                status: CacheStatus::Bypass,
                last_build_date: None,
            });
        }

        let keys = self.keys(identity);

        if self.coordinator.is_in_progress(&keys.control).await {
            self.follow(&keys, cancel).await?;
        }

        if let Some(hit) = self.lookup(&keys.data).await {
            return Ok(hit);
        }

        if self.coordinator.claim(&keys.control).await == Claim::Contended {
            // Lost the claim race: wait once more for the winner, then
            // generate ourselves if it left nothing behind.
            self.follow(&keys, cancel).await?;
            if let Some(hit) = self.lookup(&keys.data).await {
                return Ok(hit);
            }
            self.coordinator.force_claim(&keys.control).await;
        }

        self.lead(&keys, cancel, generate).await
    }

    async fn follow<E>(
        &self,
        keys: &CacheKeys,
        cancel: &CancellationToken,
    ) -> Result<(), CacheError<E>> {
        debug!(key = %keys.control, "generation in progress, waiting");
        match self.wait.wait(&self.coordinator, &keys.control, cancel).await {
            Ok(()) => Ok(()),
            Err(WaitError::Cancelled) => Err(CacheError::Cancelled),
            Err(WaitError::TimedOut) => {
                warn!(key = %keys.control, "timed out waiting for generation");
                Err(CacheError::InProgressTimeout {
                    key: keys.control.clone(),
                })
            }
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, data_key: &str) -> Option<Outcome<T>> {
        let raw = match self.store.get(data_key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = data_key, error = %e, "cache lookup failed");
                return None;
            }
        };
        match serde_json::from_str::<CachedResponse<T>>(&raw) {
            Ok(cached) => {
                debug!(key = data_key, "cache hit");
                Some(Outcome {
                    payload: cached.payload,
                    status: CacheStatus::Hit,
                    last_build_date: Some(cached.last_build_date),
                })
            }
            Err(e) => {
                warn!(key = data_key, error = %e, "discarding undecodable cache entry");
                None
            }
        }
    }

    async fn lead<T, E, F, Fut>(
        &self,
        keys: &CacheKeys,
        cancel: &CancellationToken,
        generate: F,
    ) -> Result<Outcome<T>, CacheError<E>>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Generated<T>, E>>,
    {
        debug!(key = %keys.data, "cache miss, generating");
        let guard = self.coordinator.guard(&keys.control);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = generate() => Some(result),
        };

        let generated = match result {
            Some(Ok(generated)) => generated,
            Some(Err(e)) => {
                guard.release().await;
                return Err(CacheError::Generation(e));
            }
            None => {
                debug!(key = %keys.control, "generation cancelled");
                guard.release().await;
                return Err(CacheError::Cancelled);
            }
        };

        let last_build_date = if generated.is_cacheable() {
            self.write_back(&keys.data, &generated.payload).await
        } else {
            debug!(key = %keys.data, "response marked no-cache, skipping write");
            None
        };
        guard.release().await;

        Ok(Outcome {
            payload: generated.payload,
            status: CacheStatus::Miss,
            last_build_date,
        })
    }

    // Returns the stamped build date when the write succeeded.
    async fn write_back<T: Serialize>(&self, data_key: &str, payload: &T) -> Option<u64> {
        let cached = CachedResponse {
            payload,
            last_build_date: unix_millis(),
        };
        let encoded = match serde_json::to_string(&cached) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = data_key, error = %e, "failed to encode response for cache");
                return None;
            }
        };
        match self
            .store
            .set(data_key, &encoded, self.config.route_expire())
            .await
        {
            Ok(()) => Some(cached.last_build_date),
            Err(e) => {
                warn!(key = data_key, error = %e, "cache write failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::{ControlState, MemoryStore, StoreError, StoreFuture};

    #[derive(Debug, PartialEq)]
    struct Boom;

    fn orchestrator(store: Arc<MemoryStore>) -> CacheOrchestrator {
        orchestrator_with(CacheConfig::testing(), store)
    }

    fn orchestrator_with(config: CacheConfig, store: Arc<MemoryStore>) -> CacheOrchestrator {
        CacheOrchestrator::new(config, store)
    }

    fn feed() -> RequestIdentity {
        RequestIdentity::new("/feed", "rss", None)
    }

    #[test]
    fn cache_control_no_cache_is_literal() {
        assert!(!Generated::new(()).with_cache_control(Some("no-cache")).is_cacheable());
        assert!(!Generated::new(()).with_cache_control(Some(" No-Cache ")).is_cacheable());
        assert!(Generated::new(()).with_cache_control(Some("max-age=60")).is_cacheable());
        assert!(Generated::new(()).with_cache_control(None).is_cacheable());
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator(store.clone());
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        for expected in [CacheStatus::Miss, CacheStatus::Hit] {
            let out = cache
                .handle(&feed(), &token, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Boom>(Generated::new(vec![1, 2, 3]))
                })
                .await
                .unwrap();
            assert_eq!(out.status, expected);
            assert_eq!(out.payload, vec![1, 2, 3]);
            assert!(out.last_build_date.is_some());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let keys = cache.keys(&feed());
        assert_eq!(
            cache.coordinator().state(&keys.control).await.unwrap(),
            ControlState::Idle
        );
    }

    #[tokio::test]
    async fn stored_entry_carries_last_build_date() {
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator(store.clone());
        let before = unix_millis();
        cache
            .handle(&feed(), &CancellationToken::new(), || async {
                Ok::<_, Boom>(Generated::new("x".to_string()))
            })
            .await
            .unwrap();

        let raw = store.get(&cache.keys(&feed()).data).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["payload"], "x");
        assert!(value["lastBuildDate"].as_u64().unwrap() >= before);
    }

    #[tokio::test]
    async fn no_cache_is_never_written() {
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator(store.clone());
        let token = CancellationToken::new();

        for _ in 0..2 {
            let out = cache
                .handle(&feed(), &token, || async {
                    Ok::<_, Boom>(Generated::new(1u32).no_cache())
                })
                .await
                .unwrap();
            assert_eq!(out.status, CacheStatus::Miss);
            assert_eq!(out.last_build_date, None);
        }
        assert!(store.get(&cache.keys(&feed()).data).await.unwrap().is_none());
        // Release still ran.
        assert_eq!(
            cache.coordinator().state(&cache.keys(&feed()).control).await.unwrap(),
            ControlState::Idle
        );
    }

    #[tokio::test]
    async fn bypass_paths_never_touch_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator(store.clone());
        let root = RequestIdentity::new("/", "rss", None);

        let out = cache
            .handle(&root, &CancellationToken::new(), || async {
                Ok::<_, Boom>(Generated::new(0u8))
            })
            .await
            .unwrap();
        assert_eq!(out.status, CacheStatus::Bypass);
        assert_eq!(store.get_count(), 0);
        assert_eq!(store.set_count(), 0);
    }

    #[tokio::test]
    async fn unavailable_store_passes_through() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let cache = orchestrator(store.clone());

        let out = cache
            .handle(&feed(), &CancellationToken::new(), || async {
                Ok::<_, Boom>(Generated::new(7u8))
            })
            .await
            .unwrap();
        assert_eq!(out.status, CacheStatus::Bypass);
        assert_eq!(out.payload, 7);
    }

    #[tokio::test]
    async fn generation_error_is_returned_and_released() {
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator(store.clone());
        let token = CancellationToken::new();

        let err = cache
            .handle(&feed(), &token, || async { Err::<Generated<u8>, _>(Boom) })
            .await
            .unwrap_err();
        assert_eq!(err.into_generation(), Some(Boom));

        let keys = cache.keys(&feed());
        assert_eq!(
            cache.coordinator().state(&keys.control).await.unwrap(),
            ControlState::Idle
        );
        assert!(store.get(&keys.data).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undecodable_entry_is_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator(store.clone());
        let keys = cache.keys(&feed());
        store
            .set(&keys.data, "not json", std::time::Duration::from_secs(60))
            .await
            .unwrap();

        let out = cache
            .handle(&feed(), &CancellationToken::new(), || async {
                Ok::<_, Boom>(Generated::new(5u8))
            })
            .await
            .unwrap();
        assert_eq!(out.status, CacheStatus::Miss);
        assert_eq!(out.payload, 5);
    }

    #[tokio::test]
    async fn cancelled_leader_releases() {
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator(store.clone());
        let token = CancellationToken::new();
        let canceller = token.clone();

        let err = cache
            .handle(&feed(), &token, || async move {
                canceller.cancel();
                std::future::pending::<Result<Generated<u8>, Boom>>().await
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
        assert_eq!(
            cache.coordinator().state(&cache.keys(&feed()).control).await.unwrap(),
            ControlState::Idle
        );
    }

    /// A store whose writes always fail.
    struct ReadOnlyStore(MemoryStore);

    impl CacheStore for ReadOnlyStore {
        fn available(&self) -> bool {
            true
        }

        fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
            self.0.get(key)
        }

        fn set<'a>(
            &'a self,
            _key: &'a str,
            _value: &'a str,
            _ttl: std::time::Duration,
        ) -> StoreFuture<'a, ()> {
            Box::pin(async { Err(StoreError::Backend("read-only".to_owned())) })
        }
    }

    #[tokio::test]
    async fn write_failures_do_not_fail_the_request() {
        let cache = CacheOrchestrator::new(
            CacheConfig::testing(),
            Arc::new(ReadOnlyStore(MemoryStore::new())),
        );
        let out = cache
            .handle(&feed(), &CancellationToken::new(), || async {
                Ok::<_, Boom>(Generated::new("fresh".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(out.status, CacheStatus::Miss);
        assert_eq!(out.payload, "fresh");
        assert_eq!(out.last_build_date, None);
    }

    #[tokio::test]
    async fn zeroed_timeout_keeps_claim_alive() {
        let config = CacheConfig {
            request_timeout_seconds: 0,
            ..CacheConfig::testing()
        };
        let store = Arc::new(MemoryStore::new());
        let cache = orchestrator_with(config, store);
        assert_eq!(cache.coordinator().ttl(), std::time::Duration::from_secs(1));

        let keys = cache.keys(&feed());
        assert_eq!(cache.coordinator().claim(&keys.control).await, Claim::Acquired);
        assert_eq!(
            cache.coordinator().state(&keys.control).await.unwrap(),
            ControlState::InProgress
        );
    }
}
