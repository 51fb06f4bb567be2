//! In-process [`CacheStore`] with TTL expiry.
//!
//! Suitable for single-instance deployments and tests. Expiry uses
//! [`tokio::time::Instant`], so tests running on a paused clock can advance
//! past a TTL deterministically.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::time::Instant;

use super::store::{CacheStore, StoreError, StoreFuture, StoreResult};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// A `HashMap`-backed store whose `set_unless` is atomic, giving a true
/// single-leader guarantee within one process.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use corral::cache::{CacheStore, MemoryStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.set("k", "v", Duration::from_secs(10)).await.unwrap();
/// assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    gets: AtomicUsize,
    sets: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            gets: AtomicUsize::new(0),
            sets: AtomicUsize::new(0),
        }
    }

    /// Flips the availability flag reported by [`CacheStore::available`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Number of `get` calls served, including those made by `set_unless`.
    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::Acquire)
    }

    /// Number of writes performed, including successful `set_unless` calls.
    pub fn set_count(&self) -> usize {
        self.sets.load(Ordering::Acquire)
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired entries. Reads already treat them as absent.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        if let Ok(mut entries) = self.lock() {
            entries.retain(|_, e| e.is_live(now));
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_owned()))
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn read(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        self.gets.fetch_add(1, Ordering::AcqRel);
        let now = Instant::now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    fn write(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.check_available()?;
        self.sets.fetch_add(1, Ordering::AcqRel);
        let entry = Entry {
            value: value.to_owned(),
            expires_at: Instant::now() + ttl,
        };
        self.lock()?.insert(key.to_owned(), entry);
        Ok(())
    }

    fn write_unless(&self, key: &str, busy: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        self.gets.fetch_add(1, Ordering::AcqRel);
        let now = Instant::now();
        let mut entries = self.lock()?;
        if entries
            .get(key)
            .is_some_and(|e| e.is_live(now) && e.value == busy)
        {
            return Ok(false);
        }
        self.sets.fetch_add(1, Ordering::AcqRel);
        entries.insert(
            key.to_owned(),
            Entry {
                value: value.to_owned(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }
}

impl CacheStore for MemoryStore {
    fn available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { self.read(key) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.write(key, value, ttl) })
    }

    fn set_unless<'a>(
        &'a self,
        key: &'a str,
        busy: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move { self.write_unless(key, busy, value, ttl) })
    }
}
