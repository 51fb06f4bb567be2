//! Cache stage configuration.
//!
//! All options are plain named fields with defaults; profiles (such as the
//! short-timeout [`CacheConfig::testing`] profile) are separate constructors
//! rather than environment checks inside the pipeline.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading or validating a [`CacheConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse cache config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid cache config: {field} must be greater than zero")]
    Zero { field: &'static str },
}

/// Options recognized by the cache stage.
///
/// Field names deserialize from camelCase JSON, e.g.:
///
/// ```
/// use corral::cache::CacheConfig;
///
/// let config = CacheConfig::from_json(r#"{
///     "requestTimeoutSeconds": 5,
///     "routeExpireSeconds": 120,
///     "pollIntervalMs": 10,
///     "bypassPaths": ["/", "/healthz"]
/// }"#).unwrap();
///
/// assert_eq!(config.request_timeout().as_secs(), 5);
/// assert!(config.is_bypassed("/healthz"));
/// assert!(!config.is_bypassed("/feed"));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Leading segment of every key written to the store.
    pub namespace: String,

    /// Segment naming the cached payload family in data keys.
    pub subsystem: String,

    /// Bounds the in-progress marker TTL and the total follower wait.
    pub request_timeout_seconds: u64,

    /// TTL of a cached payload.
    pub route_expire_seconds: u64,

    /// Fixed delay between follower re-checks of the control key.
    pub poll_interval_ms: u64,

    /// Paths that never touch the store.
    pub bypass_paths: HashSet<String>,

    /// `format` value substituted when the request does not carry one.
    pub default_format: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            namespace: "corral".to_owned(),
            subsystem: "route".to_owned(),
            request_timeout_seconds: 60,
            route_expire_seconds: 300,
            poll_interval_ms: 1000,
            bypass_paths: ["/", "/robots.txt", "/favicon.ico", "/logo.png"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            default_format: "rss".to_owned(),
        }
    }
}

impl CacheConfig {
    /// Short-timeout profile for test suites: 10 ms polling, 1 s request timeout.
    pub fn testing() -> Self {
        Self {
            request_timeout_seconds: 1,
            poll_interval_ms: 10,
            ..Self::default()
        }
    }

    /// Parses and validates a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Parse`] — the document is not valid JSON for this shape.
    /// - [`ConfigError::Zero`] — a timing field that must be positive is zero.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that would make the follower wait loop degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero {
                field: "pollIntervalMs",
            });
        }
        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::Zero {
                field: "requestTimeoutSeconds",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the request timeout, rounding a fractional second up.
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_seconds = ceil_secs(timeout).max(1);
        self
    }

    /// Sets the payload TTL, rounding a fractional second up.
    #[must_use]
    pub fn with_route_expire(mut self, expire: Duration) -> Self {
        self.route_expire_seconds = ceil_secs(expire).max(1);
        self
    }

    /// Sets the poll interval, rounding a fractional millisecond up.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        let millis = interval.as_micros().div_ceil(1000);
        self.poll_interval_ms = u64::try_from(millis).unwrap_or(u64::MAX).max(1);
        self
    }

    #[must_use]
    pub fn bypass(mut self, path: impl Into<String>) -> Self {
        self.bypass_paths.insert(path.into());
        self
    }

    /// Marker TTL and follower budget. Never shorter than one second, even
    /// when the field was set to zero directly.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds.max(1))
    }

    pub fn route_expire(&self) -> Duration {
        Duration::from_secs(self.route_expire_seconds)
    }

    /// Never shorter than one millisecond.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Returns `true` if requests for `path` skip the cache entirely.
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths.contains(path)
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}
