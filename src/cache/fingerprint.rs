//! Request fingerprints and the store keys derived from them.
//!
//! Only the normalized path, the `format` query parameter, and the optional
//! `limit` query parameter identify a cached response. Every other query
//! parameter is ignored so that tracking or cache-busting parameters do not
//! fragment the cache.

use std::fmt;

use xxhash_rust::xxh64::xxh64;

use super::CacheConfig;
use crate::Request;

/// Segment used in every control key.
const CONTROL_SEGMENT: &str = "path-requested";

/// The cache-relevant parts of a request.
///
/// # Examples
///
/// ```
/// use corral::cache::RequestIdentity;
///
/// let a = RequestIdentity::new("/feed/", "rss", None);
/// let b = RequestIdentity::new("/feed", "rss", None);
/// assert_eq!(a.fingerprint(), b.fingerprint());
/// assert_eq!(a.fingerprint().as_str().len(), 16);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    path: String,
    format: String,
    limit: Option<String>,
}

impl RequestIdentity {
    /// Builds an identity, normalizing a trailing slash away (except on `/`).
    pub fn new(path: impl Into<String>, format: impl Into<String>, limit: Option<String>) -> Self {
        let mut path = path.into();
        if path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        Self {
            path,
            format: format.into(),
            limit,
        }
    }

    /// Extracts the identity of an incoming request, substituting
    /// `default_format` when no `format` parameter was sent.
    pub fn from_request(request: &Request, default_format: &str) -> Self {
        let format = request
            .query_param("format")
            .filter(|f| !f.is_empty())
            .unwrap_or(default_format);
        let limit = request
            .query_param("limit")
            .filter(|l| !l.is_empty())
            .map(str::to_owned);
        Self::new(request.path(), format, limit)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn limit(&self) -> Option<&str> {
        self.limit.as_deref()
    }

    /// Hashes the identity with seedless xxHash64.
    ///
    /// The hashed text is `path:format` with `:limit` appended when a limit is
    /// present, so the result is identical across processes and restarts.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut canonical = String::with_capacity(self.path.len() + self.format.len() + 16);
        canonical.push_str(&self.path);
        canonical.push(':');
        canonical.push_str(&self.format);
        if let Some(limit) = &self.limit {
            canonical.push(':');
            canonical.push_str(limit);
        }
        Fingerprint(format!("{:016x}", xxh64(canonical.as_bytes(), 0)))
    }
}

/// Fixed-width (16 hex digit) identifier of a [`RequestIdentity`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The data and control keys of one request, derived from a single fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKeys {
    /// `{namespace}:{subsystem}:{fingerprint}` — the stored payload.
    pub data: String,
    /// `{namespace}:path-requested:{fingerprint}` — the in-progress marker.
    pub control: String,
}

impl CacheKeys {
    pub fn derive(config: &CacheConfig, identity: &RequestIdentity) -> Self {
        Self::from_fingerprint(config, &identity.fingerprint())
    }

    pub fn from_fingerprint(config: &CacheConfig, fingerprint: &Fingerprint) -> Self {
        Self {
            data: format!("{}:{}:{}", config.namespace, config.subsystem, fingerprint),
            control: format!("{}:{}:{}", config.namespace, CONTROL_SEGMENT, fingerprint),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> Request {
        let raw = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    fn keys(target: &str) -> CacheKeys {
        let config = CacheConfig::default();
        let identity = RequestIdentity::from_request(&request(target), &config.default_format);
        CacheKeys::derive(&config, &identity)
    }

    #[test]
    fn fingerprint_is_stable() {
        let id = RequestIdentity::new("/feed", "rss", None);
        // Pinned value: xxh64("/feed:rss", seed 0).
        let expected = format!("{:016x}", xxh64(b"/feed:rss", 0));
        assert_eq!(id.fingerprint().as_str(), expected);
        assert_eq!(id.fingerprint(), id.clone().fingerprint());
    }

    #[test]
    fn fingerprint_is_fixed_width() {
        for path in ["/", "/a", "/a/very/long/path/with/many/segments"] {
            let fp = RequestIdentity::new(path, "atom", Some("10".into())).fingerprint();
            assert_eq!(fp.as_str().len(), 16);
            assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn missing_format_uses_default() {
        assert_eq!(keys("/feed"), keys("/feed?format=rss"));
        assert_ne!(keys("/feed"), keys("/feed?format=atom"));
    }

    #[test]
    fn ignored_params_do_not_change_keys() {
        assert_eq!(keys("/feed?format=rss"), keys("/feed?format=rss&utm_source=x"));
        assert_eq!(keys("/feed?limit=5"), keys("/feed?key=secret&limit=5"));
    }

    #[test]
    fn format_and_limit_change_both_keys() {
        let base = keys("/feed?format=rss");
        let other_format = keys("/feed?format=json");
        let limited = keys("/feed?format=rss&limit=3");

        assert_ne!(base.data, other_format.data);
        assert_ne!(base.control, other_format.control);
        assert_ne!(base.data, limited.data);
        assert_ne!(base.control, limited.control);
    }

    #[test]
    fn keys_share_one_fingerprint() {
        let k = keys("/feed?format=rss");
        let fp = k.data.rsplit(':').next().unwrap();
        assert!(k.data.starts_with("corral:route:"));
        assert_eq!(k.control, format!("corral:path-requested:{fp}"));
    }

    #[test]
    fn encoded_parameters_share_keys() {
        assert_eq!(keys("/feed?format=%61tom"), keys("/feed?format=atom"));
        assert_eq!(keys("/feed?%66ormat=atom&%6cimit=5"), keys("/feed?format=atom&limit=5"));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        assert_eq!(keys("/feed/"), keys("/feed"));
        assert_eq!(RequestIdentity::new("/", "rss", None).path(), "/");
    }
}
