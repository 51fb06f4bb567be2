//! Per-request context — the request plus type-erased extensions.
//!
//! Middleware communicate through [`Extensions`] without knowing each
//! other's types. The server installs a [`CancellationToken`] per request;
//! stages that suspend (such as a cache follower waiting on a leader) read it
//! through [`Context::cancellation`].

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use tokio_util::sync::CancellationToken;

use crate::Request;

/// Type-erased request extensions map, keyed by type.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Per-request state handed through the middleware pipeline.
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    /// Creates a context whose cancellation is tied to `token`.
    pub fn with_cancellation(request: Request, token: CancellationToken) -> Self {
        let mut ctx = Self::new(request);
        ctx.extensions.insert(token);
        ctx
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// The request's cancellation token, or a fresh token that is never
    /// cancelled when none was installed.
    pub fn cancellation(&self) -> CancellationToken {
        self.extensions
            .get::<CancellationToken>()
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        let (req, _) = Request::parse(b"GET /feed HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        req
    }

    #[test]
    fn extensions_are_keyed_by_type() {
        let mut ext = Extensions::new();
        assert_eq!(ext.insert(5u32), None);
        assert_eq!(ext.insert(6u32), Some(5));
        ext.insert("label");
        assert_eq!(ext.get::<u32>(), Some(&6));
        assert_eq!(ext.get::<&str>(), Some(&"label"));
        assert_eq!(ext.remove::<u32>(), Some(6));
        assert_eq!(ext.get::<u32>(), None);
    }

    #[test]
    fn cancellation_defaults_to_live_token() {
        let ctx = Context::new(request());
        assert!(!ctx.cancellation().is_cancelled());
    }

    #[test]
    fn installed_token_is_shared() {
        let token = CancellationToken::new();
        let ctx = Context::with_cancellation(request(), token.clone());
        token.cancel();
        assert!(ctx.cancellation().is_cancelled());
        assert_eq!(ctx.request().path(), "/feed");
    }
}
