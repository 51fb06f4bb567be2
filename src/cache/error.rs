//! Errors surfaced by the cache orchestrator.

use thiserror::Error;

/// Failure of a request routed through the cache.
///
/// Store unavailability and store write failures never appear here: they
/// degrade to pass-through and are only logged.
#[derive(Debug, Error)]
pub enum CacheError<E> {
    /// A leader kept the control key in progress for the whole wait budget.
    /// Callers should answer with a retryable "try again later".
    #[error("request for {key} is already being generated, try again later")]
    InProgressTimeout { key: String },

    /// The caller's cancellation token fired.
    #[error("request cancelled")]
    Cancelled,

    /// The generation step failed; the inner error is returned untouched.
    #[error(transparent)]
    Generation(E),
}

impl<E> CacheError<E> {
    pub fn is_in_progress_timeout(&self) -> bool {
        matches!(self, Self::InProgressTimeout { .. })
    }

    /// Returns the generation error, if that is what this is.
    pub fn into_generation(self) -> Option<E> {
        match self {
            Self::Generation(e) => Some(e),
            _ => None,
        }
    }
}
