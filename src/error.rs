//! Error types for the merge engine.
//!
//! Failures are never swallowed: an underlying transport error is delivered
//! identically to every caller merged onto the affected call. No retry is
//! performed at this layer.

use thiserror::Error;

use crate::transport::{HttpResponse, TransportError};

/// Result delivered exactly once to every waiter on a completed call.
pub type CallResult = Result<HttpResponse, MergeError>;

/// Construction-time configuration errors. Fatal: the engine is never
/// created with an invalid configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency limit must be at least 1, got {0}")]
    InvalidConcurrencyLimit(usize),

    #[error("pending queue depth must be at least 1, got {0}")]
    InvalidQueueDepth(usize),
}

/// Errors surfaced to callers of [`MergeEngine::execute`].
///
/// [`MergeEngine::execute`]: crate::MergeEngine::execute
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MergeError {
    /// The underlying call failed; all merged callers see the same error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The pending queue was at capacity when the request arrived.
    #[error("pending queue full: {current}/{max} requests")]
    QueueFull { current: usize, max: usize },

    /// The engine was torn down before the call completed.
    #[error("request cancelled before completion")]
    Cancelled,
}

impl MergeError {
    /// True when the failure originated in the wrapped transport rather
    /// than in the merge layer itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

// Lets a MergeEngine stand in wherever a plain Transport is expected.
impl From<MergeError> for TransportError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::Transport(e) => e,
            MergeError::QueueFull { current, max } => {
                TransportError::Overloaded { current, max }
            }
            MergeError::Cancelled => TransportError::Cancelled,
        }
    }
}
