//! Synchronous errors returned by engine operations.
//!
//! Asynchronous outcomes (deadline expiry, cancellation, server shutdown)
//! are never reported here; they arrive as completion events.

/// Errors returned synchronously to the caller of an engine operation.
///
/// An operation that fails leaves the call and queue state untouched and
/// posts no event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("{op} not permitted in state {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },
    #[error("completion queue is shutting down")]
    QueueShutdown,
    #[error("completion queue already delivered its shutdown event")]
    QueueDrained,
    #[error("channel closed")]
    ChannelClosed,
    #[error("server shut down")]
    ServerShutdown,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn invalid_state(op: &'static str, state: &'static str) -> Self {
        Error::InvalidState { op, state }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
