//! Error kinds shared by futures, tasks and combinators.

use std::sync::Arc;

/// The error observed through [`Future::result`](crate::Future::result) and
/// propagated through coroutines with `?`.
///
/// `Cancelled` doubles as the cancellation signal: awaiting a cancelled
/// future yields `Err(Error::Cancelled)`, and a coroutine that lets it
/// propagate out marks its task cancelled. A coroutine that matches on the
/// variant instead has suppressed the cancellation request.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// The future or task was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A deadline elapsed. Only [`wait_for`](crate::wait_for) and
    /// [`as_completed`](crate::as_completed) produce this;
    /// [`wait`](crate::wait) reports unfinished children as pending instead.
    #[error("deadline elapsed")]
    Timeout,

    /// A result or error was queried or stored in the wrong state.
    #[error("invalid future state: {0}")]
    InvalidState(&'static str),

    /// A coroutine suspended without going through a runtime awaitable, so
    /// nothing could ever wake it. The message names the offending task.
    #[error("bad yield: {0}")]
    BadYield(String),

    /// The task's coroutine panicked. The panic is recorded here for the
    /// task's awaiters and then resumed through the step, so the loop run
    /// aborts unless something above it catches.
    #[error("coroutine panicked: {0}")]
    Panicked(Arc<str>),

    /// An application error raised by a coroutine or stored with
    /// [`Future::set_exception`](crate::Future::set_exception).
    #[error("{0}")]
    Other(Arc<dyn std::error::Error + 'static>),
}

impl Error {
    /// Wraps an application error for storage on a future.
    pub fn other(err: impl std::error::Error + 'static) -> Self {
        Error::Other(Arc::new(err))
    }

    /// Wraps a plain message as an application error.
    pub fn msg(msg: impl Into<String>) -> Self {
        Error::Other(Arc::new(Message(msg.into())))
    }

    /// True for the `Cancelled` variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

#[derive(Debug)]
struct Message(String);

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forwards_to_the_wrapped_error() {
        let err = Error::msg("disk on fire");
        assert_eq!(err.to_string(), "disk on fire");
        assert_eq!(Error::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn clones_share_the_wrapped_error() {
        let err = Error::other(std::io::Error::other("gone"));
        let clone = err.clone();
        assert_eq!(err.to_string(), clone.to_string());
    }
}
