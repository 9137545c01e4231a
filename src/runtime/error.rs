//! Errors reported by runners.

use std::fmt;

use crate::cause::Cause;

/// A blocking runner was called where blocking is not possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BlockingError {
    /// Called from inside a current-thread tokio runtime, where
    /// `block_in_place` is not supported.
    #[error(
        "cannot block inside a current-thread runtime: \
         block_in_place is only supported in multi-thread runtimes"
    )]
    CurrentThreadRuntime,

    /// Called from inside a tokio runtime of an unknown flavor.
    #[error("cannot block inside a runtime of an unsupported flavor")]
    UnsupportedRuntimeFlavor,
}

/// A runtime could not be created.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The host runtime failed to start.
    #[error("failed to build the host runtime")]
    Build(#[from] std::io::Error),

    /// [`Runtime::current`](super::Runtime::current) was called outside a
    /// tokio runtime.
    #[error("no tokio runtime is running on this thread")]
    NoCurrentRuntime,

    /// A configuration value is unusable.
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),
}

/// The failure of a fiber run with
/// [`Runtime::run_future`](super::Runtime::run_future), carrying the full
/// cause and its rendering.
#[derive(thiserror::Error)]
#[error("fiber failed:\n{rendered}")]
pub struct FiberFailure<E> {
    cause: Cause<E>,
    rendered: String,
}

impl<E: fmt::Debug> FiberFailure<E> {
    pub(crate) fn new(cause: Cause<E>) -> Self {
        let rendered = cause.pretty();
        Self { cause, rendered }
    }
}

impl<E> FiberFailure<E> {
    /// The cause of the failure.
    pub const fn cause(&self) -> &Cause<E> {
        &self.cause
    }

    /// Consumes the error, returning the cause.
    pub fn into_cause(self) -> Cause<E> {
        self.cause
    }

    /// The pretty-printed cause.
    pub fn rendered(&self) -> &str {
        &self.rendered
    }
}

impl<E> fmt::Debug for FiberFailure<E> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("FiberFailure")
            .field("rendered", &self.rendered)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn fiber_failure_renders_the_cause() {
        let failure = FiberFailure::new(Cause::fail("boom".to_string()));
        assert!(failure.to_string().contains("boom"));
        assert_eq!(failure.into_cause(), Cause::fail("boom".to_string()));
    }

    #[rstest]
    fn blocking_error_mentions_block_in_place() {
        assert!(
            BlockingError::CurrentThreadRuntime
                .to_string()
                .contains("block_in_place")
        );
    }
}
