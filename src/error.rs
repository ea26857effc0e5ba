//! Error type shared by every runtime operation.

use thiserror::Error;

use crate::engine::{NativeError, NativeHandle};

/// Errors surfaced by the reference lifecycle layer.
///
/// # Error Categories
///
/// ## Usage errors
/// - [`Error::RuntimeClosed`] - operation on a closed runtime
/// - [`Error::ReferenceClosed`] - operation on a closed value wrapper
/// - [`Error::InvalidArgument`] - argument the runtime cannot accept
/// - [`Error::CallbackSignatureMismatch`] - foreign call did not match the registered signature
///
/// ## Native failures
/// - [`Error::Native`] - the engine rejected an operation; the operation name is attached
/// - [`Error::LibraryNotLoaded`] - the native library failed to load (re-surfaced on every attempt)
/// - [`Error::RuntimeCreation`] - the engine refused to allocate a runtime
///
/// Leaks found at teardown are logged, never returned, except
/// [`Error::RuntimeLeak`] when the host itself is closed with live runtimes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("runtime is closed")]
    RuntimeClosed,

    #[error("reference is already closed")]
    ReferenceClosed,

    #[error("host is closed")]
    HostClosed,

    #[error("runtime pool is closed")]
    PoolClosed,

    #[error("no pooled runtime became available within {0:?}")]
    PoolTimeout(std::time::Duration),

    #[error("native library is not loaded: {0}")]
    LibraryNotLoaded(String),

    #[error("failed to create runtime: {0}")]
    RuntimeCreation(#[source] NativeError),

    /// The engine signalled an error for `operation`.
    #[error("native call `{operation}` failed: {source}")]
    Native {
        operation: &'static str,
        #[source]
        source: NativeError,
    },

    #[error("callback `{name}` signature mismatch: {reason}")]
    CallbackSignatureMismatch { name: String, reason: String },

    #[error("callback context {0} is not registered")]
    CallbackNotFound(NativeHandle),

    /// Raised by managed callback code.
    #[error("callback failed: {0}")]
    Callback(String),

    #[error("{0} runtime(s) still registered when the host closed")]
    RuntimeLeak(usize),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to start guard daemon: {0}")]
    GuardDaemon(#[from] std::io::Error),
}

impl Error {
    /// Adapter for `map_err` that tags a native failure with its operation.
    pub(crate) fn native(operation: &'static str) -> impl FnOnce(NativeError) -> Error {
        move |source| Error::Native { operation, source }
    }

    /// Whether this error is how a fired guard manifests to the caller.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            Error::Native {
                source: NativeError::Terminated,
                ..
            }
        )
    }

    /// The native operation that failed, if this is a native failure.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Error::Native { operation, .. } => Some(*operation),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_error_keeps_operation() {
        let err = Error::native("execute")(NativeError::Terminated);
        assert!(err.is_terminated());
        assert_eq!(err.operation(), Some("execute"));
        assert_eq!(
            err.to_string(),
            "native call `execute` failed: execution terminated"
        );
    }

    #[test]
    fn test_usage_errors_are_not_terminations() {
        assert!(!Error::RuntimeClosed.is_terminated());
        assert!(Error::ReferenceClosed.operation().is_none());
    }
}
