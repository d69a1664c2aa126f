//! Kernel-specific error types.

use didlink_types::error::DidLinkError;
use thiserror::Error;

/// Kernel error type wrapping DidLinkError with kernel-specific context.
#[derive(Error, Debug)]
pub enum KernelError {
    /// A wrapped DidLinkError.
    #[error(transparent)]
    DidLink(#[from] DidLinkError),

    /// The agent failed to boot.
    #[error("Boot failed: {0}")]
    BootFailed(String),

    /// Gave up waiting for a connection to complete.
    #[error("Timed out after {0:?} waiting for the connection")]
    WaitTimedOut(std::time::Duration),

    /// The completion listener went away without an outcome.
    #[error("Completion listener closed")]
    ListenerClosed,
}

/// Alias for kernel results.
pub type KernelResult<T> = Result<T, KernelError>;
