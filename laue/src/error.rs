//! Crate-wide error type.

use thiserror::Error;

/// Catch-all error for this crate.
///
/// Numerical failures at peak scope are *not* reported through this type;
/// they are absorbed into the peak's `RejectionFlag` and the pipeline keeps
/// going. This enum covers failures at cell, state, or operation scope.
#[derive(Debug, Error)]
pub enum Error {
    /// A matrix was singular, rank deficient, or otherwise numerically
    /// unusable where a well-conditioned one was required.
    #[error("numerical failure: {0}")]
    Numerical(String),
    /// The input data do not admit a solution (too few peaks, unknown space
    /// group, no valid interpolated state, ...).
    #[error("{0}")]
    Domain(String),
    /// A progress handler requested cancellation between iterations.
    #[error("operation cancelled")]
    Cancelled,
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shorthand for results with the crate error type.
pub type Result<T> = std::result::Result<T, Error>;
