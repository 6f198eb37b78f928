use thiserror::Error;

/// Errors returned by performance trace operations.
///
/// The error is `Clone` because a client acquisition failure is cached and
/// replayed to every caller that waits on the shared client future.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PerfError {
    /// The one-time acquisition of the performance client failed.
    ///
    /// This is fatal: the failure is replayed to every pending and future
    /// trace creation attempt and is never retried. No trace handle is
    /// created, so no stop call is owed.
    #[error("performance client acquisition failed: {0}")]
    ClientAcquisition(String),

    /// Internal bookkeeping failure, such as a poisoned lock in the
    /// in-memory test client.
    #[error("{0}")]
    Internal(String),
}
