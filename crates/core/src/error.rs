//! Transport error model
//!
//! Every request against the store resolves to success or to exactly one
//! of these outcomes. The set is closed: a conforming transport maps its
//! native error codes onto these variants and nothing else, so the layers
//! above can drive retry policy from an exhaustive match.

use thiserror::Error;

/// Result alias for transport calls.
pub type KvResult<T> = std::result::Result<T, KvError>;

/// One transport-level failure.
///
/// Variants are grouped by how the caller can react:
/// - definite state (`DocumentNotFound`, `DocumentExists`, `PathNotFound`,
///   `PathExists`, `CasMismatch`): the server made a decision
/// - transient (`TemporaryFailure`, `UnambiguousTimeout`,
///   `DurableWriteInProgress`): the write did not happen, try again
/// - ambiguous (`AmbiguousTimeout`, `DurabilityAmbiguous`,
///   `RequestCanceled`): the write may or may not have happened
/// - terminal (`Timeout`, `ValueTooLarge`, `ConnectionLost`)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    /// The addressed document does not exist (or is a tombstone and the
    /// request did not ask for deleted access).
    #[error("document not found")]
    DocumentNotFound,
    /// An insert hit an existing document.
    #[error("document already exists")]
    DocumentExists,
    /// A subdocument path was absent.
    #[error("subdocument path not found")]
    PathNotFound,
    /// A subdocument add hit an existing path.
    #[error("subdocument path already exists")]
    PathExists,
    /// The compare-and-swap value did not match the document.
    #[error("CAS mismatch")]
    CasMismatch,
    /// The request deadline elapsed with no response at all.
    #[error("request timed out")]
    Timeout,
    /// The request timed out before the server accepted it; it was
    /// definitely not applied.
    #[error("request timed out before dispatch")]
    UnambiguousTimeout,
    /// The request timed out after dispatch; it may have been applied.
    #[error("request timed out in flight")]
    AmbiguousTimeout,
    /// The server is briefly overloaded; the request was not applied.
    #[error("temporary failure")]
    TemporaryFailure,
    /// Another durable write on the document is still in flight.
    #[error("durable write in progress")]
    DurableWriteInProgress,
    /// The write happened but its durability requirement could not be
    /// confirmed.
    #[error("durability ambiguous")]
    DurabilityAmbiguous,
    /// The request was canceled while in flight.
    #[error("request canceled")]
    RequestCanceled,
    /// The value is too large for the target document.
    #[error("value too large")]
    ValueTooLarge,
    /// The connection to the cluster is gone and will not come back.
    #[error("connection lost")]
    ConnectionLost,
    /// Anything the closed set above does not name.
    #[error("kv error: {0}")]
    Other(String),
}
