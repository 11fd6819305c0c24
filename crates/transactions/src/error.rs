//! Error classification and the transaction error taxonomy
//!
//! Three layers, strictly separated:
//!
//! 1. [`ErrorClass`]: a pure mapping of every transport outcome onto a
//!    closed set of classes. Retry policy at each call site is written as
//!    an exhaustive match over these classes.
//! 2. [`TransactionOperationFailed`]: the only error an engine operation
//!    raises into the user closure. It carries the decision flags the
//!    driver acts on (retry, rollback, how to surface).
//! 3. [`TransactionError`]: what the user finally sees from the driver,
//!    with the full attempt history attached.

use crate::result::TransactionResult;
use atrium_core::KvError;
use std::fmt;
use thiserror::Error;

/// Classification of a transport outcome, driving retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The document does not exist.
    FailDocNotFound,
    /// The document already exists.
    FailDocAlreadyExists,
    /// A subdocument path was absent.
    FailPathNotFound,
    /// A subdocument path already exists.
    FailPathAlreadyExists,
    /// Compare-and-swap failed.
    FailCasMismatch,
    /// A deadline elapsed.
    FailExpiry,
    /// The ATR document cannot take another entry.
    FailAtrFull,
    /// Transient server condition; the request was not applied.
    FailTransient,
    /// The request may or may not have been applied.
    FailAmbiguous,
    /// Another transaction holds a staged write on the document.
    FailWriteWriteConflict,
    /// Unrecoverable local condition; nothing further should be written.
    FailHard,
    /// Everything else.
    FailOther,
}

impl ErrorClass {
    /// The classification table. One entry per transport outcome; pure
    /// and side-effect-free.
    pub fn classify(err: &KvError) -> ErrorClass {
        match err {
            KvError::DocumentNotFound => ErrorClass::FailDocNotFound,
            KvError::DocumentExists => ErrorClass::FailDocAlreadyExists,
            KvError::PathNotFound => ErrorClass::FailPathNotFound,
            KvError::PathExists => ErrorClass::FailPathAlreadyExists,
            KvError::CasMismatch => ErrorClass::FailCasMismatch,
            KvError::Timeout => ErrorClass::FailExpiry,
            KvError::ValueTooLarge => ErrorClass::FailAtrFull,
            KvError::UnambiguousTimeout
            | KvError::TemporaryFailure
            | KvError::DurableWriteInProgress => ErrorClass::FailTransient,
            KvError::DurabilityAmbiguous
            | KvError::AmbiguousTimeout
            | KvError::RequestCanceled => ErrorClass::FailAmbiguous,
            KvError::ConnectionLost => ErrorClass::FailHard,
            KvError::Other(_) => ErrorClass::FailOther,
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorClass::FailDocNotFound => "FAIL_DOC_NOT_FOUND",
            ErrorClass::FailDocAlreadyExists => "FAIL_DOC_ALREADY_EXISTS",
            ErrorClass::FailPathNotFound => "FAIL_PATH_NOT_FOUND",
            ErrorClass::FailPathAlreadyExists => "FAIL_PATH_ALREADY_EXISTS",
            ErrorClass::FailCasMismatch => "FAIL_CAS_MISMATCH",
            ErrorClass::FailExpiry => "FAIL_EXPIRY",
            ErrorClass::FailAtrFull => "FAIL_ATR_FULL",
            ErrorClass::FailTransient => "FAIL_TRANSIENT",
            ErrorClass::FailAmbiguous => "FAIL_AMBIGUOUS",
            ErrorClass::FailWriteWriteConflict => "FAIL_WRITE_WRITE_CONFLICT",
            ErrorClass::FailHard => "FAIL_HARD",
            ErrorClass::FailOther => "FAIL_OTHER",
        };
        f.write_str(name)
    }
}

/// Cause codes attached to surfaced failures, naming what actually went
/// wrong underneath the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCause {
    /// No specific cause recorded.
    #[default]
    Unknown,
    /// The attempt's entry is gone from its ATR.
    ActiveTransactionRecordEntryNotFound,
    /// The ATR document itself is gone.
    ActiveTransactionRecordNotFound,
    /// The ATR document cannot take another entry.
    ActiveTransactionRecordFull,
    /// A live, non-staged document already holds the key.
    DocumentExists,
    /// The document carries markers this client is too old to honor.
    ForwardCompatibilityFailure,
    /// Another process finished this attempt underneath us.
    TransactionAbortedExternally,
}

/// How a failed attempt is surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalErrorKind {
    /// The transaction failed and was (or will be) rolled back.
    #[default]
    Failed,
    /// The configured expiration elapsed.
    Expired,
    /// Commit passed the point of no return without a final ack.
    CommitAmbiguous,
    /// The writes are durable but the attempt's ATR entry could not be
    /// cleaned up; background cleanup will reconcile.
    FailedPostCommit,
}

/// The error every engine operation raises into the user closure.
///
/// Built with the fluent modifiers below, consumed by the driver: `retry`
/// asks for a fresh attempt, `rollback` (on by default) asks for an
/// unstage pass first, and `raise` picks the surfaced error type.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct TransactionOperationFailed {
    /// Classification of the underlying failure.
    pub class: ErrorClass,
    /// Human-readable description.
    pub message: String,
    /// The driver should retry the transaction with a fresh attempt.
    pub retry: bool,
    /// The driver should roll this attempt back before anything else.
    pub rollback: bool,
    /// How to surface the failure if it is final.
    pub raise: FinalErrorKind,
    /// Specific cause, when one is known.
    pub cause: ErrorCause,
}

impl TransactionOperationFailed {
    /// A failure with default routing: no retry, rollback, surfaced as
    /// `Failed`.
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retry: false,
            rollback: true,
            raise: FinalErrorKind::Failed,
            cause: ErrorCause::Unknown,
        }
    }

    /// An application-level failure raised by the user closure itself;
    /// rolls back, never retries.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::FailOther, message)
    }

    /// Ask the driver to retry with a fresh attempt.
    pub fn retry(mut self) -> Self {
        self.retry = true;
        self
    }

    /// Skip rollback: the state is unrecoverable or externally owned.
    pub fn no_rollback(mut self) -> Self {
        self.rollback = false;
        self
    }

    /// Surface as an expiry.
    pub fn expired(mut self) -> Self {
        self.raise = FinalErrorKind::Expired;
        self
    }

    /// Surface as an ambiguous commit.
    pub fn ambiguous(mut self) -> Self {
        self.raise = FinalErrorKind::CommitAmbiguous;
        self
    }

    /// Surface as a post-commit cleanup failure.
    pub fn failed_post_commit(mut self) -> Self {
        self.raise = FinalErrorKind::FailedPostCommit;
        self
    }

    /// Attach a specific cause.
    pub fn cause(mut self, cause: ErrorCause) -> Self {
        self.cause = cause;
        self
    }
}

/// Internal control flow for the ATR write phases: either the step wants
/// another go around its own retry loop, or it failed for good.
#[derive(Debug)]
pub(crate) enum OpFlow {
    /// Re-run the step after a backoff.
    Retry(String),
    /// Give up with the final error.
    Fail(TransactionOperationFailed),
}

/// What the user sees when a transaction does not succeed.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The transaction was rolled back.
    #[error("transaction failed: {message}")]
    Failed {
        /// Description of the terminal failure.
        message: String,
        /// Specific cause, when one is known.
        cause: ErrorCause,
        /// Attempt history at the time of failure.
        result: TransactionResult,
    },
    /// The configured expiration elapsed; rollback was attempted on a
    /// best-effort basis.
    #[error("transaction expired: {message}")]
    Expired {
        /// Description of where the expiry was observed.
        message: String,
        /// Attempt history at the time of failure.
        result: TransactionResult,
    },
    /// Commit passed the point of no return but the final acknowledgement
    /// was lost; cleanup will reconcile the outcome.
    #[error("transaction commit ambiguous: {message}")]
    CommitAmbiguous {
        /// Description of the ambiguous step.
        message: String,
        /// Attempt history at the time of failure.
        result: TransactionResult,
    },
}

impl TransactionError {
    /// The attempt history carried by every variant.
    pub fn result(&self) -> &TransactionResult {
        match self {
            TransactionError::Failed { result, .. }
            | TransactionError::Expired { result, .. }
            | TransactionError::CommitAmbiguous { result, .. } => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table_is_exact() {
        use ErrorClass::*;
        let table = [
            (KvError::DocumentNotFound, FailDocNotFound),
            (KvError::DocumentExists, FailDocAlreadyExists),
            (KvError::PathNotFound, FailPathNotFound),
            (KvError::PathExists, FailPathAlreadyExists),
            (KvError::CasMismatch, FailCasMismatch),
            (KvError::Timeout, FailExpiry),
            (KvError::ValueTooLarge, FailAtrFull),
            (KvError::UnambiguousTimeout, FailTransient),
            (KvError::TemporaryFailure, FailTransient),
            (KvError::DurableWriteInProgress, FailTransient),
            (KvError::DurabilityAmbiguous, FailAmbiguous),
            (KvError::AmbiguousTimeout, FailAmbiguous),
            (KvError::RequestCanceled, FailAmbiguous),
            (KvError::ConnectionLost, FailHard),
            (KvError::Other("x".into()), FailOther),
        ];
        for (err, class) in table {
            assert_eq!(ErrorClass::classify(&err), class, "{err:?}");
        }
    }

    #[test]
    fn modifiers_compose() {
        let err = TransactionOperationFailed::new(ErrorClass::FailExpiry, "late")
            .expired()
            .no_rollback();
        assert_eq!(err.raise, FinalErrorKind::Expired);
        assert!(!err.rollback);
        assert!(!err.retry);

        let err = TransactionOperationFailed::new(ErrorClass::FailTransient, "busy").retry();
        assert!(err.retry);
        assert!(err.rollback);
        assert_eq!(err.raise, FinalErrorKind::Failed);
    }
}
