//! Wire field names
//!
//! Every staged write hides its transactional metadata in the document's
//! XATTRs under the reserved `txn.` prefix; the names below are the wire
//! contract shared with every other client implementation and with the
//! cleanup path, so they never change.

/// Root of the transactional XATTR block on a staged document.
pub const TRANSACTION_INTERFACE_PREFIX: &str = "txn";

/// Transaction id of the staging transaction.
pub const TRANSACTION_ID: &str = "txn.id.txn";
/// Attempt id of the staging attempt.
pub const ATTEMPT_ID: &str = "txn.id.atmpt";
/// Key of the ATR document the staging attempt registered with.
pub const ATR_ID: &str = "txn.atr.id";
/// Bucket holding that ATR document.
pub const ATR_BUCKET_NAME: &str = "txn.atr.bkt";
/// `scope.collection` holding that ATR document.
pub const ATR_COLL_NAME: &str = "txn.atr.coll";
/// Staged operation kind: `"insert"`, `"replace"`, or `"remove"`.
pub const TYPE: &str = "txn.op.type";
/// Staged content.
pub const STAGED_DATA: &str = "txn.op.stgd";
/// CRC32 of the document value, stamped by the server at stage time.
pub const CRC32_OF_STAGING: &str = "txn.op.crc32";
/// Pre-transaction CAS, kept for restoration.
pub const PRE_TXN_CAS: &str = "txn.restore.CAS";
/// Pre-transaction revid, kept for restoration.
pub const PRE_TXN_REVID: &str = "txn.restore.revid";
/// Pre-transaction expiry, kept for restoration.
pub const PRE_TXN_EXPTIME: &str = "txn.restore.exptime";
/// Restoration block, fetched as a whole.
pub const TRANSACTION_RESTORE_PREFIX: &str = "txn.restore";
/// Forward-compatibility block on a staged document.
pub const FORWARD_COMPAT: &str = "txn.fc";

/// Map of attempt id to entry on an ATR document.
pub const ATR_FIELD_ATTEMPTS: &str = "attempts";
/// Transaction id inside an ATR entry.
pub const ATR_FIELD_TRANSACTION_ID: &str = "tid";
/// Status name inside an ATR entry.
pub const ATR_FIELD_STATUS: &str = "st";
/// Start timestamp (CAS macro) inside an ATR entry.
pub const ATR_FIELD_START_TIMESTAMP: &str = "tst";
/// Start-of-commit timestamp (CAS macro) inside an ATR entry.
pub const ATR_FIELD_START_COMMIT: &str = "tsc";
/// Rollback-start timestamp (CAS macro) inside an ATR entry.
pub const ATR_FIELD_TIMESTAMP_ROLLBACK_START: &str = "tsrs";
/// Declared expiry in milliseconds inside an ATR entry.
pub const ATR_FIELD_EXPIRES_AFTER_MSECS: &str = "exp";
/// Doc records staged for insert.
pub const ATR_FIELD_DOCS_INSERTED: &str = "ins";
/// Doc records staged for replace.
pub const ATR_FIELD_DOCS_REPLACED: &str = "rep";
/// Doc records staged for remove.
pub const ATR_FIELD_DOCS_REMOVED: &str = "rem";
/// Forward-compatibility block inside an ATR entry.
pub const ATR_FIELD_FORWARD_COMPAT: &str = "fc";
