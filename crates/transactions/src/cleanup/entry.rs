//! One unit of cleanup work

use super::{cleanup_docs, cleanup_entry_record};
use crate::atr::{ActiveTransactionRecord, AtrEntry, EXPIRY_SAFETY_MARGIN_MS};
use crate::config::TransactionConfig;
use crate::error::TransactionOperationFailed;
use crate::forward_compat::{self, ForwardCompatStage};
use atrium_core::{DocumentId, KvClient, KvError};
use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// How long after its not-before time an entry must additionally wait
/// before the worker may pop it.
pub(crate) const POP_SAFETY: Duration = Duration::from_millis(EXPIRY_SAFETY_MARGIN_MS);

/// A queued request to inspect one attempt's ATR entry and finish
/// whatever it left behind. Self-contained: it holds no reference into
/// any live attempt.
#[derive(Debug, Clone)]
pub struct AtrCleanupEntry {
    /// The ATR document holding the attempt's entry.
    pub atr_id: DocumentId,
    /// The attempt to clean.
    pub attempt_id: String,
    /// Earliest moment the worker may act (plus [`POP_SAFETY`]).
    pub min_start_time: Instant,
    /// Verify the entry is actually expired before acting. Set by the
    /// lost scanner, clear for this client's own attempts.
    pub check_if_expired: bool,
    /// Entry contents cached by the producer, saving the worker a read.
    pub cached_entry: Option<AtrEntry>,
}

impl AtrCleanupEntry {
    /// An entry for one of this client's own just-finished attempts.
    pub fn for_client_attempt(atr_id: DocumentId, attempt_id: String) -> Self {
        Self {
            atr_id,
            attempt_id,
            min_start_time: Instant::now(),
            check_if_expired: false,
            cached_entry: None,
        }
    }

    /// An entry discovered by the lost-attempts scanner; it is already
    /// past its expiry, so it becomes actionable immediately.
    pub fn for_lost_attempt(atr_id: DocumentId, entry: AtrEntry) -> Self {
        Self {
            atr_id,
            attempt_id: entry.attempt_id.clone(),
            min_start_time: Instant::now().checked_sub(POP_SAFETY).unwrap_or_else(Instant::now),
            check_if_expired: true,
            cached_entry: Some(entry),
        }
    }

    /// Whether the worker may act on this entry yet.
    pub fn ready(&self) -> bool {
        Instant::now() > self.min_start_time + POP_SAFETY
    }
}

// The queue pops the oldest not-before time first.
impl Ord for AtrCleanupEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.min_start_time.cmp(&self.min_start_time)
    }
}

impl PartialOrd for AtrCleanupEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for AtrCleanupEntry {
    fn eq(&self, other: &Self) -> bool {
        self.min_start_time == other.min_start_time
    }
}

impl Eq for AtrCleanupEntry {}

/// Inspect the entry's ATR state and finish the attempt: complete it if
/// committed, roll it back if aborted, then retire the ATR entry.
pub(crate) fn clean_entry<C: KvClient>(
    client: &C,
    config: &TransactionConfig,
    entry: &AtrCleanupEntry,
) -> Result<(), TransactionOperationFailed> {
    tracing::trace!(
        target: "atrium_transactions::cleanup",
        atr = %entry.atr_id,
        attempt_id = %entry.attempt_id,
        check_if_expired = entry.check_if_expired,
        "cleaning attempt"
    );
    let atr_entry = match &entry.cached_entry {
        Some(cached) => cached.clone(),
        None => {
            match ActiveTransactionRecord::get_entry(client, &entry.atr_id, &entry.attempt_id) {
                Ok(Some(found)) => found,
                Ok(None) => {
                    tracing::trace!(
                        target: "atrium_transactions::cleanup",
                        attempt_id = %entry.attempt_id,
                        "attempt entry gone, nothing to clean"
                    );
                    return Ok(());
                }
                Err(KvError::DocumentNotFound) => {
                    tracing::trace!(
                        target: "atrium_transactions::cleanup",
                        atr = %entry.atr_id,
                        "atr gone, nothing to clean"
                    );
                    return Ok(());
                }
                Err(err) => {
                    return Err(TransactionOperationFailed::new(
                        crate::error::ErrorClass::classify(&err),
                        err.to_string(),
                    ))
                }
            }
        }
    };

    if entry.check_if_expired && !atr_entry.has_expired(EXPIRY_SAFETY_MARGIN_MS) {
        tracing::trace!(
            target: "atrium_transactions::cleanup",
            attempt_id = %entry.attempt_id,
            age_ms = atr_entry.age_ms(),
            "attempt not expired, nothing to clean"
        );
        return Ok(());
    }

    forward_compat::check(
        ForwardCompatStage::CleanupEntry,
        atr_entry.forward_compat.as_ref(),
    )?;

    let inserted: Vec<DocumentId> =
        atr_entry.inserted.iter().map(|r| r.document_id()).collect();
    let replaced: Vec<DocumentId> =
        atr_entry.replaced.iter().map(|r| r.document_id()).collect();
    let removed: Vec<DocumentId> = atr_entry.removed.iter().map(|r| r.document_id()).collect();

    cleanup_docs(
        client,
        config,
        atr_entry.state,
        &entry.attempt_id,
        &inserted,
        &replaced,
        &removed,
    )?;
    config.cleanup_hooks.on_cleanup_docs_completed();

    cleanup_entry_record(client, config, &entry.atr_id, &entry.attempt_id)?;
    config.cleanup_hooks.on_cleanup_completed();
    Ok(())
}
