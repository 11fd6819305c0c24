//! The lost-transaction scanner
//!
//! Clients crash. Their attempts stay behind as ATR entries in PENDING,
//! COMMITTED, or ABORTED state with staged XATTRs scattered over their
//! documents. Every `cleanup_window`, this scanner walks all 1024 ATR
//! documents of every bucket this client has touched and queues any
//! entry that outlived its declared expiry plus the safety margin; the
//! cleanup worker then finishes those attempts on the absent client's
//! behalf.

use super::entry::AtrCleanupEntry;
use super::CleanupInner;
use crate::atr::{ActiveTransactionRecord, AttemptState, EXPIRY_SAFETY_MARGIN_MS};
use crate::atr_ids;
use atrium_core::{DocumentId, KvClient, KvError};
use std::sync::atomic::Ordering;
use std::time::Duration;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

pub(super) fn scanner_loop<C: KvClient>(inner: &CleanupInner<C>) {
    tracing::debug!(target: "atrium_transactions::cleanup::lost", "lost-attempts scanner started");
    loop {
        // sleep one window, waking promptly on shutdown
        let mut slept = Duration::ZERO;
        while slept < inner.config.cleanup_window {
            if inner.shutdown.load(Ordering::Acquire) {
                tracing::debug!(
                    target: "atrium_transactions::cleanup::lost",
                    "lost-attempts scanner stopped"
                );
                return;
            }
            std::thread::sleep(SHUTDOWN_POLL);
            slept += SHUTDOWN_POLL;
        }
        let buckets: Vec<String> = inner.buckets.lock().iter().cloned().collect();
        for bucket in buckets {
            let found = scan_bucket(inner, &bucket);
            if found > 0 {
                tracing::debug!(
                    target: "atrium_transactions::cleanup::lost",
                    bucket = %bucket,
                    found,
                    "queued expired attempts"
                );
            }
        }
    }
}

/// Walk every canonical ATR of one bucket, queueing expired attempts.
/// Returns how many entries were queued.
pub(super) fn scan_bucket<C: KvClient>(inner: &CleanupInner<C>, bucket: &str) -> usize {
    let mut found = 0;
    for vbucket in 0..atr_ids::NUM_VBUCKETS {
        let key = atr_ids::atr_key_for_vbucket(vbucket);
        let atr_id = match &inner.config.metadata_collection {
            Some(home) => DocumentId::new(
                home.bucket.clone(),
                home.scope.clone(),
                home.collection.clone(),
                key,
            ),
            None => DocumentId::new(bucket, "_default", "_default", key),
        };
        let entries = match ActiveTransactionRecord::get_all(&*inner.client, &atr_id) {
            Ok(entries) => entries,
            Err(KvError::DocumentNotFound) => continue,
            Err(err) => {
                tracing::warn!(
                    target: "atrium_transactions::cleanup::lost",
                    atr = %atr_id,
                    error = %err,
                    "failed to read atr during scan"
                );
                continue;
            }
        };
        for entry in entries {
            let lingering = matches!(
                entry.state,
                AttemptState::Pending | AttemptState::Committed | AttemptState::Aborted
            );
            if lingering && entry.has_expired(EXPIRY_SAFETY_MARGIN_MS) {
                tracing::trace!(
                    target: "atrium_transactions::cleanup::lost",
                    atr = %atr_id,
                    attempt_id = %entry.attempt_id,
                    state = %entry.state,
                    age_ms = entry.age_ms(),
                    "found expired attempt"
                );
                inner
                    .queue
                    .push(AtrCleanupEntry::for_lost_attempt(atr_id.clone(), entry));
                found += 1;
            }
        }
    }
    found
}
