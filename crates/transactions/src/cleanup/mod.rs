//! Background cleanup of finished and abandoned attempts
//!
//! Two producers feed one priority queue:
//! - the driver queues every attempt of its own that may have left
//!   artifacts (its ATR entry, staged XATTRs it failed to strip)
//! - the lost-attempt scanner periodically walks all 1024 ATR documents
//!   per known bucket and queues any attempt that outlived its declared
//!   expiry plus the safety margin
//!
//! A single worker thread drains the queue, completing or rolling back
//! each attempt on behalf of its (possibly long-gone) client. Unstaging
//! on behalf of a committed attempt is guarded by the CRC32 stamped at
//! stage time: if the live document's CRC differs, someone has since
//! overwritten it and cleanup must not touch it.

mod entry;
mod lost;
mod queue;

pub use entry::AtrCleanupEntry;
pub use queue::CleanupQueue;

use crate::atr::AttemptState;
use crate::config::TransactionConfig;
use crate::error::{ErrorClass, TransactionOperationFailed};
use crate::fields;
use crate::links::{fetch_transactional, TransactionGetResult};
use atrium_core::subdoc::MutateInSpec;
use atrium_core::{DocumentId, KvClient, KvError, MutateInRequest};
use entry::clean_entry;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const WORKER_IDLE_POLL: Duration = Duration::from_millis(100);

struct CleanupInner<C: KvClient> {
    client: Arc<C>,
    config: TransactionConfig,
    queue: CleanupQueue,
    buckets: Mutex<BTreeSet<String>>,
    shutdown: AtomicBool,
}

/// The per-client cleanup service: owns the queue, the worker thread,
/// and the lost-attempt scanner.
pub struct TransactionsCleanup<C: KvClient> {
    inner: Arc<CleanupInner<C>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: KvClient> TransactionsCleanup<C> {
    /// Start the service. The worker thread runs when either cleanup
    /// flavor is enabled; the scanner only for lost attempts.
    pub fn new(client: Arc<C>, config: TransactionConfig) -> Self {
        let inner = Arc::new(CleanupInner {
            client,
            config: config.clone(),
            queue: CleanupQueue::new(),
            buckets: Mutex::new(BTreeSet::new()),
            shutdown: AtomicBool::new(false),
        });
        let mut threads = Vec::new();
        if config.cleanup_client_attempts || config.cleanup_lost_attempts {
            let worker = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("atrium-cleanup".to_string())
                    .spawn(move || worker_loop(&worker))
                    .expect("failed to spawn cleanup worker thread"),
            );
        }
        if config.cleanup_lost_attempts {
            let scanner = Arc::clone(&inner);
            threads.push(
                std::thread::Builder::new()
                    .name("atrium-cleanup-lost".to_string())
                    .spawn(move || lost::scanner_loop(&scanner))
                    .expect("failed to spawn lost-attempts scanner thread"),
            );
        }
        Self {
            inner,
            threads: Mutex::new(threads),
        }
    }

    /// Queue a just-finished attempt of this client for cleanup.
    pub fn add_attempt(&self, atr_id: DocumentId, attempt_id: String) {
        if !self.inner.config.cleanup_client_attempts {
            return;
        }
        self.track_bucket(atr_id.bucket.clone());
        self.inner
            .queue
            .push(AtrCleanupEntry::for_client_attempt(atr_id, attempt_id));
    }

    /// Register a bucket for the lost-attempt scan.
    pub fn track_bucket(&self, bucket: String) {
        self.inner.buckets.lock().insert(bucket);
    }

    /// Buckets currently known to the scanner.
    pub fn tracked_buckets(&self) -> Vec<String> {
        self.inner.buckets.lock().iter().cloned().collect()
    }

    /// Queue an arbitrary entry.
    pub fn push(&self, entry: AtrCleanupEntry) {
        self.inner.queue.push(entry);
    }

    /// Entries waiting in the queue.
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// Run one entry to completion on the calling thread, ignoring its
    /// not-before time. Exposed for deterministic tests and operational
    /// tooling.
    pub fn clean_now(&self, entry: &AtrCleanupEntry) -> Result<(), TransactionOperationFailed> {
        clean_entry(&*self.inner.client, &self.inner.config, entry)
    }

    /// Scan one bucket's ATR documents for expired foreign attempts and
    /// queue them. Returns the number of entries queued.
    pub fn scan_bucket_now(&self, bucket: &str) -> usize {
        lost::scan_bucket(&self.inner, bucket)
    }

    /// Stop the background threads and wait for them.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl<C: KvClient> Drop for TransactionsCleanup<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<C: KvClient>(inner: &CleanupInner<C>) {
    tracing::debug!("cleanup worker started");
    while !inner.shutdown.load(Ordering::Acquire) {
        match inner.queue.pop_ready() {
            Some(entry) => {
                if let Err(err) = clean_entry(&*inner.client, &inner.config, &entry) {
                    tracing::warn!(
                        target: "atrium_transactions::cleanup",
                        atr = %entry.atr_id,
                        attempt_id = %entry.attempt_id,
                        error = %err,
                        "cleanup attempt failed, the lost-attempts scan will retry"
                    );
                }
            }
            None => std::thread::sleep(WORKER_IDLE_POLL),
        }
    }
    tracing::debug!("cleanup worker stopped");
}

/// Remove the attempt's entry from its ATR. Always per-attempt: wiping
/// the whole `attempts` map would destroy concurrent attempts that share
/// the ATR.
fn cleanup_entry_record<C: KvClient>(
    client: &C,
    config: &TransactionConfig,
    atr_id: &DocumentId,
    attempt_id: &str,
) -> Result<(), TransactionOperationFailed> {
    if let Some(ec) = config.cleanup_hooks.before_atr_remove() {
        return Err(TransactionOperationFailed::new(
            ec,
            "before_atr_remove hook raised error",
        ));
    }
    let path = format!("{}.{}", fields::ATR_FIELD_ATTEMPTS, attempt_id);
    let specs = vec![MutateInSpec::remove(path).xattr()];
    let req = MutateInRequest::new(atr_id.clone(), specs, config.durability_level);
    match client.mutate_in(req) {
        Ok(_) => {
            tracing::trace!(
                target: "atrium_transactions::cleanup",
                atr = %atr_id,
                attempt_id,
                "removed attempt entry"
            );
            Ok(())
        }
        Err(KvError::PathNotFound) | Err(KvError::DocumentNotFound) => Ok(()),
        Err(err) => Err(TransactionOperationFailed::new(
            ErrorClass::classify(&err),
            err.to_string(),
        )),
    }
}

/// Branch on the observed ATR state: a committed attempt is completed on
/// its behalf, an aborted one rolled back, anything else left alone.
fn cleanup_docs<C: KvClient>(
    client: &C,
    config: &TransactionConfig,
    entry_state: AttemptState,
    attempt_id: &str,
    inserted: &[DocumentId],
    replaced: &[DocumentId],
    removed: &[DocumentId],
) -> Result<(), TransactionOperationFailed> {
    match entry_state {
        AttemptState::Committed => {
            commit_docs(client, config, attempt_id, inserted)?;
            commit_docs(client, config, attempt_id, replaced)?;
            remove_docs_staged_for_removal(client, config, attempt_id, removed)?;
        }
        AttemptState::Aborted => {
            remove_docs(client, config, attempt_id, inserted)?;
            remove_txn_links(client, config, attempt_id, replaced)?;
            remove_txn_links(client, config, attempt_id, removed)?;
        }
        state => {
            tracing::trace!(
                target: "atrium_transactions::cleanup",
                %state,
                "nothing to do for docs in this state"
            );
        }
    }
    Ok(())
}

/// Fetch each doc and hand it to `apply` unless it must be skipped: no
/// staged write, staged by a different attempt, or (for committed
/// unstaging) a CRC32 that no longer matches the stamp.
fn for_each_staged_doc<C: KvClient>(
    client: &C,
    attempt_id: &str,
    docs: &[DocumentId],
    require_crc_to_match: bool,
    mut apply: impl FnMut(&TransactionGetResult, bool) -> Result<(), TransactionOperationFailed>,
) -> Result<(), TransactionOperationFailed> {
    for id in docs {
        let doc = match fetch_transactional(client, id) {
            Ok(doc) => doc,
            Err(KvError::DocumentNotFound) => {
                tracing::debug!(
                    target: "atrium_transactions::cleanup",
                    doc = %id,
                    "document gone, nothing to clean"
                );
                continue;
            }
            Err(err) => {
                return Err(TransactionOperationFailed::new(
                    ErrorClass::classify(&err),
                    err.to_string(),
                ))
            }
        };
        if !doc.links.has_staged_write()
            || !(doc.links.has_staged_content() || doc.links.is_document_being_removed())
        {
            tracing::trace!(
                target: "atrium_transactions::cleanup",
                doc = %id,
                "no staged content, assuming already unstaged"
            );
            continue;
        }
        if doc.links.staged_attempt_id.as_deref() != Some(attempt_id) {
            tracing::trace!(
                target: "atrium_transactions::cleanup",
                doc = %id,
                "staged by a different attempt, skipping"
            );
            continue;
        }
        if require_crc_to_match {
            let live = doc.metadata.as_ref().and_then(|m| m.value_crc32c);
            let staged = doc.links.crc32_of_staging;
            if live.is_none() || staged.is_none() || live != staged {
                tracing::trace!(
                    target: "atrium_transactions::cleanup",
                    doc = %id,
                    ?live,
                    ?staged,
                    "crc mismatch, document overwritten since staging, skipping"
                );
                continue;
            }
        }
        apply(&doc, doc.links.is_deleted)?;
    }
    Ok(())
}

fn hook_err(ec: ErrorClass, what: &str) -> TransactionOperationFailed {
    TransactionOperationFailed::new(ec, format!("{what} hook raised error"))
}

fn kv_err(err: KvError) -> TransactionOperationFailed {
    TransactionOperationFailed::new(ErrorClass::classify(&err), err.to_string())
}

/// Unstage committed inserts and replaces: apply the staged content.
fn commit_docs<C: KvClient>(
    client: &C,
    config: &TransactionConfig,
    attempt_id: &str,
    docs: &[DocumentId],
) -> Result<(), TransactionOperationFailed> {
    for_each_staged_doc(client, attempt_id, docs, true, |doc, is_deleted| {
        let Some(content) = doc.links.staged_content.clone() else {
            return Ok(());
        };
        if let Some(ec) = config.cleanup_hooks.before_commit_doc(&doc.id.key) {
            return Err(hook_err(ec, "before_commit_doc"));
        }
        if is_deleted {
            client
                .insert(&doc.id, content, config.durability_level)
                .map(|_| ())
                .map_err(kv_err)?;
        } else {
            let specs = vec![
                MutateInSpec::remove(fields::TRANSACTION_INTERFACE_PREFIX).xattr(),
                MutateInSpec::set_doc(content),
            ];
            let mut req = MutateInRequest::new(doc.id.clone(), specs, config.durability_level);
            req.cas = doc.cas;
            client.mutate_in(req).map(|_| ()).map_err(kv_err)?;
        }
        tracing::trace!(
            target: "atrium_transactions::cleanup",
            doc = %doc.id,
            "committed staged content"
        );
        Ok(())
    })
}

/// Apply committed staged removes: delete the documents.
fn remove_docs_staged_for_removal<C: KvClient>(
    client: &C,
    config: &TransactionConfig,
    attempt_id: &str,
    docs: &[DocumentId],
) -> Result<(), TransactionOperationFailed> {
    for_each_staged_doc(client, attempt_id, docs, true, |doc, _| {
        if !doc.links.is_document_being_removed() {
            tracing::trace!(
                target: "atrium_transactions::cleanup",
                doc = %doc.id,
                "not marked for removal, skipping"
            );
            return Ok(());
        }
        if let Some(ec) = config
            .cleanup_hooks
            .before_remove_doc_staged_for_removal(&doc.id.key)
        {
            return Err(hook_err(ec, "before_remove_doc_staged_for_removal"));
        }
        client
            .remove(&doc.id, doc.cas, config.durability_level)
            .map(|_| ())
            .map_err(kv_err)?;
        tracing::trace!(
            target: "atrium_transactions::cleanup",
            doc = %doc.id,
            "removed doc staged for removal"
        );
        Ok(())
    })
}

/// Roll back aborted staged inserts: the staged tombstones lose their
/// XATTRs (or the resurrected doc is removed).
fn remove_docs<C: KvClient>(
    client: &C,
    config: &TransactionConfig,
    attempt_id: &str,
    docs: &[DocumentId],
) -> Result<(), TransactionOperationFailed> {
    for_each_staged_doc(client, attempt_id, docs, true, |doc, is_deleted| {
        if let Some(ec) = config.cleanup_hooks.before_remove_doc(&doc.id.key) {
            return Err(hook_err(ec, "before_remove_doc"));
        }
        if is_deleted {
            let specs = vec![MutateInSpec::remove(fields::TRANSACTION_INTERFACE_PREFIX).xattr()];
            let mut req = MutateInRequest::new(doc.id.clone(), specs, config.durability_level);
            req.cas = doc.cas;
            req.access_deleted = true;
            client.mutate_in(req).map(|_| ()).map_err(kv_err)?;
        } else {
            client
                .remove(&doc.id, doc.cas, config.durability_level)
                .map(|_| ())
                .map_err(kv_err)?;
        }
        tracing::trace!(
            target: "atrium_transactions::cleanup",
            doc = %doc.id,
            "removed aborted staged insert"
        );
        Ok(())
    })
}

/// Roll back aborted staged replaces and removes: strip the XATTRs, leave
/// the body untouched.
fn remove_txn_links<C: KvClient>(
    client: &C,
    config: &TransactionConfig,
    attempt_id: &str,
    docs: &[DocumentId],
) -> Result<(), TransactionOperationFailed> {
    for_each_staged_doc(client, attempt_id, docs, false, |doc, _| {
        if let Some(ec) = config.cleanup_hooks.before_remove_links(&doc.id.key) {
            return Err(hook_err(ec, "before_remove_links"));
        }
        let specs = vec![MutateInSpec::remove(fields::TRANSACTION_INTERFACE_PREFIX).xattr()];
        let mut req = MutateInRequest::new(doc.id.clone(), specs, config.durability_level);
        req.cas = doc.cas;
        req.access_deleted = true;
        client.mutate_in(req).map(|_| ()).map_err(kv_err)?;
        tracing::trace!(
            target: "atrium_transactions::cleanup",
            doc = %doc.id,
            "removed transactional links"
        );
        Ok(())
    })
}
