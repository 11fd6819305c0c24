//! The attempt engine
//!
//! One [`AttemptContext`] executes a single attempt of the user closure:
//! it stages mutations into document XATTRs, walks the attempt's ATR
//! entry through `PENDING → COMMITTED → COMPLETED` (or
//! `ABORTED → ROLLED_BACK`), answers reads with the attempt's own staged
//! writes, resolves staged writes left by other transactions, and
//! classifies every transport outcome into a retry/rollback/expire
//! decision for the driver.
//!
//! Every operation either succeeds or raises one
//! [`TransactionOperationFailed`]; nothing else escapes into the closure.

use crate::atr::{ActiveTransactionRecord, AttemptState, EXPIRY_SAFETY_MARGIN_MS};
use crate::config::TransactionConfig;
use crate::context::TransactionShared;
use crate::error::{ErrorCause, ErrorClass, OpFlow, TransactionOperationFailed};
use crate::fields;
use crate::forward_compat::{self, ForwardCompatStage};
use crate::hooks::stages::*;
use crate::hooks::AttemptContextHooks;
use crate::links::{fetch_transactional, TransactionGetResult, TransactionLinks};
use crate::staged::{StagedMutation, StagedMutationKind, StagedMutationSet};
use atrium_core::subdoc::{MutateInSpec, StoreSemantics};
use atrium_core::{
    DocumentId, ExpDelay, KvClient, KvError, LookupInRequest, LookupInSpec, MutateInRequest,
    MACRO_CAS, MACRO_VALUE_CRC32C,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Result of one engine operation.
pub type OpResult<T> = std::result::Result<T, TransactionOperationFailed>;

fn jsonify<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).expect("scalar JSON encoding cannot fail")
}

fn op(class: ErrorClass, message: impl Into<String>) -> TransactionOperationFailed {
    TransactionOperationFailed::new(class, message)
}

fn atr_entry_path(attempt_id: &str) -> String {
    format!("{}.{}", fields::ATR_FIELD_ATTEMPTS, attempt_id)
}

/// A single attempt of a transaction.
///
/// Created fresh by the driver for every retry; operations take `&self`
/// so a closure may issue them for distinct keys from multiple threads.
/// Operations on the same key must be serialized by the caller.
pub struct AttemptContext<C: KvClient> {
    client: Arc<C>,
    config: TransactionConfig,
    overall: Arc<TransactionShared>,
    attempt_id: String,
    staged: Mutex<StagedMutationSet>,
    /// Also the first-mutation serialization point: ATR election and the
    /// PENDING write happen under this lock.
    atr_id: Mutex<Option<DocumentId>>,
    state: Mutex<AttemptState>,
    expiry_overtime_mode: AtomicBool,
    is_done: AtomicBool,
    unstaging_complete: AtomicBool,
    hooks: Arc<AttemptContextHooks>,
}

impl<C: KvClient> AttemptContext<C> {
    pub(crate) fn new(
        client: Arc<C>,
        config: TransactionConfig,
        overall: Arc<TransactionShared>,
    ) -> Self {
        let attempt_id = overall.add_attempt();
        let hooks = config.attempt_context_hooks.clone();
        Self {
            client,
            config,
            overall,
            attempt_id,
            staged: Mutex::new(StagedMutationSet::new()),
            atr_id: Mutex::new(None),
            state: Mutex::new(AttemptState::NotStarted),
            expiry_overtime_mode: AtomicBool::new(false),
            is_done: AtomicBool::new(false),
            unstaging_complete: AtomicBool::new(true),
            hooks,
        }
    }

    /// This attempt's id.
    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    /// The surrounding transaction's id.
    pub fn transaction_id(&self) -> &str {
        self.overall.transaction_id()
    }

    /// Current state of the attempt.
    pub fn state(&self) -> AttemptState {
        *self.state.lock()
    }

    /// The attempt has reached a terminal point; no further operations
    /// are accepted.
    pub fn is_done(&self) -> bool {
        self.is_done.load(Ordering::Acquire)
    }

    /// The ATR this attempt registered with, if it has mutated.
    pub fn atr_id(&self) -> Option<DocumentId> {
        self.atr_id.lock().clone()
    }

    pub(crate) fn unstaging_complete(&self) -> bool {
        self.unstaging_complete.load(Ordering::Acquire)
            && matches!(
                self.state(),
                AttemptState::Completed | AttemptState::NotStarted
            )
    }

    // ------------------------------------------------------------------
    // state and expiry plumbing
    // ------------------------------------------------------------------

    fn set_state(&self, next: AttemptState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        debug_assert!(
            state.can_transition_to(next),
            "illegal attempt state transition {} -> {}",
            *state,
            next
        );
        *state = next;
        self.overall.with_current_attempt(|a| {
            a.state = next;
            match next {
                AttemptState::Committed => a.commit_started_at = Some(SystemTime::now()),
                AttemptState::Aborted => a.rollback_started_at = Some(SystemTime::now()),
                AttemptState::Completed | AttemptState::RolledBack => {
                    a.completed_at = Some(SystemTime::now())
                }
                _ => {}
            }
        });
    }

    fn mark_done(&self) {
        self.is_done.store(true, Ordering::Release);
        self.overall.with_current_attempt(|a| {
            if a.completed_at.is_none() {
                a.completed_at = Some(SystemTime::now());
            }
        });
    }

    fn in_overtime(&self) -> bool {
        self.expiry_overtime_mode.load(Ordering::Acquire)
    }

    fn set_overtime(&self) {
        self.expiry_overtime_mode.store(true, Ordering::Release);
    }

    fn has_expired_client_side(&self, stage: &str, doc_key: Option<&str>) -> bool {
        let real = self.overall.has_expired_client_side();
        let hook = self.hooks.has_expired_client_side(stage, doc_key);
        if hook {
            tracing::debug!(attempt_id = %self.attempt_id, stage, "synthetic expiry");
        }
        real || hook
    }

    /// Pre-commit expiry gate: observing an expiry here arms overtime
    /// mode so the ensuing rollback ignores further expiries.
    fn check_expiry_pre_commit(&self, stage: &str, doc_key: Option<&str>) -> bool {
        if self.has_expired_client_side(stage, doc_key) {
            tracing::debug!(
                attempt_id = %self.attempt_id,
                stage,
                "expired pre-commit, entering overtime mode"
            );
            self.set_overtime();
            return true;
        }
        false
    }

    /// Expiry gate for the commit/rollback phases: silent once overtime
    /// mode is armed.
    fn error_if_expired_and_not_in_overtime(
        &self,
        stage: &str,
        doc_key: Option<&str>,
    ) -> Option<ErrorClass> {
        if self.in_overtime() {
            tracing::trace!(stage, "skipping expiry check in overtime mode");
            return None;
        }
        if self.has_expired_client_side(stage, doc_key) {
            return Some(ErrorClass::FailExpiry);
        }
        None
    }

    fn check_expiry_during_commit_or_rollback(&self, stage: &str) {
        if self.in_overtime() {
            tracing::trace!(stage, "ignoring expiry, already in overtime mode");
            return;
        }
        if self.has_expired_client_side(stage, None) {
            tracing::debug!(
                attempt_id = %self.attempt_id,
                stage,
                "expired during finish, entering overtime mode for one best-effort pass"
            );
            self.set_overtime();
        }
    }

    fn check_if_done(&self) -> OpResult<()> {
        if self.is_done() {
            return Err(op(
                ErrorClass::FailOther,
                "cannot perform operations after the attempt has been committed or rolled back",
            )
            .no_rollback());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------

    /// Read a document. Not finding it is a failure; use
    /// [`Self::get_optional`] when absence is an expected outcome.
    pub fn get(&self, id: &DocumentId) -> OpResult<TransactionGetResult> {
        match self.get_optional(id)? {
            Some(doc) => Ok(doc),
            None => Err(op(ErrorClass::FailDocNotFound, "document not found")),
        }
    }

    /// Read a document that may legitimately be absent.
    pub fn get_optional(&self, id: &DocumentId) -> OpResult<Option<TransactionGetResult>> {
        self.check_if_done()?;
        let res = self.do_get(id)?;
        if let Some(doc) = &res {
            forward_compat::check(ForwardCompatStage::Gets, doc.links.forward_compat.as_ref())?;
        }
        Ok(res)
    }

    fn do_get(&self, id: &DocumentId) -> OpResult<Option<TransactionGetResult>> {
        if self.check_expiry_pre_commit(STAGE_GET, Some(&id.key)) {
            return Err(op(ErrorClass::FailExpiry, "transaction expired during get").expired());
        }

        // read-your-own-writes, no network call
        {
            let staged = self.staged.lock();
            if let Some(own) = staged.find_replace(id).or_else(|| staged.find_insert(id)) {
                tracing::debug!(doc = %id, "returning own staged write");
                let doc = own.doc.clone().with_content(Some(own.content.clone()));
                return Ok(Some(doc));
            }
            if staged.find_remove(id).is_some() {
                tracing::debug!(doc = %id, "document removed by this attempt");
                return Ok(None);
            }
        }

        if let Some(ec) = self.hooks.before_doc_get(&id.key) {
            return Err(self.get_error(ec, "before_doc_get hook raised error"));
        }

        let doc = match self.get_doc(id) {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(None),
            Err(err) => {
                let class = ErrorClass::classify(&err);
                return Err(self.get_error(class, err.to_string()));
            }
        };

        if !doc.links.is_document_in_transaction() {
            if doc.links.is_deleted {
                tracing::debug!(doc = %id, "tombstone outside any transaction, not returning");
                return Ok(None);
            }
            return Ok(Some(doc));
        }

        self.resolve_staged_read(id, doc)
    }

    /// A read found foreign (or own) staging metadata: consult the
    /// staging attempt's ATR entry to decide what this reader may see.
    fn resolve_staged_read(
        &self,
        id: &DocumentId,
        doc: TransactionGetResult,
    ) -> OpResult<Option<TransactionGetResult>> {
        tracing::debug!(doc = %id, "document is in a transaction, checking its atr");
        let has_visible_body = doc.content.as_deref().map(|c| !c.is_empty()).unwrap_or(false);
        let (Some(atr_id), Some(staged_attempt)) = (
            doc.links.atr_document_id(),
            doc.links.staged_attempt_id.clone(),
        ) else {
            // Not enough metadata to resolve; treat like a plain read.
            return Ok(if has_visible_body { Some(doc) } else { None });
        };

        let entry = ActiveTransactionRecord::get_entry(&*self.client, &atr_id, &staged_attempt);
        match entry {
            Ok(Some(entry)) => {
                if staged_attempt == self.attempt_id {
                    // Own write observed remotely; the in-memory set is
                    // the primary path, this is the fallback.
                    let staged = doc.links.staged_content.clone();
                    return Ok(Some(doc.with_content(staged)));
                }
                forward_compat::check(
                    ForwardCompatStage::GetsReadingAtr,
                    entry.forward_compat.as_ref(),
                )?;
                match entry.state {
                    AttemptState::Committed => {
                        if doc.links.is_document_being_removed() {
                            Ok(None)
                        } else {
                            let staged = doc.links.staged_content.clone();
                            Ok(Some(doc.with_content(staged)))
                        }
                    }
                    _ => {
                        if has_visible_body {
                            Ok(Some(doc))
                        } else {
                            // still being inserted, not yet visible
                            Ok(None)
                        }
                    }
                }
            }
            Ok(None) => {
                // The entry is gone: committed or rolled back long ago.
                Ok(if has_visible_body { Some(doc) } else { None })
            }
            Err(err) => {
                tracing::debug!(doc = %id, error = %err, "could not read atr for staged doc");
                Ok(if has_visible_body { Some(doc) } else { None })
            }
        }
    }

    fn get_error(&self, class: ErrorClass, message: impl Into<String>) -> TransactionOperationFailed {
        let err = op(class, message);
        match class {
            ErrorClass::FailExpiry => {
                self.set_overtime();
                err.expired()
            }
            ErrorClass::FailTransient => err.retry(),
            ErrorClass::FailHard => err.no_rollback(),
            ErrorClass::FailDocNotFound => err,
            _ => TransactionOperationFailed::new(ErrorClass::FailOther, err.message),
        }
    }

    /// The raw transactional lookup. `Ok(None)` when the document (or its
    /// tombstone) does not exist at all.
    fn get_doc(&self, id: &DocumentId) -> Result<Option<TransactionGetResult>, KvError> {
        match fetch_transactional(&*self.client, id) {
            Ok(doc) => Ok(Some(doc)),
            Err(KvError::DocumentNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // staged writes
    // ------------------------------------------------------------------

    /// Stage an insert of a new document.
    pub fn insert(&self, id: &DocumentId, content: &[u8]) -> OpResult<TransactionGetResult> {
        self.check_if_done()?;
        {
            let staged = self.staged.lock();
            if staged.find_insert(id).is_some()
                || staged.find_replace(id).is_some()
                || staged.find_remove(id).is_some()
            {
                return Err(op(
                    ErrorClass::FailOther,
                    "cannot insert a document already mutated in this attempt",
                ));
            }
        }
        if self.check_expiry_pre_commit(STAGE_INSERT, Some(&id.key)) {
            return Err(op(ErrorClass::FailExpiry, "transaction expired").expired());
        }
        self.select_atr_if_needed(id)?;
        let mut delay = ExpDelay::until(
            Duration::from_millis(5),
            Duration::from_millis(300),
            self.config.expiration_time,
        );
        self.create_staged_insert(id, content, 0, &mut delay)
    }

    /// Stage a replacement of a previously read document.
    pub fn replace(
        &self,
        document: &TransactionGetResult,
        content: &[u8],
    ) -> OpResult<TransactionGetResult> {
        self.check_if_done()?;
        tracing::trace!(doc = %document.id, "replacing");
        if self.check_expiry_pre_commit(STAGE_REPLACE, Some(&document.id.key)) {
            return Err(op(ErrorClass::FailExpiry, "transaction expired").expired());
        }
        self.check_and_handle_blocking(document, ForwardCompatStage::WriteWriteConflictReplacing)?;
        self.select_atr_if_needed(&document.id)?;

        if let Some(ec) = self.hooks.before_staged_replace(&document.id.key) {
            return Err(self.staged_write_error(ec, "before_staged_replace hook raised error"));
        }
        let mut req = self.create_staging_request(document, "replace", Some(content))?;
        req.cas = document.cas;
        req.access_deleted = true;
        tracing::trace!(
            doc = %document.id,
            cas = document.cas,
            transaction_id = %self.transaction_id(),
            "staging replace"
        );
        let resp = match self.client.mutate_in(req) {
            Ok(resp) => resp,
            Err(err) => {
                return Err(self.staged_write_error(ErrorClass::classify(&err), err.to_string()))
            }
        };
        if let Some(ec) = self.hooks.after_staged_replace_complete(&document.id.key) {
            return Err(self.staged_write_error(ec, "after_staged_replace hook raised error"));
        }

        let mut out = document.clone();
        out.cas = resp.cas;
        {
            let mut staged = self.staged.lock();
            if staged.update_staged_content(&document.id, content, out.cas) {
                tracing::trace!(doc = %document.id, "re-staged over this attempt's earlier write");
            } else {
                staged.add(StagedMutation {
                    doc: out.clone(),
                    content: content.to_vec(),
                    kind: StagedMutationKind::Replace,
                });
                self.overall.with_current_attempt(|a| {
                    if !a.replaced_ids.contains(&document.id) {
                        a.replaced_ids.push(document.id.clone());
                    }
                });
            }
        }
        Ok(out)
    }

    /// Stage a removal of a previously read document.
    pub fn remove(&self, document: &TransactionGetResult) -> OpResult<()> {
        self.check_if_done()?;
        if self.check_expiry_pre_commit(STAGE_REMOVE, Some(&document.id.key)) {
            return Err(op(ErrorClass::FailExpiry, "transaction expired").expired());
        }

        // A remove cancels this attempt's own staged insert: the document
        // never existed outside the attempt, so nothing reaches the store.
        {
            let mut staged = self.staged.lock();
            if staged.find_insert(&document.id).is_some() {
                tracing::debug!(doc = %document.id, "remove cancels staged insert");
                staged.discard_insert(&document.id);
                self.overall.with_current_attempt(|a| {
                    a.inserted_ids.retain(|i| i != &document.id);
                });
                return Ok(());
            }
        }

        tracing::trace!(doc = %document.id, "removing");
        self.check_and_handle_blocking(document, ForwardCompatStage::WriteWriteConflictRemoving)?;
        self.select_atr_if_needed(&document.id)?;

        if let Some(ec) = self.hooks.before_staged_remove(&document.id.key) {
            return Err(self.staged_write_error(ec, "before_staged_remove hook raised error"));
        }
        let mut req = self.create_staging_request(document, "remove", None)?;
        req.cas = document.cas;
        req.access_deleted = document.links.is_deleted;
        let resp = match self.client.mutate_in(req) {
            Ok(resp) => resp,
            Err(err) => {
                return Err(self.staged_write_error(ErrorClass::classify(&err), err.to_string()))
            }
        };
        if let Some(ec) = self.hooks.after_staged_remove_complete(&document.id.key) {
            return Err(self.staged_write_error(ec, "after_staged_remove hook raised error"));
        }

        let mut out = document.clone();
        out.cas = resp.cas;
        self.staged.lock().add(StagedMutation {
            doc: out,
            content: Vec::new(),
            kind: StagedMutationKind::Remove,
        });
        self.overall.with_current_attempt(|a| {
            if !a.removed_ids.contains(&document.id) {
                a.removed_ids.push(document.id.clone());
            }
        });
        Ok(())
    }

    /// Shared error policy of the replace and remove staging writes.
    fn staged_write_error(
        &self,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> TransactionOperationFailed {
        let err = op(class, message);
        match class {
            ErrorClass::FailDocNotFound
            | ErrorClass::FailDocAlreadyExists
            | ErrorClass::FailCasMismatch
            | ErrorClass::FailTransient
            | ErrorClass::FailAmbiguous => err.retry(),
            ErrorClass::FailExpiry => {
                self.set_overtime();
                err.expired()
            }
            ErrorClass::FailHard => err.no_rollback(),
            _ => err,
        }
    }

    fn create_staging_request(
        &self,
        document: &TransactionGetResult,
        op_type: &str,
        content: Option<&[u8]>,
    ) -> OpResult<MutateInRequest> {
        let atr_id = self.atr_id().ok_or_else(|| {
            op(ErrorClass::FailOther, "ATR not selected before staging write")
        })?;
        let mut specs = vec![
            MutateInSpec::dict_upsert(fields::TRANSACTION_ID, jsonify(&self.transaction_id()))
                .xattr()
                .create_path(),
            MutateInSpec::dict_upsert(fields::ATTEMPT_ID, jsonify(&self.attempt_id))
                .xattr()
                .create_path(),
            MutateInSpec::dict_upsert(fields::ATR_ID, jsonify(&atr_id.key))
                .xattr()
                .create_path(),
            MutateInSpec::dict_upsert(fields::ATR_BUCKET_NAME, jsonify(&atr_id.bucket))
                .xattr()
                .create_path(),
            MutateInSpec::dict_upsert(fields::ATR_COLL_NAME, jsonify(&atr_id.collection_spec()))
                .xattr()
                .create_path(),
            MutateInSpec::dict_upsert(
                fields::CRC32_OF_STAGING,
                format!("\"{MACRO_VALUE_CRC32C}\""),
            )
            .xattr()
            .create_path()
            .expand_macros(),
            MutateInSpec::dict_upsert(fields::TYPE, jsonify(&op_type))
                .xattr()
                .create_path(),
        ];
        if let Some(metadata) = &document.metadata {
            if let Some(cas) = metadata.cas {
                specs.push(
                    MutateInSpec::dict_upsert(fields::PRE_TXN_CAS, jsonify(&cas))
                        .xattr()
                        .create_path(),
                );
            }
            if let Some(revid) = metadata.revid {
                specs.push(
                    MutateInSpec::dict_upsert(fields::PRE_TXN_REVID, jsonify(&revid))
                        .xattr()
                        .create_path(),
                );
            }
            if let Some(exptime) = metadata.exptime {
                specs.push(
                    MutateInSpec::dict_upsert(fields::PRE_TXN_EXPTIME, jsonify(&exptime))
                        .xattr()
                        .create_path(),
                );
            }
        }
        if op_type != "remove" {
            let content = content.unwrap_or(b"null");
            specs.push(
                MutateInSpec::dict_upsert(fields::STAGED_DATA, content.to_vec())
                    .xattr()
                    .create_path(),
            );
        }
        Ok(MutateInRequest::new(
            document.id.clone(),
            specs,
            self.config.durability_level,
        ))
    }

    // ------------------------------------------------------------------
    // staged insert and its conflict loop
    // ------------------------------------------------------------------

    fn create_staged_insert(
        &self,
        id: &DocumentId,
        content: &[u8],
        cas: u64,
        delay: &mut ExpDelay,
    ) -> OpResult<TransactionGetResult> {
        let mut cas = cas;
        loop {
            if let Some(ec) =
                self.error_if_expired_and_not_in_overtime(STAGE_CREATE_STAGED_INSERT, Some(&id.key))
            {
                cas = self.staged_insert_recover(id, cas, delay, ec, "expired in staged insert")?;
                continue;
            }
            if let Some(ec) = self.hooks.before_staged_insert(&id.key) {
                cas = self.staged_insert_recover(
                    id,
                    cas,
                    delay,
                    ec,
                    "before_staged_insert hook raised error",
                )?;
                continue;
            }

            tracing::debug!(doc = %id, cas, "staging insert");
            let atr_id = self.atr_id().ok_or_else(|| {
                op(ErrorClass::FailOther, "ATR not selected before staged insert")
            })?;
            let specs = vec![
                MutateInSpec::dict_upsert(fields::TRANSACTION_ID, jsonify(&self.transaction_id()))
                    .xattr()
                    .create_path(),
                MutateInSpec::dict_upsert(fields::ATTEMPT_ID, jsonify(&self.attempt_id))
                    .xattr()
                    .create_path(),
                MutateInSpec::dict_upsert(fields::ATR_ID, jsonify(&atr_id.key))
                    .xattr()
                    .create_path(),
                MutateInSpec::dict_upsert(fields::STAGED_DATA, content.to_vec())
                    .xattr()
                    .create_path(),
                MutateInSpec::dict_upsert(fields::ATR_BUCKET_NAME, jsonify(&atr_id.bucket))
                    .xattr()
                    .create_path(),
                MutateInSpec::dict_upsert(
                    fields::ATR_COLL_NAME,
                    jsonify(&atr_id.collection_spec()),
                )
                .xattr()
                .create_path(),
                MutateInSpec::dict_upsert(fields::TYPE, jsonify(&"insert"))
                    .xattr()
                    .create_path(),
                MutateInSpec::dict_upsert(
                    fields::CRC32_OF_STAGING,
                    format!("\"{MACRO_VALUE_CRC32C}\""),
                )
                .xattr()
                .create_path()
                .expand_macros(),
            ];
            let mut req = MutateInRequest::new(id.clone(), specs, self.config.durability_level);
            req.access_deleted = true;
            req.create_as_deleted = true;
            req.cas = cas;
            req.store_semantics = if cas == 0 {
                StoreSemantics::Insert
            } else {
                StoreSemantics::Replace
            };

            match self.client.mutate_in(req) {
                Ok(resp) => {
                    if let Some(ec) = self.hooks.after_staged_insert_complete(&id.key) {
                        cas = self.staged_insert_recover(
                            id,
                            cas,
                            delay,
                            ec,
                            "after_staged_insert hook raised error",
                        )?;
                        continue;
                    }
                    tracing::debug!(doc = %id, cas = resp.cas, "staged insert succeeded");
                    let links = TransactionLinks {
                        atr_key: Some(atr_id.key.clone()),
                        atr_bucket: Some(atr_id.bucket.clone()),
                        atr_collection_spec: Some(atr_id.collection_spec()),
                        staged_transaction_id: Some(self.transaction_id().to_string()),
                        staged_attempt_id: Some(self.attempt_id.clone()),
                        staged_content: Some(content.to_vec()),
                        op: Some("insert".to_string()),
                        crc32_of_staging: None,
                        restore: None,
                        forward_compat: None,
                        is_deleted: true,
                    };
                    let out = TransactionGetResult {
                        id: id.clone(),
                        cas: resp.cas,
                        content: Some(content.to_vec()),
                        links,
                        metadata: None,
                    };
                    self.staged.lock().add(StagedMutation {
                        doc: out.clone(),
                        content: content.to_vec(),
                        kind: StagedMutationKind::Insert,
                    });
                    self.overall.with_current_attempt(|a| {
                        if !a.inserted_ids.contains(id) {
                            a.inserted_ids.push(id.clone());
                        }
                    });
                    return Ok(out);
                }
                Err(err) => {
                    cas = self.staged_insert_recover(
                        id,
                        cas,
                        delay,
                        ErrorClass::classify(&err),
                        err.to_string(),
                    )?;
                }
            }
        }
    }

    /// Decide how a failed staged insert continues: `Ok(cas)` re-enters
    /// the staging loop with that CAS, `Err` gives up.
    fn staged_insert_recover(
        &self,
        id: &DocumentId,
        cas: u64,
        delay: &mut ExpDelay,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> OpResult<u64> {
        let message = message.into();
        tracing::trace!(doc = %id, class = %class, "staged insert error");
        if self.in_overtime() {
            return Err(op(ErrorClass::FailExpiry, "attempt timed out").expired());
        }
        match class {
            ErrorClass::FailExpiry => {
                self.set_overtime();
                Err(op(class, "attempt timed out").expired())
            }
            ErrorClass::FailTransient => Err(op(class, message).retry()),
            ErrorClass::FailAmbiguous => {
                tracing::debug!(doc = %id, "ambiguous staged insert, retrying");
                self.insert_delay(delay)?;
                Ok(cas)
            }
            ErrorClass::FailOther => Err(op(class, message)),
            ErrorClass::FailHard => Err(op(class, message).no_rollback()),
            ErrorClass::FailDocAlreadyExists | ErrorClass::FailCasMismatch => {
                tracing::debug!(doc = %id, "found existing doc, may still be able to insert");
                self.staged_insert_resolve_existing(id, delay)
            }
            _ => Err(op(class, message).retry()),
        }
    }

    /// The contested-insert path: refetch whatever occupies the key and
    /// decide whether it can be overwritten.
    fn staged_insert_resolve_existing(
        &self,
        id: &DocumentId,
        delay: &mut ExpDelay,
    ) -> OpResult<u64> {
        if let Some(ec) = self.hooks.before_get_doc_in_exists_during_staged_insert(&id.key) {
            return Err(self.staged_insert_refetch_error(ec, "refetch hook raised error"));
        }
        match self.get_doc(id) {
            Ok(Some(doc)) => {
                tracing::debug!(
                    doc = %id,
                    in_transaction = doc.links.is_document_in_transaction(),
                    is_deleted = doc.links.is_deleted,
                    "document exists during staged insert"
                );
                forward_compat::check(
                    ForwardCompatStage::WriteWriteConflictInsertingGet,
                    doc.links.forward_compat.as_ref(),
                )?;
                if !doc.links.is_document_in_transaction() && doc.links.is_deleted {
                    // plain tombstone: retry on top of it with its CAS
                    self.insert_delay(delay)?;
                    return Ok(doc.cas);
                }
                if !doc.links.is_document_in_transaction() {
                    return Err(op(
                        ErrorClass::FailDocAlreadyExists,
                        "document already exists",
                    ));
                }
                if doc.links.op.as_deref() != Some("insert") {
                    return Err(op(
                        ErrorClass::FailDocAlreadyExists,
                        "document exists with a staged write that is not an insert",
                    )
                    .cause(ErrorCause::DocumentExists));
                }
                self.check_and_handle_blocking(
                    &doc,
                    ForwardCompatStage::WriteWriteConflictInserting,
                )?;
                tracing::debug!(doc = %id, cas = doc.cas, "foreign staged insert resolved, overwriting");
                self.insert_delay(delay)?;
                Ok(doc.cas)
            }
            Ok(None) => Err(op(
                ErrorClass::FailDocNotFound,
                "insert found an existing document that has since vanished",
            )
            .retry()),
            Err(err) => {
                Err(self.staged_insert_refetch_error(ErrorClass::classify(&err), err.to_string()))
            }
        }
    }

    fn staged_insert_refetch_error(
        &self,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> TransactionOperationFailed {
        if self.in_overtime() {
            return op(ErrorClass::FailExpiry, "attempt timed out").expired();
        }
        let err = op(class, message);
        match class {
            ErrorClass::FailExpiry => {
                self.set_overtime();
                op(class, "attempt timed out").expired()
            }
            ErrorClass::FailTransient | ErrorClass::FailPathNotFound => err.retry(),
            ErrorClass::FailOther => err,
            ErrorClass::FailHard => err.no_rollback(),
            _ => err.retry(),
        }
    }

    fn insert_delay(&self, delay: &mut ExpDelay) -> OpResult<()> {
        delay.sleep().map_err(|_| {
            self.set_overtime();
            op(ErrorClass::FailExpiry, "insert retry budget exhausted").expired()
        })
    }

    // ------------------------------------------------------------------
    // blocking-transaction resolution
    // ------------------------------------------------------------------

    /// A write found foreign staging metadata on its target: wait briefly
    /// for the other attempt to finish, or declare a write-write conflict.
    fn check_and_handle_blocking(
        &self,
        doc: &TransactionGetResult,
        stage: ForwardCompatStage,
    ) -> OpResult<()> {
        if !doc.links.has_staged_write() {
            return Ok(());
        }
        // The transaction id is compared, not the attempt id, so a retry
        // of this transaction can overwrite its predecessor's stage.
        if doc.links.staged_transaction_id.as_deref() == Some(self.transaction_id()) {
            tracing::debug!(doc = %doc.id, "staged by this transaction, ok to continue");
            return Ok(());
        }
        let Some(atr_id) = doc.links.atr_document_id() else {
            tracing::debug!(
                doc = %doc.id,
                "foreign stage without full atr metadata, proceeding to overwrite"
            );
            return Ok(());
        };
        forward_compat::check(stage, doc.links.forward_compat.as_ref())?;

        let staged_attempt = doc
            .links
            .staged_attempt_id
            .clone()
            .unwrap_or_default();
        let mut delay = ExpDelay::until(
            Duration::from_millis(50),
            Duration::from_millis(500),
            Duration::from_secs(1),
        );
        loop {
            if delay.sleep().is_err() {
                return Err(op(
                    ErrorClass::FailWriteWriteConflict,
                    "document is in another transaction",
                )
                .retry());
            }
            if self
                .hooks
                .before_check_atr_entry_for_blocking_doc(&doc.id.key)
                .is_some()
            {
                return Err(op(
                    ErrorClass::FailWriteWriteConflict,
                    "document is in another transaction",
                )
                .retry());
            }
            match ActiveTransactionRecord::get_entry(&*self.client, &atr_id, &staged_attempt) {
                Ok(Some(entry)) => {
                    forward_compat::check(
                        ForwardCompatStage::WriteWriteConflictReadingAtr,
                        entry.forward_compat.as_ref(),
                    )?;
                    if entry.has_expired(EXPIRY_SAFETY_MARGIN_MS) {
                        tracing::debug!(
                            doc = %doc.id,
                            age_ms = entry.age_ms(),
                            "blocking atr entry has expired, ignoring"
                        );
                        return Ok(());
                    }
                    match entry.state {
                        AttemptState::Completed | AttemptState::RolledBack => {
                            tracing::debug!(doc = %doc.id, state = %entry.state, "blocking entry finished");
                            return Ok(());
                        }
                        state => {
                            tracing::debug!(doc = %doc.id, %state, "blocking entry still active, waiting");
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(doc = %doc.id, "no blocking atr entry");
                    return Ok(());
                }
                Err(_) => {
                    return Err(op(
                        ErrorClass::FailWriteWriteConflict,
                        "document is in another transaction",
                    )
                    .retry());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // ATR selection and the PENDING write
    // ------------------------------------------------------------------

    /// On the first mutation, elect the ATR and create this attempt's
    /// entry in PENDING state. Concurrent first mutations serialize on
    /// the selection lock and observe the elected ATR.
    fn select_atr_if_needed(&self, id: &DocumentId) -> OpResult<()> {
        let mut slot = self.atr_id.lock();
        if slot.is_some() {
            tracing::trace!("atr already selected");
            return Ok(());
        }
        let candidate = match self.hooks.random_atr_id() {
            Some(key) => DocumentId::new(id.bucket.clone(), "_default", "_default", key),
            None => crate::atr_ids::atr_id_for(id, self.config.metadata_collection.as_ref()),
        };
        // Retries of this transaction reuse whatever the first attempt
        // elected, whatever document mutates first this time.
        let elected = self.overall.elect_atr(candidate);
        tracing::debug!(
            doc = %id,
            vbucket = crate::atr_ids::vbucket_for_key(&id.key),
            atr = %elected,
            "first mutated doc elected atr"
        );
        *slot = Some(elected.clone());
        self.set_atr_pending(&elected)
    }

    /// Create the attempt's ATR entry: `st=PENDING`, server start
    /// timestamp, declared expiry. Runs under the selection lock.
    fn set_atr_pending(&self, atr_id: &DocumentId) -> OpResult<()> {
        let prefix = atr_entry_path(&self.attempt_id);
        let expires_ms = self.config.expiration_time.as_millis() as u64;
        let mut ambiguity_delay = ExpDelay::until(
            Duration::from_millis(5),
            Duration::from_millis(300),
            self.config.expiration_time,
        );
        loop {
            if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_PENDING, None) {
                return Err(op(ec, "transaction expired setting ATR").expired());
            }
            if let Some(ec) = self.hooks.before_atr_pending() {
                match self.atr_pending_error(ec, "before_atr_pending hook raised error")? {
                    AtrPendingFlow::TreatAsSuccess => break,
                    AtrPendingFlow::RetryWrite => {
                        self.pending_delay(&mut ambiguity_delay)?;
                        continue;
                    }
                }
            }
            tracing::debug!(atr = %atr_id, "creating atr entry in pending state");
            let specs = vec![
                MutateInSpec::dict_add(
                    format!("{prefix}.{}", fields::ATR_FIELD_TRANSACTION_ID),
                    jsonify(&self.transaction_id()),
                )
                .xattr()
                .create_path(),
                MutateInSpec::dict_add(
                    format!("{prefix}.{}", fields::ATR_FIELD_STATUS),
                    jsonify(&AttemptState::Pending.name()),
                )
                .xattr()
                .create_path(),
                MutateInSpec::dict_add(
                    format!("{prefix}.{}", fields::ATR_FIELD_START_TIMESTAMP),
                    format!("\"{MACRO_CAS}\""),
                )
                .xattr()
                .create_path()
                .expand_macros(),
                MutateInSpec::dict_add(
                    format!("{prefix}.{}", fields::ATR_FIELD_EXPIRES_AFTER_MSECS),
                    jsonify(&expires_ms),
                )
                .xattr()
                .create_path(),
            ];
            let mut req =
                MutateInRequest::new(atr_id.clone(), specs, self.config.durability_level);
            req.store_semantics = StoreSemantics::Upsert;
            match self.client.mutate_in(req) {
                Ok(resp) => {
                    if let Some(ec) = self.hooks.after_atr_pending() {
                        match self.atr_pending_error(ec, "after_atr_pending hook raised error")? {
                            AtrPendingFlow::TreatAsSuccess => break,
                            AtrPendingFlow::RetryWrite => {
                                self.pending_delay(&mut ambiguity_delay)?;
                                continue;
                            }
                        }
                    }
                    tracing::debug!(atr = %atr_id, start_cas = resp.cas, "atr entry pending");
                    break;
                }
                Err(err) => {
                    match self.atr_pending_error(ErrorClass::classify(&err), err.to_string())? {
                        AtrPendingFlow::TreatAsSuccess => break,
                        AtrPendingFlow::RetryWrite => {
                            self.pending_delay(&mut ambiguity_delay)?;
                            continue;
                        }
                    }
                }
            }
        }
        self.set_state(AttemptState::Pending);
        Ok(())
    }

    fn pending_delay(&self, delay: &mut ExpDelay) -> OpResult<()> {
        delay.sleep().map_err(|_| {
            self.set_overtime();
            op(ErrorClass::FailExpiry, "retry budget exhausted setting ATR").expired()
        })
    }

    fn atr_pending_error(
        &self,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> OpResult<AtrPendingFlow> {
        let message = message.into();
        tracing::trace!(class = %class, "error setting atr to pending");
        if self.in_overtime() {
            return Err(op(class, message).no_rollback().expired());
        }
        match class {
            ErrorClass::FailExpiry => {
                self.set_overtime();
                Err(op(class, message).expired())
            }
            ErrorClass::FailAtrFull => {
                Err(op(class, message).cause(ErrorCause::ActiveTransactionRecordFull))
            }
            ErrorClass::FailPathAlreadyExists => {
                // the entry is already there, presumably from an
                // ambiguous earlier write of ours
                Ok(AtrPendingFlow::TreatAsSuccess)
            }
            ErrorClass::FailAmbiguous => {
                tracing::debug!("ambiguous atr pending write, retrying");
                Ok(AtrPendingFlow::RetryWrite)
            }
            ErrorClass::FailTransient => Err(op(class, message).retry()),
            ErrorClass::FailHard => Err(op(class, message).no_rollback()),
            _ => Err(op(class, message)),
        }
    }

    // ------------------------------------------------------------------
    // commit
    // ------------------------------------------------------------------

    /// Commit the attempt: flip the ATR entry to COMMITTED, apply every
    /// staged mutation to its document, then retire the entry.
    pub fn commit(&self) -> OpResult<()> {
        tracing::debug!(attempt_id = %self.attempt_id, "commit");
        if self.check_expiry_pre_commit(STAGE_BEFORE_COMMIT, None) {
            return Err(op(ErrorClass::FailExpiry, "transaction expired").expired());
        }
        let has_atr = self.atr_id().is_some();
        if !has_atr {
            if self.is_done() {
                return Err(op(
                    ErrorClass::FailOther,
                    "calling commit on an attempt that is already completed",
                )
                .no_rollback());
            }
            tracing::debug!("attempt has no mutations, nothing to commit");
            self.mark_done();
            return Ok(());
        }
        if self.is_done() {
            return Err(op(
                ErrorClass::FailOther,
                "calling commit on an attempt that is already completed",
            )
            .no_rollback());
        }

        self.retry_atr_step(|this| this.atr_commit())?;
        self.commit_staged_mutations()?;
        self.atr_complete()?;
        self.mark_done();
        Ok(())
    }

    /// Drive one ATR write step through its internal retry decisions.
    fn retry_atr_step(
        &self,
        mut step: impl FnMut(&Self) -> Result<(), OpFlow>,
    ) -> OpResult<()> {
        let mut delay = ExpDelay::attempts(Duration::from_millis(10), Duration::from_millis(500), 50);
        loop {
            match step(self) {
                Ok(()) => return Ok(()),
                Err(OpFlow::Retry(reason)) => {
                    tracing::debug!(reason = %reason, "retrying atr step");
                    if delay.sleep().is_err() {
                        return Err(op(ErrorClass::FailExpiry, reason).no_rollback().expired());
                    }
                }
                Err(OpFlow::Fail(err)) => return Err(err),
            }
        }
    }

    fn atr_commit(&self) -> Result<(), OpFlow> {
        if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_COMMIT, None) {
            return self.atr_commit_error(ec, "expired in atr_commit");
        }
        if let Some(ec) = self.hooks.before_atr_commit() {
            return self.atr_commit_error(ec, "before_atr_commit hook raised error");
        }
        let atr_id = match self.atr_id() {
            Some(atr_id) => atr_id,
            None => {
                return Err(OpFlow::Fail(op(
                    ErrorClass::FailOther,
                    "ATR not selected at commit",
                )))
            }
        };
        let prefix = atr_entry_path(&self.attempt_id);
        let (inserted, replaced, removed) = self.staged.lock().extract_doc_records();
        let specs = vec![
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_STATUS),
                jsonify(&AttemptState::Committed.name()),
            )
            .xattr(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_START_COMMIT),
                format!("\"{MACRO_CAS}\""),
            )
            .xattr()
            .expand_macros(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_DOCS_INSERTED),
                jsonify(&inserted),
            )
            .xattr(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_DOCS_REPLACED),
                jsonify(&replaced),
            )
            .xattr(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_DOCS_REMOVED),
                jsonify(&removed),
            )
            .xattr(),
        ];
        tracing::trace!(atr = %atr_id, "flipping atr entry to committed");
        let req = MutateInRequest::new(atr_id, specs, self.config.durability_level);
        match self.client.mutate_in(req) {
            Ok(_) => {
                if let Some(ec) = self.hooks.after_atr_commit() {
                    return self.atr_commit_error(ec, "after_atr_commit hook raised error");
                }
                self.set_state(AttemptState::Committed);
                Ok(())
            }
            Err(err) => self.atr_commit_error(ErrorClass::classify(&err), err.to_string()),
        }
    }

    fn atr_commit_error(
        &self,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Result<(), OpFlow> {
        let message = message.into();
        match class {
            ErrorClass::FailExpiry => {
                if self.in_overtime() {
                    Err(OpFlow::Fail(
                        op(class, message).no_rollback().expired(),
                    ))
                } else {
                    // one more pass with expiry checks suppressed
                    self.set_overtime();
                    Err(OpFlow::Retry(
                        "expired in atr_commit, retrying in overtime mode".to_string(),
                    ))
                }
            }
            ErrorClass::FailAmbiguous => {
                tracing::debug!("atr_commit ambiguous, resolving");
                self.atr_commit_ambiguity_resolution()
            }
            ErrorClass::FailTransient => Err(OpFlow::Fail(op(class, message).retry())),
            ErrorClass::FailHard => Err(OpFlow::Fail(op(class, message).no_rollback())),
            _ => {
                tracing::error!(
                    transaction_id = %self.transaction_id(),
                    attempt_id = %self.attempt_id,
                    %class,
                    "failed to commit transaction"
                );
                Err(OpFlow::Fail(op(class, message)))
            }
        }
    }

    /// The commit write may or may not have landed: reread the status
    /// field until the question is settled.
    fn atr_commit_ambiguity_resolution(&self) -> Result<(), OpFlow> {
        let mut delay = ExpDelay::attempts(
            Duration::from_millis(50),
            Duration::from_millis(500),
            20,
        );
        loop {
            if self
                .error_if_expired_and_not_in_overtime(STAGE_ATR_COMMIT_AMBIGUITY_RESOLUTION, None)
                .is_some()
            {
                self.set_overtime();
                return Err(OpFlow::Fail(
                    op(
                        ErrorClass::FailExpiry,
                        "expired during commit ambiguity resolution",
                    )
                    .no_rollback()
                    .ambiguous(),
                ));
            }
            let atr_id = match self.atr_id() {
                Some(atr_id) => atr_id,
                None => {
                    return Err(OpFlow::Fail(op(
                        ErrorClass::FailOther,
                        "ATR not selected during ambiguity resolution",
                    )))
                }
            };
            let path = format!(
                "{}.{}",
                atr_entry_path(&self.attempt_id),
                fields::ATR_FIELD_STATUS
            );
            let lookup = self.client.lookup_in(LookupInRequest {
                id: atr_id,
                specs: vec![LookupInSpec::get(path).xattr()],
                access_deleted: false,
            });
            match lookup {
                Ok(resp) => {
                    let status: Option<String> = resp
                        .fields
                        .first()
                        .and_then(|f| f.as_deref())
                        .and_then(|bytes| serde_json::from_slice(bytes).ok());
                    match status.as_deref().and_then(AttemptState::parse) {
                        Some(AttemptState::Completed) => {
                            self.set_state(AttemptState::Committed);
                            return Ok(());
                        }
                        Some(AttemptState::Aborted) | Some(AttemptState::RolledBack) => {
                            return Err(OpFlow::Fail(
                                op(
                                    ErrorClass::FailOther,
                                    "transaction rolled back externally",
                                )
                                .no_rollback(),
                            ));
                        }
                        _ => {
                            // still pending, the write did not land
                            return Err(OpFlow::Retry(
                                "atr still pending, retry atr_commit".to_string(),
                            ));
                        }
                    }
                }
                Err(err) => match ErrorClass::classify(&err) {
                    ErrorClass::FailExpiry => {
                        self.set_overtime();
                        return Err(OpFlow::Fail(
                            op(ErrorClass::FailExpiry, err.to_string())
                                .no_rollback()
                                .ambiguous(),
                        ));
                    }
                    ErrorClass::FailHard => {
                        return Err(OpFlow::Fail(
                            op(ErrorClass::FailHard, err.to_string()).no_rollback(),
                        ));
                    }
                    ErrorClass::FailPathNotFound => {
                        return Err(OpFlow::Fail(
                            op(
                                ErrorClass::FailOther,
                                "transaction rolled back externally",
                            )
                            .no_rollback(),
                        ));
                    }
                    ErrorClass::FailTransient | ErrorClass::FailOther => {
                        if delay.sleep().is_err() {
                            return Err(OpFlow::Fail(
                                op(ErrorClass::FailExpiry, err.to_string())
                                    .no_rollback()
                                    .ambiguous(),
                            ));
                        }
                    }
                    _ => {
                        return Err(OpFlow::Fail(
                            op(ErrorClass::classify(&err), err.to_string()).no_rollback(),
                        ));
                    }
                },
            }
        }
    }

    /// Apply every staged mutation to its document. Past the commit
    /// point, failures are logged and left to cleanup, except a hard
    /// failure which surfaces as failed-post-commit.
    fn commit_staged_mutations(&self) -> OpResult<()> {
        let mutations: Vec<StagedMutation> = self.staged.lock().iter().cloned().collect();
        let mut all_applied = true;
        for mutation in &mutations {
            let result = match mutation.kind {
                StagedMutationKind::Insert => self.unstage_apply(mutation, true),
                StagedMutationKind::Replace => self.unstage_apply(mutation, false),
                StagedMutationKind::Remove => self.unstage_remove(mutation),
            };
            if let Err(err) = result {
                if err.class == ErrorClass::FailHard {
                    return Err(err.no_rollback().failed_post_commit());
                }
                tracing::warn!(
                    doc = %mutation.doc.id,
                    error = %err,
                    "ignoring unstaging error after commit point, cleanup will finish"
                );
                all_applied = false;
            }
        }
        if !all_applied {
            self.unstaging_complete.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Make a staged insert or replace visible: strip the transactional
    /// XATTRs and set the body. A staged insert lives on a tombstone, so
    /// it becomes a full-document insert instead.
    fn unstage_apply(&self, mutation: &StagedMutation, was_insert: bool) -> OpResult<()> {
        let id = &mutation.doc.id;
        let mut retries = ExpDelay::attempts(Duration::from_millis(5), Duration::from_millis(100), 3);
        loop {
            let result = if was_insert || mutation.doc.links.is_deleted {
                self.client
                    .insert(id, mutation.content.clone(), self.config.durability_level)
                    .map(|_| ())
            } else {
                let specs = vec![
                    MutateInSpec::remove(fields::TRANSACTION_INTERFACE_PREFIX).xattr(),
                    MutateInSpec::set_doc(mutation.content.clone()),
                ];
                let mut req =
                    MutateInRequest::new(id.clone(), specs, self.config.durability_level);
                req.cas = mutation.doc.cas;
                self.client.mutate_in(req).map(|_| ())
            };
            match result {
                Ok(()) => {
                    tracing::trace!(doc = %id, "unstaged");
                    return Ok(());
                }
                Err(err) => {
                    let class = ErrorClass::classify(&err);
                    if matches!(class, ErrorClass::FailTransient | ErrorClass::FailAmbiguous)
                        && retries.sleep().is_ok()
                    {
                        continue;
                    }
                    return Err(op(class, err.to_string()));
                }
            }
        }
    }

    /// Apply a staged remove: delete the document, or just its XATTRs if
    /// it was already a tombstone when staged.
    fn unstage_remove(&self, mutation: &StagedMutation) -> OpResult<()> {
        let id = &mutation.doc.id;
        let result = if mutation.doc.links.is_deleted {
            let specs = vec![MutateInSpec::remove(fields::TRANSACTION_INTERFACE_PREFIX).xattr()];
            let mut req = MutateInRequest::new(id.clone(), specs, self.config.durability_level);
            req.cas = mutation.doc.cas;
            req.access_deleted = true;
            self.client.mutate_in(req).map(|_| ())
        } else {
            self.client
                .remove(id, mutation.doc.cas, self.config.durability_level)
                .map(|_| ())
        };
        result.map_err(|err| op(ErrorClass::classify(&err), err.to_string()))
    }

    /// Retire the attempt's ATR entry after unstaging. Errors here are
    /// logged and left to cleanup, except a hard failure.
    fn atr_complete(&self) -> OpResult<()> {
        if let Some(ec) = self.hooks.before_atr_complete() {
            return self.atr_complete_error(ec, "before_atr_complete hook raised error");
        }
        if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_COMPLETE, None) {
            return self.atr_complete_error(ec, "expired in atr_complete");
        }
        let Some(atr_id) = self.atr_id() else {
            return Ok(());
        };
        tracing::debug!(atr = %atr_id, attempt_id = %self.attempt_id, "removing attempt from atr");
        let specs = vec![MutateInSpec::remove(atr_entry_path(&self.attempt_id)).xattr()];
        let req = MutateInRequest::new(atr_id, specs, self.config.durability_level);
        if let Err(err) = self.client.mutate_in(req) {
            return self.atr_complete_error(ErrorClass::classify(&err), err.to_string());
        }
        if let Some(ec) = self.hooks.after_atr_complete() {
            return self.atr_complete_error(ec, "after_atr_complete hook raised error");
        }
        self.set_state(AttemptState::Completed);
        Ok(())
    }

    fn atr_complete_error(
        &self,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> OpResult<()> {
        let message = message.into();
        match class {
            ErrorClass::FailHard => Err(op(class, message).no_rollback().failed_post_commit()),
            _ => {
                tracing::info!(class = %class, message = %message, "ignoring error in atr_complete");
                self.unstaging_complete.store(false, Ordering::Release);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // rollback
    // ------------------------------------------------------------------

    /// Roll the attempt back: flip the ATR entry to ABORTED, discard
    /// every staged mutation, then retire the entry.
    pub fn rollback(&self) -> OpResult<()> {
        tracing::debug!(attempt_id = %self.attempt_id, "rolling back");
        self.check_expiry_during_commit_or_rollback(STAGE_ATR_ABORT);
        if self.atr_id().is_none() || self.state() == AttemptState::NotStarted {
            tracing::debug!("rollback of an attempt with no mutations");
            self.mark_done();
            return Ok(());
        }
        if self.is_done() {
            return Err(op(
                ErrorClass::FailOther,
                "attempt already done, cannot rollback",
            )
            .no_rollback());
        }

        self.retry_atr_step(|this| this.atr_abort())?;
        self.rollback_staged_mutations()?;
        tracing::debug!("rollback completed unstaging docs");
        self.retry_atr_step(|this| this.atr_rollback_complete())?;
        self.mark_done();
        Ok(())
    }

    fn atr_abort(&self) -> Result<(), OpFlow> {
        if let Some(ec) = self.error_if_expired_and_not_in_overtime(STAGE_ATR_ABORT, None) {
            return self.atr_abort_error(ec, "expired in atr_abort");
        }
        if let Some(ec) = self.hooks.before_atr_aborted() {
            return self.atr_abort_error(ec, "before_atr_aborted hook raised error");
        }
        let atr_id = match self.atr_id() {
            Some(atr_id) => atr_id,
            None => {
                return Err(OpFlow::Fail(op(
                    ErrorClass::FailOther,
                    "ATR not selected at abort",
                )))
            }
        };
        let prefix = atr_entry_path(&self.attempt_id);
        let (inserted, replaced, removed) = self.staged.lock().extract_doc_records();
        let specs = vec![
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_STATUS),
                jsonify(&AttemptState::Aborted.name()),
            )
            .xattr()
            .create_path(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_TIMESTAMP_ROLLBACK_START),
                format!("\"{MACRO_CAS}\""),
            )
            .xattr()
            .create_path()
            .expand_macros(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_DOCS_INSERTED),
                jsonify(&inserted),
            )
            .xattr()
            .create_path(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_DOCS_REPLACED),
                jsonify(&replaced),
            )
            .xattr()
            .create_path(),
            MutateInSpec::dict_upsert(
                format!("{prefix}.{}", fields::ATR_FIELD_DOCS_REMOVED),
                jsonify(&removed),
            )
            .xattr()
            .create_path(),
        ];
        let req = MutateInRequest::new(atr_id, specs, self.config.durability_level);
        match self.client.mutate_in(req) {
            Ok(_) => {
                self.set_state(AttemptState::Aborted);
                if let Some(ec) = self.hooks.after_atr_aborted() {
                    return self.atr_abort_error(ec, "after_atr_aborted hook raised error");
                }
                tracing::debug!("atr abort phase complete");
                Ok(())
            }
            Err(err) => self.atr_abort_error(ErrorClass::classify(&err), err.to_string()),
        }
    }

    fn atr_abort_error(&self, class: ErrorClass, message: impl Into<String>) -> Result<(), OpFlow> {
        let message = message.into();
        tracing::trace!(class = %class, message = %message, "atr_abort error");
        if self.in_overtime() {
            return Err(OpFlow::Fail(
                op(ErrorClass::FailExpiry, message).no_rollback().expired(),
            ));
        }
        match class {
            ErrorClass::FailExpiry => {
                self.set_overtime();
                Err(OpFlow::Retry(
                    "expired, retrying atr_abort in overtime mode".to_string(),
                ))
            }
            ErrorClass::FailPathNotFound => Err(OpFlow::Fail(
                op(class, message)
                    .no_rollback()
                    .cause(ErrorCause::ActiveTransactionRecordEntryNotFound),
            )),
            ErrorClass::FailDocNotFound => Err(OpFlow::Fail(
                op(class, message)
                    .no_rollback()
                    .cause(ErrorCause::ActiveTransactionRecordNotFound),
            )),
            ErrorClass::FailAtrFull => Err(OpFlow::Fail(
                op(class, message)
                    .no_rollback()
                    .cause(ErrorCause::ActiveTransactionRecordFull),
            )),
            ErrorClass::FailHard => Err(OpFlow::Fail(op(class, message).no_rollback())),
            _ => Err(OpFlow::Retry("retrying atr_abort".to_string())),
        }
    }

    /// Discard every staged mutation: a staged insert's tombstone loses
    /// its XATTRs, a staged replace or remove keeps its untouched body.
    fn rollback_staged_mutations(&self) -> OpResult<()> {
        let mutations: Vec<StagedMutation> = self.staged.lock().iter().cloned().collect();
        for mutation in &mutations {
            let id = &mutation.doc.id;
            let access_deleted = match mutation.kind {
                StagedMutationKind::Insert => true,
                _ => mutation.doc.links.is_deleted,
            };
            let specs = vec![MutateInSpec::remove(fields::TRANSACTION_INTERFACE_PREFIX).xattr()];
            let mut req = MutateInRequest::new(id.clone(), specs, self.config.durability_level);
            req.cas = mutation.doc.cas;
            req.access_deleted = access_deleted;
            match self.client.mutate_in(req) {
                Ok(_) => tracing::trace!(doc = %id, "rolled back staged mutation"),
                Err(err) => {
                    let class = ErrorClass::classify(&err);
                    match class {
                        ErrorClass::FailHard => {
                            return Err(op(class, err.to_string()).no_rollback())
                        }
                        ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound => {
                            tracing::trace!(doc = %id, "nothing staged to roll back");
                        }
                        _ => {
                            tracing::warn!(
                                doc = %id,
                                error = %err,
                                "ignoring rollback unstaging error, cleanup will finish"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn atr_rollback_complete(&self) -> Result<(), OpFlow> {
        if let Some(ec) =
            self.error_if_expired_and_not_in_overtime(STAGE_ATR_ROLLBACK_COMPLETE, None)
        {
            return self.atr_rollback_complete_error(ec, "expired in atr_rollback_complete");
        }
        if let Some(ec) = self.hooks.before_atr_rolled_back() {
            return self.atr_rollback_complete_error(ec, "before_atr_rolled_back hook raised error");
        }
        let atr_id = match self.atr_id() {
            Some(atr_id) => atr_id,
            None => return Ok(()),
        };
        let specs = vec![MutateInSpec::remove(atr_entry_path(&self.attempt_id)).xattr()];
        let req = MutateInRequest::new(atr_id, specs, self.config.durability_level);
        match self.client.mutate_in(req) {
            Ok(_) => {
                self.set_state(AttemptState::RolledBack);
                if let Some(ec) = self.hooks.after_atr_rolled_back() {
                    return self
                        .atr_rollback_complete_error(ec, "after_atr_rolled_back hook raised error");
                }
                Ok(())
            }
            Err(err) => {
                self.atr_rollback_complete_error(ErrorClass::classify(&err), err.to_string())
            }
        }
    }

    fn atr_rollback_complete_error(
        &self,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Result<(), OpFlow> {
        let message = message.into();
        if self.in_overtime() && class == ErrorClass::FailExpiry {
            return Err(OpFlow::Fail(
                op(class, message).no_rollback().expired(),
            ));
        }
        match class {
            ErrorClass::FailDocNotFound | ErrorClass::FailPathNotFound => {
                tracing::debug!("atr entry already gone, rollback complete");
                if self.state() == AttemptState::Aborted {
                    self.set_state(AttemptState::RolledBack);
                }
                Ok(())
            }
            ErrorClass::FailAtrFull => Err(OpFlow::Retry("atr full, retrying".to_string())),
            ErrorClass::FailHard => Err(OpFlow::Fail(op(class, message).no_rollback())),
            ErrorClass::FailExpiry => Err(OpFlow::Fail(
                op(class, message).no_rollback().expired(),
            )),
            _ => Err(OpFlow::Retry(
                "retrying atr_rollback_complete".to_string(),
            )),
        }
    }
}

enum AtrPendingFlow {
    TreatAsSuccess,
    RetryWrite,
}

#[cfg(test)]
mod tests {
    use super::*;
    use atrium_core::testing::MockCluster;
    use atrium_core::DurabilityLevel;
    use serde_json::json;

    fn context(cluster: &Arc<MockCluster>) -> AttemptContext<MockCluster> {
        let config = TransactionConfig::builder()
            .durability_level(DurabilityLevel::None)
            .cleanup_client_attempts(false)
            .cleanup_lost_attempts(false)
            .build();
        let overall = Arc::new(TransactionShared::new(&config));
        AttemptContext::new(Arc::clone(cluster), config, overall)
    }

    fn id(key: &str) -> DocumentId {
        DocumentId::new("default", "_default", "_default", key)
    }

    fn seed(cluster: &MockCluster, doc: &DocumentId, body: serde_json::Value) {
        cluster
            .upsert(doc, serde_json::to_vec(&body).unwrap(), DurabilityLevel::None)
            .unwrap();
    }

    #[test]
    fn insert_after_any_own_mutation_is_rejected() {
        let cluster = Arc::new(MockCluster::new());
        let ctx = context(&cluster);
        let k = id("dup");
        ctx.insert(&k, b"{\"v\":1}").unwrap();
        let err = ctx.insert(&k, b"{\"v\":2}").unwrap_err();
        assert_eq!(err.class, ErrorClass::FailOther);
        assert!(!err.retry);

        // and after a remove of an existing doc
        let cluster = Arc::new(MockCluster::new());
        let ctx = context(&cluster);
        let k = id("reinserted");
        seed(&cluster, &k, json!({"v": 1}));
        let snapshot = ctx.get(&k).unwrap();
        ctx.remove(&snapshot).unwrap();
        let err = ctx.insert(&k, b"{\"v\":2}").unwrap_err();
        assert_eq!(err.class, ErrorClass::FailOther);
    }

    #[test]
    fn operations_after_commit_are_rejected_without_rollback() {
        let cluster = Arc::new(MockCluster::new());
        let ctx = context(&cluster);
        let k = id("done");
        seed(&cluster, &k, json!({"v": 1}));
        ctx.commit().unwrap();
        let err = ctx.get(&k).unwrap_err();
        assert_eq!(err.class, ErrorClass::FailOther);
        assert!(!err.rollback);
    }

    #[test]
    fn commit_with_no_mutations_is_a_no_op() {
        let cluster = Arc::new(MockCluster::new());
        let ctx = context(&cluster);
        ctx.commit().unwrap();
        assert!(ctx.is_done());
        assert!(ctx.atr_id().is_none());
        assert!(ctx.unstaging_complete());
    }

    #[test]
    fn rollback_discards_a_staged_replace() {
        let cluster = Arc::new(MockCluster::new());
        let ctx = context(&cluster);
        let k = id("undone");
        seed(&cluster, &k, json!({"v": 1}));
        let snapshot = ctx.get(&k).unwrap();
        ctx.replace(&snapshot, b"{\"v\":2}").unwrap();
        ctx.rollback().unwrap();

        assert_eq!(ctx.state(), AttemptState::RolledBack);
        assert_eq!(cluster.body_of(&k), Some(json!({"v": 1})));
        assert_eq!(cluster.xattrs_of(&k), Some(json!({})));
        // its atr entry is gone too
        let atr = ctx.atr_id().unwrap();
        let attempts = cluster
            .xattrs_of(&atr)
            .map(|x| x.get("attempts").cloned().unwrap_or(json!({})))
            .unwrap();
        assert_eq!(attempts, json!({}));
    }

    #[test]
    fn staging_a_replace_leaves_the_visible_body_alone() {
        let cluster = Arc::new(MockCluster::new());
        let ctx = context(&cluster);
        let k = id("staged");
        seed(&cluster, &k, json!({"v": 1}));
        let snapshot = ctx.get(&k).unwrap();
        ctx.replace(&snapshot, b"{\"v\":2}").unwrap();

        assert_eq!(cluster.body_of(&k), Some(json!({"v": 1})));
        let xattrs = cluster.xattrs_of(&k).unwrap();
        assert_eq!(xattrs["txn"]["op"]["type"], json!("replace"));
        assert_eq!(xattrs["txn"]["op"]["stgd"], json!({"v": 2}));
        assert_eq!(xattrs["txn"]["id"]["atmpt"], json!(ctx.attempt_id()));
    }
}
