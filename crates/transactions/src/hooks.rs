//! Fault-injection hooks
//!
//! A configurable table of named callables consulted at fixed points in
//! the attempt engine and the cleanup path. Each hook either stays silent
//! (`None`) or answers with a synthetic [`ErrorClass`], which then flows
//! through exactly the same error handling as a real transport outcome.
//! Hooks are the only way synthetic errors enter the engine; the default
//! table is entirely empty.

use crate::error::ErrorClass;

/// Stage names consulted by [`AttemptContextHooks::has_expired_client_side`].
/// The set is closed; the engine asks about no other stages.
pub mod stages {
    /// A transactional read.
    pub const STAGE_GET: &str = "STAGE_GET";
    /// Entry into a staged insert.
    pub const STAGE_INSERT: &str = "STAGE_INSERT";
    /// Entry into a staged replace.
    pub const STAGE_REPLACE: &str = "STAGE_REPLACE";
    /// Entry into a staged remove.
    pub const STAGE_REMOVE: &str = "STAGE_REMOVE";
    /// The PENDING write on the ATR.
    pub const STAGE_ATR_PENDING: &str = "STAGE_ATR_PENDING";
    /// The COMMITTED write on the ATR.
    pub const STAGE_ATR_COMMIT: &str = "STAGE_ATR_COMMIT";
    /// The status reread after an ambiguous commit write.
    pub const STAGE_ATR_COMMIT_AMBIGUITY_RESOLUTION: &str =
        "STAGE_ATR_COMMIT_AMBIGUITY_RESOLUTION";
    /// The ABORTED write on the ATR.
    pub const STAGE_ATR_ABORT: &str = "STAGE_ATR_ABORT";
    /// The rollback-completion removal on the ATR.
    pub const STAGE_ATR_ROLLBACK_COMPLETE: &str = "STAGE_ATR_ROLLBACK_COMPLETE";
    /// The completion removal on the ATR.
    pub const STAGE_ATR_COMPLETE: &str = "STAGE_ATR_COMPLETE";
    /// The staged-insert mutation itself (including its conflict loop).
    pub const STAGE_CREATE_STAGED_INSERT: &str = "STAGE_CREATE_STAGED_INSERT";
    /// The last check before the commit sequence starts.
    pub const STAGE_BEFORE_COMMIT: &str = "STAGE_BEFORE_COMMIT";
}

/// A hook taking the affected document key, answering with an optional
/// synthetic error class.
pub type DocHook = Box<dyn Fn(Option<&str>) -> Option<ErrorClass> + Send + Sync>;

/// A hook with no inputs or outputs, called for observation only.
pub type NotifyHook = Box<dyn Fn() + Send + Sync>;

fn fire(hook: &Option<DocHook>, doc_key: Option<&str>) -> Option<ErrorClass> {
    hook.as_ref().and_then(|h| h(doc_key))
}

/// Injection points inside the attempt engine.
///
/// Field names are the stable hook vocabulary; tests address points by
/// name, the engine consults them positionally and never reflectively.
#[derive(Default)]
pub struct AttemptContextHooks {
    /// Before the document lookup in a transactional read.
    pub before_doc_get: Option<DocHook>,
    /// Before the staged-insert mutation is sent.
    pub before_staged_insert: Option<DocHook>,
    /// After the staged-insert mutation succeeded.
    pub after_staged_insert_complete: Option<DocHook>,
    /// Before the staged-replace mutation is sent.
    pub before_staged_replace: Option<DocHook>,
    /// After the staged-replace mutation succeeded.
    pub after_staged_replace_complete: Option<DocHook>,
    /// Before the staged-remove mutation is sent.
    pub before_staged_remove: Option<DocHook>,
    /// After the staged-remove mutation succeeded.
    pub after_staged_remove_complete: Option<DocHook>,
    /// Before the ATR entry is created in PENDING state.
    pub before_atr_pending: Option<DocHook>,
    /// After the ATR entry reached PENDING state.
    pub after_atr_pending: Option<DocHook>,
    /// Before the ATR entry is flipped to COMMITTED.
    pub before_atr_commit: Option<DocHook>,
    /// After the ATR entry reached COMMITTED.
    pub after_atr_commit: Option<DocHook>,
    /// Before the ATR entry is flipped to ABORTED.
    pub before_atr_aborted: Option<DocHook>,
    /// After the ATR entry reached ABORTED.
    pub after_atr_aborted: Option<DocHook>,
    /// Before the ATR entry is flipped to ROLLED_BACK (removed).
    pub before_atr_rolled_back: Option<DocHook>,
    /// After the rollback removal of the ATR entry.
    pub after_atr_rolled_back: Option<DocHook>,
    /// Before the completion removal of the ATR entry.
    pub before_atr_complete: Option<DocHook>,
    /// After the completion removal of the ATR entry.
    pub after_atr_complete: Option<DocHook>,
    /// Before each poll of a foreign ATR entry blocking one of our writes.
    pub before_check_atr_entry_for_blocking_doc: Option<DocHook>,
    /// Before the refetch of an existing document during a contested
    /// staged insert.
    pub before_get_doc_in_exists_during_staged_insert: Option<DocHook>,
    /// Overrides the canonical ATR key choice; the returned key is used
    /// verbatim.
    pub random_atr_id_for_vbucket: Option<Box<dyn Fn() -> Option<String> + Send + Sync>>,
    /// Reports a synthetic client-side expiry at a named stage.
    pub has_expired_client_side: Option<Box<dyn Fn(&str, Option<&str>) -> bool + Send + Sync>>,
}

impl AttemptContextHooks {
    pub(crate) fn before_doc_get(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_doc_get, Some(key))
    }

    pub(crate) fn before_staged_insert(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_staged_insert, Some(key))
    }

    pub(crate) fn after_staged_insert_complete(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.after_staged_insert_complete, Some(key))
    }

    pub(crate) fn before_staged_replace(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_staged_replace, Some(key))
    }

    pub(crate) fn after_staged_replace_complete(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.after_staged_replace_complete, Some(key))
    }

    pub(crate) fn before_staged_remove(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_staged_remove, Some(key))
    }

    pub(crate) fn after_staged_remove_complete(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.after_staged_remove_complete, Some(key))
    }

    pub(crate) fn before_atr_pending(&self) -> Option<ErrorClass> {
        fire(&self.before_atr_pending, None)
    }

    pub(crate) fn after_atr_pending(&self) -> Option<ErrorClass> {
        fire(&self.after_atr_pending, None)
    }

    pub(crate) fn before_atr_commit(&self) -> Option<ErrorClass> {
        fire(&self.before_atr_commit, None)
    }

    pub(crate) fn after_atr_commit(&self) -> Option<ErrorClass> {
        fire(&self.after_atr_commit, None)
    }

    pub(crate) fn before_atr_aborted(&self) -> Option<ErrorClass> {
        fire(&self.before_atr_aborted, None)
    }

    pub(crate) fn after_atr_aborted(&self) -> Option<ErrorClass> {
        fire(&self.after_atr_aborted, None)
    }

    pub(crate) fn before_atr_rolled_back(&self) -> Option<ErrorClass> {
        fire(&self.before_atr_rolled_back, None)
    }

    pub(crate) fn after_atr_rolled_back(&self) -> Option<ErrorClass> {
        fire(&self.after_atr_rolled_back, None)
    }

    pub(crate) fn before_atr_complete(&self) -> Option<ErrorClass> {
        fire(&self.before_atr_complete, None)
    }

    pub(crate) fn after_atr_complete(&self) -> Option<ErrorClass> {
        fire(&self.after_atr_complete, None)
    }

    pub(crate) fn before_check_atr_entry_for_blocking_doc(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_check_atr_entry_for_blocking_doc, Some(key))
    }

    pub(crate) fn before_get_doc_in_exists_during_staged_insert(
        &self,
        key: &str,
    ) -> Option<ErrorClass> {
        fire(&self.before_get_doc_in_exists_during_staged_insert, Some(key))
    }

    pub(crate) fn random_atr_id(&self) -> Option<String> {
        self.random_atr_id_for_vbucket.as_ref().and_then(|h| h())
    }

    pub(crate) fn has_expired_client_side(&self, stage: &str, doc_key: Option<&str>) -> bool {
        self.has_expired_client_side
            .as_ref()
            .map(|h| h(stage, doc_key))
            .unwrap_or(false)
    }
}

/// Injection points inside the cleanup path.
#[derive(Default)]
pub struct CleanupHooks {
    /// Before a committed doc is unstaged by cleanup.
    pub before_commit_doc: Option<DocHook>,
    /// Before an aborted staged insert is removed by cleanup.
    pub before_remove_doc: Option<DocHook>,
    /// Before a committed staged remove is applied by cleanup.
    pub before_remove_doc_staged_for_removal: Option<DocHook>,
    /// Before transactional XATTRs are stripped from a doc by cleanup.
    pub before_remove_links: Option<DocHook>,
    /// Before the attempt's ATR entry is removed by cleanup.
    pub before_atr_remove: Option<DocHook>,
    /// After the per-document pass of one cleanup run.
    pub on_cleanup_docs_completed: Option<NotifyHook>,
    /// After one cleanup run finished entirely.
    pub on_cleanup_completed: Option<NotifyHook>,
}

impl CleanupHooks {
    pub(crate) fn before_commit_doc(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_commit_doc, Some(key))
    }

    pub(crate) fn before_remove_doc(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_remove_doc, Some(key))
    }

    pub(crate) fn before_remove_doc_staged_for_removal(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_remove_doc_staged_for_removal, Some(key))
    }

    pub(crate) fn before_remove_links(&self, key: &str) -> Option<ErrorClass> {
        fire(&self.before_remove_links, Some(key))
    }

    pub(crate) fn before_atr_remove(&self) -> Option<ErrorClass> {
        fire(&self.before_atr_remove, None)
    }

    pub(crate) fn on_cleanup_docs_completed(&self) {
        if let Some(h) = &self.on_cleanup_docs_completed {
            h();
        }
    }

    pub(crate) fn on_cleanup_completed(&self) {
        if let Some(h) = &self.on_cleanup_completed {
            h();
        }
    }
}
