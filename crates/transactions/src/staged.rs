//! The staged-mutation set
//!
//! The in-memory log of an attempt's pending writes. It answers
//! read-your-own-writes lookups, keeps insertion order for the commit
//! pass, and extracts the doc-record lists written into the ATR entry at
//! commit/abort time. At most one mutation per (document, kind) is ever
//! held; the engine coalesces re-stages of the same document into the
//! existing entry.

use crate::atr::DocRecord;
use crate::links::TransactionGetResult;
use atrium_core::DocumentId;
use std::collections::HashMap;

/// What a staged mutation will do to its document at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagedMutationKind {
    /// The document springs into existence.
    Insert,
    /// The document body is replaced.
    Replace,
    /// The document is removed.
    Remove,
}

/// One pending write.
#[derive(Debug, Clone)]
pub struct StagedMutation {
    /// Snapshot of the document at stage time; its CAS is the staged CAS.
    pub doc: TransactionGetResult,
    /// Content to apply at commit; empty for a remove.
    pub content: Vec<u8>,
    /// Operation kind.
    pub kind: StagedMutationKind,
}

/// Ordered collection of an attempt's staged mutations with O(1) lookup
/// per (document, kind).
#[derive(Default)]
pub struct StagedMutationSet {
    mutations: Vec<StagedMutation>,
    index: HashMap<(DocumentId, StagedMutationKind), usize>,
}

impl StagedMutationSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// No mutations staged yet.
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    fn find(&self, id: &DocumentId, kind: StagedMutationKind) -> Option<&StagedMutation> {
        self.index
            .get(&(id.clone(), kind))
            .map(|&i| &self.mutations[i])
    }

    fn find_mut(
        &mut self,
        id: &DocumentId,
        kind: StagedMutationKind,
    ) -> Option<&mut StagedMutation> {
        let i = *self.index.get(&(id.clone(), kind))?;
        Some(&mut self.mutations[i])
    }

    /// The staged replace for a document, if any.
    pub fn find_replace(&self, id: &DocumentId) -> Option<&StagedMutation> {
        self.find(id, StagedMutationKind::Replace)
    }

    /// The staged insert for a document, if any.
    pub fn find_insert(&self, id: &DocumentId) -> Option<&StagedMutation> {
        self.find(id, StagedMutationKind::Insert)
    }

    /// The staged remove for a document, if any.
    pub fn find_remove(&self, id: &DocumentId) -> Option<&StagedMutation> {
        self.find(id, StagedMutationKind::Remove)
    }

    /// Mutable access to the staged replace, for re-stage coalescing.
    pub fn find_replace_mut(&mut self, id: &DocumentId) -> Option<&mut StagedMutation> {
        self.find_mut(id, StagedMutationKind::Replace)
    }

    /// Mutable access to the staged insert, for re-stage coalescing.
    pub fn find_insert_mut(&mut self, id: &DocumentId) -> Option<&mut StagedMutation> {
        self.find_mut(id, StagedMutationKind::Insert)
    }

    /// Fold a re-stage of `id` into the existing staged replace or
    /// insert, updating its content and CAS in place. Returns false when
    /// there is nothing to fold into and the caller must `add` instead.
    pub fn update_staged_content(&mut self, id: &DocumentId, content: &[u8], cas: u64) -> bool {
        if let Some(existing) = self.find_replace_mut(id) {
            existing.content = content.to_vec();
            existing.doc.cas = cas;
            return true;
        }
        if let Some(existing) = self.find_insert_mut(id) {
            existing.content = content.to_vec();
            existing.doc.cas = cas;
            return true;
        }
        false
    }

    /// Append a mutation. The caller has already coalesced; a second
    /// mutation of the same (document, kind) replaces the first in place.
    pub fn add(&mut self, mutation: StagedMutation) {
        let key = (mutation.doc.id.clone(), mutation.kind);
        match self.index.get(&key) {
            Some(&i) => self.mutations[i] = mutation,
            None => {
                self.index.insert(key, self.mutations.len());
                self.mutations.push(mutation);
            }
        }
    }

    /// Drop the staged insert for a document. Used when a remove follows
    /// an insert inside one attempt: the document never existed outside
    /// the attempt, so both cancel.
    pub fn discard_insert(&mut self, id: &DocumentId) -> Option<StagedMutation> {
        let key = (id.clone(), StagedMutationKind::Insert);
        let removed_at = self.index.remove(&key)?;
        let mutation = self.mutations.remove(removed_at);
        for slot in self.index.values_mut() {
            if *slot > removed_at {
                *slot -= 1;
            }
        }
        Some(mutation)
    }

    /// Iterate in insertion order (the commit/rollback order).
    pub fn iter(&self) -> impl Iterator<Item = &StagedMutation> {
        self.mutations.iter()
    }

    /// The doc-record lists written into the ATR entry: inserted,
    /// replaced, removed.
    pub fn extract_doc_records(&self) -> (Vec<DocRecord>, Vec<DocRecord>, Vec<DocRecord>) {
        let mut inserted = Vec::new();
        let mut replaced = Vec::new();
        let mut removed = Vec::new();
        for mutation in &self.mutations {
            let record = DocRecord::from(&mutation.doc.id);
            match mutation.kind {
                StagedMutationKind::Insert => inserted.push(record),
                StagedMutationKind::Replace => replaced.push(record),
                StagedMutationKind::Remove => removed.push(record),
            }
        }
        (inserted, replaced, removed)
    }
}
