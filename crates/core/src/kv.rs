//! The transport contract
//!
//! The transactions runtime consumes exactly four request kinds from the
//! underlying client: subdocument lookups, subdocument mutations, and
//! full-document insert/upsert/remove. Connection pooling, dispatch, and
//! serialization live behind this trait; implementations must be safe to
//! call from multiple threads.

use crate::doc::DocumentId;
use crate::durability::DurabilityLevel;
use crate::error::KvResult;
use crate::subdoc::{LookupInSpec, MutateInSpec, StoreSemantics};

/// A subdocument lookup.
#[derive(Debug, Clone)]
pub struct LookupInRequest {
    /// Target document.
    pub id: DocumentId,
    /// Paths to read, answered in order.
    pub specs: Vec<LookupInSpec>,
    /// Allow reading a tombstone's XATTRs.
    pub access_deleted: bool,
}

/// One field of a lookup response. `None` means the path was absent.
pub type LookupInField = Option<Vec<u8>>;

/// Response to a [`LookupInRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct LookupInResponse {
    /// Document CAS at read time.
    pub cas: u64,
    /// The document is a tombstone.
    pub is_deleted: bool,
    /// One entry per request spec, in request order.
    pub fields: Vec<LookupInField>,
}

/// A subdocument mutation.
#[derive(Debug, Clone)]
pub struct MutateInRequest {
    /// Target document.
    pub id: DocumentId,
    /// Mutations applied atomically, in order.
    pub specs: Vec<MutateInSpec>,
    /// Expected CAS; 0 skips the check.
    pub cas: u64,
    /// Whole-document create/exist requirement.
    pub store_semantics: StoreSemantics,
    /// Allow mutating a tombstone's XATTRs.
    pub access_deleted: bool,
    /// When the mutation creates the document, create it as a tombstone
    /// (XATTRs only, no visible body).
    pub create_as_deleted: bool,
    /// Durability required for this write.
    pub durability: DurabilityLevel,
}

impl MutateInRequest {
    /// A mutation request with default flags (replace semantics, CAS
    /// unchecked, live documents only).
    pub fn new(id: DocumentId, specs: Vec<MutateInSpec>, durability: DurabilityLevel) -> Self {
        Self {
            id,
            specs,
            cas: 0,
            store_semantics: StoreSemantics::Replace,
            access_deleted: false,
            create_as_deleted: false,
            durability,
        }
    }
}

/// Response to a successful mutation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MutateInResponse {
    /// CAS assigned by the mutation.
    pub cas: u64,
}

/// The four request kinds the runtime needs from the store.
///
/// All calls are synchronous from the caller's point of view; a transport
/// backed by a non-blocking connection completes the request internally
/// and returns the classified outcome.
pub trait KvClient: Send + Sync + 'static {
    /// Read paths from a document (optionally a tombstone).
    fn lookup_in(&self, req: LookupInRequest) -> KvResult<LookupInResponse>;

    /// Atomically mutate paths in a document.
    fn mutate_in(&self, req: MutateInRequest) -> KvResult<MutateInResponse>;

    /// Create a document that must not exist as a live document. Returns
    /// the new CAS.
    fn insert(&self, id: &DocumentId, value: Vec<u8>, durability: DurabilityLevel)
        -> KvResult<u64>;

    /// Create or replace a document unconditionally. Returns the new CAS.
    fn upsert(&self, id: &DocumentId, value: Vec<u8>, durability: DurabilityLevel)
        -> KvResult<u64>;

    /// Remove a live document, leaving a tombstone. A non-zero `cas` makes
    /// the removal conditional. Returns the tombstone's CAS.
    fn remove(&self, id: &DocumentId, cas: u64, durability: DurabilityLevel) -> KvResult<u64>;
}
