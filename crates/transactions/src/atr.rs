//! Active Transaction Record model
//!
//! An ATR is a plain document whose `attempts` XATTR maps attempt ids to
//! entries; the entry's status field is the single source of truth for a
//! transaction's durability boundary. This module reads and parses
//! entries; the writes live with the attempt engine and cleanup, which
//! own their error policies.

use crate::fields;
use crate::forward_compat::ForwardCompat;
use atrium_core::subdoc::DOCUMENT_METADATA_PATH;
use atrium_core::{DocumentId, KvClient, KvError, KvResult, LookupInRequest, LookupInSpec};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Safety margin added to an attempt's declared expiry before anyone
/// treats it as abandoned.
pub const EXPIRY_SAFETY_MARGIN_MS: u64 = 1500;

/// State of one attempt, as recorded in its ATR entry.
///
/// Legal transitions only ever move forward:
/// `NotStarted → Pending → Committed → Completed` and
/// `Pending → Aborted → RolledBack`. Anything else observed on the wire
/// means external tampering or a newer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// No ATR entry exists yet.
    NotStarted,
    /// The entry exists; mutations are being staged.
    Pending,
    /// The commit point has passed; staged content is authoritative.
    Committed,
    /// Unstaging finished and the entry was removed.
    Completed,
    /// Rollback has begun; staged content is being discarded.
    Aborted,
    /// Rollback finished and the entry was removed.
    RolledBack,
}

impl AttemptState {
    /// Wire name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            AttemptState::NotStarted => "NOT_STARTED",
            AttemptState::Pending => "PENDING",
            AttemptState::Committed => "COMMITTED",
            AttemptState::Completed => "COMPLETED",
            AttemptState::Aborted => "ABORTED",
            AttemptState::RolledBack => "ROLLED_BACK",
        }
    }

    /// Parse a wire name.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "NOT_STARTED" => Some(AttemptState::NotStarted),
            "PENDING" => Some(AttemptState::Pending),
            "COMMITTED" => Some(AttemptState::Committed),
            "COMPLETED" => Some(AttemptState::Completed),
            "ABORTED" => Some(AttemptState::Aborted),
            "ROLLED_BACK" => Some(AttemptState::RolledBack),
            _ => None,
        }
    }

    /// Whether `self → next` is a legal forward transition.
    pub fn can_transition_to(&self, next: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, next),
            (NotStarted, Pending)
                | (Pending, Committed)
                | (Pending, Aborted)
                | (Committed, Completed)
                | (Aborted, RolledBack)
        )
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Address of one document, as recorded in an ATR entry's staged lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    /// Bucket name.
    pub bucket: String,
    /// Scope name.
    pub scope: String,
    /// Collection name.
    pub collection: String,
    /// Document key.
    pub key: String,
}

impl From<&DocumentId> for DocRecord {
    fn from(id: &DocumentId) -> Self {
        Self {
            bucket: id.bucket.clone(),
            scope: id.scope.clone(),
            collection: id.collection.clone(),
            key: id.key.clone(),
        }
    }
}

impl DocRecord {
    /// The document id this record names.
    pub fn document_id(&self) -> DocumentId {
        DocumentId::new(
            self.bucket.clone(),
            self.scope.clone(),
            self.collection.clone(),
            self.key.clone(),
        )
    }
}

/// The raw JSON shape of one ATR entry.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawAtrEntry {
    tid: Option<String>,
    st: Option<String>,
    tst: Option<u64>,
    tsc: Option<u64>,
    tsrs: Option<u64>,
    exp: Option<u64>,
    ins: Option<Vec<DocRecord>>,
    rep: Option<Vec<DocRecord>>,
    rem: Option<Vec<DocRecord>>,
    fc: Option<ForwardCompat>,
}

/// One attempt's entry, parsed together with the server "now" observed on
/// the same read (the ATR document's own CAS, a hybrid-logical-clock
/// nanosecond timestamp).
#[derive(Debug, Clone)]
pub struct AtrEntry {
    /// Attempt id keying this entry.
    pub attempt_id: String,
    /// Transaction the attempt belongs to.
    pub transaction_id: Option<String>,
    /// Recorded state.
    pub state: AttemptState,
    /// Start timestamp, milliseconds.
    pub start_ms: Option<u64>,
    /// Start-of-commit timestamp, milliseconds.
    pub start_commit_ms: Option<u64>,
    /// Rollback-start timestamp, milliseconds.
    pub rollback_start_ms: Option<u64>,
    /// Declared expiry budget, milliseconds.
    pub expires_after_ms: Option<u64>,
    /// Docs staged for insert.
    pub inserted: Vec<DocRecord>,
    /// Docs staged for replace.
    pub replaced: Vec<DocRecord>,
    /// Docs staged for remove.
    pub removed: Vec<DocRecord>,
    /// Forward-compatibility block.
    pub forward_compat: Option<ForwardCompat>,
    /// Server now at read time, milliseconds.
    pub now_ms: u64,
}

fn cas_to_ms(cas: u64) -> u64 {
    cas / 1_000_000
}

impl AtrEntry {
    fn from_raw(attempt_id: String, raw: RawAtrEntry, now_cas: u64) -> Self {
        let state = raw
            .st
            .as_deref()
            .and_then(AttemptState::parse)
            .unwrap_or(AttemptState::NotStarted);
        Self {
            attempt_id,
            transaction_id: raw.tid,
            state,
            start_ms: raw.tst.map(cas_to_ms),
            start_commit_ms: raw.tsc.map(cas_to_ms),
            rollback_start_ms: raw.tsrs.map(cas_to_ms),
            expires_after_ms: raw.exp,
            inserted: raw.ins.unwrap_or_default(),
            replaced: raw.rep.unwrap_or_default(),
            removed: raw.rem.unwrap_or_default(),
            forward_compat: raw.fc,
            now_ms: cas_to_ms(now_cas),
        }
    }

    /// Age of the attempt as seen by the server clock, milliseconds.
    pub fn age_ms(&self) -> u64 {
        self.start_ms
            .map(|start| self.now_ms.saturating_sub(start))
            .unwrap_or(0)
    }

    /// Whether the attempt outlived its declared budget plus the safety
    /// margin. Entries without a start timestamp are never expired.
    pub fn has_expired(&self, safety_margin_ms: u64) -> bool {
        match (self.start_ms, self.expires_after_ms) {
            (Some(_), Some(exp)) => self.age_ms() > exp + safety_margin_ms,
            _ => false,
        }
    }
}

/// Read access to ATR documents.
pub struct ActiveTransactionRecord;

impl ActiveTransactionRecord {
    /// Fetch one attempt's entry. `Ok(None)` when the ATR document exists
    /// but holds no entry for the attempt; `Err(DocumentNotFound)` when
    /// the ATR document itself is gone.
    pub fn get_entry<C: KvClient>(
        client: &C,
        atr_id: &DocumentId,
        attempt_id: &str,
    ) -> KvResult<Option<AtrEntry>> {
        let resp = client.lookup_in(LookupInRequest {
            id: atr_id.clone(),
            specs: vec![
                LookupInSpec::get(format!("{}.{}", fields::ATR_FIELD_ATTEMPTS, attempt_id))
                    .xattr(),
                LookupInSpec::get(DOCUMENT_METADATA_PATH).xattr(),
            ],
            access_deleted: false,
        })?;
        let now_cas = parse_now_cas(resp.fields.get(1), resp.cas);
        let Some(Some(raw_bytes)) = resp.fields.first().map(|f| f.as_ref()) else {
            return Ok(None);
        };
        let raw: RawAtrEntry =
            serde_json::from_slice(raw_bytes).map_err(|e| KvError::Other(e.to_string()))?;
        Ok(Some(AtrEntry::from_raw(
            attempt_id.to_string(),
            raw,
            now_cas,
        )))
    }

    /// Fetch every entry on an ATR document. `Ok(empty)` when the document
    /// exists with no attempts; `Err(DocumentNotFound)` when it is gone.
    pub fn get_all<C: KvClient>(client: &C, atr_id: &DocumentId) -> KvResult<Vec<AtrEntry>> {
        let resp = client.lookup_in(LookupInRequest {
            id: atr_id.clone(),
            specs: vec![
                LookupInSpec::get(fields::ATR_FIELD_ATTEMPTS).xattr(),
                LookupInSpec::get(DOCUMENT_METADATA_PATH).xattr(),
            ],
            access_deleted: false,
        })?;
        let now_cas = parse_now_cas(resp.fields.get(1), resp.cas);
        let Some(Some(raw_bytes)) = resp.fields.first().map(|f| f.as_ref()) else {
            return Ok(Vec::new());
        };
        let map: std::collections::HashMap<String, RawAtrEntry> =
            serde_json::from_slice(raw_bytes).map_err(|e| KvError::Other(e.to_string()))?;
        Ok(map
            .into_iter()
            .map(|(attempt_id, raw)| AtrEntry::from_raw(attempt_id, raw, now_cas))
            .collect())
    }
}

fn parse_now_cas(field: Option<&Option<Vec<u8>>>, fallback: u64) -> u64 {
    field
        .and_then(|f| f.as_deref())
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(bytes).ok())
        .and_then(|meta| meta.get("CAS").and_then(|v| v.as_u64()))
        .unwrap_or(fallback)
}
