//! Transactional read results
//!
//! A transactional read fetches the document body together with the whole
//! `txn.` XATTR block and the server's `$document` metadata in one
//! subdocument lookup. [`TransactionLinks`] is the parsed XATTR block:
//! who staged what on this document, where its ATR lives, and what the
//! pre-transaction restoration data was. [`TransactionGetResult`] is the
//! snapshot handed to the user closure and to the staged-mutation set.

use crate::fields;
use crate::forward_compat::ForwardCompat;
use atrium_core::subdoc::DOCUMENT_METADATA_PATH;
use atrium_core::{
    DocumentId, KvClient, KvResult, LookupInField, LookupInRequest, LookupInResponse, LookupInSpec,
};
use serde::Deserialize;

/// Pre-transaction restoration metadata staged alongside a replace or
/// remove.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestoreMetadata {
    /// CAS before staging.
    #[serde(rename = "CAS")]
    pub cas: Option<u64>,
    /// Revid before staging.
    pub revid: Option<u64>,
    /// Expiry before staging.
    pub exptime: Option<u64>,
}

/// Server-side document metadata from the `$document` virtual XATTR.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentMetadata {
    /// Current CAS.
    #[serde(rename = "CAS")]
    pub cas: Option<u64>,
    /// Current revid.
    pub revid: Option<u64>,
    /// Current expiry.
    pub exptime: Option<u64>,
    /// CRC32 of the current document value.
    pub value_crc32c: Option<u32>,
}

/// The transactional XATTR block of one document, parsed.
#[derive(Debug, Clone, Default)]
pub struct TransactionLinks {
    /// Key of the ATR the staging attempt registered with.
    pub atr_key: Option<String>,
    /// Bucket of that ATR.
    pub atr_bucket: Option<String>,
    /// `scope.collection` of that ATR.
    pub atr_collection_spec: Option<String>,
    /// Transaction that staged the write.
    pub staged_transaction_id: Option<String>,
    /// Attempt that staged the write.
    pub staged_attempt_id: Option<String>,
    /// The staged content.
    pub staged_content: Option<Vec<u8>>,
    /// Staged operation kind: `"insert"`, `"replace"`, or `"remove"`.
    pub op: Option<String>,
    /// CRC32 of the document value stamped at stage time.
    pub crc32_of_staging: Option<u32>,
    /// Pre-transaction restoration data.
    pub restore: Option<RestoreMetadata>,
    /// Forward-compatibility block.
    pub forward_compat: Option<ForwardCompat>,
    /// The document was a tombstone when read.
    pub is_deleted: bool,
}

impl TransactionLinks {
    /// A staging attempt has marked this document.
    pub fn is_document_in_transaction(&self) -> bool {
        self.atr_key.is_some()
    }

    /// The document carries a foreign or own staged write.
    pub fn has_staged_write(&self) -> bool {
        self.staged_attempt_id.is_some()
    }

    /// The staged operation removes the document at commit.
    pub fn is_document_being_removed(&self) -> bool {
        self.op.as_deref() == Some("remove")
    }

    /// There is staged content to apply at commit.
    pub fn has_staged_content(&self) -> bool {
        self.staged_content.is_some()
    }

    /// Full id of the ATR behind the staged write, when every segment is
    /// present.
    pub fn atr_document_id(&self) -> Option<DocumentId> {
        let key = self.atr_key.as_ref()?;
        let bucket = self.atr_bucket.as_ref()?;
        let spec = self.atr_collection_spec.as_deref().unwrap_or("_default._default");
        let (scope, collection) = spec.split_once('.').unwrap_or(("_default", "_default"));
        Some(DocumentId::new(bucket.clone(), scope, collection, key.clone()))
    }
}

/// A read snapshot of one document inside an attempt.
#[derive(Debug, Clone)]
pub struct TransactionGetResult {
    /// Document address.
    pub id: DocumentId,
    /// CAS observed at read (or re-stage) time.
    pub cas: u64,
    /// Visible content; `None` for a tombstone.
    pub content: Option<Vec<u8>>,
    /// Parsed transactional XATTR block.
    pub links: TransactionLinks,
    /// Server document metadata, when the read fetched it.
    pub metadata: Option<DocumentMetadata>,
}

impl TransactionGetResult {
    /// The visible content, or an error-friendly empty slice.
    pub fn content(&self) -> &[u8] {
        self.content.as_deref().unwrap_or(&[])
    }

    /// Replace the snapshot's content (used when the staged content is
    /// what the reader must see).
    pub(crate) fn with_content(mut self, content: Option<Vec<u8>>) -> Self {
        self.content = content;
        self
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(field: Option<&LookupInField>) -> Option<T> {
    field
        .and_then(|f| f.as_deref())
        .and_then(|bytes| serde_json::from_slice(bytes).ok())
}

/// The fixed lookup shape of a transactional read: the whole `txn.`
/// block, the server metadata, and the body, in this order.
pub(crate) fn transactional_lookup_specs() -> Vec<LookupInSpec> {
    vec![
        LookupInSpec::get(fields::ATR_ID).xattr(),
        LookupInSpec::get(fields::TRANSACTION_ID).xattr(),
        LookupInSpec::get(fields::ATTEMPT_ID).xattr(),
        LookupInSpec::get(fields::STAGED_DATA).xattr(),
        LookupInSpec::get(fields::ATR_BUCKET_NAME).xattr(),
        LookupInSpec::get(fields::ATR_COLL_NAME).xattr(),
        LookupInSpec::get(fields::TRANSACTION_RESTORE_PREFIX).xattr(),
        LookupInSpec::get(fields::TYPE).xattr(),
        LookupInSpec::get(DOCUMENT_METADATA_PATH).xattr(),
        LookupInSpec::get(fields::CRC32_OF_STAGING).xattr(),
        LookupInSpec::get(fields::FORWARD_COMPAT).xattr(),
        LookupInSpec::get_doc(),
    ]
}

impl TransactionGetResult {
    /// Parse a transactional lookup response.
    pub(crate) fn from_lookup(id: DocumentId, resp: &LookupInResponse) -> Self {
        let f = &resp.fields;
        let links = TransactionLinks {
            atr_key: parse_json(f.first()),
            staged_transaction_id: parse_json(f.get(1)),
            staged_attempt_id: parse_json(f.get(2)),
            staged_content: f.get(3).and_then(|v| v.clone()),
            atr_bucket: parse_json(f.get(4)),
            atr_collection_spec: parse_json(f.get(5)),
            restore: parse_json(f.get(6)),
            op: parse_json(f.get(7)),
            crc32_of_staging: parse_json(f.get(9)),
            forward_compat: parse_json(f.get(10)),
            is_deleted: resp.is_deleted,
        };
        let metadata: Option<DocumentMetadata> = parse_json(f.get(8));
        TransactionGetResult {
            id,
            cas: resp.cas,
            content: f.get(11).and_then(|v| v.clone()),
            links,
            metadata,
        }
    }
}

/// One transactional lookup with access to tombstones.
pub(crate) fn fetch_transactional<C: KvClient>(
    client: &C,
    id: &DocumentId,
) -> KvResult<TransactionGetResult> {
    let resp = client.lookup_in(LookupInRequest {
        id: id.clone(),
        specs: transactional_lookup_specs(),
        access_deleted: true,
    })?;
    Ok(TransactionGetResult::from_lookup(id.clone(), &resp))
}
