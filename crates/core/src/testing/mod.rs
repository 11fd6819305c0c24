//! In-memory cluster for tests
//!
//! [`MockCluster`] implements the whole transport contract against a
//! process-local map so the transaction suites run hermetically:
//!
//! - documents carry a JSON body, a JSON XATTR tree, a CAS, and a revid
//! - removing a document leaves a tombstone (XATTRs gone, body gone);
//!   tombstones are visible only to `access_deleted` requests
//! - subdocument mutations are atomic: either every spec applies or none
//! - CAS values are hybrid-logical-clock nanoseconds, strictly increasing
//! - the `$document` virtual XATTR exposes CAS, revid, exptime, and the
//!   CRC32 of the current body
//! - `${Mutation.CAS}` and `${Mutation.ValueCRC32c}` macros expand at
//!   write time when a spec asks for expansion

use crate::doc::DocumentId;
use crate::durability::DurabilityLevel;
use crate::error::{KvError, KvResult};
use crate::kv::{
    KvClient, LookupInRequest, LookupInResponse, MutateInRequest, MutateInResponse,
};
use crate::subdoc::{MutateInOp, StoreSemantics, DOCUMENT_METADATA_PATH, MACRO_CAS,
    MACRO_VALUE_CRC32C};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
struct StoredDoc {
    /// `None` is a tombstone.
    body: Option<Value>,
    xattrs: Map<String, Value>,
    cas: u64,
    revid: u64,
    exptime: u32,
}

impl StoredDoc {
    fn is_tombstone(&self) -> bool {
        self.body.is_none()
    }

    fn body_bytes(&self) -> Vec<u8> {
        match &self.body {
            Some(v) => serde_json::to_vec(v).expect("body serializes"),
            None => Vec::new(),
        }
    }

    fn value_crc32(&self) -> u32 {
        crc32fast::hash(&self.body_bytes())
    }

    fn metadata_json(&self) -> Value {
        json!({
            "CAS": self.cas,
            "revid": self.revid,
            "exptime": self.exptime,
            "value_crc32c": self.value_crc32(),
        })
    }
}

/// An in-memory store honoring the [`KvClient`] contract.
pub struct MockCluster {
    docs: Mutex<HashMap<DocumentId, StoredDoc>>,
    last_cas: AtomicU64,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// An empty cluster.
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            last_cas: AtomicU64::new(0),
        }
    }

    /// Next CAS: wall-clock nanoseconds, forced strictly increasing.
    fn next_cas(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos() as u64;
        let prev = self
            .last_cas
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .expect("fetch_update closure never returns None");
        now.max(prev + 1)
    }

    /// The live body of a document, for assertions. `None` when the
    /// document is absent or a tombstone.
    pub fn body_of(&self, id: &DocumentId) -> Option<Value> {
        self.docs.lock().get(id).and_then(|d| d.body.clone())
    }

    /// The XATTR tree of a document, for assertions.
    pub fn xattrs_of(&self, id: &DocumentId) -> Option<Value> {
        self.docs
            .lock()
            .get(id)
            .map(|d| Value::Object(d.xattrs.clone()))
    }

    /// The current CAS of a document, tombstones included.
    pub fn cas_of(&self, id: &DocumentId) -> Option<u64> {
        self.docs.lock().get(id).map(|d| d.cas)
    }

    /// Whether the document exists only as a tombstone.
    pub fn is_tombstone(&self, id: &DocumentId) -> bool {
        self.docs
            .lock()
            .get(id)
            .map(|d| d.is_tombstone())
            .unwrap_or(false)
    }
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('.').collect()
}

fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in split_path(path) {
        cur = cur.as_object()?.get(seg)?;
    }
    Some(cur)
}

fn set_path(
    root: &mut Map<String, Value>,
    path: &str,
    value: Value,
    create_path: bool,
    must_be_absent: bool,
) -> KvResult<()> {
    let segs = split_path(path);
    let mut cur = root;
    for seg in &segs[..segs.len() - 1] {
        if !cur.contains_key(*seg) {
            if !create_path {
                return Err(KvError::PathNotFound);
            }
            cur.insert((*seg).to_string(), Value::Object(Map::new()));
        }
        cur = cur
            .get_mut(*seg)
            .and_then(|v| v.as_object_mut())
            .ok_or(KvError::PathNotFound)?;
    }
    let last = segs[segs.len() - 1];
    if must_be_absent && cur.contains_key(last) {
        return Err(KvError::PathExists);
    }
    cur.insert(last.to_string(), value);
    Ok(())
}

fn remove_path(root: &mut Map<String, Value>, path: &str) -> KvResult<()> {
    let segs = split_path(path);
    let mut cur = root;
    for seg in &segs[..segs.len() - 1] {
        cur = cur
            .get_mut(*seg)
            .and_then(|v| v.as_object_mut())
            .ok_or(KvError::PathNotFound)?;
    }
    cur.remove(segs[segs.len() - 1])
        .map(|_| ())
        .ok_or(KvError::PathNotFound)
}

impl KvClient for MockCluster {
    fn lookup_in(&self, req: LookupInRequest) -> KvResult<LookupInResponse> {
        let docs = self.docs.lock();
        let doc = docs.get(&req.id).ok_or(KvError::DocumentNotFound)?;
        if doc.is_tombstone() && !req.access_deleted {
            return Err(KvError::DocumentNotFound);
        }
        let xattr_root = Value::Object(doc.xattrs.clone());
        let mut fields = Vec::with_capacity(req.specs.len());
        for spec in &req.specs {
            let field = if spec.get_doc {
                doc.body
                    .as_ref()
                    .map(|v| serde_json::to_vec(v).expect("body serializes"))
            } else if spec.xattr && spec.path == DOCUMENT_METADATA_PATH {
                Some(serde_json::to_vec(&doc.metadata_json()).expect("metadata serializes"))
            } else if spec.xattr {
                get_path(&xattr_root, &spec.path)
                    .map(|v| serde_json::to_vec(v).expect("xattr serializes"))
            } else {
                doc.body
                    .as_ref()
                    .and_then(|b| get_path(b, &spec.path))
                    .map(|v| serde_json::to_vec(v).expect("field serializes"))
            };
            fields.push(field);
        }
        Ok(LookupInResponse {
            cas: doc.cas,
            is_deleted: doc.is_tombstone(),
            fields,
        })
    }

    fn mutate_in(&self, req: MutateInRequest) -> KvResult<MutateInResponse> {
        let mut docs = self.docs.lock();
        let existing = docs.get(&req.id);

        let mut doc = match (existing, req.store_semantics) {
            (Some(_), StoreSemantics::Insert) => return Err(KvError::DocumentExists),
            (Some(d), _) => {
                if d.is_tombstone() && !req.access_deleted {
                    return Err(KvError::DocumentNotFound);
                }
                if req.cas != 0 && d.cas != req.cas {
                    return Err(KvError::CasMismatch);
                }
                d.clone()
            }
            (None, StoreSemantics::Replace) => return Err(KvError::DocumentNotFound),
            (None, _) => {
                if req.cas != 0 {
                    return Err(KvError::DocumentNotFound);
                }
                StoredDoc {
                    body: if req.create_as_deleted {
                        None
                    } else {
                        Some(json!({}))
                    },
                    xattrs: Map::new(),
                    cas: 0,
                    revid: 0,
                    exptime: 0,
                }
            }
        };

        // Apply specs to the working copy; macro values are filled in once
        // the final body and the new CAS are known.
        let mut macro_paths: Vec<(String, &'static str)> = Vec::new();
        for spec in &req.specs {
            match spec.op {
                MutateInOp::SetDoc => {
                    let value: Value =
                        serde_json::from_slice(&spec.value).map_err(|_| KvError::Other(
                            "set_doc value is not JSON".to_string(),
                        ))?;
                    doc.body = Some(value);
                }
                MutateInOp::Remove => {
                    if spec.xattr {
                        remove_path(&mut doc.xattrs, &spec.path)?;
                    } else {
                        let body = doc.body.as_mut().ok_or(KvError::PathNotFound)?;
                        let map = body.as_object_mut().ok_or(KvError::PathNotFound)?;
                        let mut owned = std::mem::take(map);
                        let res = remove_path(&mut owned, &spec.path);
                        *map = owned;
                        res?;
                    }
                }
                MutateInOp::DictAdd | MutateInOp::DictUpsert => {
                    let must_be_absent = spec.op == MutateInOp::DictAdd;
                    if spec.expand_macros {
                        let as_str = std::str::from_utf8(&spec.value).unwrap_or("");
                        let trimmed = as_str.trim_matches('"');
                        let kind = if trimmed == MACRO_CAS {
                            MACRO_CAS
                        } else if trimmed == MACRO_VALUE_CRC32C {
                            MACRO_VALUE_CRC32C
                        } else {
                            return Err(KvError::Other(format!(
                                "unknown macro {trimmed:?}"
                            )));
                        };
                        // reserve the slot now so DictAdd still sees clashes
                        set_path(
                            &mut doc.xattrs,
                            &spec.path,
                            Value::Null,
                            spec.create_path,
                            must_be_absent,
                        )?;
                        macro_paths.push((spec.path.clone(), kind));
                    } else {
                        let value: Value = serde_json::from_slice(&spec.value)
                            .map_err(|_| KvError::Other("spec value is not JSON".to_string()))?;
                        if spec.xattr {
                            set_path(
                                &mut doc.xattrs,
                                &spec.path,
                                value,
                                spec.create_path,
                                must_be_absent,
                            )?;
                        } else {
                            let body = doc.body.as_mut().ok_or(KvError::PathNotFound)?;
                            let map = body.as_object_mut().ok_or(KvError::PathNotFound)?;
                            let mut owned = std::mem::take(map);
                            let res =
                                set_path(&mut owned, &spec.path, value, spec.create_path, must_be_absent);
                            *map = owned;
                            res?;
                        }
                    }
                }
            }
        }

        let new_cas = self.next_cas();
        doc.cas = new_cas;
        doc.revid += 1;
        let crc = doc.value_crc32();
        for (path, kind) in macro_paths {
            let value = match kind {
                MACRO_CAS => json!(new_cas),
                _ => json!(crc),
            };
            set_path(&mut doc.xattrs, &path, value, true, false)?;
        }

        docs.insert(req.id, doc);
        Ok(MutateInResponse { cas: new_cas })
    }

    fn insert(
        &self,
        id: &DocumentId,
        value: Vec<u8>,
        _durability: DurabilityLevel,
    ) -> KvResult<u64> {
        let body: Value = serde_json::from_slice(&value)
            .map_err(|_| KvError::Other("insert value is not JSON".to_string()))?;
        let mut docs = self.docs.lock();
        if docs.get(id).map(|d| !d.is_tombstone()).unwrap_or(false) {
            return Err(KvError::DocumentExists);
        }
        let revid = docs.get(id).map(|d| d.revid).unwrap_or(0);
        let cas = self.next_cas();
        docs.insert(
            id.clone(),
            StoredDoc {
                body: Some(body),
                xattrs: Map::new(),
                cas,
                revid: revid + 1,
                exptime: 0,
            },
        );
        Ok(cas)
    }

    fn upsert(
        &self,
        id: &DocumentId,
        value: Vec<u8>,
        _durability: DurabilityLevel,
    ) -> KvResult<u64> {
        let body: Value = serde_json::from_slice(&value)
            .map_err(|_| KvError::Other("upsert value is not JSON".to_string()))?;
        let mut docs = self.docs.lock();
        let revid = docs.get(id).map(|d| d.revid).unwrap_or(0);
        let cas = self.next_cas();
        docs.insert(
            id.clone(),
            StoredDoc {
                body: Some(body),
                xattrs: Map::new(),
                cas,
                revid: revid + 1,
                exptime: 0,
            },
        );
        Ok(cas)
    }

    fn remove(&self, id: &DocumentId, cas: u64, _durability: DurabilityLevel) -> KvResult<u64> {
        let mut docs = self.docs.lock();
        let doc = docs.get_mut(id).ok_or(KvError::DocumentNotFound)?;
        if doc.is_tombstone() {
            return Err(KvError::DocumentNotFound);
        }
        if cas != 0 && doc.cas != cas {
            return Err(KvError::CasMismatch);
        }
        let new_cas = self.next_cas();
        doc.body = None;
        doc.xattrs = Map::new();
        doc.cas = new_cas;
        doc.revid += 1;
        Ok(new_cas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subdoc::{LookupInSpec, MutateInSpec};

    fn id(key: &str) -> DocumentId {
        DocumentId::new("default", "_default", "_default", key)
    }

    fn cluster_with(key: &str, body: Value) -> MockCluster {
        let cluster = MockCluster::new();
        cluster
            .upsert(&id(key), serde_json::to_vec(&body).unwrap(), DurabilityLevel::None)
            .unwrap();
        cluster
    }

    #[test]
    fn lookup_missing_doc_is_not_found() {
        let cluster = MockCluster::new();
        let req = LookupInRequest {
            id: id("nope"),
            specs: vec![LookupInSpec::get_doc()],
            access_deleted: false,
        };
        assert_eq!(cluster.lookup_in(req), Err(KvError::DocumentNotFound));
    }

    #[test]
    fn tombstone_needs_access_deleted() {
        let cluster = cluster_with("d", json!({"a": 1}));
        let cas = cluster.cas_of(&id("d")).unwrap();
        cluster.remove(&id("d"), cas, DurabilityLevel::None).unwrap();

        let hidden = LookupInRequest {
            id: id("d"),
            specs: vec![LookupInSpec::get_doc()],
            access_deleted: false,
        };
        assert_eq!(cluster.lookup_in(hidden), Err(KvError::DocumentNotFound));

        let visible = LookupInRequest {
            id: id("d"),
            specs: vec![LookupInSpec::get_doc()],
            access_deleted: true,
        };
        let resp = cluster.lookup_in(visible).unwrap();
        assert!(resp.is_deleted);
        assert_eq!(resp.fields[0], None);
    }

    #[test]
    fn cas_mismatch_rejects_mutation() {
        let cluster = cluster_with("d", json!({"a": 1}));
        let mut req = MutateInRequest::new(
            id("d"),
            vec![MutateInSpec::dict_upsert("txn.id.txn", b"\"t\"".to_vec())
                .xattr()
                .create_path()],
            DurabilityLevel::None,
        );
        req.cas = 42; // stale
        assert_eq!(cluster.mutate_in(req), Err(KvError::CasMismatch));
    }

    #[test]
    fn mutation_is_atomic_on_spec_failure() {
        let cluster = cluster_with("d", json!({"a": 1}));
        let req = MutateInRequest::new(
            id("d"),
            vec![
                MutateInSpec::dict_upsert("txn.id.txn", b"\"t\"".to_vec())
                    .xattr()
                    .create_path(),
                MutateInSpec::remove("txn.absent").xattr(),
            ],
            DurabilityLevel::None,
        );
        assert_eq!(cluster.mutate_in(req), Err(KvError::PathNotFound));
        // first spec must not have leaked
        assert_eq!(cluster.xattrs_of(&id("d")).unwrap(), json!({}));
    }

    #[test]
    fn cas_macro_expands_to_new_cas() {
        let cluster = cluster_with("d", json!({"a": 1}));
        let req = MutateInRequest::new(
            id("d"),
            vec![MutateInSpec::dict_upsert("txn.ts", format!("\"{MACRO_CAS}\""))
                .xattr()
                .create_path()
                .expand_macros()],
            DurabilityLevel::None,
        );
        let resp = cluster.mutate_in(req).unwrap();
        let xattrs = cluster.xattrs_of(&id("d")).unwrap();
        assert_eq!(xattrs["txn"]["ts"], json!(resp.cas));
    }

    #[test]
    fn crc_macro_tracks_body() {
        let cluster = cluster_with("d", json!({"a": 1}));
        let req = MutateInRequest::new(
            id("d"),
            vec![
                MutateInSpec::dict_upsert("txn.crc", format!("\"{MACRO_VALUE_CRC32C}\""))
                    .xattr()
                    .create_path()
                    .expand_macros(),
            ],
            DurabilityLevel::None,
        );
        cluster.mutate_in(req).unwrap();
        let stamped = cluster.xattrs_of(&id("d")).unwrap()["txn"]["crc"]
            .as_u64()
            .unwrap();
        let live = crc32fast::hash(
            &serde_json::to_vec(&cluster.body_of(&id("d")).unwrap()).unwrap(),
        ) as u64;
        assert_eq!(stamped, live);

        // rewriting the body changes the live crc but not the stamp
        cluster
            .upsert(
                &id("d"),
                serde_json::to_vec(&json!({"a": 2})).unwrap(),
                DurabilityLevel::None,
            )
            .unwrap();
        let live2 = crc32fast::hash(
            &serde_json::to_vec(&cluster.body_of(&id("d")).unwrap()).unwrap(),
        ) as u64;
        assert_ne!(stamped, live2);
    }

    #[test]
    fn create_as_deleted_makes_tombstone_with_xattrs() {
        let cluster = MockCluster::new();
        let mut req = MutateInRequest::new(
            id("staged"),
            vec![MutateInSpec::dict_upsert("txn.op.type", b"\"insert\"".to_vec())
                .xattr()
                .create_path()],
            DurabilityLevel::None,
        );
        req.store_semantics = StoreSemantics::Insert;
        req.access_deleted = true;
        req.create_as_deleted = true;
        cluster.mutate_in(req).unwrap();
        assert!(cluster.is_tombstone(&id("staged")));
        assert_eq!(
            cluster.xattrs_of(&id("staged")).unwrap()["txn"]["op"]["type"],
            json!("insert")
        );
    }

    #[test]
    fn insert_resurrects_tombstone_and_clears_xattrs() {
        let cluster = cluster_with("d", json!({"a": 1}));
        cluster.remove(&id("d"), 0, DurabilityLevel::None).unwrap();
        cluster
            .insert(
                &id("d"),
                serde_json::to_vec(&json!({"b": 2})).unwrap(),
                DurabilityLevel::None,
            )
            .unwrap();
        assert_eq!(cluster.body_of(&id("d")).unwrap(), json!({"b": 2}));
        assert_eq!(cluster.xattrs_of(&id("d")).unwrap(), json!({}));
    }

    #[test]
    fn cas_is_strictly_increasing() {
        let cluster = MockCluster::new();
        let a = cluster
            .upsert(&id("a"), b"{}".to_vec(), DurabilityLevel::None)
            .unwrap();
        let b = cluster
            .upsert(&id("a"), b"{}".to_vec(), DurabilityLevel::None)
            .unwrap();
        assert!(b > a);
    }
}
