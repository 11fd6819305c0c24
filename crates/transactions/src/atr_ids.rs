//! ATR addressing
//!
//! Every transaction registers with exactly one Active Transaction Record,
//! chosen from the key of its first mutated document: the key hashes to a
//! vbucket with the store's own partitioning function, and each of the
//! 1024 vbuckets owns one canonical ATR key. Hashing the ATR key itself
//! lands on the same vbucket, so an ATR always lives on the partition of
//! the documents that elect it, and ATR load spreads across the cluster.

use atrium_core::DocumentId;
use std::sync::LazyLock;

/// Number of vbuckets in the partition map.
pub const NUM_VBUCKETS: u16 = 1024;

/// The store's key partitioning function: top 15 bits of the CRC32 of the
/// key bytes, folded onto the vbucket count.
pub fn vbucket_for_key(key: &str) -> u16 {
    let crc = crc32fast::hash(key.as_bytes());
    (((crc >> 16) & 0x7fff) % NUM_VBUCKETS as u32) as u16
}

/// Canonical ATR keys, one per vbucket. Each key is the lowest-suffix
/// `_txn:atr-<vb>-#<suffix>` that hashes back onto its own vbucket, so the
/// table is identical for every client that computes it.
static ATR_KEYS: LazyLock<Vec<String>> = LazyLock::new(|| {
    (0..NUM_VBUCKETS)
        .map(|vb| {
            (0u32..)
                .map(|suffix| format!("_txn:atr-{vb}-#{suffix:x}"))
                .find(|key| vbucket_for_key(key) == vb)
                .expect("some suffix hashes onto every vbucket")
        })
        .collect()
});

/// The canonical ATR key owned by a vbucket.
pub fn atr_key_for_vbucket(vbucket: u16) -> &'static str {
    &ATR_KEYS[vbucket as usize]
}

/// The ATR document elected by a document key: the canonical key for the
/// key's vbucket, homed in the document's bucket under `_default._default`
/// unless `metadata_collection` overrides the home.
pub fn atr_id_for(doc_id: &DocumentId, metadata_collection: Option<&DocumentId>) -> DocumentId {
    let key = atr_key_for_vbucket(vbucket_for_key(&doc_id.key));
    match metadata_collection {
        Some(home) => DocumentId::new(
            home.bucket.clone(),
            home.scope.clone(),
            home.collection.clone(),
            key,
        ),
        None => DocumentId::new(doc_id.bucket.clone(), "_default", "_default", key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_canonical_key_hashes_onto_its_vbucket() {
        for vb in 0..NUM_VBUCKETS {
            assert_eq!(vbucket_for_key(atr_key_for_vbucket(vb)), vb, "vbucket {vb}");
        }
    }

    #[test]
    fn same_key_always_elects_same_atr() {
        let id = DocumentId::new("b", "s", "c", "some-doc-key");
        let a = atr_id_for(&id, None);
        let b = atr_id_for(&id, None);
        assert_eq!(a, b);
        assert_eq!(a.bucket, "b");
        assert_eq!(a.scope, "_default");
        assert_eq!(a.collection, "_default");
    }

    #[test]
    fn metadata_collection_overrides_home() {
        let id = DocumentId::new("b", "s", "c", "k");
        let home = DocumentId::new("meta", "txn", "records", "");
        let atr = atr_id_for(&id, Some(&home));
        assert_eq!(atr.bucket, "meta");
        assert_eq!(atr.scope, "txn");
        assert_eq!(atr.collection, "records");
        assert_eq!(atr.key, atr_id_for(&id, None).key);
    }

    #[test]
    fn keys_spread_over_many_vbuckets() {
        let distinct: std::collections::HashSet<u16> = (0..200)
            .map(|n| vbucket_for_key(&format!("doc-{n}")))
            .collect();
        assert!(distinct.len() > 100);
    }
}
