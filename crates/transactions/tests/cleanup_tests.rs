//! Cleanup behavior against the in-memory cluster: unstaging on behalf
//! of absent clients, the CRC32 clobber guard, and the lost-attempts
//! scan.

use atrium_core::subdoc::{MutateInSpec, StoreSemantics};
use atrium_core::testing::MockCluster;
use atrium_core::{DocumentId, DurabilityLevel, KvClient, MutateInRequest};
use atrium_transactions::{atr_ids, AtrCleanupEntry, TransactionConfig, Transactions};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ATTEMPT: &str = "dead-attempt";
const TXN: &str = "dead-txn";

fn doc_id(key: &str) -> DocumentId {
    DocumentId::new("default", "_default", "_default", key)
}

fn quiet_config() -> TransactionConfig {
    TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .build()
}

fn seed(cluster: &MockCluster, id: &DocumentId, body: Value) {
    cluster
        .upsert(id, serde_json::to_vec(&body).unwrap(), DurabilityLevel::None)
        .unwrap();
}

fn live_crc(cluster: &MockCluster, id: &DocumentId) -> u32 {
    let body = cluster.body_of(id).map(|b| serde_json::to_vec(&b).unwrap());
    crc32fast::hash(body.as_deref().unwrap_or(&[]))
}

/// Stage a replace on `id` as the dead client would have.
fn plant_staged_replace(cluster: &MockCluster, id: &DocumentId, staged: Value, crc: u32) {
    let atr_id = atr_ids::atr_id_for(id, None);
    let specs = vec![
        MutateInSpec::dict_upsert("txn.id.txn", serde_json::to_vec(&TXN).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.id.atmpt", serde_json::to_vec(&ATTEMPT).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.id", serde_json::to_vec(&atr_id.key).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.bkt", serde_json::to_vec(&atr_id.bucket).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.coll", b"\"_default._default\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.type", b"\"replace\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.stgd", serde_json::to_vec(&staged).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.crc32", serde_json::to_vec(&crc).unwrap())
            .xattr()
            .create_path(),
    ];
    cluster
        .mutate_in(MutateInRequest::new(
            id.clone(),
            specs,
            DurabilityLevel::None,
        ))
        .unwrap();
}

/// Stage an insert (a tombstone carrying XATTRs) as the dead client
/// would have.
fn plant_staged_insert(cluster: &MockCluster, id: &DocumentId, staged: Value) {
    let atr_id = atr_ids::atr_id_for(id, None);
    let specs = vec![
        MutateInSpec::dict_upsert("txn.id.txn", serde_json::to_vec(&TXN).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.id.atmpt", serde_json::to_vec(&ATTEMPT).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.id", serde_json::to_vec(&atr_id.key).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.bkt", serde_json::to_vec(&atr_id.bucket).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.coll", b"\"_default._default\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.type", b"\"insert\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.stgd", serde_json::to_vec(&staged).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.crc32", b"0".to_vec())
            .xattr()
            .create_path(),
    ];
    let mut req = MutateInRequest::new(id.clone(), specs, DurabilityLevel::None);
    req.store_semantics = StoreSemantics::Insert;
    req.access_deleted = true;
    req.create_as_deleted = true;
    cluster.mutate_in(req).unwrap();
}

/// Record the dead attempt in its ATR with the given status and staged
/// doc lists, started 10 seconds ago with a 10 ms budget.
fn plant_atr_entry(
    cluster: &MockCluster,
    atr_id: &DocumentId,
    status: &str,
    ins: &[&DocumentId],
    rep: &[&DocumentId],
    rem: &[&DocumentId],
) {
    let now_ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let records = |docs: &[&DocumentId]| {
        Value::Array(
            docs.iter()
                .map(|d| {
                    json!({
                        "bucket": d.bucket, "scope": d.scope,
                        "collection": d.collection, "key": d.key,
                    })
                })
                .collect(),
        )
    };
    let prefix = format!("attempts.{ATTEMPT}");
    let specs = vec![
        MutateInSpec::dict_upsert(format!("{prefix}.tid"), serde_json::to_vec(&TXN).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert(
            format!("{prefix}.st"),
            serde_json::to_vec(&status).unwrap(),
        )
        .xattr()
        .create_path(),
        MutateInSpec::dict_upsert(
            format!("{prefix}.tst"),
            serde_json::to_vec(&(now_ns - 10_000_000_000)).unwrap(),
        )
        .xattr()
        .create_path(),
        MutateInSpec::dict_upsert(format!("{prefix}.exp"), b"10".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert(
            format!("{prefix}.ins"),
            serde_json::to_vec(&records(ins)).unwrap(),
        )
        .xattr()
        .create_path(),
        MutateInSpec::dict_upsert(
            format!("{prefix}.rep"),
            serde_json::to_vec(&records(rep)).unwrap(),
        )
        .xattr()
        .create_path(),
        MutateInSpec::dict_upsert(
            format!("{prefix}.rem"),
            serde_json::to_vec(&records(rem)).unwrap(),
        )
        .xattr()
        .create_path(),
    ];
    let mut req = MutateInRequest::new(atr_id.clone(), specs, DurabilityLevel::None);
    req.store_semantics = StoreSemantics::Upsert;
    cluster.mutate_in(req).unwrap();
}

fn cleanup_entry(atr_id: &DocumentId, check_if_expired: bool) -> AtrCleanupEntry {
    AtrCleanupEntry {
        atr_id: atr_id.clone(),
        attempt_id: ATTEMPT.to_string(),
        min_start_time: Instant::now(),
        check_if_expired,
        cached_entry: None,
    }
}

fn atr_attempts(cluster: &MockCluster, atr_id: &DocumentId) -> Value {
    cluster
        .xattrs_of(atr_id)
        .map(|x| x.get("attempts").cloned().unwrap_or(json!({})))
        .unwrap_or(json!({}))
}

#[test]
fn committed_attempt_is_completed_on_the_dead_clients_behalf() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("committed-doc");
    seed(&cluster, &d, json!({"n": 0}));
    let crc = live_crc(&cluster, &d);
    plant_staged_replace(&cluster, &d, json!({"n": 9}), crc);
    let atr_id = atr_ids::atr_id_for(&d, None);
    plant_atr_entry(&cluster, &atr_id, "COMMITTED", &[], &[&d], &[]);

    let transactions = Transactions::new(cluster.clone(), quiet_config());
    transactions
        .cleanup()
        .clean_now(&cleanup_entry(&atr_id, false))
        .unwrap();

    assert_eq!(cluster.body_of(&d), Some(json!({"n": 9})));
    assert_eq!(cluster.xattrs_of(&d), Some(json!({})));
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
}

#[test]
fn crc_mismatch_protects_a_clobbered_document() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("clobbered-doc");
    seed(&cluster, &d, json!({"n": 0}));
    // the stamp disagrees with the live body: someone rewrote the doc
    plant_staged_replace(&cluster, &d, json!({"n": 9}), 0xDEAD_BEEF);
    let atr_id = atr_ids::atr_id_for(&d, None);
    plant_atr_entry(&cluster, &atr_id, "COMMITTED", &[], &[&d], &[]);

    let transactions = Transactions::new(cluster.clone(), quiet_config());
    transactions
        .cleanup()
        .clean_now(&cleanup_entry(&atr_id, false))
        .unwrap();

    // the doc was left alone, only the ATR entry was retired
    assert_eq!(cluster.body_of(&d), Some(json!({"n": 0})));
    assert_ne!(cluster.xattrs_of(&d), Some(json!({})));
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
}

#[test]
fn aborted_attempt_rolls_back_staged_replace_and_insert() {
    let cluster = Arc::new(MockCluster::new());
    let replaced = doc_id("aborted-replace");
    let inserted = doc_id("aborted-insert");
    seed(&cluster, &replaced, json!({"n": 0}));
    let crc = live_crc(&cluster, &replaced);
    plant_staged_replace(&cluster, &replaced, json!({"n": 9}), crc);
    plant_staged_insert(&cluster, &inserted, json!({"v": 1}));
    let atr_id = atr_ids::atr_id_for(&replaced, None);
    plant_atr_entry(&cluster, &atr_id, "ABORTED", &[&inserted], &[&replaced], &[]);

    let transactions = Transactions::new(cluster.clone(), quiet_config());
    transactions
        .cleanup()
        .clean_now(&cleanup_entry(&atr_id, false))
        .unwrap();

    // replaced doc keeps its body, loses its links
    assert_eq!(cluster.body_of(&replaced), Some(json!({"n": 0})));
    assert_eq!(cluster.xattrs_of(&replaced), Some(json!({})));
    // inserted doc stays a tombstone, loses its links
    assert_eq!(cluster.body_of(&inserted), None);
    assert_eq!(cluster.xattrs_of(&inserted), Some(json!({})));
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
}

#[test]
fn committed_staged_remove_is_applied_by_cleanup() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("removed-doc");
    seed(&cluster, &d, json!({"n": 0}));
    let crc = live_crc(&cluster, &d);
    // a staged remove has type "remove" and no staged content
    let atr_id = atr_ids::atr_id_for(&d, None);
    let specs = vec![
        MutateInSpec::dict_upsert("txn.id.txn", serde_json::to_vec(&TXN).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.id.atmpt", serde_json::to_vec(&ATTEMPT).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.id", serde_json::to_vec(&atr_id.key).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.bkt", serde_json::to_vec(&atr_id.bucket).unwrap())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.atr.coll", b"\"_default._default\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.type", b"\"remove\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.op.crc32", serde_json::to_vec(&crc).unwrap())
            .xattr()
            .create_path(),
    ];
    cluster
        .mutate_in(MutateInRequest::new(
            d.clone(),
            specs,
            DurabilityLevel::None,
        ))
        .unwrap();
    plant_atr_entry(&cluster, &atr_id, "COMMITTED", &[], &[], &[&d]);

    let transactions = Transactions::new(cluster.clone(), quiet_config());
    transactions
        .cleanup()
        .clean_now(&cleanup_entry(&atr_id, false))
        .unwrap();

    assert_eq!(cluster.body_of(&d), None, "the staged remove was applied");
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
}

#[test]
fn check_if_expired_skips_a_live_attempt() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("live-doc");
    seed(&cluster, &d, json!({"n": 0}));
    let crc = live_crc(&cluster, &d);
    plant_staged_replace(&cluster, &d, json!({"n": 9}), crc);
    let atr_id = atr_ids::atr_id_for(&d, None);

    // a fresh entry: started now, with a generous budget
    let now_ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let prefix = format!("attempts.{ATTEMPT}");
    let specs = vec![
        MutateInSpec::dict_upsert(format!("{prefix}.st"), b"\"PENDING\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert(
            format!("{prefix}.tst"),
            serde_json::to_vec(&now_ns).unwrap(),
        )
        .xattr()
        .create_path(),
        MutateInSpec::dict_upsert(format!("{prefix}.exp"), b"60000".to_vec())
            .xattr()
            .create_path(),
    ];
    let mut req = MutateInRequest::new(atr_id.clone(), specs, DurabilityLevel::None);
    req.store_semantics = StoreSemantics::Upsert;
    cluster.mutate_in(req).unwrap();

    let transactions = Transactions::new(cluster.clone(), quiet_config());
    transactions
        .cleanup()
        .clean_now(&cleanup_entry(&atr_id, true))
        .unwrap();

    // nothing was touched: the attempt is still within its budget
    assert_ne!(atr_attempts(&cluster, &atr_id), json!({}));
    assert_ne!(cluster.xattrs_of(&d), Some(json!({})));
}

/// The full lost-attempt path: the scanner discovers an expired foreign
/// attempt, queues it, and the background worker retires it.
#[test]
fn lost_scanner_and_worker_converge_on_an_abandoned_attempt() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("abandoned-doc");
    seed(&cluster, &d, json!({"n": 0}));
    let crc = live_crc(&cluster, &d);
    plant_staged_replace(&cluster, &d, json!({"n": 9}), crc);
    let atr_id = atr_ids::atr_id_for(&d, None);
    plant_atr_entry(&cluster, &atr_id, "COMMITTED", &[], &[&d], &[]);

    // worker thread on, periodic scanner off; the scan runs on demand
    let config = TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .cleanup_client_attempts(true)
        .cleanup_lost_attempts(false)
        .build();
    let transactions = Transactions::new(cluster.clone(), config);

    let found = transactions.cleanup().scan_bucket_now("default");
    assert_eq!(found, 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while atr_attempts(&cluster, &atr_id) != json!({}) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
    assert_eq!(cluster.body_of(&d), Some(json!({"n": 9})));
    transactions.close();
}
