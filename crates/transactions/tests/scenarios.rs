//! End-to-end transaction scenarios against the in-memory cluster.

use atrium_core::testing::MockCluster;
use atrium_core::{DocumentId, DurabilityLevel, KvClient};
use atrium_transactions::{
    AttemptContextHooks, AttemptState, ErrorClass, TransactionConfig, TransactionError,
    TransactionOperationFailed, Transactions,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn doc_id(key: &str) -> DocumentId {
    DocumentId::new("default", "_default", "_default", key)
}

/// A configuration without background cleanup threads, so tests control
/// every side effect.
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

fn body(cluster: &MockCluster, id: &DocumentId) -> Option<Value> {
    cluster.body_of(id)
}

fn atr_attempts(cluster: &MockCluster, atr_id: &DocumentId) -> Value {
    cluster
        .xattrs_of(atr_id)
        .map(|x| x.get("attempts").cloned().unwrap_or(json!({})))
        .unwrap_or(json!({}))
}

#[test]
fn happy_replace_commits_and_retires_atr_entry() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("happy");
    seed(&cluster, &d, json!({"n": 0}));
    let transactions = Transactions::new(cluster.clone(), quiet_config());

    let target = d.clone();
    let result = transactions
        .run(move |ctx| {
            let snapshot = ctx.get(&target)?;
            ctx.replace(&snapshot, br#"{"n":1}"#)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(body(&cluster, &d), Some(json!({"n": 1})));
    assert_eq!(cluster.xattrs_of(&d), Some(json!({})));
    assert!(result.unstaging_complete);
    assert_eq!(result.attempts.len(), 1);
    assert_eq!(result.attempts[0].state, AttemptState::Completed);

    let atr_id = result.atr_id.expect("a mutation elected an atr");
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
}

#[test]
fn concurrent_writers_on_one_doc_serialize() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("counter");
    seed(&cluster, &d, json!({"n": 0}));
    let config = TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .expiration_time(Duration::from_secs(30))
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .build();
    let transactions = Transactions::new(cluster.clone(), config);

    let committed = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let transactions = transactions.clone();
            let committed = Arc::clone(&committed);
            let target = d.clone();
            std::thread::spawn(move || {
                let outcome = transactions.run(move |ctx| {
                    let snapshot = ctx.get(&target)?;
                    let current: Value = serde_json::from_slice(snapshot.content()).map_err(
                        |e| TransactionOperationFailed::application(e.to_string()),
                    )?;
                    let n = current["n"].as_u64().unwrap_or(0);
                    let next = serde_json::to_vec(&json!({ "n": n + 1 })).unwrap();
                    ctx.replace(&snapshot, &next)?;
                    Ok(())
                });
                if outcome.is_ok() {
                    committed.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let committed = committed.load(Ordering::SeqCst);
    let final_n = body(&cluster, &d).unwrap()["n"].as_u64().unwrap();
    assert_eq!(final_n, committed, "every committed increment is visible");
    assert_eq!(committed, 8, "all writers commit within the budget");
}

#[test]
fn insert_then_remove_same_key_in_one_attempt() {
    let cluster = Arc::new(MockCluster::new());
    let k = doc_id("ephemeral");
    let transactions = Transactions::new(cluster.clone(), quiet_config());

    let target = k.clone();
    let result = transactions
        .run(move |ctx| {
            ctx.insert(&target, br#"{"v":1}"#)?;
            let snapshot = ctx.get(&target)?;
            assert_eq!(snapshot.content(), br#"{"v":1}"#);
            ctx.remove(&snapshot)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(body(&cluster, &k), None, "the document never became visible");
    let atr_id = result.atr_id.expect("the insert elected an atr");
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
}

/// A peer staged a replace and crashed; its ATR entry is long expired.
/// A later transaction must see through the stale stage and proceed.
#[test]
fn write_write_conflict_with_expired_peer() {
    use atrium_core::subdoc::{MutateInSpec, StoreSemantics};
    use atrium_core::MutateInRequest;

    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("contested");
    seed(&cluster, &d, json!({"n": 0}));

    let atr_id = atrium_transactions::atr_ids::atr_id_for(&d, None);
    let now_ns = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;

    // the peer's staged replace on D
    let stage_specs = vec![
        MutateInSpec::dict_upsert("txn.id.txn", b"\"peer-txn\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert("txn.id.atmpt", b"\"peer-attempt\"".to_vec())
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
        MutateInSpec::dict_upsert("txn.op.stgd", b"{\"n\":99}".to_vec())
            .xattr()
            .create_path(),
    ];
    cluster
        .mutate_in(MutateInRequest::new(
            d.clone(),
            stage_specs,
            DurabilityLevel::None,
        ))
        .unwrap();

    // the peer's ATR entry: PENDING, started 10 s ago, 10 ms budget
    let prefix = "attempts.peer-attempt";
    let entry_specs = vec![
        MutateInSpec::dict_upsert(format!("{prefix}.tid"), b"\"peer-txn\"".to_vec())
            .xattr()
            .create_path(),
        MutateInSpec::dict_upsert(format!("{prefix}.st"), b"\"PENDING\"".to_vec())
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
            format!("{prefix}.rep"),
            serde_json::to_vec(&json!([{
                "bucket": d.bucket, "scope": d.scope,
                "collection": d.collection, "key": d.key,
            }]))
            .unwrap(),
        )
        .xattr()
        .create_path(),
    ];
    let mut req = MutateInRequest::new(atr_id.clone(), entry_specs, DurabilityLevel::None);
    req.store_semantics = StoreSemantics::Upsert;
    cluster.mutate_in(req).unwrap();

    // transaction B replaces D
    let transactions = Transactions::new(cluster.clone(), quiet_config());
    let target = d.clone();
    transactions
        .run(move |ctx| {
            let snapshot = ctx.get(&target)?;
            ctx.replace(&snapshot, br#"{"n":5}"#)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(body(&cluster, &d), Some(json!({"n": 5})));

    // cleanup retires the peer's abandoned entry
    let entry = atrium_transactions::AtrCleanupEntry {
        atr_id: atr_id.clone(),
        attempt_id: "peer-attempt".to_string(),
        min_start_time: Instant::now(),
        check_if_expired: true,
        cached_entry: None,
    };
    transactions.cleanup().clean_now(&entry).unwrap();
    assert_eq!(atr_attempts(&cluster, &atr_id), json!({}));
    assert_eq!(body(&cluster, &d), Some(json!({"n": 5})));
}

/// One ambiguous outcome on the commit write must not re-run the
/// attempt: the reread shows the commit landed.
#[test]
fn ambiguous_atr_commit_resolves_without_attempt_retry() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("ambiguous");
    seed(&cluster, &d, json!({"n": 0}));

    let fired = Arc::new(AtomicBool::new(false));
    let fired_in_hook = Arc::clone(&fired);
    let mut hooks = AttemptContextHooks::default();
    hooks.after_atr_commit = Some(Box::new(move |_| {
        if fired_in_hook.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(ErrorClass::FailAmbiguous)
        }
    }));
    let config = TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .attempt_context_hooks(hooks)
        .build();
    let transactions = Transactions::new(cluster.clone(), config);

    let target = d.clone();
    let result = transactions
        .run(move |ctx| {
            let snapshot = ctx.get(&target)?;
            ctx.replace(&snapshot, br#"{"n":1}"#)?;
            Ok(())
        })
        .unwrap();

    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(result.attempts.len(), 1, "no attempt retry");
    assert_eq!(body(&cluster, &d), Some(json!({"n": 1})));
}

#[test]
fn expiry_during_replace_surfaces_expired_and_leaves_doc_untouched() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("slow");
    seed(&cluster, &d, json!({"n": 0}));
    let config = TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .expiration_time(Duration::from_millis(50))
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .build();
    let transactions = Transactions::new(cluster.clone(), config);

    let target = d.clone();
    let err = transactions
        .run(move |ctx| {
            let snapshot = ctx.get(&target)?;
            std::thread::sleep(Duration::from_millis(200));
            ctx.replace(&snapshot, br#"{"n":1}"#)?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, TransactionError::Expired { .. }), "{err}");
    assert_eq!(body(&cluster, &d), Some(json!({"n": 0})));
    assert_eq!(cluster.xattrs_of(&d), Some(json!({})));
}

#[test]
fn transient_failure_retries_with_a_fresh_attempt() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("flaky");
    seed(&cluster, &d, json!({"n": 0}));

    let fired = Arc::new(AtomicBool::new(false));
    let fired_in_hook = Arc::clone(&fired);
    let mut hooks = AttemptContextHooks::default();
    hooks.before_staged_replace = Some(Box::new(move |_| {
        if fired_in_hook.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(ErrorClass::FailTransient)
        }
    }));
    let config = TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .attempt_context_hooks(hooks)
        .build();
    let transactions = Transactions::new(cluster.clone(), config);

    let target = d.clone();
    let result = transactions
        .run(move |ctx| {
            let snapshot = ctx.get(&target)?;
            ctx.replace(&snapshot, br#"{"n":1}"#)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(result.attempts.len(), 2);
    assert_eq!(result.attempts[0].state, AttemptState::RolledBack);
    assert_eq!(result.attempts[1].state, AttemptState::Completed);
    assert_eq!(body(&cluster, &d), Some(json!({"n": 1})));
}

#[test]
fn reads_see_own_staged_writes() {
    let cluster = Arc::new(MockCluster::new());
    let existing = doc_id("existing");
    let fresh = doc_id("fresh");
    seed(&cluster, &existing, json!({"v": "old"}));
    let transactions = Transactions::new(cluster.clone(), quiet_config());

    let (existing_id, fresh_id) = (existing.clone(), fresh.clone());
    transactions
        .run(move |ctx| {
            ctx.insert(&fresh_id, br#"{"v":"new"}"#)?;
            assert_eq!(ctx.get(&fresh_id)?.content(), br#"{"v":"new"}"#);

            let snapshot = ctx.get(&existing_id)?;
            ctx.replace(&snapshot, br#"{"v":"updated"}"#)?;
            assert_eq!(ctx.get(&existing_id)?.content(), br#"{"v":"updated"}"#);

            let snapshot = ctx.get(&existing_id)?;
            ctx.remove(&snapshot)?;
            assert!(ctx.get_optional(&existing_id)?.is_none());
            Ok(())
        })
        .unwrap();

    assert_eq!(body(&cluster, &fresh), Some(json!({"v": "new"})));
    assert_eq!(body(&cluster, &existing), None);
}

#[test]
fn insert_over_live_document_fails_without_retry() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("occupied");
    seed(&cluster, &d, json!({"v": 1}));
    let transactions = Transactions::new(cluster.clone(), quiet_config());

    let target = d.clone();
    let err = transactions
        .run(move |ctx| {
            ctx.insert(&target, br#"{"v":2}"#)?;
            Ok(())
        })
        .unwrap_err();

    match &err {
        TransactionError::Failed { result, .. } => {
            assert_eq!(result.attempts.len(), 1, "no retry for a live duplicate");
        }
        other => panic!("expected Failed, got {other}"),
    }
    assert_eq!(body(&cluster, &d), Some(json!({"v": 1})));
}

#[test]
fn staged_writes_stay_invisible_until_commit() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("invisible");
    seed(&cluster, &d, json!({"n": 0}));

    // park the attempt right before its ATR flips to committed, so the
    // staged write is observable from outside
    let cluster_for_hook = Arc::clone(&cluster);
    let observed = Arc::new(parking_lot::Mutex::new(None));
    let observed_in_hook = Arc::clone(&observed);
    let probe = d.clone();
    let mut hooks = AttemptContextHooks::default();
    hooks.before_atr_commit = Some(Box::new(move |_| {
        *observed_in_hook.lock() = cluster_for_hook.body_of(&probe);
        None
    }));
    let config = TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .attempt_context_hooks(hooks)
        .build();
    let transactions = Transactions::new(cluster.clone(), config);

    let target = d.clone();
    transactions
        .run(move |ctx| {
            let snapshot = ctx.get(&target)?;
            ctx.replace(&snapshot, br#"{"n":1}"#)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(
        observed.lock().clone(),
        Some(json!({"n": 0})),
        "the visible body is untouched while staged"
    );
    assert_eq!(body(&cluster, &d), Some(json!({"n": 1})));
}

#[test]
fn callback_api_delivers_the_outcome_off_thread() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("callback");
    seed(&cluster, &d, json!({"n": 0}));
    let transactions = Transactions::new(cluster.clone(), quiet_config());

    let (tx, rx) = std::sync::mpsc::channel();
    let target = d.clone();
    transactions.run_with_callback(
        move |ctx| {
            let snapshot = ctx.get(&target)?;
            ctx.replace(&snapshot, br#"{"n":1}"#)?;
            Ok(())
        },
        move |outcome| {
            tx.send(outcome).unwrap();
        },
    );
    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("callback fires")
        .unwrap();
    assert!(result.unstaging_complete);
    assert_eq!(body(&cluster, &d), Some(json!({"n": 1})));
}

#[test]
fn expiry_bounds_total_runtime_of_hopeless_retries() {
    let cluster = Arc::new(MockCluster::new());
    let d = doc_id("hopeless");
    seed(&cluster, &d, json!({"n": 0}));
    let config = TransactionConfig::builder()
        .durability_level(DurabilityLevel::None)
        .expiration_time(Duration::from_millis(200))
        .cleanup_client_attempts(false)
        .cleanup_lost_attempts(false)
        .build();
    let transactions = Transactions::new(cluster.clone(), config);

    let start = Instant::now();
    let err = transactions
        .run(move |_ctx| {
            Err(TransactionOperationFailed::new(
                ErrorClass::FailTransient,
                "synthetic contention",
            )
            .retry())
        })
        .unwrap_err();

    assert!(matches!(err, TransactionError::Expired { .. }), "{err}");
    assert!(
        start.elapsed() < Duration::from_secs(4),
        "retries stop shortly after the budget"
    );
    assert!(err.result().attempts.len() > 1, "it did retry first");
}
