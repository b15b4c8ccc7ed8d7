// transaction_tests.rs
// Multi-document transactions, prepare, and concurrent writers

mod helpers;

use helpers::{fails, first_batch, ids, in_txn, ok};
use quarry_core::Engine;
use serde_json::json;
use std::sync::{mpsc, Barrier};
use std::thread;
use std::time::Duration;

// ========== CONCURRENT WRITERS ==========

#[test]
fn test_concurrent_unique_inserts_one_duplicate() {
    let engine = Engine::in_memory();
    ok(
        &engine,
        json!({"createIndexes": "users", "indexes": [{"key": {"email": 1}, "name": "email_1", "unique": true}]}),
    );

    let barrier = Barrier::new(2);
    let replies: Vec<serde_json::Value> = thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|i| {
                let engine = &engine;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    engine.execute(&json!({
                        "insert": "users",
                        "documents": [{"_id": i, "email": "same@example.com"}],
                    }))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let inserted: i64 = replies.iter().map(|r| r["n"].as_i64().unwrap()).sum();
    assert_eq!(inserted, 1);
    let duplicates: Vec<_> = replies
        .iter()
        .filter_map(|r| r["writeErrors"].as_array())
        .flatten()
        .collect();
    assert_eq!(duplicates.len(), 1, "replies: {:?}", replies);
    assert_eq!(duplicates[0]["code"], 11000);
    assert_eq!(duplicates[0]["keyValue"], json!({"email": "same@example.com"}));

    let reply = ok(&engine, json!({"count": "users"}));
    assert_eq!(reply["n"], 1);
}

#[test]
fn test_concurrent_increments_are_not_lost() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"insert": "counters", "documents": [{"_id": "c", "v": 0}]}));

    let threads = 4;
    let per_thread = 25;
    let barrier = Barrier::new(threads);
    thread::scope(|scope| {
        for _ in 0..threads {
            let engine = &engine;
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for _ in 0..per_thread {
                    let reply = engine.execute(&json!({
                        "update": "counters",
                        "updates": [{"q": {"_id": "c"}, "u": {"$inc": {"v": 1}}}],
                    }));
                    assert_eq!(reply["nModified"], 1, "{}", reply);
                }
            });
        }
    });

    let reply = ok(&engine, json!({"find": "counters"}));
    assert_eq!(first_batch(&reply)[0]["v"], (threads * per_thread) as i64);
}

// ========== PREPARED TRANSACTIONS ==========

#[test]
fn test_prepared_transaction_blocks_conflicting_insert() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"create": "c"}));

    ok(&engine, in_txn(json!({"insert": "c", "documents": [{"_id": 1, "from": "t1"}]}), "s1", 1, true));
    let prepared = ok(&engine, in_txn(json!({"prepareTransaction": 1}), "s1", 1, false));
    assert!(prepared["prepareTimestamp"].as_i64().unwrap() > 0);

    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        let engine = &engine;
        scope.spawn(move || {
            let reply = engine.execute(&json!({"insert": "c", "documents": [{"_id": 1, "from": "t2"}]}));
            tx.send(reply).unwrap();
        });

        // T2 waits on the prepared T1.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        ok(engine, in_txn(json!({"abortTransaction": 1}), "s1", 1, false));
        let reply = rx.recv_timeout(Duration::from_secs(10)).expect("insert finished after abort");
        assert_eq!(reply["ok"], 1.0, "{}", reply);
        assert_eq!(reply["n"], 1);
    });

    let reply = ok(&engine, json!({"find": "c"}));
    assert_eq!(first_batch(&reply), vec![json!({"_id": 1, "from": "t2"})]);
}

#[test]
fn test_prepared_commit_needs_timestamp() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"create": "c"}));
    ok(&engine, in_txn(json!({"insert": "c", "documents": [{"_id": 1}]}), "s1", 1, true));
    let prepared = ok(&engine, in_txn(json!({"prepareTransaction": 1}), "s1", 1, false));
    let prepare_ts = prepared["prepareTimestamp"].as_i64().unwrap();

    fails(&engine, in_txn(json!({"commitTransaction": 1}), "s1", 1, false), "InvalidOptions");
    fails(
        &engine,
        in_txn(json!({"insert": "c", "documents": [{"_id": 2}]}), "s1", 1, false),
        "PreparedTransactionInProgress",
    );

    let reply = ok(
        &engine,
        in_txn(json!({"commitTransaction": 1, "commitTimestamp": prepare_ts + 1}), "s1", 1, false),
    );
    assert_eq!(reply["commitTimestamp"], prepare_ts + 1);
    let reply = ok(&engine, json!({"find": "c"}));
    assert_eq!(ids(&first_batch(&reply)), vec![1]);
}

// ========== ISOLATION ==========

#[test]
fn test_transaction_reads_its_snapshot() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"insert": "c", "documents": [{"_id": 1}, {"_id": 2}]}));

    let reply = ok(&engine, in_txn(json!({"find": "c", "sort": {"_id": 1}}), "s1", 1, true));
    assert_eq!(ids(&first_batch(&reply)), vec![1, 2]);

    ok(&engine, json!({"insert": "c", "documents": [{"_id": 3}]}));
    ok(&engine, json!({"delete": "c", "deletes": [{"q": {"_id": 1}, "limit": 1}]}));

    let reply = ok(&engine, in_txn(json!({"find": "c", "sort": {"_id": 1}}), "s1", 1, false));
    assert_eq!(ids(&first_batch(&reply)), vec![1, 2]);
    ok(&engine, in_txn(json!({"commitTransaction": 1}), "s1", 1, false));

    let reply = ok(&engine, json!({"find": "c", "sort": {"_id": 1}}));
    assert_eq!(ids(&first_batch(&reply)), vec![2, 3]);
}

#[test]
fn test_conflicting_write_in_transaction_is_transient() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"insert": "c", "documents": [{"_id": 1, "v": 0}]}));

    ok(
        &engine,
        in_txn(json!({"update": "c", "updates": [{"q": {"_id": 1}, "u": {"$set": {"v": 1}}}]}), "s1", 1, true),
    );
    let reply = fails(
        &engine,
        in_txn(json!({"update": "c", "updates": [{"q": {"_id": 1}, "u": {"$set": {"v": 2}}}]}), "s2", 1, true),
        "WriteConflict",
    );
    assert_eq!(reply["errorLabels"], json!(["TransientTransactionError"]));

    // The failed transaction was aborted; s1 still commits.
    fails(&engine, in_txn(json!({"commitTransaction": 1}), "s2", 1, false), "NoSuchTransaction");
    ok(&engine, in_txn(json!({"commitTransaction": 1}), "s1", 1, false));
    let reply = ok(&engine, json!({"find": "c"}));
    assert_eq!(first_batch(&reply)[0]["v"], 1);
}

#[test]
fn test_abort_discards_every_write() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"insert": "c", "documents": [{"_id": 1, "v": 0}]}));
    ok(
        &engine,
        json!({"createIndexes": "c", "indexes": [{"key": {"v": 1}, "name": "v_1"}]}),
    );

    ok(&engine, in_txn(json!({"insert": "c", "documents": [{"_id": 2, "v": 5}]}), "s1", 7, true));
    ok(
        &engine,
        in_txn(json!({"update": "c", "updates": [{"q": {"_id": 1}, "u": {"$set": {"v": 9}}}]}), "s1", 7, false),
    );
    ok(&engine, in_txn(json!({"abortTransaction": 1}), "s1", 7, false));

    let reply = ok(&engine, json!({"find": "c", "filter": {"v": {"$gte": 0}}}));
    assert_eq!(first_batch(&reply), vec![json!({"_id": 1, "v": 0})]);

    // A later transaction number on the same session starts fresh.
    ok(&engine, in_txn(json!({"insert": "c", "documents": [{"_id": 2, "v": 5}]}), "s1", 8, true));
    ok(&engine, in_txn(json!({"commitTransaction": 1}), "s1", 8, false));
    let reply = ok(&engine, json!({"count": "c"}));
    assert_eq!(reply["n"], 2);
}

#[test]
fn test_read_at_cluster_time() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"insert": "c", "documents": [{"_id": 1, "v": 0}]}));
    ok(
        &engine,
        in_txn(json!({"update": "c", "updates": [{"q": {"_id": 1}, "u": {"$set": {"v": 1}}}]}), "s1", 1, true),
    );
    let reply = ok(&engine, in_txn(json!({"commitTransaction": 1}), "s1", 1, false));
    let committed_at = reply["commitTimestamp"].as_i64().unwrap();
    ok(&engine, json!({"update": "c", "updates": [{"q": {"_id": 1}, "u": {"$set": {"v": 2}}}]}));

    let reply = ok(&engine, json!({"find": "c", "readConcern": {"atClusterTime": committed_at}}));
    assert_eq!(first_batch(&reply)[0]["v"], 1);
    let reply = ok(&engine, json!({"find": "c"}));
    assert_eq!(first_batch(&reply)[0]["v"], 2);

    engine.collect_garbage();
    fails(
        &engine,
        json!({"find": "c", "readConcern": {"atClusterTime": committed_at}}),
        "SnapshotTooOld",
    );
}
