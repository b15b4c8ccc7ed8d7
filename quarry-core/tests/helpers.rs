// helpers.rs
// Shared helpers for the integration tests

#![allow(dead_code)]

use quarry_core::Engine;
use serde_json::{json, Value};

/// Run `cmd`, failing the test unless the reply has `ok: 1`.
pub fn ok(engine: &Engine, cmd: Value) -> Value {
    let reply = engine.execute(&cmd);
    assert_eq!(reply["ok"], 1.0, "command {} failed: {}", cmd, reply);
    reply
}

/// Run `cmd`, expecting it to fail with `code_name`.
pub fn fails(engine: &Engine, cmd: Value, code_name: &str) -> Value {
    let reply = engine.execute(&cmd);
    assert_eq!(reply["ok"], 0.0, "command {} unexpectedly succeeded: {}", cmd, reply);
    assert_eq!(reply["codeName"], code_name, "unexpected error for {}: {}", cmd, reply);
    reply
}

pub fn first_batch(reply: &Value) -> Vec<Value> {
    reply["cursor"]["firstBatch"].as_array().cloned().unwrap_or_default()
}

/// Every document a find/aggregate reply leads to, following getMore.
pub fn drain(engine: &Engine, coll: &str, reply: Value) -> Vec<Value> {
    let mut docs = first_batch(&reply);
    let mut id = reply["cursor"]["id"].as_i64().unwrap_or(0);
    while id != 0 {
        let next = ok(engine, json!({"getMore": id, "collection": coll}));
        docs.extend(next["cursor"]["nextBatch"].as_array().cloned().unwrap_or_default());
        id = next["cursor"]["id"].as_i64().unwrap_or(0);
    }
    docs
}

pub fn ids(docs: &[Value]) -> Vec<i64> {
    docs.iter().map(|d| d["_id"].as_i64().expect("integer _id")).collect()
}

/// Insert `{_id: i, n: i}` for each i in `0..count`, in a scrambled order.
pub fn seed(engine: &Engine, coll: &str, count: i64) {
    let mut order: Vec<i64> = (0..count).collect();
    order.reverse();
    order.rotate_left((count / 3) as usize);
    let docs: Vec<Value> = order.iter().map(|i| json!({"_id": i, "n": i})).collect();
    ok(engine, json!({"insert": coll, "documents": docs}));
}

/// Attach transaction fields for session `lsid`.
pub fn in_txn(mut cmd: Value, lsid: &str, txn_number: i64, start: bool) -> Value {
    cmd["lsid"] = json!({"id": lsid});
    cmd["txnNumber"] = json!(txn_number);
    cmd["autocommit"] = json!(false);
    if start {
        cmd["startTransaction"] = json!(true);
    }
    cmd
}
