// aggregation_tests.rs
// Aggregation pipelines end to end through the aggregate command

mod helpers;

use helpers::{drain, fails, first_batch, ids, ok, seed};
use quarry_core::Engine;
use serde_json::{json, Value};

fn aggregate(engine: &Engine, coll: &str, pipeline: Value) -> Vec<Value> {
    let reply = ok(engine, json!({"aggregate": coll, "pipeline": pipeline, "cursor": {}}));
    drain(engine, coll, reply)
}

// ========== GROUPING ==========

#[test]
fn test_bucket_auto_numeric_ordering() {
    let engine = Engine::in_memory();
    let docs: Vec<Value> = ["1", "5", "100", "9", "10", "50", "99", "200", "500"]
        .iter()
        .enumerate()
        .map(|(i, n)| json!({"_id": i, "num": n}))
        .collect();
    ok(&engine, json!({"insert": "nums", "documents": docs}));

    let reply = ok(
        &engine,
        json!({
            "aggregate": "nums",
            "pipeline": [{"$bucketAuto": {"groupBy": "$num", "buckets": 3}}],
            "collation": {"locale": "en_US", "numericOrdering": true},
            "cursor": {},
        }),
    );
    assert_eq!(
        first_batch(&reply),
        vec![
            json!({"_id": {"min": "1", "max": "10"}, "count": 3}),
            json!({"_id": {"min": "10", "max": "100"}, "count": 3}),
            json!({"_id": {"min": "100", "max": "500"}, "count": 3}),
        ]
    );
}

#[test]
fn test_group_and_sort() {
    let engine = Engine::in_memory();
    ok(
        &engine,
        json!({"insert": "sales", "documents": [
            {"_id": 1, "item": "a", "qty": 2, "price": 10},
            {"_id": 2, "item": "b", "qty": 1, "price": 20},
            {"_id": 3, "item": "a", "qty": 3, "price": 10},
            {"_id": 4, "item": "c", "qty": 5, "price": 1},
        ]}),
    );
    let out = aggregate(
        &engine,
        "sales",
        json!([
            {"$group": {
                "_id": "$item",
                "total": {"$sum": {"$multiply": ["$qty", "$price"]}},
                "orders": {"$sum": 1},
            }},
            {"$sort": {"total": -1}},
        ]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": "a", "total": 50, "orders": 2}),
            json!({"_id": "b", "total": 20, "orders": 1}),
            json!({"_id": "c", "total": 5, "orders": 1}),
        ]
    );

    let out = aggregate(&engine, "sales", json!([{"$sortByCount": "$item"}, {"$limit": 1}]));
    assert_eq!(out, vec![json!({"_id": "a", "count": 2})]);
}

#[test]
fn test_unwind_then_count() {
    let engine = Engine::in_memory();
    ok(
        &engine,
        json!({"insert": "posts", "documents": [
            {"_id": 1, "tags": ["x", "y"]},
            {"_id": 2, "tags": []},
            {"_id": 3, "tags": ["x"]},
        ]}),
    );
    let out = aggregate(
        &engine,
        "posts",
        json!([{"$unwind": "$tags"}, {"$match": {"tags": "x"}}, {"$count": "n"}]),
    );
    assert_eq!(out, vec![json!({"n": 2})]);
}

#[test]
fn test_blocking_sort_needs_disk_use_over_memory_limit() {
    let engine = Engine::in_memory();
    let docs: Vec<Value> = (0..200)
        .map(|i| json!({"_id": i, "pad": "x".repeat(256)}))
        .collect();
    ok(&engine, json!({"insert": "big", "documents": docs}));
    ok(&engine, json!({"setParameter": 1, "internalQueryMaxBlockingMemoryBytes": 4096}));

    let pipeline = json!([{"$sort": {"pad": 1, "_id": -1}}, {"$limit": 150}, {"$sort": {"_id": 1}}]);
    fails(
        &engine,
        json!({"aggregate": "big", "pipeline": pipeline.clone(), "cursor": {}}),
        "QueryExceededMemoryLimitNoDiskUseAllowed",
    );
    let reply = ok(
        &engine,
        json!({"aggregate": "big", "pipeline": pipeline, "cursor": {}, "allowDiskUse": true}),
    );
    let out = drain(&engine, "big", reply);
    assert_eq!(ids(&out), (50..200).collect::<Vec<_>>());
}

// ========== JOINS ==========

#[test]
fn test_lookup_equality() {
    let engine = Engine::in_memory();
    ok(
        &engine,
        json!({"insert": "orders", "documents": [
            {"_id": 1, "customer": "ann"},
            {"_id": 2, "customer": "bob"},
            {"_id": 3, "customer": "zed"},
        ]}),
    );
    ok(
        &engine,
        json!({"insert": "customers", "documents": [
            {"_id": "ann", "city": "Oslo"},
            {"_id": "bob", "city": "Rome"},
        ]}),
    );
    let out = aggregate(
        &engine,
        "orders",
        json!([
            {"$lookup": {"from": "customers", "localField": "customer", "foreignField": "_id", "as": "who"}},
            {"$sort": {"_id": 1}},
            {"$project": {"_id": 1, "cities": "$who.city"}},
        ]),
    );
    assert_eq!(
        out,
        vec![
            json!({"_id": 1, "cities": ["Oslo"]}),
            json!({"_id": 2, "cities": ["Rome"]}),
            json!({"_id": 3, "cities": []}),
        ]
    );
}

// ========== OUTPUT STAGES ==========

#[test]
fn test_out_replaces_collection() {
    let engine = Engine::in_memory();
    seed(&engine, "src", 10);
    ok(&engine, json!({"insert": "dst", "documents": [{"_id": "old"}]}));

    let reply = ok(
        &engine,
        json!({"aggregate": "src", "pipeline": [{"$match": {"n": {"$lt": 3}}}, {"$out": "dst"}], "cursor": {}}),
    );
    assert!(first_batch(&reply).is_empty());

    let reply = ok(&engine, json!({"find": "dst", "sort": {"_id": 1}}));
    assert_eq!(ids(&first_batch(&reply)), vec![0, 1, 2]);

    let reply = ok(&engine, json!({"listCollections": 1, "nameOnly": true}));
    let mut names: Vec<String> = first_batch(&reply)
        .iter()
        .filter_map(|c| c["name"].as_str().map(str::to_string))
        .collect();
    names.sort();
    assert_eq!(names, vec!["dst", "src"]);
}

#[test]
fn test_out_not_allowed_in_transaction() {
    let engine = Engine::in_memory();
    seed(&engine, "src", 3);
    let reply = engine.execute(&json!({
        "aggregate": "src",
        "pipeline": [{"$out": "dst"}],
        "cursor": {},
        "lsid": {"id": "s1"},
        "txnNumber": 1,
        "autocommit": false,
        "startTransaction": true,
    }));
    assert_eq!(reply["codeName"], "OperationNotSupportedInTransaction", "{}", reply);
}

// ========== CHANGE STREAMS ==========

#[test]
fn test_change_stream_tails_through_get_more() {
    let engine = Engine::in_memory();
    ok(&engine, json!({"create": "feed"}));

    let reply = ok(&engine, json!({"aggregate": "feed", "pipeline": [{"$changeStream": {}}], "cursor": {}}));
    assert!(first_batch(&reply).is_empty());
    let cursor_id = reply["cursor"]["id"].as_i64().unwrap();
    assert_ne!(cursor_id, 0);

    ok(&engine, json!({"insert": "feed", "documents": [{"_id": 1, "v": "a"}]}));
    ok(&engine, json!({"update": "feed", "updates": [{"q": {"_id": 1}, "u": {"$set": {"v": "b"}}}]}));
    ok(&engine, json!({"delete": "feed", "deletes": [{"q": {"_id": 1}, "limit": 1}]}));

    let reply = ok(&engine, json!({"getMore": cursor_id, "collection": "feed"}));
    let events = reply["cursor"]["nextBatch"].as_array().unwrap().clone();
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["operationType"].as_str()).collect();
    assert_eq!(kinds, vec!["insert", "update", "delete"]);
    assert_eq!(events[0]["fullDocument"], json!({"_id": 1, "v": "a"}));
    assert_eq!(events[2]["documentKey"], json!({"_id": 1}));
    assert_eq!(reply["cursor"]["id"], cursor_id);

    let reply = ok(&engine, json!({"getMore": cursor_id, "collection": "feed"}));
    assert!(reply["cursor"]["nextBatch"].as_array().unwrap().is_empty());
    ok(&engine, json!({"killCursors": "feed", "cursors": [cursor_id]}));
}

#[test]
fn test_explain_aggregate_lists_stages() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 5);
    let reply = ok(
        &engine,
        json!({"explain": {"aggregate": "c", "pipeline": [{"$match": {"n": 1}}, {"$group": {"_id": null, "s": {"$sum": "$n"}}}], "cursor": {}}}),
    );
    let stages = reply["stages"].as_array().expect("stages");
    assert!(stages.len() >= 2, "{}", reply);
}
