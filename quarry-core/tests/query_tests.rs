// query_tests.rs
// find, count, distinct, the planner and the plan cache through commands

mod helpers;

use helpers::{drain, fails, first_batch, ids, ok, seed};
use quarry_core::Engine;
use serde_json::json;

// ========== PAGING ==========

#[test]
fn test_skip_then_limit_returns_middle_page() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 10);

    let reply = ok(
        &engine,
        json!({"aggregate": "c", "pipeline": [{"$sort": {"_id": 1}}, {"$skip": 6}, {"$limit": 3}], "cursor": {}}),
    );
    assert_eq!(ids(&first_batch(&reply)), vec![6, 7, 8]);

    let reply = ok(&engine, json!({"find": "c", "sort": {"_id": 1}, "skip": 6, "limit": 3}));
    assert_eq!(ids(&first_batch(&reply)), vec![6, 7, 8]);
}

#[test]
fn test_batches_cover_every_document_once() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 250);
    let reply = ok(&engine, json!({"find": "c", "sort": {"_id": 1}, "batchSize": 7}));
    assert_eq!(first_batch(&reply).len(), 7);
    let all = drain(&engine, "c", reply);
    assert_eq!(ids(&all), (0..250).collect::<Vec<_>>());
}

#[test]
fn test_negative_limit_is_single_batch() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 20);
    let reply = ok(&engine, json!({"find": "c", "sort": {"_id": -1}, "limit": -2}));
    assert_eq!(ids(&first_batch(&reply)), vec![19, 18]);
    assert_eq!(reply["cursor"]["id"], 0);
}

#[test]
fn test_find_on_missing_collection_is_empty() {
    let engine = Engine::in_memory();
    let reply = ok(&engine, json!({"find": "nothing", "filter": {"a": 1}}));
    assert!(first_batch(&reply).is_empty());
    assert_eq!(reply["cursor"]["id"], 0);
}

// ========== FILTERS AND PROJECTIONS ==========

#[test]
fn test_filter_sort_projection() {
    let engine = Engine::in_memory();
    ok(
        &engine,
        json!({"insert": "people", "documents": [
            {"_id": 1, "name": "ann", "age": 31, "tags": ["a", "b"]},
            {"_id": 2, "name": "bob", "age": 25, "tags": ["b"]},
            {"_id": 3, "name": "cy", "age": 40},
        ]}),
    );
    let reply = ok(
        &engine,
        json!({"find": "people", "filter": {"age": {"$gte": 30}}, "sort": {"age": -1}, "projection": {"name": 1, "_id": 0}}),
    );
    assert_eq!(first_batch(&reply), vec![json!({"name": "cy"}), json!({"name": "ann"})]);

    let reply = ok(&engine, json!({"find": "people", "filter": {"tags": "b"}, "sort": {"_id": 1}}));
    assert_eq!(ids(&first_batch(&reply)), vec![1, 2]);

    let reply = ok(&engine, json!({"count": "people", "query": {"tags": {"$exists": false}}}));
    assert_eq!(reply["n"], 1);
}

#[test]
fn test_distinct_unwinds_arrays() {
    let engine = Engine::in_memory();
    ok(
        &engine,
        json!({"insert": "c", "documents": [
            {"_id": 1, "t": ["x", "y"]},
            {"_id": 2, "t": "y"},
            {"_id": 3, "t": "z"},
            {"_id": 4},
        ]}),
    );
    let reply = ok(&engine, json!({"distinct": "c", "key": "t"}));
    assert_eq!(reply["values"], json!(["x", "y", "z"]));
    let reply = ok(&engine, json!({"distinct": "c", "key": "t", "query": {"_id": {"$gt": 2}}}));
    assert_eq!(reply["values"], json!(["z"]));
}

#[test]
fn test_collation_on_query() {
    let engine = Engine::in_memory();
    ok(
        &engine,
        json!({"insert": "c", "documents": [{"_id": 1, "s": "apple"}, {"_id": 2, "s": "APPLE"}, {"_id": 3, "s": "pear"}]}),
    );
    let reply = ok(
        &engine,
        json!({"find": "c", "filter": {"s": "Apple"}, "collation": {"locale": "en", "strength": 2}, "sort": {"_id": 1}}),
    );
    assert_eq!(ids(&first_batch(&reply)), vec![1, 2]);
    let reply = ok(&engine, json!({"find": "c", "filter": {"s": "Apple"}}));
    assert!(first_batch(&reply).is_empty());
}

// ========== PLANNING ==========

#[test]
fn test_index_chosen_for_equality() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 200);
    ok(&engine, json!({"createIndexes": "c", "indexes": [{"key": {"n": 1}, "name": "n_1"}]}));
    let reply = ok(
        &engine,
        json!({"explain": {"find": "c", "filter": {"n": 42}}, "verbosity": "executionStats"}),
    );
    let plan = reply["queryPlanner"]["winningPlan"].to_string();
    assert!(plan.contains("IXSCAN"), "expected an index scan: {}", plan);
    assert_eq!(reply["executionStats"]["nReturned"], 1);
    assert_eq!(reply["executionStats"]["totalDocsExamined"], 1);
}

#[test]
fn test_hint_forces_plan() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 50);
    ok(&engine, json!({"createIndexes": "c", "indexes": [{"key": {"n": 1}, "name": "n_1"}]}));
    let reply = ok(&engine, json!({"explain": {"find": "c", "filter": {"n": 3}, "hint": {"$natural": 1}}}));
    let plan = reply["queryPlanner"]["winningPlan"].to_string();
    assert!(plan.contains("COLLSCAN"), "expected a collection scan: {}", plan);
    fails(
        &engine,
        json!({"find": "c", "filter": {"n": 3}, "hint": "no_such_index"}),
        "BadValue",
    );
}

#[test]
fn test_plan_cache_activates_and_clears() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 300);
    ok(
        &engine,
        json!({"createIndexes": "c", "indexes": [{"key": {"n": 1}, "name": "n_1"}, {"key": {"n": -1, "_id": 1}, "name": "n_-1__id_1"}]}),
    );
    let query = json!({"find": "c", "filter": {"n": {"$gte": 10, "$lt": 20}, "_id": {"$gte": 0}}});
    for _ in 0..3 {
        ok(&engine, query.clone());
    }
    let status = engine.server_status();
    assert!(status["planCache"]["entries"].as_u64().unwrap() >= 1);

    let reply = ok(&engine, json!({"explain": query.clone()}));
    assert_eq!(reply["queryPlanner"]["fromPlanCache"], true);

    ok(&engine, json!({"planCacheClear": "c"}));
    assert_eq!(engine.server_status()["planCache"]["entries"], 0);
    let reply = ok(&engine, json!({"explain": query}));
    assert_eq!(reply["queryPlanner"]["fromPlanCache"], false);
}

#[test]
fn test_index_drop_invalidates_cached_plans() {
    let engine = Engine::in_memory();
    seed(&engine, "c", 100);
    ok(
        &engine,
        json!({"createIndexes": "c", "indexes": [{"key": {"n": 1}, "name": "n_1"}, {"key": {"n": 1, "_id": 1}, "name": "n_1__id_1"}]}),
    );
    let query = json!({"find": "c", "filter": {"n": 5}});
    for _ in 0..4 {
        ok(&engine, query.clone());
    }
    ok(&engine, json!({"dropIndexes": "c", "index": "*"}));
    let reply = ok(&engine, json!({"explain": query.clone()}));
    assert_eq!(reply["queryPlanner"]["fromPlanCache"], false);
    let reply = ok(&engine, query);
    assert_eq!(ids(&first_batch(&reply)), vec![5]);
}
