/*!
 * Command surface tests through the dispatcher on the SQLite memory backend:
 * writes, queries, namespaces, indexes and admin metadata.
 */

mod common;

use bson::{doc, Bson};
use common::{assert_error, assert_ok, connection, run, test_context};

#[tokio::test]
async fn insert_then_find_returns_each_document_once() {
    let ctx = test_context(false);
    let mut conn = connection(1);

    let docs: Vec<Bson> = (0..20)
        .map(|i| Bson::Document(doc! {"_id": i, "v": i * 2}))
        .collect();
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": docs, "$db": "db"},
    )
    .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 20);

    let reply = run(&ctx, &mut conn, doc! {"find": "c", "$db": "db"}).await;
    assert_ok(&reply);
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(batch.len(), 20);
    let mut seen = std::collections::HashSet::new();
    for d in batch {
        let id = d.as_document().unwrap().get_i32("_id").unwrap();
        assert!(seen.insert(id), "duplicate _id {} in result", id);
    }
}

#[tokio::test]
async fn insert_generates_missing_ids() {
    let ctx = test_context(false);
    let mut conn = connection(1);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": [{"v": 1}], "$db": "db"},
    )
    .await;
    assert_ok(&reply);

    let reply = run(&ctx, &mut conn, doc! {"find": "c", "$db": "db"}).await;
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    let doc = batch[0].as_document().unwrap();
    assert_eq!(doc.keys().next().unwrap(), "_id");
    assert!(matches!(doc.get("_id"), Some(Bson::ObjectId(_))));
}

#[tokio::test]
async fn ordered_insert_stops_at_first_duplicate() {
    let ctx = test_context(false);
    let mut conn = connection(1);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "insert": "c",
            "documents": [{"_id": 1}, {"_id": 1}, {"_id": 2}],
            "ordered": true,
            "$db": "db",
        },
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    assert_eq!(reply.get_i32("n").unwrap(), 1);
    let errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(errors.len(), 1);
    let e = errors[0].as_document().unwrap();
    assert_eq!(e.get_i32("index").unwrap(), 1);
    assert_eq!(e.get_i32("code").unwrap(), 11000);
    assert!(e.get_str("errmsg").unwrap().starts_with("E11000 duplicate key error"));
}

#[tokio::test]
async fn unordered_insert_attempts_every_document() {
    let ctx = test_context(false);
    let mut conn = connection(1);

    let documents: Vec<Bson> = vec![
        Bson::Document(doc! {"_id": 1}),
        Bson::Document(doc! {"_id": 1}),
        Bson::Document(doc! {"_id": 2}),
        Bson::Document(doc! {"_id": 2}),
        Bson::Document(doc! {"_id": 3}),
    ];
    let total = documents.len() as i32;
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": documents, "ordered": false, "$db": "db"},
    )
    .await;
    let errors = reply.get_array("writeErrors").unwrap();
    // Successes plus errors cover the whole batch, and indices stay in range.
    assert_eq!(reply.get_i32("n").unwrap() + errors.len() as i32, total);
    for e in errors {
        let index = e.as_document().unwrap().get_i32("index").unwrap();
        assert!((0..total).contains(&index));
    }
    assert_eq!(reply.get_i32("n").unwrap(), 3);
}

#[tokio::test]
async fn update_set_inc_and_upsert() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": [{"_id": 1, "v": 1}, {"_id": 2, "v": 1}], "$db": "db"},
    )
    .await;

    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "update": "c",
            "updates": [{"q": {}, "u": {"$inc": {"v": 10}}, "multi": true}],
            "$db": "db",
        },
    )
    .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("n").unwrap(), 2);
    assert_eq!(reply.get_i32("nModified").unwrap(), 2);

    // No match without upsert.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"update": "c", "updates": [{"q": {"_id": 9}, "u": {"$set": {"v": 5}}}], "$db": "db"},
    )
    .await;
    assert_eq!(reply.get_i32("n").unwrap(), 0);

    // Upsert reports the new _id.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "update": "c",
            "updates": [{"q": {"_id": 9}, "u": {"$set": {"v": 5}}, "upsert": true}],
            "$db": "db",
        },
    )
    .await;
    assert_eq!(reply.get_i32("n").unwrap(), 1);
    let upserted = reply.get_array("upserted").unwrap();
    let entry = upserted[0].as_document().unwrap();
    assert_eq!(entry.get_i32("index").unwrap(), 0);
    assert_eq!(entry.get_i32("_id").unwrap(), 9);

    // Unknown modifiers end up in writeErrors, not top-level errors.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"update": "c", "updates": [{"q": {}, "u": {"$frob": {"v": 1}}}], "$db": "db"},
    )
    .await;
    assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
    let errors = reply.get_array("writeErrors").unwrap();
    assert_eq!(errors[0].as_document().unwrap().get_i32("code").unwrap(), 9);
}

#[tokio::test]
async fn delete_respects_limit_field() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    let documents: Vec<Bson> = (0..6)
        .map(|i| Bson::Document(doc! {"_id": i, "k": i % 2}))
        .collect();
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": documents, "$db": "db"},
    )
    .await;

    // limit 1 removes a single match.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"delete": "c", "deletes": [{"q": {"k": 0}, "limit": 1}], "$db": "db"},
    )
    .await;
    assert_eq!(reply.get_i32("n").unwrap(), 1);

    // limit 0 removes all matches.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"delete": "c", "deletes": [{"q": {"k": 0}, "limit": 0}], "$db": "db"},
    )
    .await;
    assert_eq!(reply.get_i32("n").unwrap(), 2);

    // Anything else is rejected with the reference wording.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"delete": "c", "deletes": [{"q": {}, "limit": 2}], "$db": "db"},
    )
    .await;
    let errors = reply.get_array("writeErrors").unwrap();
    let e = errors[0].as_document().unwrap();
    assert_eq!(e.get_i32("code").unwrap(), 9);
    assert_eq!(
        e.get_str("errmsg").unwrap(),
        "The limit field in delete objects must be 0 or 1. Got 2"
    );
}

#[tokio::test]
async fn find_and_modify_returns_old_or_new() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": [{"_id": 1, "v": 1}], "$db": "db"},
    )
    .await;

    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "findAndModify": "c",
            "query": {"_id": 1},
            "update": {"$inc": {"v": 1}},
            "$db": "db",
        },
    )
    .await;
    assert_ok(&reply);
    let value = reply.get_document("value").unwrap();
    assert_eq!(value.get_i32("v").unwrap(), 1);
    assert!(reply
        .get_document("lastErrorObject")
        .unwrap()
        .get_bool("updatedExisting")
        .unwrap());

    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "findAndModify": "c",
            "query": {"_id": 1},
            "update": {"$inc": {"v": 1}},
            "new": true,
            "$db": "db",
        },
    )
    .await;
    assert_eq!(reply.get_document("value").unwrap().get_i32("v").unwrap(), 3);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"findAndModify": "c", "query": {"_id": 1}, "remove": true, "$db": "db"},
    )
    .await;
    assert_eq!(reply.get_document("value").unwrap().get_i32("_id").unwrap(), 1);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"findAndModify": "c", "query": {"_id": 1}, "remove": true, "$db": "db"},
    )
    .await;
    assert_eq!(reply.get("value"), Some(&Bson::Null));
}

#[tokio::test]
async fn find_sort_skip_limit_projection() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    let documents: Vec<Bson> = (0..10)
        .map(|i| Bson::Document(doc! {"_id": i, "v": 9 - i}))
        .collect();
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": documents, "$db": "db"},
    )
    .await;

    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "find": "c",
            "sort": {"v": 1},
            "skip": 2,
            "limit": 3,
            "projection": {"_id": 0, "v": 1},
            "$db": "db",
        },
    )
    .await;
    assert_ok(&reply);
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(
        batch,
        &vec![
            Bson::Document(doc! {"v": 2}),
            Bson::Document(doc! {"v": 3}),
            Bson::Document(doc! {"v": 4}),
        ]
    );
}

#[tokio::test]
async fn count_and_distinct() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    let documents: Vec<Bson> = vec![
        Bson::Document(doc! {"_id": 1, "tags": ["a", "b"]}),
        Bson::Document(doc! {"_id": 2, "tags": ["b", "c"]}),
        Bson::Document(doc! {"_id": 3, "tags": "a"}),
    ];
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": documents, "$db": "db"},
    )
    .await;

    let reply = run(&ctx, &mut conn, doc! {"count": "c", "$db": "db"}).await;
    assert_eq!(reply.get_i32("n").unwrap(), 3);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"count": "c", "query": {"tags": "a"}, "$db": "db"},
    )
    .await;
    assert_eq!(reply.get_i32("n").unwrap(), 2);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"distinct": "c", "key": "tags", "$db": "db"},
    )
    .await;
    assert_ok(&reply);
    let mut values: Vec<String> = reply
        .get_array("values")
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    values.sort();
    assert_eq!(values, vec!["a", "b", "c"]);

    let reply = run(&ctx, &mut conn, doc! {"distinct": "c", "$db": "db"}).await;
    assert_error(&reply, 40414, "Location40414");
    assert_eq!(
        reply.get_str("errmsg").unwrap(),
        "BSON field 'distinct.key' is missing but a required field"
    );
}

#[tokio::test]
async fn aggregate_runs_through_the_backend() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    let documents: Vec<Bson> = (0..110)
        .map(|i| Bson::Document(doc! {"_id": i, "v": 42}))
        .collect();
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": documents, "$db": "db"},
    )
    .await;

    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "aggregate": "c",
            "pipeline": [{"$match": {"v": 42}}, {"$count": "v"}],
            "cursor": {},
            "$db": "db",
        },
    )
    .await;
    assert_ok(&reply);
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(batch, &vec![Bson::Document(doc! {"v": 110})]);

    // $count first, then $match on a value the count document fails.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "aggregate": "c",
            "pipeline": [{"$count": "v"}, {"$match": {"v": 1}}],
            "cursor": {},
            "$db": "db",
        },
    )
    .await;
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert!(batch.is_empty());
}

#[tokio::test]
async fn explain_reports_pushdown() {
    let ctx = test_context(false);
    let mut conn = connection(1);

    // A leading fully-pushable $match reaches the backend.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "explain": {
                "aggregate": "c",
                "pipeline": [{"$match": {"v": 42}}, {"$count": "v"}],
                "cursor": {},
            },
            "$db": "db",
        },
    )
    .await;
    assert_ok(&reply);
    let plan = reply
        .get_document("queryPlanner")
        .unwrap()
        .get_document("winningPlan")
        .unwrap();
    assert!(plan.get_bool("pushdown").unwrap());

    // With $count first nothing can be pushed.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "explain": {
                "aggregate": "c",
                "pipeline": [{"$count": "v"}, {"$match": {"v": 1}}],
                "cursor": {},
            },
            "$db": "db",
        },
    )
    .await;
    let plan = reply
        .get_document("queryPlanner")
        .unwrap()
        .get_document("winningPlan")
        .unwrap();
    assert!(!plan.get_bool("pushdown").unwrap());

    // find: scalar equality pushes down, an operator filter does not.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"explain": {"find": "c", "filter": {"v": 42}}, "$db": "db"},
    )
    .await;
    let plan = reply
        .get_document("queryPlanner")
        .unwrap()
        .get_document("winningPlan")
        .unwrap();
    assert!(plan.get_bool("pushdown").unwrap());

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"explain": {"find": "c", "filter": {"v": {"$gt": 1}}}, "$db": "db"},
    )
    .await;
    let plan = reply
        .get_document("queryPlanner")
        .unwrap()
        .get_document("winningPlan")
        .unwrap();
    assert!(!plan.get_bool("pushdown").unwrap());
}

#[tokio::test]
async fn create_drop_and_namespace_errors() {
    let ctx = test_context(false);
    let mut conn = connection(1);

    let reply = run(&ctx, &mut conn, doc! {"create": "c", "$db": "db"}).await;
    assert_ok(&reply);

    let reply = run(&ctx, &mut conn, doc! {"create": "c", "$db": "db"}).await;
    assert_error(&reply, 48, "NamespaceExists");
    assert_eq!(reply.get_str("errmsg").unwrap(), "Collection db.c already exists.");

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"create": "log", "capped": true, "$db": "db"},
    )
    .await;
    assert_error(&reply, 72, "InvalidOptions");

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"create": "log", "capped": true, "size": 4096, "max": 100, "$db": "db"},
    )
    .await;
    assert_ok(&reply);

    let reply = run(&ctx, &mut conn, doc! {"drop": "c", "$db": "db"}).await;
    assert_ok(&reply);
    let reply = run(&ctx, &mut conn, doc! {"drop": "c", "$db": "db"}).await;
    assert_error(&reply, 26, "NamespaceNotFound");
    assert_eq!(reply.get_str("errmsg").unwrap(), "ns not found");

    let reply = run(&ctx, &mut conn, doc! {"create": "sys$tem", "$db": "db"}).await;
    assert_error(&reply, 73, "InvalidNamespace");
}

#[tokio::test]
async fn list_collections_reports_capped_options() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    run(
        &ctx,
        &mut conn,
        doc! {"create": "log", "capped": true, "size": 4096, "max": 10, "$db": "db"},
    )
    .await;
    run(&ctx, &mut conn, doc! {"create": "plain", "$db": "db"}).await;

    let reply = run(&ctx, &mut conn, doc! {"listCollections": 1, "$db": "db"}).await;
    assert_ok(&reply);
    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_str("ns").unwrap(), "db.$cmd.listCollections");
    let batch = cursor.get_array("firstBatch").unwrap();
    assert_eq!(batch.len(), 2);

    let log = batch
        .iter()
        .map(|b| b.as_document().unwrap())
        .find(|d| d.get_str("name") == Ok("log"))
        .unwrap();
    let options = log.get_document("options").unwrap();
    assert!(options.get_bool("capped").unwrap());
    assert_eq!(options.get_i64("size").unwrap(), 4096);
}

#[tokio::test]
async fn index_lifecycle() {
    let ctx = test_context(false);
    let mut conn = connection(1);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "createIndexes": "c",
            "indexes": [{"key": {"v": 1}, "name": "v_1", "unique": true}],
            "$db": "db",
        },
    )
    .await;
    assert_ok(&reply);
    assert_eq!(reply.get_i32("numIndexesBefore").unwrap(), 1);
    assert_eq!(reply.get_i32("numIndexesAfter").unwrap(), 2);
    assert!(reply.get_bool("createdCollectionAutomatically").unwrap());

    let reply = run(&ctx, &mut conn, doc! {"listIndexes": "c", "$db": "db"}).await;
    assert_ok(&reply);
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    let names: Vec<&str> = batch
        .iter()
        .map(|b| b.as_document().unwrap().get_str("name").unwrap())
        .collect();
    assert_eq!(names, vec!["_id_", "v_1"]);

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"dropIndexes": "c", "index": "_id_", "$db": "db"},
    )
    .await;
    assert_error(&reply, 72, "InvalidOptions");

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"dropIndexes": "c", "index": "nope", "$db": "db"},
    )
    .await;
    assert_error(&reply, 27, "IndexNotFound");

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"dropIndexes": "c", "index": "v_1", "$db": "db"},
    )
    .await;
    assert_ok(&reply);

    let reply = run(&ctx, &mut conn, doc! {"listIndexes": "missing", "$db": "db"}).await;
    assert_error(&reply, 26, "NamespaceNotFound");
}

#[tokio::test]
async fn rename_collection_moves_documents() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "old", "documents": [{"_id": 1}], "$db": "db"},
    )
    .await;

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"renameCollection": "db.old", "to": "db.new", "$db": "admin"},
    )
    .await;
    assert_ok(&reply);

    let reply = run(&ctx, &mut conn, doc! {"find": "new", "$db": "db"}).await;
    let batch = reply
        .get_document("cursor")
        .unwrap()
        .get_array("firstBatch")
        .unwrap();
    assert_eq!(batch.len(), 1);
}

#[tokio::test]
async fn admin_metadata_commands() {
    let ctx = test_context(false);
    let mut conn = connection(7);

    let reply = run(&ctx, &mut conn, doc! {"ping": 1, "$db": "admin"}).await;
    assert_ok(&reply);

    let reply = run(&ctx, &mut conn, doc! {"hello": 1, "$db": "admin"}).await;
    assert_ok(&reply);
    assert!(reply.get_bool("isWritablePrimary").unwrap());
    assert_eq!(reply.get_i32("maxBsonObjectSize").unwrap(), 16777216);
    assert_eq!(reply.get_i32("maxMessageSizeBytes").unwrap(), 48000000);
    assert_eq!(reply.get_i32("maxWriteBatchSize").unwrap(), 100000);
    assert_eq!(reply.get_i32("logicalSessionTimeoutMinutes").unwrap(), 30);
    assert_eq!(reply.get_i32("minWireVersion").unwrap(), 0);
    assert!(reply.get_i32("maxWireVersion").unwrap() >= 13);
    assert!(!reply.get_bool("readOnly").unwrap());
    assert!(!reply.contains_key("setName"));

    let reply = run(&ctx, &mut conn, doc! {"isMaster": 1, "$db": "admin"}).await;
    assert!(reply.get_bool("ismaster").unwrap());

    let reply = run(&ctx, &mut conn, doc! {"buildInfo": 1, "$db": "admin"}).await;
    assert_ok(&reply);
    assert!(reply.get_str("version").is_ok());

    let reply = run(&ctx, &mut conn, doc! {"whatsmyuri": 1, "$db": "admin"}).await;
    assert_eq!(reply.get_str("you").unwrap(), "127.0.0.1:40007");

    let reply = run(&ctx, &mut conn, doc! {"serverStatus": 1, "$db": "admin"}).await;
    assert_ok(&reply);
    assert_eq!(reply.get_str("process").unwrap(), "doppeldb");

    let reply = run(
        &ctx,
        &mut conn,
        doc! {"getParameter": "*", "$db": "admin"},
    )
    .await;
    assert_ok(&reply);
    assert!(reply.contains_key("featureCompatibilityVersion"));

    let reply = run(&ctx, &mut conn, doc! {"connectionStatus": 1, "$db": "admin"}).await;
    assert_ok(&reply);
    assert!(reply
        .get_document("authInfo")
        .unwrap()
        .get_array("authenticatedUsers")
        .unwrap()
        .is_empty());

    let reply = run(&ctx, &mut conn, doc! {"mapReduce": "c", "$db": "db"}).await;
    assert_error(&reply, 59, "CommandNotFound");
    assert_eq!(reply.get_str("errmsg").unwrap(), "no such command: 'mapReduce'");
}

#[tokio::test]
async fn db_and_collection_stats() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": [{"_id": 1}, {"_id": 2}], "$db": "db"},
    )
    .await;

    let reply = run(&ctx, &mut conn, doc! {"dbStats": 1, "$db": "db"}).await;
    assert_ok(&reply);
    assert_eq!(reply.get_str("db").unwrap(), "db");
    assert_eq!(reply.get_i32("objects").unwrap(), 2);

    let reply = run(&ctx, &mut conn, doc! {"collStats": "c", "$db": "db"}).await;
    assert_ok(&reply);
    assert_eq!(reply.get_str("ns").unwrap(), "db.c");
    assert_eq!(reply.get_i32("count").unwrap(), 2);

    let reply = run(&ctx, &mut conn, doc! {"listDatabases": 1, "$db": "admin"}).await;
    assert_ok(&reply);
    let databases = reply.get_array("databases").unwrap();
    assert!(databases
        .iter()
        .any(|d| d.as_document().unwrap().get_str("name") == Ok("db")));

    let reply = run(&ctx, &mut conn, doc! {"dropDatabase": 1, "$db": "db"}).await;
    assert_ok(&reply);
    assert_eq!(reply.get_str("dropped").unwrap(), "db");
}

#[tokio::test]
async fn auth_gates_commands_and_sasl_flows() {
    let ctx = test_context(true);
    let mut conn = connection(1);

    // Unauthenticated reads are rejected when auth is on.
    let reply = run(&ctx, &mut conn, doc! {"find": "c", "$db": "db"}).await;
    assert_error(&reply, 13, "Unauthorized");

    // The handshake is always allowed.
    let reply = run(&ctx, &mut conn, doc! {"hello": 1, "$db": "admin"}).await;
    assert_ok(&reply);

    // Unsupported mechanism.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "saslStart": 1,
            "mechanism": "PLAIN",
            "payload": Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: vec![],
            }),
            "$db": "admin",
        },
    )
    .await;
    assert_error(&reply, 2, "BadValue");

    // saslContinue without a conversation.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "saslContinue": 1,
            "conversationId": 1,
            "payload": Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: vec![],
            }),
            "$db": "admin",
        },
    )
    .await;
    assert_eq!(reply.get_i32("code").unwrap(), 17);

    // An unknown user fails saslStart with the uniform auth error.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "saslStart": 1,
            "mechanism": "SCRAM-SHA-256",
            "payload": Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: b"n,,n=ghost,r=abcdef".to_vec(),
            }),
            "$db": "admin",
        },
    )
    .await;
    assert_error(&reply, 18, "AuthenticationFailed");
    assert_eq!(reply.get_str("errmsg").unwrap(), "Authentication failed.");

    // A known user gets a server-first challenge back.
    let reply = run(
        &ctx,
        &mut conn,
        doc! {
            "saslStart": 1,
            "mechanism": "SCRAM-SHA-256",
            "payload": Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: b"n,,n=u1,r=clientnonce0000".to_vec(),
            }),
            "$db": "admin",
        },
    )
    .await;
    assert_ok(&reply);
    assert!(!reply.get_bool("done").unwrap());
    match reply.get("payload") {
        Some(Bson::Binary(bin)) => {
            let text = String::from_utf8(bin.bytes.clone()).unwrap();
            assert!(text.starts_with("r=clientnonce0000"));
            assert!(text.contains(",s="));
            assert!(text.contains(",i="));
        }
        other => panic!("expected binary payload, got {:?}", other),
    }

    // logout clears the (absent) identity and succeeds regardless.
    let reply = run(&ctx, &mut conn, doc! {"logout": 1, "$db": "admin"}).await;
    assert_ok(&reply);
}

#[tokio::test]
async fn write_batch_size_cap() {
    let ctx = test_context(false);
    let mut conn = connection(1);
    let reply = run(
        &ctx,
        &mut conn,
        doc! {"insert": "c", "documents": [], "$db": "db"},
    )
    .await;
    assert_error(&reply, 2, "BadValue");
    assert_eq!(
        reply.get_str("errmsg").unwrap(),
        "Write batch sizes must be between 1 and 100000. Got 0 operations."
    );
}
