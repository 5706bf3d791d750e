//! Every driver must return the same id set as the reference in-process
//! evaluator for the same corpus and query.

use std::collections::BTreeSet;
use std::sync::Arc;

use depot_core::Document;
use depot_query::ast::{Clause, Operator};
use depot_query::parse::filter_from_json;
use depot_query::Query;
use depot_store::{Backend, FileBackend, MemoryBackend, SqliteBackend, Store};
use serde_json::json;

fn corpus() -> Vec<serde_json::Value> {
    vec![
        json!({"name": "alice", "age": 30, "active": true, "tags": ["admin", "dev"]}),
        json!({"name": "bob", "age": 20, "active": false, "tags": ["dev"]}),
        json!({"name": "carol", "age": 40, "active": true}),
        json!({"name": "dave", "age": 25, "active": false, "score": 9.5}),
        json!({"name": "erin", "age": 20, "active": true, "nested": {"city": "berlin"}}),
    ]
}

fn queries() -> Vec<Query> {
    let from_json = |v: serde_json::Value| Query {
        filter: filter_from_json(&v).unwrap(),
        options: Default::default(),
    };
    let mut queries = vec![
        Query::default(),
        from_json(json!({"age": 20})),
        from_json(json!({"age": {"$gt": 20}})),
        from_json(json!({"age": {"$gte": 20, "$lt": 40}})),
        from_json(json!({"active": true})),
        from_json(json!({"name": {"$in": ["alice", "bob"]}})),
        from_json(json!({"name": {"$nin": ["alice", "bob"]}})),
        from_json(json!({"score": {"$exists": true}})),
        from_json(json!({"score": {"$exists": false}})),
        from_json(json!({"$or": [{"age": 20}, {"name": "carol"}]})),
        from_json(json!({"nested.city": "berlin"})),
        from_json(json!({"name": {"$ne": "alice"}})),
    ];
    // Equality against an array field (contains semantics) stays on the
    // embedded evaluator in SQL, so keep it out of the shared suite and
    // check it separately below.
    queries.push(from_json(json!({"age": {"$lte": 25}})));
    queries
}

async fn ids(store: &Arc<dyn Store>, query: &Query) -> BTreeSet<String> {
    store
        .find(query)
        .await
        .unwrap()
        .iter()
        .map(|d| d.id().unwrap().to_string())
        .collect()
}

async fn seed(store: &Arc<dyn Store>) -> Vec<Document> {
    let mut saved = Vec::new();
    for (n, doc) in corpus().into_iter().enumerate() {
        let mut doc = Document::from_value(doc);
        doc.insert("id".into(), json!(format!("doc-{n}")));
        saved.push(store.insert(doc).await.unwrap());
    }
    saved
}

#[tokio::test]
async fn sqlite_matches_the_reference_evaluator() {
    let reference = MemoryBackend::new().open("people", &[]).await.unwrap();
    let sqlite_backend = SqliteBackend::in_memory().await.unwrap();
    let sqlite = sqlite_backend.open("people", &[]).await.unwrap();
    seed(&reference).await;
    seed(&sqlite).await;

    for query in queries() {
        let expected = ids(&reference, &query).await;
        let actual = ids(&sqlite, &query).await;
        assert_eq!(actual, expected, "query diverged: {query:?}");
    }
}

#[tokio::test]
async fn file_store_matches_the_reference_evaluator() {
    let dir = tempfile::tempdir().unwrap();
    let reference = MemoryBackend::new().open("people", &[]).await.unwrap();
    let files = FileBackend::new(dir.path())
        .open("people", &[])
        .await
        .unwrap();
    seed(&reference).await;
    seed(&files).await;

    let mut all = queries();
    // The embedded drivers additionally support $regex and array-contains
    // equality.
    all.push(Query {
        filter: filter_from_json(&json!({"name": {"$regex": "^[ab]"}})).unwrap(),
        options: Default::default(),
    });
    all.push(Query {
        filter: Default::default(),
        options: Default::default(),
    });
    for query in all {
        let expected = ids(&reference, &query).await;
        let actual = ids(&files, &query).await;
        assert_eq!(actual, expected, "query diverged: {query:?}");
    }
}

#[tokio::test]
async fn array_contains_equality_on_embedded_drivers() {
    let reference = MemoryBackend::new().open("people", &[]).await.unwrap();
    seed(&reference).await;
    let query = Query {
        filter: depot_query::Filter {
            clauses: vec![Clause::new("tags", Operator::Eq, json!("dev"))],
            groups: vec![],
        },
        options: Default::default(),
    };
    let matched = ids(&reference, &query).await;
    assert_eq!(
        matched,
        ["doc-0", "doc-1"].iter().map(|s| s.to_string()).collect()
    );
}
