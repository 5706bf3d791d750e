//! The driver contract, run identically against every backend.

use std::sync::Arc;

use depot_core::Document;
use depot_query::ast::{Clause, Operator};
use depot_query::{Query, SortDir, Update};
use depot_store::{Backend, FileBackend, MemoryBackend, SqliteBackend, Store, StoreError};
use serde_json::json;

struct Drivers {
    stores: Vec<(&'static str, Arc<dyn Store>)>,
    _dir: tempfile::TempDir,
}

async fn drivers(unique: &[&str]) -> Drivers {
    let dir = tempfile::tempdir().unwrap();
    let unique: Vec<String> = unique.iter().map(|s| s.to_string()).collect();
    let memory = MemoryBackend::new().open("things", &unique).await.unwrap();
    let file = FileBackend::new(dir.path())
        .open("things", &unique)
        .await
        .unwrap();
    let sqlite_backend = SqliteBackend::in_memory().await.unwrap();
    let sqlite = sqlite_backend.open("things", &unique).await.unwrap();
    Drivers {
        stores: vec![("memory", memory), ("file", file), ("sqlite", sqlite)],
        _dir: dir,
    }
}

fn doc(v: serde_json::Value) -> Document {
    Document::from_value(v)
}

#[tokio::test]
async fn insert_stamps_system_fields_everywhere() {
    for (name, store) in drivers(&[]).await.stores {
        let saved = store.insert(doc(json!({"n": 1}))).await.unwrap();
        assert!(saved.id().is_some(), "{name}: id missing");
        let created = saved.get("createdAt").and_then(|v| v.as_str()).unwrap();
        let updated = saved.get("updatedAt").and_then(|v| v.as_str()).unwrap();
        assert_eq!(created, updated, "{name}: timestamps differ at insert");
        assert!(
            chrono::DateTime::parse_from_rfc3339(created).is_ok(),
            "{name}: createdAt is not RFC3339"
        );
    }
}

#[tokio::test]
async fn update_one_is_read_modify_write() {
    for (name, store) in drivers(&[]).await.stores {
        let saved = store
            .insert(doc(json!({"n": 1, "tmp": true})))
            .await
            .unwrap();
        let update = Update::new().set("n", json!(2)).unset("tmp");
        let (post, pre) = store
            .update_one(&Query::by_id(saved.id().unwrap()), &update)
            .await
            .unwrap();
        assert_eq!(pre.get("n"), Some(&json!(1)), "{name}");
        assert_eq!(post.get("n"), Some(&json!(2)), "{name}");
        assert!(post.get("tmp").is_none(), "{name}: $unset ignored");
        assert_eq!(post.id(), pre.id(), "{name}: id changed");
        assert!(
            post.get("updatedAt").unwrap().as_str()
                >= pre.get("updatedAt").unwrap().as_str(),
            "{name}: updatedAt went backwards"
        );
    }
}

#[tokio::test]
async fn unique_violations_are_a_distinct_error_kind() {
    for (name, store) in drivers(&["email"]).await.stores {
        store
            .insert(doc(json!({"email": "x@y.z"})))
            .await
            .unwrap();
        let err = store
            .insert(doc(json!({"email": "x@y.z"})))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::UniqueViolation { ref field } if field == "email"),
            "{name}: expected unique violation, got {err:?}"
        );
        // The failed insert left nothing behind.
        assert_eq!(store.count(&Query::default()).await.unwrap(), 1, "{name}");
    }
}

#[tokio::test]
async fn update_of_missing_document_is_not_found() {
    for (name, store) in drivers(&[]).await.stores {
        let err = store
            .update_one(&Query::by_id("missing"), &Update::new().set("a", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound), "{name}: {err:?}");
    }
}

#[tokio::test]
async fn sort_limit_skip_shape_results_identically() {
    for (name, store) in drivers(&[]).await.stores {
        for n in [5, 3, 1, 4, 2] {
            store.insert(doc(json!({"n": n}))).await.unwrap();
        }
        let mut query = Query::default();
        query.options.sort = vec![("n".into(), SortDir::Asc)];
        query.options.skip = Some(1);
        query.options.limit = Some(2);
        let out = store.find(&query).await.unwrap();
        let ns: Vec<i64> = out
            .iter()
            .map(|d| d.get("n").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![2, 3], "{name}");
    }
}

#[tokio::test]
async fn remove_returns_the_removed_count() {
    for (name, store) in drivers(&[]).await.stores {
        for n in 0..4 {
            store.insert(doc(json!({"n": n}))).await.unwrap();
        }
        let mut query = Query::default();
        query
            .filter
            .clauses
            .push(Clause::new("n", Operator::Gte, json!(2)));
        assert_eq!(store.remove(&query).await.unwrap(), 2, "{name}");
        assert_eq!(store.count(&Query::default()).await.unwrap(), 2, "{name}");
        assert_eq!(store.remove(&query).await.unwrap(), 0, "{name}");
    }
}

#[tokio::test]
async fn client_supplied_ids_are_kept_and_deduplicated() {
    for (name, store) in drivers(&[]).await.stores {
        let saved = store
            .insert(doc(json!({"id": "chosen", "n": 1})))
            .await
            .unwrap();
        assert_eq!(saved.id(), Some("chosen"), "{name}");
        let err = store
            .insert(doc(json!({"id": "chosen", "n": 2})))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::UniqueViolation { ref field } if field == "id"),
            "{name}: {err:?}"
        );
    }
}
