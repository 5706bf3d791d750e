use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use depot_core::Document;
use depot_query::{Query, Update};

use crate::embedded;
use crate::{Backend, Store, StoreError};

type Namespace = Arc<RwLock<Vec<Document>>>;

/// Embedded in-memory backend. Insertion order is the iteration order.
///
/// Useful on its own for tests and as the reference the SQL driver is
/// checked against.
#[derive(Default)]
pub struct MemoryBackend {
    namespaces: DashMap<String, Namespace>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn open(
        &self,
        namespace: &str,
        unique_fields: &[String],
    ) -> Result<Arc<dyn Store>, StoreError> {
        let docs = self
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .clone();
        Ok(Arc::new(MemoryStore {
            docs,
            unique_fields: unique_fields.to_vec(),
        }))
    }
}

/// One collection's view of the in-memory backend.
pub struct MemoryStore {
    docs: Namespace,
    unique_fields: Vec<String>,
}

impl MemoryStore {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Document>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Document>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        Ok(embedded::scan(&self.read(), query))
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Document>, StoreError> {
        let docs = self.read();
        Ok(embedded::matching_indices(&docs, query)
            .first()
            .map(|&idx| docs[idx].clone()))
    }

    async fn count(&self, query: &Query) -> Result<i64, StoreError> {
        Ok(embedded::matching_indices(&self.read(), query).len() as i64)
    }

    async fn insert(&self, mut doc: Document) -> Result<Document, StoreError> {
        let mut docs = self.write();
        let id = doc.ensure_id();
        embedded::check_id_free(&docs, &id)?;
        embedded::check_unique(&docs, &doc, &self.unique_fields, None)?;
        doc.stamp_created();
        docs.push(doc.clone());
        Ok(doc)
    }

    async fn update_one(
        &self,
        query: &Query,
        update: &Update,
    ) -> Result<(Document, Document), StoreError> {
        let mut docs = self.write();
        let idx = *embedded::matching_indices(&docs, query)
            .first()
            .ok_or(StoreError::NotFound)?;
        let pre = docs[idx].clone();
        let post = embedded::apply_update(&pre, update);
        embedded::check_unique(&docs, &post, &self.unique_fields, Some(idx))?;
        docs[idx] = post.clone();
        Ok((post, pre))
    }

    async fn remove(&self, query: &Query) -> Result<u64, StoreError> {
        let mut docs = self.write();
        let matched = embedded::matching_indices(&docs, query);
        for idx in matched.iter().rev() {
            docs.remove(*idx);
        }
        Ok(matched.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_query::ast::{Clause, Operator};
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        Document::from_value(v)
    }

    async fn store_with_unique(unique: &[&str]) -> Arc<dyn Store> {
        let backend = MemoryBackend::new();
        let unique: Vec<String> = unique.iter().map(|s| s.to_string()).collect();
        backend.open("items", &unique).await.unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_id_and_timestamps() {
        let store = store_with_unique(&[]).await;
        let saved = store.insert(doc(json!({"title": "x"}))).await.unwrap();
        assert!(saved.id().is_some());
        assert!(saved.get("createdAt").is_some());
        assert_eq!(saved.get("createdAt"), saved.get("updatedAt"));
    }

    #[tokio::test]
    async fn find_preserves_insertion_order() {
        let store = store_with_unique(&[]).await;
        for n in [3, 1, 2] {
            store.insert(doc(json!({"n": n}))).await.unwrap();
        }
        let all = store.find(&Query::default()).await.unwrap();
        let ns: Vec<_> = all.iter().map(|d| d.get("n").unwrap().clone()).collect();
        assert_eq!(ns, vec![json!(3), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn unique_violations_are_distinct_errors() {
        let store = store_with_unique(&["email"]).await;
        store
            .insert(doc(json!({"email": "a@b.com"})))
            .await
            .unwrap();
        let err = store
            .insert(doc(json!({"email": "a@b.com"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation { field } if field == "email"));
    }

    #[tokio::test]
    async fn update_one_returns_post_and_pre_images() {
        let store = store_with_unique(&[]).await;
        let saved = store.insert(doc(json!({"title": "old"}))).await.unwrap();
        let update = Update::new().set("title", json!("new"));
        let (post, pre) = store
            .update_one(&Query::by_id(saved.id().unwrap()), &update)
            .await
            .unwrap();
        assert_eq!(pre.get("title"), Some(&json!("old")));
        assert_eq!(post.get("title"), Some(&json!("new")));
        assert!(post.get("updatedAt").unwrap().as_str() >= pre.get("updatedAt").unwrap().as_str());
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let store = store_with_unique(&[]).await;
        let err = store
            .update_one(&Query::by_id("nope"), &Update::new().set("a", json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn remove_reports_the_count() {
        let store = store_with_unique(&[]).await;
        for n in 0..3 {
            store.insert(doc(json!({"n": n}))).await.unwrap();
        }
        let mut query = Query::default();
        query
            .filter
            .clauses
            .push(Clause::new("n", Operator::Lt, json!(2)));
        assert_eq!(store.remove(&query).await.unwrap(), 2);
        assert_eq!(store.count(&Query::default()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_never_collide_on_id() {
        let store = store_with_unique(&[]).await;
        let mut handles = Vec::new();
        for n in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.insert(doc(json!({"n": n}))).await.unwrap()
            }));
        }
        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            let saved = handle.await.unwrap();
            assert!(ids.insert(saved.id().unwrap().to_string()));
        }
        assert_eq!(store.count(&Query::default()).await.unwrap(), 32);
    }
}
