use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use depot_core::Document;
use depot_query::{Query, Update};

use crate::embedded;
use crate::{Backend, Store, StoreError};

/// Embedded file backend: one JSON blob per document at
/// `<root>/<namespace>/<id>.json`, with an in-memory index built at open.
///
/// Writes persist before the call returns. After a restart the index is
/// rebuilt ordered by `(createdAt, id)`, the durable proxy for insertion
/// order.
pub struct FileBackend {
    root: PathBuf,
    namespaces: DashMap<String, Arc<RwLock<Vec<Document>>>>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileBackend {
            root: root.into(),
            namespaces: DashMap::new(),
        }
    }

    fn load_namespace(&self, dir: &Path) -> Result<Vec<Document>, StoreError> {
        let mut docs = Vec::new();
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(StoreError::backend)?;
            return Ok(docs);
        }
        for entry in std::fs::read_dir(dir).map_err(StoreError::backend)? {
            let entry = entry.map_err(StoreError::backend)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(StoreError::backend)?;
            match serde_json::from_str(&raw) {
                Ok(serde_json::Value::Object(map)) => docs.push(Document(map)),
                _ => tracing::warn!(path = %path.display(), "skipping unreadable document blob"),
            }
        }
        docs.sort_by(|a, b| {
            let ka = (a.get("createdAt").and_then(|v| v.as_str()), a.id());
            let kb = (b.get("createdAt").and_then(|v| v.as_str()), b.id());
            ka.cmp(&kb)
        });
        Ok(docs)
    }
}

#[async_trait::async_trait]
impl Backend for FileBackend {
    async fn open(
        &self,
        namespace: &str,
        unique_fields: &[String],
    ) -> Result<Arc<dyn Store>, StoreError> {
        let dir = self.root.join(namespace);
        let docs = match self.namespaces.get(namespace) {
            Some(existing) => existing.clone(),
            None => {
                let loaded = Arc::new(RwLock::new(self.load_namespace(&dir)?));
                self.namespaces
                    .insert(namespace.to_string(), loaded.clone());
                loaded
            }
        };
        Ok(Arc::new(FileStore {
            dir,
            docs,
            unique_fields: unique_fields.to_vec(),
        }))
    }
}

pub struct FileStore {
    dir: PathBuf,
    docs: Arc<RwLock<Vec<Document>>>,
    unique_fields: Vec<String>,
}

impl FileStore {
    fn blob_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn persist(&self, doc: &Document) -> Result<(), StoreError> {
        let id = doc.id().ok_or_else(|| {
            StoreError::Backend("document without id cannot be persisted".into())
        })?;
        let raw = serde_json::to_string_pretty(doc).map_err(StoreError::backend)?;
        std::fs::create_dir_all(&self.dir).map_err(StoreError::backend)?;
        std::fs::write(self.blob_path(id), raw).map_err(StoreError::backend)
    }

    fn unlink(&self, id: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.blob_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::backend(e)),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Document>> {
        self.docs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Document>> {
        self.docs.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl Store for FileStore {
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
        self.persist(&doc)?;
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
        self.persist(&post)?;
        docs[idx] = post.clone();
        Ok((post, pre))
    }

    async fn remove(&self, query: &Query) -> Result<u64, StoreError> {
        let mut docs = self.write();
        let matched = embedded::matching_indices(&docs, query);
        for idx in matched.iter().rev() {
            let doc = docs.remove(*idx);
            if let Some(id) = doc.id() {
                self.unlink(id)?;
            }
        }
        Ok(matched.len() as u64)
    }
}
