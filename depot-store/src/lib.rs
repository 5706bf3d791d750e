//! # depot-store — store drivers behind one backend-neutral interface
//!
//! The pipeline consumes [`Store`], six operations over the query and update
//! ASTs from `depot-query`. Each driver implements one backend:
//!
//! | Driver | Backend |
//! |--------|---------|
//! | [`MemoryBackend`] | embedded, in-process, insertion-ordered |
//! | [`FileBackend`] | embedded, JSON blob per document on disk |
//! | [`SqliteBackend`] | SQLite table per namespace with a JSON `data` column |
//!
//! Driver contracts: inserts are single-shot; `update_one` is an atomic
//! read-modify-write returning post- and pre-images; unique violations are a
//! distinct error kind; insertion order is guaranteed only by the embedded
//! drivers; concurrent inserts never fabricate duplicate ids.

mod embedded;
mod file;
mod memory;
mod sqlite;

use std::sync::Arc;

use depot_core::{Document, PipelineError};
use depot_query::{Query, Update};

pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Errors a driver can surface.
#[derive(Debug)]
pub enum StoreError {
    /// No document matched (update/remove by id paths).
    NotFound,
    /// A unique-constrained field collided on write.
    UniqueViolation { field: String },
    /// The driver does not recognize an operator in the query.
    Unsupported(String),
    /// Anything else from the backend; details belong in logs only.
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "document not found"),
            StoreError::UniqueViolation { field } => {
                write!(f, "unique constraint violated on {field}")
            }
            StoreError::Unsupported(op) => write!(f, "unsupported operator: {op}"),
            StoreError::Backend(err) => write!(f, "backend error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Backend(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => PipelineError::NotFound("document not found".into()),
            StoreError::UniqueViolation { field } => PipelineError::UniqueConflict { field },
            StoreError::Unsupported(op) => {
                PipelineError::BadRequest(format!("unsupported operator: {op}"))
            }
            StoreError::Backend(err) => {
                tracing::error!(error = %err, "store backend failure");
                PipelineError::Internal("store failure".into())
            }
        }
    }
}

/// The six operations the request pipeline consumes.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn find(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    async fn find_one(&self, query: &Query) -> Result<Option<Document>, StoreError>;

    async fn count(&self, query: &Query) -> Result<i64, StoreError>;

    /// Insert a document, assigning an `id` and timestamps when missing.
    /// Single-shot: a failed insert leaves no partial state.
    async fn insert(&self, doc: Document) -> Result<Document, StoreError>;

    /// Atomic read-modify-write. Returns `(post_image, pre_image)`.
    async fn update_one(
        &self,
        query: &Query,
        update: &Update,
    ) -> Result<(Document, Document), StoreError>;

    /// Remove matching documents, returning how many went away.
    async fn remove(&self, query: &Query) -> Result<u64, StoreError>;
}

/// Opens per-collection stores for one configured backend.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Open (or create) the namespace for a collection, enforcing unique
    /// constraints on the given fields from now on.
    async fn open(
        &self,
        namespace: &str,
        unique_fields: &[String],
    ) -> Result<Arc<dyn Store>, StoreError>;
}
