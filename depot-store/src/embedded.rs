//! Shared scan logic for the embedded (in-process) drivers.

use depot_core::Document;
use depot_query::eval;
use depot_query::{Query, Update};

use crate::StoreError;

/// Indices of documents matching the filter, in insertion order.
pub(crate) fn matching_indices(docs: &[Document], query: &Query) -> Vec<usize> {
    docs.iter()
        .enumerate()
        .filter(|(_, doc)| eval::matches(&query.filter, doc))
        .map(|(idx, _)| idx)
        .collect()
}

/// Filtered + shaped result set for `find`.
pub(crate) fn scan(docs: &[Document], query: &Query) -> Vec<Document> {
    let matched: Vec<_> = docs
        .iter()
        .filter(|doc| eval::matches(&query.filter, doc))
        .map(|doc| doc.0.clone())
        .collect();
    eval::apply_options(matched, &query.options)
        .into_iter()
        .map(Document)
        .collect()
}

/// Reject `candidate` when a unique-constrained field collides with any
/// other stored document. `skip` excludes the document being updated.
pub(crate) fn check_unique(
    docs: &[Document],
    candidate: &Document,
    unique_fields: &[String],
    skip: Option<usize>,
) -> Result<(), StoreError> {
    for field in unique_fields {
        let Some(value) = candidate.get(field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        for (idx, existing) in docs.iter().enumerate() {
            if Some(idx) == skip {
                continue;
            }
            if existing.get(field) == Some(value) {
                return Err(StoreError::UniqueViolation {
                    field: field.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Duplicate-id guard shared by the embedded insert paths.
pub(crate) fn check_id_free(docs: &[Document], id: &str) -> Result<(), StoreError> {
    if docs.iter().any(|doc| doc.id() == Some(id)) {
        return Err(StoreError::UniqueViolation { field: "id".into() });
    }
    Ok(())
}

/// Apply an update to a pre-image, stamping `updatedAt`.
pub(crate) fn apply_update(pre: &Document, update: &Update) -> Document {
    let mut post = pre.clone();
    update.apply(&mut post);
    // The id never changes through an update.
    if let Some(id) = pre.get("id") {
        post.insert("id".into(), id.clone());
    }
    post.stamp_updated();
    post
}
