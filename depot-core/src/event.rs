use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{Identity, InternalApi, RequestContext};
use crate::document::Document;
use crate::error::{PipelineError, ValidationErrors};

/// One position in the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    BeforeRequest,
    Validate,
    Get,
    Post,
    Put,
    Delete,
    AfterCommit,
}

impl Phase {
    /// The hook file stem for this phase (`resources/<coll>/<stem>.{js,native}`).
    pub fn file_stem(self) -> &'static str {
        match self {
            Phase::BeforeRequest => "beforerequest",
            Phase::Validate => "validate",
            Phase::Get => "get",
            Phase::Post => "post",
            Phase::Put => "put",
            Phase::Delete => "delete",
            Phase::AfterCommit => "aftercommit",
        }
    }

    pub const ALL: [Phase; 7] = [
        Phase::BeforeRequest,
        Phase::Validate,
        Phase::Get,
        Phase::Post,
        Phase::Put,
        Phase::Delete,
        Phase::AfterCommit,
    ];
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// A broadcast scheduled by a hook, delivered after successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmitMessage {
    pub room: String,
    pub event: String,
    pub payload: Value,
}

/// The realtime broadcast collaborator. Not part of the core; may be absent.
pub trait Emitter: Send + Sync {
    fn emit(&self, room: &str, event: &str, payload: &Value);
}

/// Emitter used when no broadcast layer is attached.
pub struct NoopEmitter;

impl Emitter for NoopEmitter {
    fn emit(&self, _room: &str, _event: &str, _payload: &Value) {}
}

/// A hook's `cancel(message, status)` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cancellation {
    pub message: String,
    pub status: u16,
}

/// The mutable per-invocation surface a hook sees.
///
/// Both script runtimes expose this one shape; the reconciliation in
/// [`EventContext::finish`] is what turns a completed script run into either
/// a typed error or an [`EventOutcome`].
pub struct EventContext {
    /// The working document. In-place mutations are authoritative.
    pub data: Document,
    /// Parsed request query parameters (read-only from the hook's view).
    pub query: Value,
    pub me: Option<Identity>,
    /// Pre-update snapshot; present only when a pre-image exists.
    pub previous: Option<Document>,
    pub is_root: bool,
    pub internal: bool,
    pub errors: ValidationErrors,
    /// Fields stripped from the response after the phase completes.
    pub hide: BTreeSet<String>,
    /// Fields stripped from the document before it is stored.
    pub protect: BTreeSet<String>,
    pub cancellation: Option<Cancellation>,
    pub emits: Vec<EmitMessage>,
    /// Back-pointer for cross-collection internal calls.
    pub api: Option<Arc<dyn InternalApi>>,
    pub collection: String,
    pub phase: Phase,
}

impl std::fmt::Debug for EventContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventContext")
            .field("data", &self.data)
            .field("query", &self.query)
            .field("me", &self.me)
            .field("previous", &self.previous)
            .field("is_root", &self.is_root)
            .field("internal", &self.internal)
            .field("errors", &self.errors)
            .field("hide", &self.hide)
            .field("protect", &self.protect)
            .field("cancellation", &self.cancellation)
            .field("emits", &self.emits)
            .field("api", &self.api.as_ref().map(|_| "<dyn InternalApi>"))
            .field("collection", &self.collection)
            .field("phase", &self.phase)
            .finish()
    }
}

impl EventContext {
    pub fn new(collection: impl Into<String>, phase: Phase, data: Document) -> Self {
        EventContext {
            data,
            query: Value::Object(Map::new()),
            me: None,
            previous: None,
            is_root: false,
            internal: false,
            errors: ValidationErrors::new(),
            hide: BTreeSet::new(),
            protect: BTreeSet::new(),
            cancellation: None,
            emits: Vec::new(),
            api: None,
            collection: collection.into(),
            phase,
        }
    }

    /// Seed a context from the request it belongs to.
    pub fn from_request(
        rc: &RequestContext,
        collection: impl Into<String>,
        phase: Phase,
        data: Document,
    ) -> Self {
        let mut ctx = EventContext::new(collection, phase, data);
        ctx.query = rc.query.clone();
        ctx.me = rc.identity.clone();
        ctx.is_root = rc.is_root();
        ctx.internal = rc.internal;
        ctx.api = Some(Arc::clone(&rc.api));
        ctx
    }

    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.add(field, message);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn cancel(&mut self, message: impl Into<String>, status: u16) {
        self.cancellation = Some(Cancellation {
            message: message.into(),
            status,
        });
    }

    pub fn hide_field(&mut self, field: impl Into<String>) {
        self.hide.insert(field.into());
    }

    pub fn protect_field(&mut self, field: impl Into<String>) {
        self.protect.insert(field.into());
    }

    pub fn emit(&mut self, room: impl Into<String>, event: impl Into<String>, payload: Value) {
        self.emits.push(EmitMessage {
            room: room.into(),
            event: event.into(),
            payload,
        });
    }

    pub fn is_me(&self, id: &str) -> bool {
        self.me.as_ref().map(|m| m.id == id).unwrap_or(false)
    }

    /// Whether `field` differs from the pre-update snapshot. Without a
    /// pre-image (insert, get, delete) this is always false.
    pub fn changed(&self, field: &str) -> bool {
        match &self.previous {
            Some(prev) => self.data.get(field) != prev.get(field),
            None => false,
        }
    }

    /// Structured diagnostic channel for hook authors.
    pub fn log(&self, message: &str, fields: Option<&Map<String, Value>>) {
        match fields {
            Some(fields) => tracing::info!(
                collection = %self.collection,
                phase = %self.phase,
                fields = %serde_json::Value::Object(fields.clone()),
                "{message}"
            ),
            None => tracing::info!(
                collection = %self.collection,
                phase = %self.phase,
                "{message}"
            ),
        }
    }

    /// Reconcile a completed phase in place, in order: cancellation wins,
    /// then accumulated errors, then hide removals are applied to the
    /// working document. On success the context is ready for the next
    /// phase; `protect` and `emits` persist across phases.
    pub fn settle(&mut self) -> Result<(), PipelineError> {
        if let Some(cancel) = self.cancellation.take() {
            return Err(PipelineError::Cancelled {
                message: cancel.message,
                status: cancel.status,
            });
        }
        if !self.errors.is_empty() {
            return Err(PipelineError::Validation(std::mem::take(&mut self.errors)));
        }
        for field in std::mem::take(&mut self.hide) {
            self.data.remove(&field);
        }
        Ok(())
    }

    /// [`settle`](Self::settle) for the final phase, consuming the context.
    pub fn finish(mut self) -> Result<EventOutcome, PipelineError> {
        self.settle()?;
        Ok(EventOutcome {
            data: self.data,
            protect: self.protect,
            emits: self.emits,
        })
    }
}

/// What survives a successful phase: the (possibly mutated) working document,
/// fields to strip before commit, and queued broadcasts.
#[derive(Debug)]
pub struct EventOutcome {
    pub data: Document,
    pub protect: BTreeSet<String>,
    pub emits: Vec<EmitMessage>,
}
