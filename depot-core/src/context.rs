use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PipelineError;

/// The lifecycle method of a request, derived from the HTTP verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The identity projection hooks see as `me`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub is_root: bool,
}

impl Identity {
    /// The identity a validated master key confers.
    pub fn root() -> Self {
        Identity {
            id: "root".into(),
            username: "master".into(),
            is_root: true,
        }
    }
}

/// A cross-collection call issued from inside a hook.
#[derive(Debug, Clone)]
pub struct InternalCall {
    pub collection: String,
    pub method: Method,
    /// Target document id for single-document methods.
    pub id: Option<String>,
    /// Query parameters as a JSON object (same shape as URL parameters).
    pub query: Value,
    /// Request body for POST/PUT.
    pub body: Option<Value>,
}

/// The narrow capability a [`RequestContext`] exposes to hooks: re-entering
/// the pipeline against another collection, and emitting realtime events.
///
/// Keeping this surface small breaks the router ↔ resource ↔ context cycle;
/// hooks never see the full resource registry.
#[async_trait::async_trait]
pub trait InternalApi: Send + Sync {
    /// Run `call` through the full pipeline with `internal = true` and root
    /// privileges. The target collection's hooks still run.
    async fn call(&self, call: InternalCall) -> Result<Value, PipelineError>;

    /// Forward an event to the realtime collaborator immediately.
    fn emit(&self, room: &str, event: &str, payload: Value);
}

/// Stand-in used where no registry is wired (tests, bare stores).
pub struct NoInternalApi;

#[async_trait::async_trait]
impl InternalApi for NoInternalApi {
    async fn call(&self, call: InternalCall) -> Result<Value, PipelineError> {
        Err(PipelineError::Internal(format!(
            "internal call to '{}' without a registry",
            call.collection
        )))
    }

    fn emit(&self, _room: &str, _event: &str, _payload: Value) {}
}

/// Per-request immutable bundle handed down the pipeline.
///
/// Cloned-with-overrides for internal (hook-initiated) calls via
/// [`RequestContext::internal_child`].
#[derive(Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Parsed request query parameters as a JSON object.
    pub query: Value,
    pub identity: Option<Identity>,
    pub development: bool,
    /// True when this request was initiated by a hook, not a client.
    pub internal: bool,
    pub api: Arc<dyn InternalApi>,
}

impl RequestContext {
    pub fn new(method: Method, query: Value, identity: Option<Identity>, api: Arc<dyn InternalApi>) -> Self {
        RequestContext {
            method,
            query,
            identity,
            development: false,
            internal: false,
            api,
        }
    }

    pub fn is_root(&self) -> bool {
        self.identity.as_ref().map(|i| i.is_root).unwrap_or(false)
    }

    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.id.as_str())
    }

    pub fn username(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.username.as_str())
    }

    /// True when the caller asked to bypass hooks and is allowed to.
    pub fn skip_events(&self) -> bool {
        self.is_root()
            && self
                .query
                .get("$skipEvents")
                .map(|v| v == &Value::Bool(true) || v == &Value::String("true".into()))
                .unwrap_or(false)
    }

    /// Derive the context for a hook-initiated call: internal, root, and
    /// carrying the new method/query in place of the original ones.
    pub fn internal_child(&self, method: Method, query: Value) -> Self {
        RequestContext {
            method,
            query,
            identity: Some(Identity::root()),
            development: self.development,
            internal: true,
            api: Arc::clone(&self.api),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(identity: Option<Identity>, query: Value) -> RequestContext {
        RequestContext::new(Method::Get, query, identity, Arc::new(NoInternalApi))
    }

    #[test]
    fn skip_events_requires_root() {
        let query = json!({"$skipEvents": true});
        assert!(!ctx(None, query.clone()).skip_events());
        let user = Identity {
            id: "u1".into(),
            username: "alice".into(),
            is_root: false,
        };
        assert!(!ctx(Some(user), query.clone()).skip_events());
        assert!(ctx(Some(Identity::root()), query).skip_events());
    }

    #[test]
    fn internal_child_elevates_and_marks_internal() {
        let base = ctx(None, json!({}));
        let child = base.internal_child(Method::Post, json!({"a": 1}));
        assert!(child.internal);
        assert!(child.is_root());
        assert_eq!(child.method, Method::Post);
        assert_eq!(child.query, json!({"a": 1}));
    }

    #[test]
    fn identity_serializes_camel_case() {
        let me = Identity::root();
        let v = serde_json::to_value(&me).unwrap();
        assert_eq!(v, json!({"id": "root", "username": "master", "isRoot": true}));
    }
}
