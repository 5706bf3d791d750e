//! The collection resource: one named schema bound to a store namespace and
//! a per-phase script set, driving the lifecycle state machine
//! `dispatch → validate → hook → commit → aftercommit → respond`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use depot_core::{
    Document, EmitMessage, Emitter, EventContext, Method, Phase, PipelineError, RequestContext,
};
use depot_query::{eval, Query, Update};
use depot_schema::{Mode, Schema};
use depot_script::js::{JsPool, JsScript};
use depot_script::native::PluginHandle;
use depot_store::Store;
use serde_json::{Map, Value};
use tracing::warn;

/// A hook attached to one phase, in either dialect.
pub enum Hook {
    Js(JsScript),
    Native(Arc<PluginHandle>),
}

/// The single-document operations a resource serves besides list/count.
#[derive(Debug, Clone)]
pub enum Target {
    List,
    Count,
    One(String),
}

pub struct CollectionResource {
    name: String,
    schema: Schema,
    store: Arc<dyn Store>,
    hooks: RwLock<HashMap<Phase, Arc<Hook>>>,
    js: Arc<JsPool>,
    emitter: Arc<dyn Emitter>,
    ownership_field: Option<String>,
}

impl CollectionResource {
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        store: Arc<dyn Store>,
        js: Arc<JsPool>,
        emitter: Arc<dyn Emitter>,
    ) -> Self {
        let ownership_field = schema.ownership_field().map(String::from);
        CollectionResource {
            name: name.into(),
            schema,
            store,
            hooks: RwLock::new(HashMap::new()),
            js,
            emitter,
            ownership_field,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Swap the handler for one phase. In-flight requests keep the handler
    /// they already resolved.
    pub fn set_hook(&self, phase: Phase, hook: Option<Hook>) {
        let mut hooks = self.hooks.write().unwrap_or_else(|e| e.into_inner());
        match hook {
            Some(hook) => hooks.insert(phase, Arc::new(hook)),
            None => hooks.remove(&phase),
        };
    }

    fn hook(&self, phase: Phase) -> Option<Arc<Hook>> {
        self.hooks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&phase)
            .cloned()
    }

    /// Run the phase hook, if any, returning the mutated context.
    async fn run_hook(
        &self,
        phase: Phase,
        event: EventContext,
    ) -> Result<EventContext, PipelineError> {
        let Some(hook) = self.hook(phase) else {
            return Ok(event);
        };
        match hook.as_ref() {
            Hook::Js(script) => Ok(self.js.run(script, event).await?),
            Hook::Native(handle) => {
                let handle = Arc::clone(handle);
                let outcome = tokio::task::spawn_blocking(move || {
                    let mut event = event;
                    let result = handle.invoke(&mut event);
                    (event, result)
                })
                .await
                .map_err(|e| PipelineError::Script(format!("plugin thread failed: {e}")))?;
                let (event, result) = outcome;
                result?;
                Ok(event)
            }
        }
    }

    fn event(&self, rc: &RequestContext, phase: Phase, data: Document) -> EventContext {
        EventContext::from_request(rc, &self.name, phase, data)
    }

    /// Inject the ownership clause for non-root list/count calls, or refuse
    /// the request when there is no identity to scope by.
    fn scope_query(&self, rc: &RequestContext, query: &Query) -> Result<Query, PipelineError> {
        let mut query = query.clone();
        if let Some(field) = &self.ownership_field {
            if !rc.is_root() {
                let Some(user_id) = rc.user_id() else {
                    return Err(PipelineError::Unauthorized("authentication required".into()));
                };
                query
                    .filter
                    .push_eq(field, Value::String(user_id.to_string()));
            }
        }
        Ok(query)
    }

    /// 403 unless the caller may touch this document.
    fn check_ownership(&self, rc: &RequestContext, doc: &Document) -> Result<(), PipelineError> {
        let Some(field) = &self.ownership_field else {
            return Ok(());
        };
        if rc.is_root() {
            return Ok(());
        }
        let owner = doc.get(field).and_then(Value::as_str);
        match (owner, rc.user_id()) {
            (Some(owner), Some(caller)) if owner == caller => Ok(()),
            _ => Err(PipelineError::Forbidden("not your document".into())),
        }
    }

    fn deliver(&self, emits: Vec<EmitMessage>) {
        for emit in emits {
            let room = if emit.room.is_empty() {
                self.name.as_str()
            } else {
                emit.room.as_str()
            };
            self.emitter.emit(room, &emit.event, &emit.payload);
        }
    }

    /// AfterCommit never changes the response; failures are logged and the
    /// (possibly mutated) data plus queued emits are all that escape.
    async fn after_commit(&self, rc: &RequestContext, data: Document, previous: Option<Document>) -> Document {
        let mut event = self.event(rc, Phase::AfterCommit, data);
        event.previous = previous;
        let fallback = event.data.clone();
        match self.run_hook(Phase::AfterCommit, event).await {
            Ok(mut event) => {
                if event.cancellation.is_some() || event.has_errors() {
                    warn!(
                        collection = %self.name,
                        "aftercommit hook errored; response unchanged"
                    );
                    event.cancellation = None;
                    event.errors = Default::default();
                }
                match event.settle() {
                    Ok(()) => {
                        self.deliver(std::mem::take(&mut event.emits));
                        event.data
                    }
                    Err(_) => fallback,
                }
            }
            Err(err) => {
                warn!(collection = %self.name, error = %err, "aftercommit hook failed");
                fallback
            }
        }
    }

    fn apply_projection(&self, query: &Query, doc: &mut Map<String, Value>) {
        if let Some(projection) = &query.options.fields {
            eval::apply_projection(doc, projection);
        }
    }

    // ── GET many ─────────────────────────────────────────────────────────

    pub async fn list(&self, rc: &RequestContext, query: &Query) -> Result<Value, PipelineError> {
        let scoped = self.scope_query(rc, query)?;
        if rc.skip_events() {
            let docs = self.store.find(&scoped).await?;
            return Ok(Value::Array(
                docs.into_iter()
                    .map(|mut d| {
                        self.apply_projection(query, &mut d);
                        d.into_value()
                    })
                    .collect(),
            ));
        }

        let mut event = self.event(rc, Phase::BeforeRequest, Document::new());
        event = self.run_hook(Phase::BeforeRequest, event).await?;
        event.settle()?;
        let mut emits = event.emits;

        let docs = self.store.find(&scoped).await?;
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            // The Get hook runs once per document; a cancel drops that
            // document from the response set and is not fatal.
            let mut event = self.event(rc, Phase::Get, doc);
            event = self.run_hook(Phase::Get, event).await?;
            if event.cancellation.is_some() {
                continue;
            }
            event.settle()?;
            emits.append(&mut event.emits);
            let mut data = event.data.into_inner();
            self.apply_projection(query, &mut data);
            out.push(Value::Object(data));
        }

        self.after_commit(rc, Document::new(), None).await;
        self.deliver(emits);
        Ok(Value::Array(out))
    }

    // ── GET /count ───────────────────────────────────────────────────────

    pub async fn count(&self, rc: &RequestContext, query: &Query) -> Result<Value, PipelineError> {
        let scoped = self.scope_query(rc, query)?;
        if !rc.skip_events() {
            let mut event = self.event(rc, Phase::BeforeRequest, Document::new());
            event = self.run_hook(Phase::BeforeRequest, event).await?;
            event.settle()?;
            self.deliver(event.emits);
        }
        let count = self.store.count(&scoped).await?;
        Ok(Value::Number(count.into()))
    }

    // ── GET one ──────────────────────────────────────────────────────────

    pub async fn get_one(
        &self,
        rc: &RequestContext,
        id: &str,
        query: &Query,
    ) -> Result<Value, PipelineError> {
        if rc.skip_events() {
            let doc = self.fetch(rc, id).await?;
            let mut data = doc.into_inner();
            self.apply_projection(query, &mut data);
            return Ok(Value::Object(data));
        }

        let mut event = self.event(rc, Phase::BeforeRequest, Document::new());
        event = self.run_hook(Phase::BeforeRequest, event).await?;
        event.settle()?;
        let mut emits = event.emits;

        let doc = self.fetch(rc, id).await?;
        let mut event = self.event(rc, Phase::Get, doc);
        event = self.run_hook(Phase::Get, event).await?;
        event.settle()?;
        emits.append(&mut event.emits);

        let data = self.after_commit(rc, event.data, None).await;
        self.deliver(emits);
        let mut data = data.into_inner();
        self.apply_projection(query, &mut data);
        Ok(Value::Object(data))
    }

    // ── POST ─────────────────────────────────────────────────────────────

    pub async fn create(&self, rc: &RequestContext, body: Value) -> Result<Value, PipelineError> {
        let raw = match body {
            Value::Object(map) => map,
            _ => return Err(PipelineError::BadRequest("expected a JSON object".into())),
        };
        let now = depot_core::now_rfc3339();

        if rc.skip_events() {
            let mut clean = self
                .schema
                .sanitize(&raw, Mode::Create, rc.internal, &now);
            let errors = self.schema.validate(&clean, Mode::Create);
            if !errors.is_empty() {
                return Err(PipelineError::Validation(errors));
            }
            self.hash_password_field(&mut clean)?;
            let saved = self.store.insert(clean).await?;
            return Ok(saved.into_value());
        }

        let mut event = self.event(rc, Phase::BeforeRequest, Document(raw));
        event = self.run_hook(Phase::BeforeRequest, event).await?;
        event.settle()?;
        let mut emits = std::mem::take(&mut event.emits);

        // Schema gate: coerce, then seed hook-visible errors.
        event.data = self
            .schema
            .sanitize(&event.data, Mode::Create, rc.internal, &now);
        event.errors = self.schema.validate(&event.data, Mode::Create);

        event.phase = Phase::Validate;
        event = self.run_hook(Phase::Validate, event).await?;
        event.settle()?;

        event.phase = Phase::Post;
        event = self.run_hook(Phase::Post, event).await?;
        event.settle()?;
        emits.append(&mut event.emits);

        let mut doc = event.data;
        for field in &event.protect {
            doc.remove(field);
        }
        self.hash_password_field(&mut doc)?;

        let saved = self.store.insert(doc).await?;

        let data = self.after_commit(rc, saved, None).await;
        self.deliver(emits);
        Ok(data.into_value())
    }

    // ── PUT ──────────────────────────────────────────────────────────────

    pub async fn update(
        &self,
        rc: &RequestContext,
        id: &str,
        body: Value,
    ) -> Result<Value, PipelineError> {
        let raw = match body {
            Value::Object(map) => map,
            _ => return Err(PipelineError::BadRequest("expected a JSON object".into())),
        };
        let now = depot_core::now_rfc3339();
        let existing = self.fetch(rc, id).await?;

        if rc.skip_events() {
            let changes = self
                .schema
                .sanitize(&raw, Mode::Update, rc.internal, &now);
            let mut merged = self.merge_changes(&existing, changes, rc.internal);
            let errors = self.schema.validate(&merged, Mode::Update);
            if !errors.is_empty() {
                return Err(PipelineError::Validation(errors));
            }
            self.hash_password_field(&mut merged)?;
            let update = self.diff_update(&existing, &merged, &Default::default());
            let (post, _) = self.store.update_one(&Query::by_id(id), &update).await?;
            return Ok(post.into_value());
        }

        let mut event = self.event(rc, Phase::BeforeRequest, Document(raw));
        event = self.run_hook(Phase::BeforeRequest, event).await?;
        event.settle()?;
        let mut emits = std::mem::take(&mut event.emits);

        // The working document is the pre-image merged with the sanitized
        // changes; hooks see the future state with `previous` alongside.
        let changes = self
            .schema
            .sanitize(&event.data, Mode::Update, rc.internal, &now);
        event.data = self.merge_changes(&existing, changes, rc.internal);
        event.previous = Some(existing.clone());
        event.errors = self.schema.validate(&event.data, Mode::Update);

        event.phase = Phase::Validate;
        event = self.run_hook(Phase::Validate, event).await?;
        event.settle()?;

        event.phase = Phase::Put;
        event = self.run_hook(Phase::Put, event).await?;
        event.settle()?;
        emits.append(&mut event.emits);

        let mut doc = event.data;
        self.hash_password_field(&mut doc)?;
        let update = self.diff_update(&existing, &doc, &event.protect);
        if update.is_empty() {
            let data = self.after_commit(rc, existing.clone(), Some(existing)).await;
            self.deliver(emits);
            return Ok(data.into_value());
        }

        let (post, pre) = self.store.update_one(&Query::by_id(id), &update).await?;

        let data = self.after_commit(rc, post, Some(pre)).await;
        self.deliver(emits);
        Ok(data.into_value())
    }

    // ── DELETE ───────────────────────────────────────────────────────────

    pub async fn delete(&self, rc: &RequestContext, id: &str) -> Result<(), PipelineError> {
        let existing = self.fetch(rc, id).await?;

        if rc.skip_events() {
            if self.store.remove(&Query::by_id(id)).await? == 0 {
                return Err(PipelineError::NotFound(format!("{}/{id}", self.name)));
            }
            return Ok(());
        }

        let mut event = self.event(rc, Phase::BeforeRequest, Document::new());
        event = self.run_hook(Phase::BeforeRequest, event).await?;
        event.settle()?;
        let mut emits = std::mem::take(&mut event.emits);

        let mut event = self.event(rc, Phase::Delete, existing.clone());
        event = self.run_hook(Phase::Delete, event).await?;
        event.settle()?;
        emits.append(&mut event.emits);

        if self.store.remove(&Query::by_id(id)).await? == 0 {
            return Err(PipelineError::NotFound(format!("{}/{id}", self.name)));
        }

        self.after_commit(rc, existing, None).await;
        self.deliver(emits);
        Ok(())
    }

    /// Route a parsed request to the matching operation.
    pub async fn dispatch(
        &self,
        rc: &RequestContext,
        target: Target,
        query: &Query,
        body: Option<Value>,
    ) -> Result<Option<Value>, PipelineError> {
        match (rc.method, target) {
            (Method::Get, Target::List) => self.list(rc, query).await.map(Some),
            (Method::Get, Target::Count) => self.count(rc, query).await.map(Some),
            (Method::Get, Target::One(id)) => self.get_one(rc, &id, query).await.map(Some),
            (Method::Post, Target::List) => self
                .create(rc, body.unwrap_or(Value::Null))
                .await
                .map(Some),
            (Method::Put, Target::One(id)) => self
                .update(rc, &id, body.unwrap_or(Value::Null))
                .await
                .map(Some),
            (Method::Delete, Target::One(id)) => self.delete(rc, &id).await.map(|()| None),
            _ => Err(PipelineError::BadRequest("unsupported operation".into())),
        }
    }

    /// Merge sanitized update changes into the pre-image. System properties
    /// stay readonly from outside: for external callers the stored value
    /// wins over whatever the payload carried.
    fn merge_changes(&self, existing: &Document, changes: Document, internal: bool) -> Document {
        let mut merged = existing.clone();
        for (key, value) in changes.0 {
            if !internal {
                if let Some(property) = self.schema.property(&key) {
                    if property.system {
                        continue;
                    }
                }
            }
            merged.insert(key, value);
        }
        merged
    }

    /// Fetch a document by id, enforcing ownership for non-root callers.
    async fn fetch(&self, rc: &RequestContext, id: &str) -> Result<Document, PipelineError> {
        let doc = self
            .store
            .find_one(&Query::by_id(id))
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("{}/{id}", self.name)))?;
        self.check_ownership(rc, &doc)?;
        Ok(doc)
    }

    /// `$set` for changed fields, `$unset` for protected fields and keys a
    /// hook removed from the working document.
    fn diff_update(
        &self,
        pre: &Document,
        post: &Document,
        protect: &std::collections::BTreeSet<String>,
    ) -> Update {
        let mut update = Update::new();
        for (key, value) in post.iter() {
            if depot_schema::IMPLICIT_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if protect.contains(key) {
                continue;
            }
            if pre.get(key) != Some(value) {
                update.set.insert(key.clone(), value.clone());
            }
        }
        for key in pre.keys() {
            if depot_schema::IMPLICIT_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if !post.contains_key(key) {
                update.unset.push(key.clone());
            }
        }
        for key in protect {
            if pre.contains_key(key) || post.contains_key(key) {
                update.unset.push(key.clone());
            }
        }
        update.unset.sort();
        update.unset.dedup();
        update
    }

    /// Collections named `users` never store plaintext passwords.
    fn hash_password_field(&self, doc: &mut Document) -> Result<(), PipelineError> {
        if self.name != "users" {
            return Ok(());
        }
        let Some(Value::String(password)) = doc.get("password") else {
            return Ok(());
        };
        if password.starts_with("$argon2") {
            return Ok(());
        }
        let hashed = depot_security::hash_password(password)
            .map_err(|e| PipelineError::Internal(format!("password hash: {e}")))?;
        doc.insert("password".into(), Value::String(hashed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::{Identity, NoInternalApi, NoopEmitter, RequestContext};
    use depot_script::js::JsPoolConfig;
    use depot_store::{Backend, MemoryBackend};
    use serde_json::json;

    async fn resource(config: &str) -> CollectionResource {
        let schema = Schema::from_config(config).unwrap();
        let store = MemoryBackend::new()
            .open("docs", &schema.unique_fields())
            .await
            .unwrap();
        CollectionResource::new(
            "docs",
            schema,
            store,
            Arc::new(JsPool::new(JsPoolConfig::default()).unwrap()),
            Arc::new(NoopEmitter),
        )
    }

    fn rc(identity: Option<Identity>) -> RequestContext {
        RequestContext::new(Method::Get, json!({}), identity, Arc::new(NoInternalApi))
    }

    #[tokio::test]
    async fn diff_update_sets_changes_and_unsets_removals() {
        let resource = resource(r#"{"properties": {"a": {"type": "number"}}}"#).await;
        let pre = Document::from_value(json!({"id": "1", "a": 1, "b": 2, "createdAt": "x"}));
        let post = Document::from_value(json!({"id": "1", "a": 9, "createdAt": "x"}));
        let update = resource.diff_update(&pre, &post, &Default::default());
        assert_eq!(update.set.get("a"), Some(&json!(9)));
        assert!(!update.set.contains_key("id"));
        assert!(!update.set.contains_key("createdAt"));
        assert_eq!(update.unset, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn diff_update_unsets_protected_fields() {
        let resource = resource(r#"{"properties": {"a": {"type": "number"}}}"#).await;
        let pre = Document::from_value(json!({"id": "1", "secret": "s"}));
        let post = Document::from_value(json!({"id": "1", "secret": "s2"}));
        let protect = ["secret".to_string()].into_iter().collect();
        let update = resource.diff_update(&pre, &post, &protect);
        assert!(!update.set.contains_key("secret"));
        assert_eq!(update.unset, vec!["secret".to_string()]);
    }

    #[tokio::test]
    async fn scope_query_injects_the_ownership_clause() {
        let resource =
            resource(r#"{"properties": {"userId": {"type": "string"}}}"#).await;
        let user = Identity {
            id: "u1".into(),
            username: "alice".into(),
            is_root: false,
        };
        let scoped = resource
            .scope_query(&rc(Some(user)), &Query::default())
            .unwrap();
        assert_eq!(scoped.filter.clauses.len(), 1);
        assert_eq!(scoped.filter.clauses[0].field, "userId");
        assert_eq!(scoped.filter.clauses[0].value, json!("u1"));

        // Root is never scoped; anonymous is refused.
        let scoped = resource
            .scope_query(&rc(Some(Identity::root())), &Query::default())
            .unwrap();
        assert!(scoped.filter.is_empty());
        assert!(matches!(
            resource.scope_query(&rc(None), &Query::default()),
            Err(PipelineError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn hooks_swap_atomically() {
        let resource = resource(r#"{"properties": {"a": {"type": "number"}}}"#).await;
        assert!(resource.hook(Phase::Post).is_none());
        resource.set_hook(Phase::Post, Some(Hook::Js(JsScript::new("docs/post", "1;"))));
        let first = resource.hook(Phase::Post).unwrap();
        resource.set_hook(Phase::Post, Some(Hook::Js(JsScript::new("docs/post", "2;"))));
        let second = resource.hook(Phase::Post).unwrap();
        // The old handle stays valid for in-flight requests.
        assert!(!Arc::ptr_eq(&first, &second));
        resource.set_hook(Phase::Post, None);
        assert!(resource.hook(Phase::Post).is_none());
    }
}
