//! Resource discovery: a directory walk at startup, `notify` events
//! afterwards. Each `resources/<collection>/` directory holding a
//! `config.json` becomes a live [`CollectionResource`]; schema or hook edits
//! replace it atomically, and removing the directory destroys it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use depot_core::{
    Emitter, Identity, InternalApi, InternalCall, Method, PipelineError, RequestContext,
};
use depot_query::parse::filter_from_json;
use depot_query::Query;
use depot_schema::Schema;
use depot_script::js::{JsPool, JsScript};
use depot_script::native::{NativePlugins, PluginCompiler, PluginHandle};
use depot_store::Backend;
use notify::Watcher;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::resource::{CollectionResource, Hook, Target};

pub struct ResourceRegistry {
    resources: Arc<DashMap<String, Arc<CollectionResource>>>,
    resources_dir: PathBuf,
    backend: Arc<dyn Backend>,
    js: Arc<JsPool>,
    compiler: Arc<PluginCompiler>,
    plugins: Arc<NativePlugins>,
    emitter: Arc<dyn Emitter>,
}

impl ResourceRegistry {
    pub fn new(
        resources_dir: impl Into<PathBuf>,
        backend: Arc<dyn Backend>,
        js: Arc<JsPool>,
        compiler: Arc<PluginCompiler>,
        emitter: Arc<dyn Emitter>,
    ) -> Self {
        ResourceRegistry {
            resources: Arc::new(DashMap::new()),
            resources_dir: resources_dir.into(),
            backend,
            js,
            compiler,
            plugins: Arc::new(NativePlugins::new()),
            emitter,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CollectionResource>> {
        self.resources.get(name).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// The internal-call capability handed to request contexts.
    pub fn gateway(&self) -> Arc<InternalGateway> {
        Arc::new(InternalGateway {
            resources: Arc::clone(&self.resources),
            emitter: Arc::clone(&self.emitter),
        })
    }

    /// Walk `resources/` and (re)load every collection directory.
    pub async fn load_all(&self) -> std::io::Result<()> {
        if !self.resources_dir.exists() {
            std::fs::create_dir_all(&self.resources_dir)?;
        }
        for entry in std::fs::read_dir(&self.resources_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            self.load_collection(&name).await;
        }
        info!(collections = self.resources.len(), "resources loaded");
        Ok(())
    }

    /// Load or replace one collection from its directory. Missing or broken
    /// configuration removes the collection instead.
    pub async fn load_collection(&self, name: &str) {
        let dir = self.resources_dir.join(name);
        let config = dir.join("config.json");
        if !config.exists() {
            if self.resources.remove(name).is_some() {
                info!(collection = name, "collection removed");
            }
            return;
        }

        let schema = match std::fs::read_to_string(&config)
            .map_err(|e| e.to_string())
            .and_then(|raw| Schema::from_config(&raw).map_err(|e| e.to_string()))
        {
            Ok(schema) => schema,
            Err(err) => {
                error!(collection = name, error = %err, "invalid config.json, skipping");
                return;
            }
        };

        let store = match self.backend.open(name, &schema.unique_fields()).await {
            Ok(store) => store,
            Err(err) => {
                error!(collection = name, error = %err, "store open failed");
                return;
            }
        };

        let resource = CollectionResource::new(
            name,
            schema,
            store,
            Arc::clone(&self.js),
            Arc::clone(&self.emitter),
        );
        for phase in depot_core::Phase::ALL {
            if let Some(hook) = self.load_hook(&dir, name, phase).await {
                resource.set_hook(phase, Some(hook));
            }
        }

        self.resources.insert(name.to_string(), Arc::new(resource));
        info!(collection = name, "collection loaded");
    }

    /// Load one phase's hook file, preferring `.js` when both dialects
    /// exist. A hook that fails to compile leaves the phase with no script.
    async fn load_hook(&self, dir: &Path, collection: &str, phase: depot_core::Phase) -> Option<Hook> {
        let stem = phase.file_stem();

        let js_path = dir.join(format!("{stem}.js"));
        if js_path.exists() {
            let source = match std::fs::read_to_string(&js_path) {
                Ok(source) => source,
                Err(err) => {
                    error!(collection, phase = stem, error = %err, "hook unreadable");
                    return None;
                }
            };
            let script = JsScript::new(format!("{collection}/{stem}"), source);
            if let Err(err) = self.js.check(&script) {
                error!(collection, phase = stem, error = %err, "hook failed to compile");
                return None;
            }
            return Some(Hook::Js(script));
        }

        let native_path = dir.join(format!("{stem}.native"));
        if native_path.exists() {
            let source = match std::fs::read_to_string(&native_path) {
                Ok(source) => source,
                Err(err) => {
                    error!(collection, phase = stem, error = %err, "hook unreadable");
                    return None;
                }
            };
            match self.compiler.compile(collection, stem, &source).await {
                Ok(compiled) => match PluginHandle::load(&compiled) {
                    Ok(handle) => {
                        self.plugins.install(collection, stem, Arc::clone(&handle));
                        return Some(Hook::Native(handle));
                    }
                    Err(err) => {
                        error!(collection, phase = stem, error = %err, "plugin load failed");
                    }
                },
                Err(err) => {
                    // Failure policy: the phase simply has no script.
                    error!(collection, phase = stem, error = %err, "plugin compile failed");
                }
            }
        }
        None
    }

    /// Watch `resources/` and reload the affected collection on changes.
    /// The returned watcher must stay alive for as long as reloads matter.
    pub fn watch(self: Arc<Self>) -> notify::Result<notify::RecommendedWatcher> {
        let root = self.resources_dir.clone();
        let dir = self.resources_dir.clone();
        let registry = self;
        let handle = tokio::runtime::Handle::current();
        let mut watcher =
            notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        warn!(error = %err, "filesystem watch error");
                        return;
                    }
                };
                let mut touched = std::collections::BTreeSet::new();
                for path in &event.paths {
                    if let Some(name) = collection_of(&root, path) {
                        touched.insert(name);
                    }
                }
                for name in touched {
                    let registry = Arc::clone(&registry);
                    handle.spawn(async move {
                        registry.load_collection(&name).await;
                    });
                }
            })?;
        watcher.watch(&dir, notify::RecursiveMode::Recursive)?;
        info!(dir = %dir.display(), "watching resources");
        Ok(watcher)
    }
}

/// The collection directory a changed path belongs to, if any.
fn collection_of(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let first = relative.components().next()?;
    match first {
        std::path::Component::Normal(name) => name.to_str().map(String::from),
        _ => None,
    }
}

/// The narrow capability hooks re-enter the pipeline through: resolves the
/// target collection and dispatches with `internal = true` and root
/// privileges. The target's hooks still run.
#[derive(Clone)]
pub struct InternalGateway {
    resources: Arc<DashMap<String, Arc<CollectionResource>>>,
    emitter: Arc<dyn Emitter>,
}

#[async_trait::async_trait]
impl InternalApi for InternalGateway {
    async fn call(&self, call: InternalCall) -> Result<Value, PipelineError> {
        let resource = self
            .resources
            .get(&call.collection)
            .map(|r| r.value().clone())
            .ok_or_else(|| PipelineError::NotFound(format!("collection {}", call.collection)))?;

        let query = Query {
            filter: filter_from_json(&call.query)
                .map_err(|e| PipelineError::BadRequest(e.to_string()))?,
            options: Default::default(),
        };
        let rc = RequestContext {
            method: call.method,
            query: call.query.clone(),
            identity: Some(Identity::root()),
            development: false,
            internal: true,
            api: Arc::new(self.clone()),
        };
        let target = match (call.method, call.id) {
            (Method::Post, _) => Target::List,
            (Method::Get, None) => Target::List,
            (_, Some(id)) => Target::One(id),
            (_, None) => {
                return Err(PipelineError::BadRequest(
                    "this method needs a document id".into(),
                ))
            }
        };

        let result = resource.dispatch(&rc, target, &query, call.body).await?;
        Ok(result.unwrap_or(Value::Null))
    }

    fn emit(&self, room: &str, event: &str, payload: Value) {
        self.emitter.emit(room, event, &payload);
    }
}
