//! The QuickJS side of the runtime: a fixed-size pool of isolates, each with
//! its own heap, global object, and compiled-function cache.

mod host;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use depot_core::EventContext;
use rquickjs as qjs;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{content_hash, ScriptError, CANCEL_SENTINEL};

/// A hook source held once as text; per-isolate compilation is lazy and
/// cached by content hash.
#[derive(Debug, Clone)]
pub struct JsScript {
    /// Diagnostic name, conventionally `<collection>/<phase>`.
    pub name: String,
    pub source: String,
    pub hash: String,
}

impl JsScript {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        let source = source.into();
        let hash = content_hash(&source);
        JsScript {
            name: name.into(),
            source,
            hash,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsPoolConfig {
    /// Number of pre-initialised isolates.
    pub size: usize,
    /// Bounded wait for an idle isolate before the throwaway slow path.
    pub acquire_timeout: Duration,
    /// Executions before an isolate is torn down and recreated.
    pub max_executions: u32,
    /// Root for the opt-in `require()` module loader.
    pub sandbox_dir: Option<PathBuf>,
}

impl Default for JsPoolConfig {
    fn default() -> Self {
        JsPoolConfig {
            size: 4,
            acquire_timeout: Duration::from_secs(5),
            max_executions: 1000,
            sandbox_dir: None,
        }
    }
}

/// A fixed-size pool of isolates.
///
/// One request holds one isolate for the duration of one script. When every
/// isolate is busy past the acquire timeout, execution falls through to a
/// fresh throwaway isolate rather than failing the request.
pub struct JsPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Isolate>>,
    permits: Arc<Semaphore>,
    config: JsPoolConfig,
}

impl JsPool {
    pub fn new(config: JsPoolConfig) -> Result<Self, ScriptError> {
        let mut idle = Vec::with_capacity(config.size);
        for _ in 0..config.size {
            idle.push(Isolate::new()?);
        }
        Ok(JsPool {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(idle.len())),
                idle: Mutex::new(idle),
                config,
            }),
        })
    }

    /// Compile `script` in a throwaway isolate to surface syntax errors at
    /// load time. The per-isolate caches still compile lazily.
    pub fn check(&self, script: &JsScript) -> Result<(), ScriptError> {
        let mut isolate = Isolate::new()?;
        isolate.compile_only(script)
    }

    /// Execute `script` against `event`, returning the mutated context.
    ///
    /// Cancellation is not an error here: it comes back recorded on the
    /// context for the bridge to reconcile.
    pub async fn run(
        &self,
        script: &JsScript,
        event: EventContext,
    ) -> Result<EventContext, ScriptError> {
        let handle = Handle::current();
        let sandbox = self.inner.config.sandbox_dir.clone();
        let (isolate, pooled) = self.acquire().await?;
        let script = script.clone();

        let (isolate, event, result) = tokio::task::spawn_blocking(move || {
            let mut isolate = isolate;
            let mut event = event;
            let result = isolate.execute(&script, &mut event, handle, sandbox.as_deref());
            (isolate, event, result)
        })
        .await
        .map_err(|e| ScriptError::Exception(format!("executor thread failed: {e}")))?;

        if pooled {
            self.release(isolate)?;
        }
        result.map(|()| event)
    }

    async fn acquire(&self) -> Result<(Isolate, bool), ScriptError> {
        let permits = Arc::clone(&self.inner.permits);
        let acquired =
            tokio::time::timeout(self.inner.config.acquire_timeout, permits.acquire_owned()).await;
        match acquired {
            Ok(Ok(permit)) => {
                permit.forget();
                match self.inner.idle.lock().unwrap().pop() {
                    Some(isolate) => Ok((isolate, true)),
                    // Permit accounting guarantees an idle isolate; a fresh
                    // one keeps the request alive if that ever breaks.
                    None => Ok((Isolate::new()?, false)),
                }
            }
            _ => {
                warn!("isolate pool exhausted, using a throwaway isolate");
                Ok((Isolate::new()?, false))
            }
        }
    }

    fn release(&self, isolate: Isolate) -> Result<(), ScriptError> {
        let isolate = if isolate.executions >= self.inner.config.max_executions {
            debug!(
                executions = isolate.executions,
                "recycling isolate past its execution budget"
            );
            Isolate::new()?
        } else {
            isolate
        };
        self.inner.idle.lock().unwrap().push(isolate);
        self.inner.permits.add_permits(1);
        Ok(())
    }
}

/// One QuickJS runtime + context pair with a compiled-function cache.
struct Isolate {
    // The runtime owns the heap; dropping it drops the context.
    _runtime: qjs::Runtime,
    context: qjs::Context,
    compiled: HashMap<String, qjs::Persistent<qjs::Function<'static>>>,
    executions: u32,
}

// QuickJS's raw pointers make this non-`Send` by default, but an `Isolate`
// is only ever touched by the one thread that currently owns it: idle in
// `PoolInner`'s `Mutex<Vec<Isolate>>`, or exclusively moved into the
// `spawn_blocking` closure that runs it. It is never accessed from two
// threads at once.
unsafe impl Send for Isolate {}

impl Isolate {
    fn new() -> Result<Self, ScriptError> {
        let runtime =
            qjs::Runtime::new().map_err(|e| ScriptError::Compile(format!("runtime: {e}")))?;
        runtime.set_memory_limit(32 * 1024 * 1024);
        runtime.set_max_stack_size(1024 * 1024);
        let context = qjs::Context::full(&runtime)
            .map_err(|e| ScriptError::Compile(format!("context: {e}")))?;
        context.with(|ctx| {
            ctx.eval::<(), _>(host::PRELUDE)
                .map_err(|e| ScriptError::Compile(format!("prelude: {}", describe(&ctx, e))))
        })?;
        Ok(Isolate {
            _runtime: runtime,
            context,
            compiled: HashMap::new(),
            executions: 0,
        })
    }

    fn compile_only(&mut self, script: &JsScript) -> Result<(), ScriptError> {
        self.context.with(|ctx| {
            let wrapped = wrap_source(&script.source);
            ctx.eval::<qjs::Function, _>(wrapped)
                .map(|_| ())
                .map_err(|e| ScriptError::Compile(describe(&ctx, e)))
        })
    }

    fn execute(
        &mut self,
        script: &JsScript,
        event: &mut EventContext,
        handle: Handle,
        sandbox: Option<&Path>,
    ) -> Result<(), ScriptError> {
        self.executions += 1;
        let state = host::HostState::shared();
        let compiled = &mut self.compiled;

        let run = self.context.with(|ctx| -> Result<(), ScriptError> {
            host::install(&ctx, event, &state, handle, sandbox)
                .map_err(|e| ScriptError::Exception(describe(&ctx, e)))?;

            let function = match compiled.get(&script.hash) {
                Some(persistent) => persistent
                    .clone()
                    .restore(&ctx)
                    .map_err(|e| ScriptError::Exception(describe(&ctx, e)))?,
                None => {
                    let function: qjs::Function = ctx
                        .eval(wrap_source(&script.source))
                        .map_err(|e| ScriptError::Compile(describe(&ctx, e)))?;
                    compiled.insert(
                        script.hash.clone(),
                        qjs::Persistent::save(&ctx, function.clone()),
                    );
                    function
                }
            };

            let outcome: Result<(), qjs::Error> = function.call(());
            if let Err(err) = outcome {
                let thrown = thrown_value(&ctx, err);
                if thrown.as_deref() != Some(CANCEL_SENTINEL) {
                    let _ = ctx.eval::<(), _>(host::CLEANUP);
                    return Err(ScriptError::Exception(
                        thrown.unwrap_or_else(|| "unknown exception".into()),
                    ));
                }
                // The sentinel means cancel() already recorded its payload.
            }

            // The mutated `data` global replaces the working document.
            let extracted: Result<String, qjs::Error> = (|| {
                let stringify: qjs::Function = ctx.eval("JSON.stringify")?;
                let data: qjs::Value = ctx.globals().get("data")?;
                stringify.call((data,))
            })();
            let extracted = extracted.map_err(|e| ScriptError::Exception(describe(&ctx, e)))?;
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&extracted) {
                event.data = depot_core::Document::from_value(value);
            }

            ctx.eval::<(), _>(host::CLEANUP)
                .map_err(|e| ScriptError::Exception(describe(&ctx, e)))?;
            Ok(())
        });

        host::merge_back(event, &state);
        run
    }
}

fn wrap_source(source: &str) -> String {
    // IIFE wrapper keeps user declarations off the shared global object.
    format!("(function() {{\n{source}\n}})")
}

/// Render the thrown value behind an `Err(Exception)`, if any.
fn thrown_value(ctx: &qjs::Ctx<'_>, err: qjs::Error) -> Option<String> {
    if !matches!(err, qjs::Error::Exception) {
        return Some(err.to_string());
    }
    let caught = ctx.catch();
    if let Some(s) = caught.as_string() {
        return s.to_string().ok();
    }
    if let Some(obj) = caught.as_object() {
        if let Ok(message) = obj.get::<_, String>("message") {
            return Some(message);
        }
    }
    Some(format!("{caught:?}"))
}

fn describe(ctx: &qjs::Ctx<'_>, err: qjs::Error) -> String {
    thrown_value(ctx, err).unwrap_or_else(|| "unknown error".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::{Document, Phase};
    use serde_json::json;

    fn event(data: serde_json::Value) -> EventContext {
        EventContext::new("items", Phase::Validate, Document::from_value(data))
    }

    async fn pool() -> JsPool {
        JsPool::new(JsPoolConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn scripts_mutate_data_in_place() {
        let pool = pool().await;
        let script = JsScript::new("items/post", "data.title = data.title.toUpperCase();");
        let out = pool.run(&script, event(json!({"title": "x"}))).await.unwrap();
        assert_eq!(out.data.get("title"), Some(&json!("X")));
    }

    #[tokio::test]
    async fn error_accumulates_and_cancel_short_circuits() {
        let pool = pool().await;

        let script = JsScript::new("items/validate", "error('title', 'is required');");
        let out = pool.run(&script, event(json!({}))).await.unwrap();
        assert!(out.has_errors());

        let script = JsScript::new(
            "items/validate",
            "cancel('stop right there', 422); error('never', 'reached');",
        );
        let out = pool.run(&script, event(json!({}))).await.unwrap();
        let cancel = out.cancellation.as_ref().expect("cancel should be recorded");
        assert_eq!(cancel.message, "stop right there");
        assert_eq!(cancel.status, 422);
        assert!(!out.has_errors());
    }

    #[tokio::test]
    async fn cancel_if_and_unless_guard() {
        let pool = pool().await;
        let script = JsScript::new(
            "items/validate",
            "cancelIf(data.n > 5, 'too big', 400); cancelUnless(data.ok, 'not ok', 403);",
        );
        let out = pool.run(&script, event(json!({"n": 1, "ok": true}))).await.unwrap();
        assert!(out.cancellation.is_none());
        let out = pool.run(&script, event(json!({"n": 9, "ok": true}))).await.unwrap();
        assert_eq!(out.cancellation.unwrap().status, 400);
        let out = pool.run(&script, event(json!({"n": 1, "ok": false}))).await.unwrap();
        assert_eq!(out.cancellation.unwrap().status, 403);
    }

    #[tokio::test]
    async fn hide_and_protect_are_recorded() {
        let pool = pool().await;
        let script = JsScript::new("users/get", "hide('password'); protect('secret');");
        let out = pool.run(&script, event(json!({}))).await.unwrap();
        assert!(out.hide.contains("password"));
        assert!(out.protect.contains("secret"));
    }

    #[tokio::test]
    async fn real_exceptions_are_not_cancellations() {
        let pool = pool().await;
        let script = JsScript::new("items/post", "throw new Error('boom');");
        let err = pool.run(&script, event(json!({}))).await.unwrap_err();
        assert!(matches!(err, ScriptError::Exception(msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn syntax_errors_fail_the_check() {
        let pool = pool().await;
        let script = JsScript::new("items/post", "function ( {");
        assert!(matches!(
            pool.check(&script),
            Err(ScriptError::Compile(_))
        ));
    }

    #[tokio::test]
    async fn me_and_is_me_reflect_identity() {
        let pool = pool().await;
        let mut ev = event(json!({}));
        ev.me = Some(depot_core::Identity {
            id: "u1".into(),
            username: "alice".into(),
            is_root: false,
        });
        let script = JsScript::new(
            "items/get",
            "if (!isMe('u1')) error('me', 'wrong'); if (me.username !== 'alice') error('name', 'wrong');",
        );
        let out = pool.run(&script, ev).await.unwrap();
        assert!(!out.has_errors());
    }

    #[tokio::test]
    async fn changed_compares_against_previous() {
        let pool = pool().await;
        let mut ev = event(json!({"title": "new", "same": 1}));
        ev.previous = Some(Document::from_value(json!({"title": "old", "same": 1})));
        let script = JsScript::new(
            "items/put",
            "if (!changed('title')) error('title', 'should differ'); if (changed('same')) error('same', 'should match');",
        );
        let out = pool.run(&script, ev).await.unwrap();
        assert!(!out.has_errors());
    }

    #[tokio::test]
    async fn emit_queues_messages() {
        let pool = pool().await;
        let script = JsScript::new(
            "items/aftercommit",
            "emit('lobby', 'created', {id: data.id});",
        );
        let out = pool.run(&script, event(json!({"id": "1"}))).await.unwrap();
        assert_eq!(out.emits.len(), 1);
        assert_eq!(out.emits[0].room, "lobby");
        assert_eq!(out.emits[0].payload, json!({"id": "1"}));
    }

    #[tokio::test]
    async fn require_crypto_is_available() {
        let pool = pool().await;
        let script = JsScript::new(
            "items/post",
            r#"const crypto = require('crypto');
               data.digest = crypto.sha256('abc');
               data.token = crypto.randomUUID();"#,
        );
        let out = pool.run(&script, event(json!({}))).await.unwrap();
        assert_eq!(
            out.data.get("digest"),
            Some(&json!(
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
            ))
        );
        assert_eq!(out.data.get("token").unwrap().as_str().unwrap().len(), 36);
    }

    #[tokio::test]
    async fn globals_do_not_leak_between_runs() {
        let pool = JsPool::new(JsPoolConfig {
            size: 1,
            ..JsPoolConfig::default()
        })
        .unwrap();
        let plant = JsScript::new("items/post", "globalThis.leak = 'x'; data.ok = true;");
        pool.run(&plant, event(json!({}))).await.unwrap();
        let probe = JsScript::new(
            "items/post",
            "if (typeof data !== 'object') error('data', 'missing'); data.saw = typeof leak;",
        );
        let out = pool.run(&probe, event(json!({}))).await.unwrap();
        // User globals survive within an isolate until recycling; the
        // engine-installed bindings must not.
        assert_eq!(out.data.get("saw"), Some(&json!("string")));
        assert!(!out.has_errors());
    }

    #[tokio::test]
    async fn isolates_recycle_after_the_execution_budget() {
        let pool = JsPool::new(JsPoolConfig {
            size: 1,
            max_executions: 2,
            ..JsPoolConfig::default()
        })
        .unwrap();
        let plant = JsScript::new("items/post", "globalThis.counter = (globalThis.counter || 0) + 1; data.count = counter;");
        let first = pool.run(&plant, event(json!({}))).await.unwrap();
        assert_eq!(first.data.get("count"), Some(&json!(1)));
        let second = pool.run(&plant, event(json!({}))).await.unwrap();
        assert_eq!(second.data.get("count"), Some(&json!(2)));
        // The isolate hit its budget and was torn down; state restarts.
        let third = pool.run(&plant, event(json!({}))).await.unwrap();
        assert_eq!(third.data.get("count"), Some(&json!(1)));
    }
}
