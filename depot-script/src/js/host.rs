//! Host bindings installed on an isolate's global object before each run.

use std::path::Path;
use std::sync::{Arc, Mutex};

use depot_core::{Cancellation, EmitMessage, EventContext, InternalCall, Method};
use hmac::{Hmac, Mac};
use rquickjs as qjs;
use rquickjs::function::Func;
use sha2::{Digest, Sha256};
use tokio::runtime::Handle;

/// Mutable state the host functions write into during one run.
#[derive(Default)]
pub(crate) struct HostState {
    pub errors: std::collections::BTreeMap<String, String>,
    pub hide: Vec<String>,
    pub protect: Vec<String>,
    pub cancellation: Option<Cancellation>,
    pub emits: Vec<EmitMessage>,
}

impl HostState {
    pub(crate) fn shared() -> Arc<Mutex<HostState>> {
        Arc::new(Mutex::new(HostState::default()))
    }
}

/// Install the per-run bindings: the event globals and the host functions.
pub(crate) fn install(
    ctx: &qjs::Ctx<'_>,
    event: &EventContext,
    state: &Arc<Mutex<HostState>>,
    handle: Handle,
    sandbox: Option<&Path>,
) -> Result<(), qjs::Error> {
    {
        let mut seeded = state.lock().unwrap();
        seeded.errors = event.errors.0.clone();
    }
    let globals = ctx.globals();

    let st = Arc::clone(state);
    globals.set(
        "__error",
        Func::from(move |field: String, message: String| {
            st.lock().unwrap().errors.insert(field, message);
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "__has_errors",
        Func::from(move || -> bool { !st.lock().unwrap().errors.is_empty() }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "__hide",
        Func::from(move |field: String| {
            st.lock().unwrap().hide.push(field);
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "__protect",
        Func::from(move |field: String| {
            st.lock().unwrap().protect.push(field);
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "__cancel",
        Func::from(move |message: String, status: i32| {
            let status = u16::try_from(status).unwrap_or(400);
            st.lock().unwrap().cancellation = Some(Cancellation { message, status });
        }),
    )?;

    let st = Arc::clone(state);
    globals.set(
        "__emit",
        Func::from(move |room: String, event: String, payload: String| {
            let payload = serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null);
            st.lock().unwrap().emits.push(EmitMessage {
                room,
                event,
                payload,
            });
        }),
    )?;

    let collection = event.collection.clone();
    let phase = event.phase;
    globals.set(
        "__log",
        Func::from(move |message: String, fields: String| {
            if fields.is_empty() {
                tracing::info!(collection = %collection, phase = %phase, "{message}");
            } else {
                tracing::info!(collection = %collection, phase = %phase, fields = %fields, "{message}");
            }
        }),
    )?;

    globals.set(
        "__sha256",
        Func::from(|input: String| hex::encode(Sha256::digest(input.as_bytes()))),
    )?;

    globals.set(
        "__hmac_sha256",
        Func::from(|key: String, message: String| -> String {
            let mut mac = match Hmac::<Sha256>::new_from_slice(key.as_bytes()) {
                Ok(mac) => mac,
                Err(_) => return String::new(),
            };
            mac.update(message.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }),
    )?;

    globals.set(
        "__uuid",
        Func::from(|| uuid::Uuid::new_v4().to_string()),
    )?;

    let sandbox = sandbox.map(Path::to_path_buf);
    globals.set(
        "__module_source",
        Func::from(move |name: String| -> String {
            match load_module(sandbox.as_deref(), &name) {
                Ok(src) => serde_json::json!({ "src": src }).to_string(),
                Err(err) => serde_json::json!({ "err": err }).to_string(),
            }
        }),
    )?;

    let api = event.api.clone();
    globals.set(
        "__dpd",
        Func::from(
            move |method: String, collection: String, query: String, body: String| -> String {
                let outcome = internal_call(&api, &handle, &method, &collection, &query, &body);
                match outcome {
                    Ok(value) => serde_json::json!({ "ok": value }).to_string(),
                    Err(err) => serde_json::json!({ "err": err }).to_string(),
                }
            },
        ),
    )?;

    // Event globals go through JSON to keep engine and host value spaces
    // apart (the same round-trip brings `data` back out).
    let env = serde_json::json!({
        "data": event.data,
        "query": event.query,
        "me": event.me,
        "previous": event.previous,
        "isRoot": event.is_root,
        "internal": event.internal,
        "errors": event.errors,
    });
    let install: qjs::Function = ctx.eval("__install")?;
    install.call::<_, ()>((env.to_string(),))?;
    Ok(())
}

/// Fold the run's host state back into the event context.
pub(crate) fn merge_back(event: &mut EventContext, state: &Arc<Mutex<HostState>>) {
    let mut state = state.lock().unwrap();
    for (field, message) in std::mem::take(&mut state.errors) {
        event.errors.add(field, message);
    }
    for field in state.hide.drain(..) {
        event.hide.insert(field);
    }
    for field in state.protect.drain(..) {
        event.protect.insert(field);
    }
    if let Some(cancel) = state.cancellation.take() {
        event.cancellation = Some(cancel);
    }
    event.emits.append(&mut state.emits);
}

fn internal_call(
    api: &Option<Arc<dyn depot_core::InternalApi>>,
    handle: &Handle,
    method: &str,
    collection: &str,
    query: &str,
    body: &str,
) -> Result<serde_json::Value, String> {
    let Some(api) = api else {
        return Err("internal calls are not available in this context".into());
    };
    let method = match method {
        "get" => Method::Get,
        "post" => Method::Post,
        "put" => Method::Put,
        "delete" => Method::Delete,
        other => return Err(format!("unknown method: {other}")),
    };
    let mut query: serde_json::Value =
        serde_json::from_str(query).map_err(|e| format!("bad query: {e}"))?;
    let id = query
        .as_object_mut()
        .and_then(|obj| obj.remove("id"))
        .and_then(|v| v.as_str().map(String::from));
    let body = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_str(body).map_err(|e| format!("bad body: {e}"))?)
    };
    let call = InternalCall {
        collection: collection.to_string(),
        method,
        id,
        query,
        body,
    };
    // Scripts run on blocking threads, so re-entering the async pipeline
    // parks this thread, not the runtime.
    handle
        .block_on(api.call(call))
        .map_err(|e| e.to_string())
}

/// The opt-in CommonJS-style loader:
/// `<sandbox>/node_modules/<name>/package.json → main`.
fn load_module(sandbox: Option<&Path>, name: &str) -> Result<String, String> {
    let Some(sandbox) = sandbox else {
        return Err(format!("module not found: {name}"));
    };
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(format!("invalid module name: {name}"));
    }
    let root = sandbox.join("node_modules").join(name);
    let manifest = std::fs::read_to_string(root.join("package.json"))
        .map_err(|_| format!("module not found: {name}"))?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest).map_err(|e| format!("bad package.json: {e}"))?;
    let main = manifest
        .get("main")
        .and_then(|v| v.as_str())
        .unwrap_or("index.js");
    std::fs::read_to_string(root.join(main)).map_err(|_| format!("module main missing: {name}"))
}

/// Installed once per isolate. Defines the user-facing API in terms of the
/// `__`-prefixed host functions.
pub(crate) const PRELUDE: &str = r#"
function __install(json) {
  const env = JSON.parse(json);
  globalThis.data = env.data;
  globalThis.query = env.query;
  globalThis.me = env.me;
  globalThis.previous = env.previous;
  globalThis.isRoot = env.isRoot;
  globalThis.internal = env.internal;
  globalThis.errors = env.errors;
}

globalThis.error = function (field, message) { __error(String(field), String(message)); };
globalThis.hasErrors = function () { return __has_errors(); };
globalThis.hide = function (field) { __hide(String(field)); };
globalThis.protect = function (field) { __protect(String(field)); };

globalThis.cancel = function (message, status) {
  __cancel(message == null ? "" : String(message), status == null ? 400 : status | 0);
  throw "__depot_cancel__";
};
globalThis.cancelIf = function (condition, message, status) {
  if (condition) cancel(message, status);
};
globalThis.cancelUnless = function (condition, message, status) {
  if (!condition) cancel(message, status);
};

globalThis.isMe = function (id) {
  return me !== null && typeof me === 'object' && me.id === id;
};
globalThis.changed = function (field) {
  if (previous === null || typeof previous !== 'object') return false;
  return JSON.stringify(data[field]) !== JSON.stringify(previous[field]);
};

globalThis.emit = function (room, event, payload) {
  if (payload === undefined) { payload = event; event = room; room = ""; }
  __emit(String(room), String(event), JSON.stringify(payload === undefined ? null : payload));
};

globalThis.log = function (message, fields) {
  __log(String(message), fields === undefined ? "" : JSON.stringify(fields));
};

function __dpd_call(method, collection, query, body) {
  const res = JSON.parse(__dpd(method, String(collection), JSON.stringify(query || {}),
    body === undefined || body === null ? "" : JSON.stringify(body)));
  if (res.err !== undefined) throw new Error(res.err);
  return res.ok;
}
globalThis.dpd = {
  get: function (collection, query) { return __dpd_call('get', collection, query, null); },
  post: function (collection, body) { return __dpd_call('post', collection, {}, body); },
  put: function (collection, id, body) { return __dpd_call('put', collection, { id: String(id) }, body); },
  del: function (collection, query) { return __dpd_call('delete', collection, query, null); },
};

globalThis.require = function (name) {
  name = String(name);
  if (name === 'crypto') {
    return { sha256: __sha256, hmacSha256: __hmac_sha256, randomUUID: __uuid };
  }
  if (name === 'util') {
    return {
      format: function (fmt) {
        let i = 1; const args = arguments;
        return String(fmt).replace(/%[sdj%]/g, function (m) {
          if (m === '%%') return '%';
          if (i >= args.length) return m;
          const a = args[i++];
          if (m === '%j') { try { return JSON.stringify(a); } catch (e) { return '[Circular]'; } }
          if (m === '%d') return String(Number(a));
          return String(a);
        });
      }
    };
  }
  if (name === 'path') {
    return {
      join: function () {
        return Array.prototype.filter.call(arguments, Boolean).join('/').replace(/\/+/g, '/');
      },
      dirname: function (p) {
        p = String(p); const i = p.lastIndexOf('/');
        return i < 0 ? '.' : (i === 0 ? '/' : p.slice(0, i));
      },
      basename: function (p) {
        p = String(p); const i = p.lastIndexOf('/');
        return i < 0 ? p : p.slice(i + 1);
      }
    };
  }
  const res = JSON.parse(__module_source(name));
  if (res.err !== undefined) throw new Error(res.err);
  const module = { exports: {} };
  (new Function('module', 'exports', 'require', res.src))(module, module.exports, globalThis.require);
  return module.exports;
};
"#;

/// Deletes the per-run bindings; user globals live until the isolate
/// recycles.
pub(crate) const CLEANUP: &str = r#"
delete globalThis.data;
delete globalThis.query;
delete globalThis.me;
delete globalThis.previous;
delete globalThis.isRoot;
delete globalThis.internal;
delete globalThis.errors;
"#;
