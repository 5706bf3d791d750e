//! Loading and invoking compiled native hooks.

mod compile;

pub use compile::{CompiledPlugin, PluginCompiler};

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use depot_core::{Cancellation, EmitMessage, EventContext};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ScriptError;

const PROTOCOL_VERSION: u32 = 1;

type HandlerFn = unsafe extern "C" fn(*const c_char) -> *mut c_char;
type FreeFn = unsafe extern "C" fn(*mut c_char);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputEnvelope<'a> {
    version: u32,
    data: &'a Map<String, Value>,
    query: &'a Value,
    me: Option<&'a depot_core::Identity>,
    previous: Option<&'a Map<String, Value>>,
    is_root: bool,
    internal: bool,
    errors: &'a BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputEnvelope {
    version: u32,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    errors: BTreeMap<String, String>,
    #[serde(default)]
    hide_fields: Vec<String>,
    #[serde(default)]
    protect_fields: Vec<String>,
    #[serde(default)]
    cancel: Option<Cancellation>,
    #[serde(default)]
    emits: Vec<EmitMessage>,
    #[serde(default)]
    logs: Vec<String>,
    #[serde(default)]
    fail: Option<String>,
}

/// A loaded shared object pinned for as long as any request may call it.
pub struct PluginHandle {
    library: libloading::Library,
    pub path: PathBuf,
    pub hash: String,
}

impl PluginHandle {
    /// Open the shared object and resolve the handler symbols.
    pub fn load(plugin: &CompiledPlugin) -> Result<Arc<PluginHandle>, ScriptError> {
        let library = unsafe { libloading::Library::new(&plugin.path) }
            .map_err(|e| ScriptError::Load(format!("{}: {e}", plugin.path.display())))?;
        // Resolve eagerly so a bad artifact fails at load, not mid-request.
        unsafe {
            library
                .get::<HandlerFn>(b"depot_handle_event")
                .map_err(|e| ScriptError::Load(format!("missing handler symbol: {e}")))?;
            library
                .get::<FreeFn>(b"depot_free_result")
                .map_err(|e| ScriptError::Load(format!("missing free symbol: {e}")))?;
        }
        Ok(Arc::new(PluginHandle {
            library,
            path: plugin.path.clone(),
            hash: plugin.hash.clone(),
        }))
    }

    /// Run the plugin against `event`, folding its outcome back in.
    pub fn invoke(&self, event: &mut EventContext) -> Result<(), ScriptError> {
        let input = InputEnvelope {
            version: PROTOCOL_VERSION,
            data: &event.data,
            query: &event.query,
            me: event.me.as_ref(),
            previous: event.previous.as_deref(),
            is_root: event.is_root,
            internal: event.internal,
            errors: &event.errors.0,
        };
        let raw = serde_json::to_string(&input)
            .map_err(|e| ScriptError::Protocol(format!("input: {e}")))?;
        let raw = CString::new(raw).map_err(|e| ScriptError::Protocol(format!("input: {e}")))?;

        let response = unsafe {
            let handler = self
                .library
                .get::<HandlerFn>(b"depot_handle_event")
                .map_err(|e| ScriptError::Load(e.to_string()))?;
            let free = self
                .library
                .get::<FreeFn>(b"depot_free_result")
                .map_err(|e| ScriptError::Load(e.to_string()))?;
            let ptr = handler(raw.as_ptr());
            if ptr.is_null() {
                return Err(ScriptError::Protocol("plugin returned null".into()));
            }
            let response = CStr::from_ptr(ptr).to_string_lossy().into_owned();
            free(ptr);
            response
        };

        let output: OutputEnvelope = serde_json::from_str(&response)
            .map_err(|e| ScriptError::Protocol(format!("output: {e}")))?;
        if output.version != PROTOCOL_VERSION {
            return Err(ScriptError::Protocol(format!(
                "unsupported protocol version {}",
                output.version
            )));
        }
        if let Some(message) = output.fail {
            return Err(ScriptError::Panic(message));
        }

        event.data = depot_core::Document(output.data);
        for (field, message) in output.errors {
            event.errors.add(field, message);
        }
        event.hide.extend(output.hide_fields);
        event.protect.extend(output.protect_fields);
        if output.cancel.is_some() {
            event.cancellation = output.cancel;
        }
        event.emits.extend(output.emits);
        for line in output.logs {
            tracing::info!(
                collection = %event.collection,
                phase = %event.phase,
                "{line}"
            );
        }
        Ok(())
    }
}

/// The process-wide `(collection, phase) → handle` cache.
///
/// Readers resolve on each invocation; hot reload swaps under the write
/// lock, so in-flight requests keep the `Arc` they resolved while new
/// requests see the new handle. Content-hashed artifact paths mean a
/// recompile never reopens an already-open path.
#[derive(Default)]
pub struct NativePlugins {
    handles: RwLock<HashMap<(String, String), Arc<PluginHandle>>>,
}

impl NativePlugins {
    pub fn new() -> Self {
        NativePlugins::default()
    }

    pub fn get(&self, collection: &str, phase: &str) -> Option<Arc<PluginHandle>> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(collection.to_string(), phase.to_string()))
            .cloned()
    }

    /// Atomically install (or replace) the handle for `(collection, phase)`.
    pub fn install(&self, collection: &str, phase: &str, handle: Arc<PluginHandle>) {
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((collection.to_string(), phase.to_string()), handle);
    }

    pub fn remove(&self, collection: &str, phase: &str) {
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(collection.to_string(), phase.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_envelope_tolerates_missing_fields() {
        let output: OutputEnvelope =
            serde_json::from_str(r#"{"version": 1, "data": {"a": 1}}"#).unwrap();
        assert_eq!(output.version, 1);
        assert!(output.errors.is_empty());
        assert!(output.cancel.is_none());
    }

    #[test]
    fn input_envelope_serializes_camel_case() {
        let data = Map::new();
        let errors = BTreeMap::new();
        let query = serde_json::json!({});
        let input = InputEnvelope {
            version: 1,
            data: &data,
            query: &query,
            me: None,
            previous: None,
            is_root: true,
            internal: false,
            errors: &errors,
        };
        let raw = serde_json::to_string(&input).unwrap();
        assert!(raw.contains("\"isRoot\":true"));
        assert!(raw.contains("\"version\":1"));
    }
}
