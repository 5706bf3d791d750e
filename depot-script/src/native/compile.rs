//! Compiles `<phase>.native` hook sources into loadable shared objects.
//!
//! One compiler serves both startup discovery and hot reload. The artifact
//! path is content-hashed, so every source version gets a fresh path and the
//! loader never reopens a stale object under a new handle.

use std::path::{Path, PathBuf};

use tracing::{debug, error};

use crate::{content_hash, ScriptError};

/// The manifest of the scratch crate. Pins only what the adapter itself
/// references.
const SCRATCH_MANIFEST: &str = r#"[package]
name = "depot-plugin"
version = "0.0.0"
edition = "2021"

[lib]
crate-type = ["cdylib"]

[dependencies]
serde = { version = "1", features = ["derive"] }
serde_json = "1"

[profile.release]
debug = false
"#;

pub struct PluginCompiler {
    plugins_dir: PathBuf,
}

/// A compiled artifact ready for the loader.
#[derive(Debug, Clone)]
pub struct CompiledPlugin {
    pub path: PathBuf,
    pub hash: String,
}

impl PluginCompiler {
    /// `plugins_dir` is where finished shared objects land (`.plugins/`).
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        PluginCompiler {
            plugins_dir: plugins_dir.into(),
        }
    }

    /// Compile `source` for `(collection, phase)`. Reuses the artifact when
    /// the same source version was compiled before.
    pub async fn compile(
        &self,
        collection: &str,
        phase: &str,
        source: &str,
    ) -> Result<CompiledPlugin, ScriptError> {
        let hash = content_hash(source);
        let file_name = format!(
            "{collection}.{phase}.{hash}.{}",
            std::env::consts::DLL_EXTENSION
        );
        std::fs::create_dir_all(&self.plugins_dir)
            .map_err(|e| ScriptError::Compile(format!("plugins dir: {e}")))?;
        let out_path = self
            .plugins_dir
            .join(&file_name)
            .canonicalize()
            .unwrap_or_else(|_| self.plugins_dir.join(&file_name));
        // The loader needs absolute paths; relative ones resolve against the
        // linker's idea of cwd, not ours.
        let out_path = if out_path.is_absolute() {
            out_path
        } else {
            std::env::current_dir()
                .map_err(|e| ScriptError::Compile(e.to_string()))?
                .join(out_path)
        };

        if out_path.exists() {
            debug!(path = %out_path.display(), "reusing compiled plugin");
            return Ok(CompiledPlugin {
                path: out_path,
                hash,
            });
        }

        let scratch = tempfile::tempdir()
            .map_err(|e| ScriptError::Compile(format!("scratch dir: {e}")))?;
        write_scratch_crate(scratch.path(), source)
            .map_err(|e| ScriptError::Compile(format!("scratch crate: {e}")))?;

        let output = tokio::process::Command::new("cargo")
            .arg("build")
            .arg("--release")
            .arg("--quiet")
            .current_dir(scratch.path())
            .env("CARGO_TARGET_DIR", scratch.path().join("target"))
            .output()
            .await
            .map_err(|e| ScriptError::Compile(format!("cargo: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(collection, phase, "plugin compilation failed:\n{stderr}");
            return Err(ScriptError::Compile(format!(
                "cargo build failed for {collection}/{phase}"
            )));
        }

        let artifact = scratch
            .path()
            .join("target")
            .join("release")
            .join(format!(
                "{}depot_plugin.{}",
                std::env::consts::DLL_PREFIX,
                std::env::consts::DLL_EXTENSION
            ));
        std::fs::copy(&artifact, &out_path)
            .map_err(|e| ScriptError::Compile(format!("artifact copy: {e}")))?;
        debug!(path = %out_path.display(), "compiled plugin");
        // The scratch directory drops here; only the artifact survives.
        Ok(CompiledPlugin {
            path: out_path,
            hash,
        })
    }
}

fn write_scratch_crate(dir: &Path, source: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir.join("src"))?;
    std::fs::write(dir.join("Cargo.toml"), SCRATCH_MANIFEST)?;
    let lib = format!("{ADAPTER}\n// ---- user hook ----\n{source}\n");
    std::fs::write(dir.join("src").join("lib.rs"), lib)
}

/// The generated adapter around a user hook.
///
/// The boundary is a version-tagged serialized envelope in each direction;
/// host and plugin agree on the wire format, not on a shared memory layout.
/// User code defines `fn handle(ctx: &mut EventContext)`.
const ADAPTER: &str = r##"// Generated by depot-script. Do not edit.
use std::collections::BTreeMap;
use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const CANCEL_SENTINEL: &str = "__depot_cancel__";
const PROTOCOL_VERSION: u32 = 1;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Input {
    version: u32,
    data: Map<String, Value>,
    #[serde(default)]
    query: Value,
    #[serde(default)]
    me: Option<Value>,
    #[serde(default)]
    previous: Option<Map<String, Value>>,
    #[serde(default)]
    is_root: bool,
    #[serde(default)]
    internal: bool,
    #[serde(default)]
    errors: BTreeMap<String, String>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct Output {
    version: u32,
    data: Map<String, Value>,
    errors: BTreeMap<String, String>,
    hide_fields: Vec<String>,
    protect_fields: Vec<String>,
    cancel: Option<CancelOut>,
    emits: Vec<EmitOut>,
    logs: Vec<String>,
    fail: Option<String>,
}

#[derive(Serialize)]
struct CancelOut {
    message: String,
    status: u16,
}

#[derive(Serialize)]
struct EmitOut {
    room: String,
    event: String,
    payload: Value,
}

/// The event context a native hook receives. Mirrors the JS surface.
pub struct EventContext {
    pub data: Map<String, Value>,
    pub query: Value,
    pub me: Option<Value>,
    pub previous: Option<Map<String, Value>>,
    pub is_root: bool,
    pub internal: bool,
    errors: BTreeMap<String, String>,
    hide: Vec<String>,
    protect: Vec<String>,
    emits: Vec<EmitOut>,
    logs: Vec<String>,
}

impl EventContext {
    pub fn error(&mut self, field: &str, message: &str) {
        self.errors.insert(field.to_string(), message.to_string());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn hide(&mut self, field: &str) {
        self.hide.push(field.to_string());
    }

    pub fn protect(&mut self, field: &str) {
        self.protect.push(field.to_string());
    }

    pub fn emit(&mut self, room: &str, event: &str, payload: Value) {
        self.emits.push(EmitOut {
            room: room.to_string(),
            event: event.to_string(),
            payload,
        });
    }

    pub fn log(&mut self, message: &str) {
        self.logs.push(message.to_string());
    }

    pub fn is_me(&self, id: &str) -> bool {
        self.me
            .as_ref()
            .and_then(|m| m.get("id"))
            .and_then(|v| v.as_str())
            == Some(id)
    }

    pub fn changed(&self, field: &str) -> bool {
        match &self.previous {
            Some(previous) => self.data.get(field) != previous.get(field),
            None => false,
        }
    }

    pub fn cancel(&self, message: &str, status: u16) -> ! {
        std::panic::panic_any(format!("{CANCEL_SENTINEL}:{status}:{message}"));
    }
}

fn fail_output(message: String) -> Output {
    Output {
        version: PROTOCOL_VERSION,
        fail: Some(message),
        ..Output::default()
    }
}

fn run(input: &str) -> Output {
    let input: Input = match serde_json::from_str(input) {
        Ok(input) => input,
        Err(e) => return fail_output(format!("bad input envelope: {e}")),
    };
    if input.version != PROTOCOL_VERSION {
        return fail_output(format!("unsupported protocol version {}", input.version));
    }

    let mut ctx = EventContext {
        data: input.data,
        query: input.query,
        me: input.me,
        previous: input.previous,
        is_root: input.is_root,
        internal: input.internal,
        errors: input.errors,
        hide: Vec::new(),
        protect: Vec::new(),
        emits: Vec::new(),
        logs: Vec::new(),
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| handle(&mut ctx)));
    let cancel = match outcome {
        Ok(()) => None,
        Err(payload) => {
            let text = payload
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap_or_else(|| "opaque panic".to_string());
            match text.strip_prefix(CANCEL_SENTINEL) {
                Some(rest) => {
                    let rest = rest.trim_start_matches(':');
                    let (status, message) = match rest.split_once(':') {
                        Some((status, message)) => {
                            (status.parse().unwrap_or(400), message.to_string())
                        }
                        None => (400, rest.to_string()),
                    };
                    Some(CancelOut { message, status })
                }
                None => return fail_output(format!("panic: {text}")),
            }
        }
    };

    Output {
        version: PROTOCOL_VERSION,
        data: ctx.data,
        errors: ctx.errors,
        hide_fields: ctx.hide,
        protect_fields: ctx.protect,
        cancel,
        emits: ctx.emits,
        logs: ctx.logs,
        fail: None,
    }
}

/// # Safety
/// `input` must be a valid NUL-terminated UTF-8 envelope; the returned
/// pointer must be released with `depot_free_result`.
#[no_mangle]
pub unsafe extern "C" fn depot_handle_event(input: *const c_char) -> *mut c_char {
    let input = if input.is_null() {
        String::new()
    } else {
        CStr::from_ptr(input).to_string_lossy().into_owned()
    };
    let output = run(&input);
    let raw = serde_json::to_string(&output)
        .unwrap_or_else(|_| "{\"version\":1,\"fail\":\"unserializable output\"}".to_string());
    match CString::new(raw) {
        Ok(cstring) => cstring.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
/// `ptr` must have come from `depot_handle_event` and not been freed.
#[no_mangle]
pub unsafe extern "C" fn depot_free_result(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}
"##;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_crate_has_a_pinned_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_scratch_crate(dir.path(), "fn handle(_ctx: &mut EventContext) {}").unwrap();
        let manifest = std::fs::read_to_string(dir.path().join("Cargo.toml")).unwrap();
        assert!(manifest.contains("crate-type = [\"cdylib\"]"));
        assert!(manifest.contains("serde_json"));
        let lib = std::fs::read_to_string(dir.path().join("src/lib.rs")).unwrap();
        assert!(lib.contains("depot_handle_event"));
        assert!(lib.contains("fn handle(_ctx: &mut EventContext)"));
    }

    #[test]
    fn artifact_names_are_content_hashed() {
        let a = content_hash("fn handle(ctx: &mut EventContext) {}");
        let b = content_hash("fn handle(ctx: &mut EventContext) { ctx.hide(\"x\"); }");
        assert_ne!(a, b);
        assert_eq!(a.len(), 12);
    }
}
