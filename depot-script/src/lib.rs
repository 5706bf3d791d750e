//! # depot-script — the dual script runtime
//!
//! Lifecycle hooks come in two dialects, both seeing the same event-context
//! surface:
//!
//! - [`js::JsPool`]: a fixed pool of pre-initialised QuickJS isolates
//!   running `<phase>.js` hooks synchronously.
//! - [`native::NativePlugins`]: `<phase>.native` hooks compiled to shared
//!   objects at startup (and on edit) and invoked through a version-tagged
//!   serialized envelope.
//!
//! Cancellation is uniform: a reserved sentinel travels as a thrown string
//! (JS) or a panic payload (native); the host turns it into a typed
//! cancellation rather than an execution error.

pub mod js;
pub mod native;

/// The reserved value a `cancel()` call travels as inside a runtime.
pub const CANCEL_SENTINEL: &str = "__depot_cancel__";

/// Errors from compiling or executing a hook.
#[derive(Debug)]
pub enum ScriptError {
    /// The source failed to compile (JS syntax error, cargo failure).
    Compile(String),
    /// The script threw a real exception (not a cancellation).
    Exception(String),
    /// A native plugin panicked outside the cancellation protocol.
    Panic(String),
    /// The shared object could not be loaded or lacks the handler symbol.
    Load(String),
    /// The envelope exchanged with a plugin did not parse or had the wrong
    /// version tag.
    Protocol(String),
}

impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScriptError::Compile(msg) => write!(f, "compile error: {msg}"),
            ScriptError::Exception(msg) => write!(f, "script exception: {msg}"),
            ScriptError::Panic(msg) => write!(f, "plugin panic: {msg}"),
            ScriptError::Load(msg) => write!(f, "plugin load error: {msg}"),
            ScriptError::Protocol(msg) => write!(f, "plugin protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<ScriptError> for depot_core::PipelineError {
    fn from(err: ScriptError) -> Self {
        tracing::error!(error = %err, "hook execution failed");
        depot_core::PipelineError::Script(err.to_string())
    }
}

/// Hash used to key compiled artifacts and per-isolate caches.
pub(crate) fn content_hash(source: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(source.as_bytes());
    hex::encode(&digest[..6])
}
