//! # depot-core — shared types for the Depot request pipeline
//!
//! This crate holds the value types every other Depot crate builds on:
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Document`] | A JSON document with `id` / `createdAt` / `updatedAt` system fields |
//! | [`RequestContext`] | Per-request immutable bundle of identity, query, and flags |
//! | [`EventContext`] | The mutable surface a lifecycle hook sees and mutates |
//! | [`PipelineError`] | The error taxonomy the pipeline maps to HTTP responses |
//! | [`Settings`] | Runtime settings loaded from `.config/security.json` |
//!
//! Nothing here touches HTTP, storage, or scripting directly; those live in
//! `depot-server`, `depot-store`, and `depot-script` respectively.

mod config;
mod context;
mod document;
mod error;
mod event;

pub use config::Settings;
pub use context::{Identity, InternalApi, InternalCall, Method, NoInternalApi, RequestContext};
pub use document::{now_rfc3339, Document};
pub use error::{PipelineError, ValidationErrors};
pub use event::{
    Cancellation, EmitMessage, Emitter, EventContext, EventOutcome, NoopEmitter, Phase,
};
