//! # depot-server — the request-execution engine
//!
//! Drop a schema at `resources/<collection>/config.json` and this crate
//! serves validated CRUD, query, and count endpoints for it, intercepted by
//! per-phase hooks in JavaScript (`<phase>.js`) or compiled Rust
//! (`<phase>.native`).
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resource`] | The per-collection lifecycle state machine |
//! | [`registry`] | Discovery, hot reload, and the internal-call gateway |
//! | [`router`] | axum routes, identity extraction, CORS |
//! | [`auth`] | `/auth/login`, `/auth/validate`, `/auth/me` |
//! | [`sweeper`] | Hourly cleanup of expired unverified users |

pub mod auth;
pub mod registry;
pub mod resource;
pub mod router;
pub mod sweeper;

pub use registry::{InternalGateway, ResourceRegistry};
pub use resource::{CollectionResource, Hook, Target};
pub use router::{build_router, AppState};
