//! Deployment and process lifecycle manager for model-serving services.
//!
//! Versions of a model live under `<env root>/<model>/<version>/`, next to a
//! per-model `config.json` descriptor that declares which service instances
//! serve it. [`Manager`] deploys artifacts into that layout and restarts the
//! declared instances; [`server`] exposes it over HTTP.

#![forbid(unsafe_code)]
#![deny(warnings, unused_must_use, dead_code, missing_debug_implementations)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro
)]

pub mod archive;
pub mod audit;
pub mod auth;
pub mod browse;
pub mod cache;
pub mod config;
pub mod dotenv;
pub mod error;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod process;
pub mod prober;
pub mod registry;
pub mod script;
pub mod server;

pub use archive::{ArtifactSource, UploadedFile};
pub use audit::{AuditSink, JsonlAuditLog};
pub use auth::{Authorizer, Caller, Role, RolePolicy, UserDirectory};
pub use config::ManagerConfig;
pub use error::{ManagerError, Result};
pub use logging::init_tracing;
pub use manager::Manager;
pub use prober::PortProber;
