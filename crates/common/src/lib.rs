//! Shared types for the optiflux deployment manager.
//!
//! This crate holds the on-disk descriptor schema and the JSON payloads
//! exchanged between the `optiflux` server and its CLI client.

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

pub mod api;
pub mod descriptor;

pub use api::{
    DeployReceipt, EntryKind, Envelope, FileEntry, InstanceReport, LaunchedInstance, LogTail,
    ModelPage, ModelSummary, PortState, PortStatus, ResponseStatus, RestartReport,
    RestartRequest, ServiceStatusReport, UploadType, VersionSummary,
};
pub use descriptor::{
    DEFAULT_WORKERS, Environment, InstanceStatus, ModelDescriptor, ServiceInstance, ServiceKind,
    ServiceTable,
};

/// Default port the manager HTTP server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 8912;
