//! JSON payloads of the manager HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::descriptor::{InstanceStatus, ServiceInstance, ServiceKind};

/// Live result of probing a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    /// Something accepted a connection.
    Running,
    /// Nothing is listening.
    Stopped,
}

impl PortState {
    /// State for a port that did or did not accept a connection.
    pub const fn from_open(open: bool) -> Self {
        if open { Self::Running } else { Self::Stopped }
    }

    /// True for [`PortState::Running`].
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        })
    }
}

/// A port and its live state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    /// Checked port.
    pub port: u16,
    /// Whether it accepted a connection.
    pub status: PortState,
}

/// One version directory of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSummary {
    /// Directory name.
    pub version: String,
    /// Directory modification time.
    pub timestamp: Option<DateTime<Utc>>,
    /// Total bytes of regular files under the directory.
    pub size: u64,
    /// True for the descriptor's current version.
    pub is_serving: bool,
    /// Live port states, only attached to the serving version.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<ServiceKind, Vec<PortStatus>>,
}

/// `{"recom_status": {"8001": "Running"}, "reward_status": {"8002": "Stopped"}}`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceStatusReport {
    /// Recommendation server ports.
    #[serde(default)]
    pub recom_status: BTreeMap<u16, PortState>,
    /// Reward server ports.
    #[serde(default)]
    pub reward_status: BTreeMap<u16, PortState>,
}

impl ServiceStatusReport {
    /// Records the state of one port.
    pub fn insert(&mut self, kind: ServiceKind, port: u16, state: PortState) {
        self.ports_mut(kind).insert(port, state);
    }

    /// State recorded for `port`, if it was checked.
    pub fn get(&self, kind: ServiceKind, port: u16) -> Option<PortState> {
        match kind {
            ServiceKind::Recommendation => self.recom_status.get(&port).copied(),
            ServiceKind::Reward => self.reward_status.get(&port).copied(),
        }
    }

    /// True when every recorded port is running.
    pub fn all_running(&self) -> bool {
        self.recom_status
            .values()
            .chain(self.reward_status.values())
            .all(|state| state.is_running())
    }

    fn ports_mut(&mut self, kind: ServiceKind) -> &mut BTreeMap<u16, PortState> {
        match kind {
            ServiceKind::Recommendation => &mut self.recom_status,
            ServiceKind::Reward => &mut self.reward_status,
        }
    }
}

/// Catalog row for one model of an environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Model directory name.
    pub model_name: String,
    /// Number of version directories.
    pub version_count: usize,
    /// Highest version by version ordering.
    pub max_version: Option<String>,
    /// Bytes across all versions.
    pub total_size: u64,
    /// Newest version modification time.
    pub latest_timestamp: Option<DateTime<Utc>>,
    /// The descriptor's current version.
    pub serving_version: Option<String>,
    /// Live port states of the declared instances.
    #[serde(default)]
    pub services: BTreeMap<ServiceKind, Vec<PortStatus>>,
}

/// One page of the model catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPage {
    /// Rows of this page.
    pub models: Vec<ModelSummary>,
    /// Models in the environment.
    pub total: usize,
    /// One-based page number.
    pub page: usize,
    /// Page size.
    pub per_page: usize,
}

/// File or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// One entry of a version directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name.
    pub name: String,
    /// File or directory.
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes; recursive for directories.
    pub size: u64,
    /// Modification time.
    pub last_modified: Option<DateTime<Utc>>,
}

/// Stored state of one descriptor instance next to its live probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReport {
    /// Service kind.
    pub service: ServiceKind,
    /// Position within the kind's instances.
    pub index: usize,
    /// The stored entry.
    pub instance: ServiceInstance,
    /// Live state of its port.
    pub probe: PortState,
}

/// Outcome of launching one instance during a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchedInstance {
    /// Service kind.
    pub service: ServiceKind,
    /// Bound port.
    pub port: u16,
    /// Status recorded in the descriptor.
    pub status: InstanceStatus,
    /// Listener pid when liveness was awaited.
    pub pid: Option<u32>,
}

/// Result of restarting every instance of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    /// Restarted model.
    pub model_name: String,
    /// Version now serving.
    pub version: String,
    /// Launched instances in launch order.
    pub launched: Vec<LaunchedInstance>,
}

/// Where a deploy stored its artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployReceipt {
    /// Model name.
    pub model_name: String,
    /// Version name.
    pub model_version: String,
    /// Version directory on the server.
    pub path: String,
    /// Files written.
    pub files: usize,
    /// Bytes written.
    pub bytes: u64,
}

/// Last lines of an instance log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTail {
    /// Log file on the server.
    pub path: String,
    /// Lines, oldest first.
    pub lines: Vec<String>,
}

/// Body of a restart request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartRequest {
    /// Environment name.
    pub env: String,
    /// Model name.
    pub model_name: String,
    /// Version to serve.
    pub model_version: String,
}

/// How a deploy request body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadType {
    /// A single file, extracted in place when it is a `.zip`.
    #[default]
    File,
    /// A zip bundle of a directory; its top-level folder is stripped.
    Folder,
}

impl UploadType {
    /// Query parameter value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }
}

/// Outcome marker of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// `data` holds the result.
    Success,
    /// `message` explains the failure.
    Error,
}

/// Response wrapper shared by every endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Success or error.
    pub status: ResponseStatus,
    /// Error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Result payload.
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    /// A successful response carrying `data`.
    pub const fn success(data: T) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: None,
            data: Some(data),
        }
    }

    /// An error response carrying `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Converts the envelope into the carried data or the server message.
    pub fn into_result(self) -> Result<T, String> {
        match (self.status, self.data) {
            (ResponseStatus::Success, Some(data)) => Ok(data),
            (ResponseStatus::Success, None) => Err("response carried no data".to_string()),
            (ResponseStatus::Error, _) => Err(self
                .message
                .unwrap_or_else(|| "request failed".to_string())),
        }
    }
}
