//! Per-model `config.json` descriptor.
//!
//! The canonical on-disk form is:
//!
//! ```json
//! {
//!   "current_version": "1.0.0",
//!   "services": {
//!     "recomserver": [{"port": 8001, "workers": 2, "status": "stopped", "pid": null}],
//!     "rewardserver": [{"port": 8002, "workers": 2, "status": "stopped", "pid": null}]
//!   }
//! }
//! ```
//!
//! `status` and `pid` are advisory. Whether an instance is serving is always
//! answered by probing its port.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Worker count used when an instance entry omits `workers`.
pub const DEFAULT_WORKERS: u32 = 1;

/// Worker count of the instances in a freshly initialized descriptor.
const INITIAL_WORKERS: u32 = 2;

/// A deployment tier. Each one has its own root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development.
    Dev,
    /// Pre-production.
    Preprod,
    /// Production.
    Prod,
}

impl Environment {
    /// Every environment.
    pub const ALL: [Self; 3] = [Self::Dev, Self::Preprod, Self::Prod];

    /// Lowercase name, also the default root directory name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Preprod => "preprod",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dev" => Ok(Self::Dev),
            "preprod" => Ok(Self::Preprod),
            "prod" => Ok(Self::Prod),
            other => Err(format!(
                "unknown environment '{other}' (expected dev, preprod or prod)"
            )),
        }
    }
}

/// The fixed set of inference server roles.
///
/// Each kind owns its wire name (the descriptor key), the Python module
/// exposing its ASGI `app`, and the key used in status reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    /// The recommendation server, `recomserver`.
    #[serde(rename = "recomserver")]
    Recommendation,
    /// The reward server, `rewardserver`.
    #[serde(rename = "rewardserver")]
    Reward,
}

impl ServiceKind {
    /// Launch order used by a restart.
    pub const ALL: [Self; 2] = [Self::Recommendation, Self::Reward];

    /// Wire name used as descriptor key and in file names.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Recommendation => "recomserver",
            Self::Reward => "rewardserver",
        }
    }

    /// Import target handed to the process manager.
    pub const fn entry_point(self) -> &'static str {
        match self {
            Self::Recommendation => "src.recomserver:app",
            Self::Reward => "src.rewardserver:app",
        }
    }

    /// Key of this kind in a service status report.
    pub const fn status_key(self) -> &'static str {
        match self {
            Self::Recommendation => "recom_status",
            Self::Reward => "reward_status",
        }
    }

    /// Port of the single instance in a fresh descriptor.
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Recommendation => 8001,
            Self::Reward => 8002,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown service '{value}'"))
    }
}

/// Last status the manager recorded for an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Never started, or stopped.
    #[default]
    Stopped,
    /// Launched successfully.
    Running,
    /// The last launch failed.
    Error,
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// One `(kind, port, workers)` entry of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// TCP port the instance binds.
    pub port: u16,
    /// Worker processes started by the launcher.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Advisory status from the last restart.
    #[serde(default)]
    pub status: InstanceStatus,
    /// Listener pid seen after the last launch, if any.
    #[serde(default)]
    pub pid: Option<u32>,
}

const fn default_workers() -> u32 {
    DEFAULT_WORKERS
}

impl ServiceInstance {
    /// A stopped instance with no recorded pid.
    pub const fn new(port: u16, workers: u32) -> Self {
        Self {
            port,
            workers,
            status: InstanceStatus::Stopped,
            pid: None,
        }
    }
}

/// Instances declared per service kind, in launch order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceTable {
    /// `recomserver` instances.
    #[serde(rename = "recomserver", default)]
    pub recommendation: Vec<ServiceInstance>,
    /// `rewardserver` instances.
    #[serde(rename = "rewardserver", default)]
    pub reward: Vec<ServiceInstance>,
}

impl ServiceTable {
    /// Instances of one kind.
    pub fn instances(&self, kind: ServiceKind) -> &[ServiceInstance] {
        match kind {
            ServiceKind::Recommendation => &self.recommendation,
            ServiceKind::Reward => &self.reward,
        }
    }

    /// Mutable instances of one kind.
    pub fn instances_mut(&mut self, kind: ServiceKind) -> &mut Vec<ServiceInstance> {
        match kind {
            ServiceKind::Recommendation => &mut self.recommendation,
            ServiceKind::Reward => &mut self.reward,
        }
    }

    /// Every instance paired with its kind, recommendation servers first.
    pub fn iter(&self) -> impl Iterator<Item = (ServiceKind, &ServiceInstance)> + '_ {
        ServiceKind::ALL.into_iter().flat_map(move |kind| {
            self.instances(kind)
                .iter()
                .map(move |instance| (kind, instance))
        })
    }

    /// Finds the instance of `kind` bound to `port`.
    pub fn find_mut(&mut self, kind: ServiceKind, port: u16) -> Option<&mut ServiceInstance> {
        self.instances_mut(kind)
            .iter_mut()
            .find(|instance| instance.port == port)
    }

    /// First port declared more than once across all kinds.
    pub fn duplicate_port(&self) -> Option<u16> {
        let mut seen = HashSet::new();
        self.iter()
            .map(|(_, instance)| instance.port)
            .find(|port| !seen.insert(*port))
    }

    /// Number of instances across all kinds.
    pub fn len(&self) -> usize {
        self.recommendation.len() + self.reward.len()
    }

    /// True when no instance is declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The `config.json` document of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Version the instances serve, if one was ever selected.
    #[serde(default)]
    pub current_version: Option<String>,
    /// Declared instances.
    #[serde(default)]
    pub services: ServiceTable,
}

impl ModelDescriptor {
    /// Descriptor written when a model has none yet: one stopped instance per
    /// kind on its default port.
    pub fn initial(current_version: Option<&str>) -> Self {
        Self {
            current_version: current_version.map(str::to_string),
            services: Self::initial_services(),
        }
    }

    /// The service table of [`ModelDescriptor::initial`].
    pub fn initial_services() -> ServiceTable {
        ServiceTable {
            recommendation: vec![ServiceInstance::new(
                ServiceKind::Recommendation.default_port(),
                INITIAL_WORKERS,
            )],
            reward: vec![ServiceInstance::new(
                ServiceKind::Reward.default_port(),
                INITIAL_WORKERS,
            )],
        }
    }

    /// True when `version` is the serving version.
    pub fn is_serving(&self, version: &str) -> bool {
        self.current_version.as_deref() == Some(version)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn initial_descriptor_uses_default_ports() {
        let descriptor = ModelDescriptor::initial(Some("1.0.0"));
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["current_version"], "1.0.0");
        assert_eq!(value["services"]["recomserver"][0]["port"], 8001);
        assert_eq!(value["services"]["rewardserver"][0]["port"], 8002);
        assert_eq!(value["services"]["rewardserver"][0]["workers"], 2);
        assert_eq!(value["services"]["recomserver"][0]["status"], "stopped");
        assert!(value["services"]["recomserver"][0]["pid"].is_null());
    }

    #[test]
    fn iter_yields_recommendation_before_reward() {
        let mut services = ModelDescriptor::initial_services();
        services.recommendation.push(ServiceInstance::new(8003, 1));
        let order: Vec<(ServiceKind, u16)> = services
            .iter()
            .map(|(kind, instance)| (kind, instance.port))
            .collect();
        assert_eq!(
            order,
            vec![
                (ServiceKind::Recommendation, 8001),
                (ServiceKind::Recommendation, 8003),
                (ServiceKind::Reward, 8002),
            ]
        );
    }

    #[test]
    fn duplicate_port_is_detected_across_kinds() {
        let mut services = ModelDescriptor::initial_services();
        assert_eq!(services.duplicate_port(), None);
        services.reward.push(ServiceInstance::new(8001, 1));
        assert_eq!(services.duplicate_port(), Some(8001));
    }

    #[test]
    fn service_kind_parses_wire_names_only() {
        assert_eq!(
            "rewardserver".parse::<ServiceKind>().unwrap(),
            ServiceKind::Reward
        );
        assert!("reward".parse::<ServiceKind>().is_err());
        assert_eq!(ServiceKind::Recommendation.entry_point(), "src.recomserver:app");
    }

    #[test]
    fn environment_parse_is_case_insensitive() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn missing_instance_fields_take_defaults() {
        let instance: ServiceInstance = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(instance, ServiceInstance::new(9000, DEFAULT_WORKERS));
    }
}
