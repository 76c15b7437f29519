//! On-disk version registry.
//!
//! ```text
//! <env_root>/<model>/config.json     descriptor
//! <env_root>/<model>/<version>/      artifact root of one version
//! ```
//!
//! Descriptors are accepted in the legacy flat shape (service kinds at the
//! top level) and in the nested `services` shape. Every write emits the
//! nested shape. Mutations hold `config.json.lock` and replace the file
//! atomically.

use chrono::{DateTime, Utc};
use optiflux_common::{
    DEFAULT_WORKERS, InstanceStatus, ModelDescriptor, ModelPage, ModelSummary, PortStatus,
    ServiceInstance, ServiceKind, ServiceStatusReport, ServiceTable, VersionSummary,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{ManagerError, Result};
use crate::lock::{FileLock, write_atomic};
use crate::prober::PortProber;

/// Descriptor file name inside a model directory.
pub const DESCRIPTOR_FILE: &str = "config.json";

/// Directories inside a model that are never versions.
const NOISE_DIRS: [&str; 2] = [".ipynb_checkpoints", "__pycache__"];

/// The descriptor of the model at `model_dir`.
pub fn descriptor_path(model_dir: &Path) -> PathBuf {
    model_dir.join(DESCRIPTOR_FILE)
}

/// Rejects names that cannot be a single directory level.
pub fn checked_segment<'a>(name: &'static str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ManagerError::MissingParameter(name));
    }
    if trimmed.starts_with('.') || trimmed.contains(['/', '\\', '\0']) {
        return Err(ManagerError::invalid(
            name,
            format!("'{trimmed}' is not a valid directory name"),
        ));
    }
    Ok(trimmed)
}

fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || NOISE_DIRS.contains(&name)
}

enum DescriptorState {
    Missing,
    Corrupt(String),
    Canonical(ModelDescriptor),
    Migrated(ModelDescriptor),
}

fn read_state(path: &Path) -> Result<DescriptorState> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(DescriptorState::Missing),
        Err(err) => return Err(ManagerError::io(path, err)),
    };
    if contents.trim().is_empty() {
        return Ok(DescriptorState::Missing);
    }
    let value: Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => return Ok(DescriptorState::Corrupt(err.to_string())),
    };
    Ok(match normalize(&value) {
        Some((descriptor, false)) => DescriptorState::Canonical(descriptor),
        Some((descriptor, true)) => DescriptorState::Migrated(descriptor),
        None => DescriptorState::Corrupt("descriptor is not a JSON object".to_string()),
    })
}

/// Converts either descriptor shape into the canonical one. The flag is true
/// when the input differs from its canonical serialization.
fn normalize(value: &Value) -> Option<(ModelDescriptor, bool)> {
    let object = value.as_object()?;
    let current_version = match object.get("current_version") {
        Some(Value::String(version)) => Some(version.clone()),
        Some(Value::Number(version)) => Some(version.to_string()),
        _ => None,
    };

    let services = match object.get("services") {
        Some(Value::Object(nested)) => parse_table(nested),
        _ if ServiceKind::ALL
            .iter()
            .any(|kind| object.contains_key(kind.as_str())) =>
        {
            parse_table(object)
        }
        _ => ModelDescriptor::initial_services(),
    };

    let descriptor = ModelDescriptor {
        current_version,
        services,
    };
    let canonical = serde_json::to_value(&descriptor).ok()?;
    Some((descriptor, canonical != *value))
}

fn parse_table(map: &Map<String, Value>) -> ServiceTable {
    let mut table = ServiceTable::default();
    for kind in ServiceKind::ALL {
        let Some(entries) = map.get(kind.as_str()).and_then(Value::as_array) else {
            continue;
        };
        *table.instances_mut(kind) = entries
            .iter()
            .filter_map(|entry| {
                let instance = parse_instance(entry);
                if instance.is_none() {
                    warn!(%kind, %entry, "Dropping service entry without a usable port.");
                }
                instance
            })
            .collect();
    }
    table
}

fn parse_instance(entry: &Value) -> Option<ServiceInstance> {
    let port = match entry.get("port")? {
        Value::Number(port) => port.as_u64(),
        Value::String(port) => port.trim().parse().ok(),
        _ => None,
    }
    .and_then(|port| u16::try_from(port).ok())
    .filter(|port| *port != 0)?;

    let workers = entry
        .get("workers")
        .and_then(Value::as_u64)
        .and_then(|workers| u32::try_from(workers).ok())
        .filter(|workers| *workers > 0)
        .unwrap_or(DEFAULT_WORKERS);
    let status = entry
        .get("status")
        .and_then(Value::as_str)
        .and_then(|status| status.parse().ok())
        .unwrap_or(InstanceStatus::Stopped);
    let pid = entry
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok());

    Some(ServiceInstance {
        port,
        workers,
        status,
        pid,
    })
}

fn write_unlocked(path: &Path, descriptor: &ModelDescriptor) -> Result<()> {
    let mut contents = serde_json::to_string_pretty(descriptor)
        .map_err(|err| ManagerError::descriptor(path, format!("serialization failed: {err}")))?;
    contents.push('\n');
    write_atomic(path, contents.as_bytes())
}

/// Returns the descriptor at `path`, creating or repairing it first.
///
/// A missing or empty file gets the initial descriptor. An unparseable file
/// is overwritten with the initial descriptor and logged. A readable file in
/// the legacy shape is rewritten in the canonical shape. Calling this twice
/// leaves the file byte-identical after the first call.
pub fn load_or_init_descriptor(path: &Path) -> Result<ModelDescriptor> {
    load_or_init_seeded(path, None)
}

/// [`load_or_init_descriptor`] where a newly written descriptor gets
/// `seed_version` as its `current_version`.
pub fn load_or_init_seeded(path: &Path, seed_version: Option<&str>) -> Result<ModelDescriptor> {
    if let DescriptorState::Canonical(descriptor) = read_state(path)? {
        return Ok(descriptor);
    }

    let _lock = FileLock::acquire(path)?;
    let descriptor = match read_state(path)? {
        DescriptorState::Canonical(descriptor) => return Ok(descriptor),
        DescriptorState::Migrated(descriptor) => {
            info!(path = %path.display(), "Rewriting descriptor in canonical form.");
            descriptor
        }
        DescriptorState::Missing => {
            info!(path = %path.display(), "Writing initial descriptor.");
            ModelDescriptor::initial(seed_version)
        }
        DescriptorState::Corrupt(reason) => {
            warn!(path = %path.display(), %reason, "Descriptor is corrupt, restoring defaults.");
            ModelDescriptor::initial(seed_version)
        }
    };
    write_unlocked(path, &descriptor)?;
    Ok(descriptor)
}

/// Reads a descriptor without writing anything. Missing and corrupt files
/// both yield `None`.
pub fn read_descriptor(path: &Path) -> Result<Option<ModelDescriptor>> {
    Ok(match read_state(path)? {
        DescriptorState::Canonical(descriptor) | DescriptorState::Migrated(descriptor) => {
            Some(descriptor)
        }
        DescriptorState::Missing => None,
        DescriptorState::Corrupt(reason) => {
            warn!(path = %path.display(), %reason, "Ignoring corrupt descriptor.");
            None
        }
    })
}

/// Read-modify-write of the descriptor under its lock. A missing or corrupt
/// file starts from the initial descriptor seeded with `seed_version`.
pub fn update_descriptor<F>(
    path: &Path,
    seed_version: Option<&str>,
    mutate: F,
) -> Result<ModelDescriptor>
where
    F: FnOnce(&mut ModelDescriptor) -> Result<()>,
{
    let _lock = FileLock::acquire(path)?;
    let mut descriptor = match read_state(path)? {
        DescriptorState::Canonical(descriptor) | DescriptorState::Migrated(descriptor) => {
            descriptor
        }
        DescriptorState::Missing => ModelDescriptor::initial(seed_version),
        DescriptorState::Corrupt(reason) => {
            warn!(path = %path.display(), %reason, "Descriptor is corrupt, restoring defaults.");
            ModelDescriptor::initial(seed_version)
        }
    };
    mutate(&mut descriptor)?;
    write_unlocked(path, &descriptor)?;
    Ok(descriptor)
}

/// Points the model's serving version at `version`.
pub fn set_current_version(path: &Path, version: &str) -> Result<ModelDescriptor> {
    let descriptor = update_descriptor(path, Some(version), |descriptor| {
        descriptor.current_version = Some(version.to_string());
        Ok(())
    })?;
    info!(path = %path.display(), version, "Serving version updated.");
    Ok(descriptor)
}

/// Replaces the whole descriptor after checking that no port repeats.
pub fn replace_descriptor(path: &Path, descriptor: &ModelDescriptor) -> Result<()> {
    if let Some(port) = descriptor.services.duplicate_port() {
        return Err(ManagerError::invalid(
            "services",
            format!("port {port} is declared more than once"),
        ));
    }
    let _lock = FileLock::acquire(path)?;
    write_unlocked(path, descriptor)
}

fn modified_at(meta: &Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

/// Sum of regular file sizes under `path`. Unreadable entries are logged
/// and skipped.
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping unreadable entry.");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| match entry.metadata() {
            Ok(meta) => Some(meta.len()),
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "Skipping unreadable file.");
                None
            }
        })
        .sum()
}

/// Live state of every instance port in `descriptor`.
pub fn service_states(
    descriptor: &ModelDescriptor,
    prober: &PortProber,
) -> BTreeMap<ServiceKind, Vec<PortStatus>> {
    ServiceKind::ALL
        .into_iter()
        .map(|kind| {
            let states = descriptor
                .services
                .instances(kind)
                .iter()
                .map(|instance| PortStatus {
                    port: instance.port,
                    status: prober.state(instance.port),
                })
                .collect();
            (kind, states)
        })
        .collect()
}

/// Live state of every declared instance port.
pub fn check_service_status(
    descriptor: &ModelDescriptor,
    prober: &PortProber,
) -> ServiceStatusReport {
    let mut report = ServiceStatusReport::default();
    for (kind, instance) in descriptor.services.iter() {
        report.insert(kind, instance.port, prober.state(instance.port));
    }
    report
}

/// Lists the version directories of a model, newest name first.
///
/// Ordering is plain string ordering, so "1.9.0" sorts above "1.10.0".
/// Only the serving version carries live port states, and only when a
/// prober is given. A missing model directory yields an empty list.
pub fn scan_versions(
    model_dir: &Path,
    descriptor: Option<&ModelDescriptor>,
    prober: Option<&PortProber>,
) -> Result<Vec<VersionSummary>> {
    let entries = match fs::read_dir(model_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(ManagerError::io(model_dir, err)),
    };

    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ManagerError::io(model_dir, err))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_ignored(&name) {
            continue;
        }
        let path = entry.path();
        let Ok(meta) = fs::metadata(&path) else {
            debug!(path = %path.display(), "Skipping unreadable model entry.");
            continue;
        };
        if !meta.is_dir() {
            continue;
        }

        let is_serving = descriptor.is_some_and(|descriptor| descriptor.is_serving(&name));
        let services = match (is_serving, descriptor, prober) {
            (true, Some(descriptor), Some(prober)) => service_states(descriptor, prober),
            _ => BTreeMap::new(),
        };
        versions.push(VersionSummary {
            timestamp: modified_at(&meta),
            size: dir_size(&path),
            version: name,
            is_serving,
            services,
        });
    }

    versions.sort_by(|a, b| b.version.cmp(&a.version));
    Ok(versions)
}

/// One page of the models in an environment, most recently changed first.
pub fn list_models(
    env_root: &Path,
    page: usize,
    per_page: usize,
    prober: &PortProber,
) -> Result<ModelPage> {
    if page == 0 {
        return Err(ManagerError::invalid("page", "pages start at 1"));
    }
    if per_page == 0 {
        return Err(ManagerError::invalid("per_page", "must be at least 1"));
    }

    let entries = match fs::read_dir(env_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok(ModelPage {
                models: Vec::new(),
                total: 0,
                page,
                per_page,
            });
        }
        Err(err) => return Err(ManagerError::io(env_root, err)),
    };

    let mut models = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ManagerError::io(env_root, err))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let model_dir = entry.path();
        if is_ignored(&name) || !model_dir.is_dir() || !descriptor_path(&model_dir).is_file() {
            continue;
        }

        let descriptor = read_descriptor(&descriptor_path(&model_dir))?;
        let versions = scan_versions(&model_dir, descriptor.as_ref(), None)?;
        let latest_timestamp = versions
            .iter()
            .filter_map(|version| version.timestamp)
            .max()
            .or_else(|| fs::metadata(&model_dir).ok().and_then(|meta| modified_at(&meta)));

        models.push((
            ModelSummary {
                model_name: name,
                version_count: versions.len(),
                max_version: versions.first().map(|version| version.version.clone()),
                total_size: dir_size(&model_dir),
                latest_timestamp,
                serving_version: descriptor
                    .as_ref()
                    .and_then(|descriptor| descriptor.current_version.clone()),
                services: BTreeMap::new(),
            },
            descriptor,
        ));
    }

    models.sort_by(|(a, _), (b, _)| {
        b.latest_timestamp
            .cmp(&a.latest_timestamp)
            .then_with(|| a.model_name.cmp(&b.model_name))
    });
    let total = models.len();
    let models = models
        .into_iter()
        .skip((page - 1).saturating_mul(per_page))
        .take(per_page)
        .map(|(mut summary, descriptor)| {
            if let Some(descriptor) = descriptor {
                summary.services = service_states(&descriptor, prober);
            }
            summary
        })
        .collect();

    Ok(ModelPage {
        models,
        total,
        page,
        per_page,
    })
}
