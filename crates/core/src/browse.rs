//! Read-only views into version directories: file listings, file content,
//! service log tails and per-instance status.

use chrono::{DateTime, Utc};
use optiflux_common::{EntryKind, FileEntry, InstanceReport, LogTail, ModelDescriptor, ServiceKind};
use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Component, Path, PathBuf};

use crate::error::{ManagerError, Result};
use crate::prober::PortProber;
use crate::script::ScriptPaths;

/// Joins `relative` onto `base`, refusing anything that could leave `base`.
pub fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = base.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ManagerError::InvalidPath(relative.to_string()));
            }
        }
    }
    Ok(path)
}

/// Entries of `version_dir/sub_path`, directories first, then by name.
pub fn list_files(version_dir: &Path, sub_path: Option<&str>) -> Result<Vec<FileEntry>> {
    let dir = resolve_within(version_dir, sub_path.unwrap_or_default())?;
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ManagerError::NotFound(format!("directory {}", dir.display())));
        }
        Err(err) => return Err(ManagerError::io(&dir, err)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| ManagerError::io(&dir, err))?;
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        files.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() },
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        });
    }
    files.sort_by(|a, b| {
        (a.kind != EntryKind::Directory, &a.name).cmp(&(b.kind != EntryKind::Directory, &b.name))
    });
    Ok(files)
}

/// Content of a file inside the version directory, decoded lossily.
pub fn read_file(version_dir: &Path, relative: &str) -> Result<String> {
    if relative.trim().is_empty() {
        return Err(ManagerError::MissingParameter("path"));
    }
    let path = resolve_within(version_dir, relative)?;
    match fs::read(&path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(ManagerError::NotFound(format!("file {relative}")))
        }
        Err(err) => Err(ManagerError::io(&path, err)),
    }
}

/// Last `lines` lines of an instance log. `launcher` selects the nohup
/// output instead of the server log.
pub fn tail_service_log(
    version_dir: &Path,
    kind: ServiceKind,
    port: u16,
    lines: usize,
    launcher: bool,
) -> Result<LogTail> {
    let paths = ScriptPaths::new(version_dir, kind, port);
    let path = if launcher {
        paths.launcher_log
    } else {
        paths.log
    };
    let file = match fs::File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(ManagerError::NotFound(format!("log {}", path.display())));
        }
        Err(err) => return Err(ManagerError::io(&path, err)),
    };

    let mut tail = VecDeque::with_capacity(lines.min(4096));
    for line in BufReader::new(file).split(b'\n') {
        let line = line.map_err(|err| ManagerError::io(&path, err))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string());
        }
    }

    Ok(LogTail {
        path: path.display().to_string(),
        lines: tail.into(),
    })
}

/// The stored entry `index` of `kind` plus a live probe of its port.
pub fn instance_status(
    descriptor: &ModelDescriptor,
    kind: ServiceKind,
    index: usize,
    prober: &PortProber,
) -> Result<InstanceReport> {
    let instances = descriptor.services.instances(kind);
    let instance = instances.get(index).ok_or_else(|| {
        ManagerError::invalid(
            "instance_index",
            format!("{kind} has {} instance(s), index {index} is out of range", instances.len()),
        )
    })?;
    Ok(InstanceReport {
        service: kind,
        index,
        instance: instance.clone(),
        probe: prober.state(instance.port),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use optiflux_common::PortState;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn listing_puts_directories_first() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "abc").unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/app.py"), "x").unwrap();

        let entries = list_files(dir.path(), None).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["src", "a.txt"]);
        assert_eq!(entries[1].size, 3);

        let nested = list_files(dir.path(), Some("src")).unwrap();
        assert_eq!(nested[0].name, "app.py");
    }

    #[test]
    fn traversal_is_rejected() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            list_files(dir.path(), Some("../..")),
            Err(ManagerError::InvalidPath(_))
        ));
        assert!(matches!(
            read_file(dir.path(), "/etc/passwd"),
            Err(ManagerError::InvalidPath(_))
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            read_file(dir.path(), "nope.txt"),
            Err(ManagerError::NotFound(_))
        ));
        assert!(matches!(
            list_files(dir.path(), Some("nope")),
            Err(ManagerError::NotFound(_))
        ));
    }

    #[test]
    fn tail_returns_last_lines() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();
        let body: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        fs::write(dir.path().join("logs/recomserver_8001.log"), body).unwrap();

        let tail = tail_service_log(dir.path(), ServiceKind::Recommendation, 8001, 3, false).unwrap();
        assert_eq!(tail.lines, vec!["line 8", "line 9", "line 10"]);

        assert!(matches!(
            tail_service_log(dir.path(), ServiceKind::Recommendation, 8001, 3, true),
            Err(ManagerError::NotFound(_))
        ));
    }

    #[test]
    fn instance_index_is_bounds_checked() {
        let descriptor = ModelDescriptor::initial(None);
        let prober = PortProber::new("127.0.0.1", Duration::from_millis(200));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut descriptor_with_live = descriptor.clone();
        descriptor_with_live.services.reward[0].port = listener.local_addr().unwrap().port();

        let report = instance_status(&descriptor_with_live, ServiceKind::Reward, 0, &prober).unwrap();
        assert_eq!(report.probe, PortState::Running);
        assert!(matches!(
            instance_status(&descriptor, ServiceKind::Reward, 1, &prober),
            Err(ManagerError::InvalidParameter { .. })
        ));
    }
}
