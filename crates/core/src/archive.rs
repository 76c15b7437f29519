//! Materializing uploaded artifacts into a version directory.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use zip::ZipArchive;

use crate::error::{ManagerError, Result};

/// One file of a multi-file upload, addressed relative to the upload root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// `/`-separated path inside the upload.
    pub relative_path: String,
    /// File content.
    pub bytes: Vec<u8>,
}

/// What a deploy writes into the version directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    /// A single file. A `.zip` is extracted in place instead of stored.
    File {
        /// Client-side file name; only its last component is used.
        name: String,
        /// File content.
        bytes: Vec<u8>,
    },
    /// A directory upload. A single top-level wrapper folder shared by every
    /// file is stripped.
    Batch(Vec<UploadedFile>),
}

impl ArtifactSource {
    /// Reads a zipped directory bundle into a batch.
    pub fn from_zip_bundle(bytes: &[u8]) -> Result<Self> {
        Ok(Self::Batch(read_zip_entries(bytes)?))
    }

    /// True when there is nothing to write.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::File { bytes, .. } => bytes.is_empty(),
            Self::Batch(files) => files.is_empty(),
        }
    }
}

/// Totals of a materialized artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Materialized {
    /// Files written.
    pub files: usize,
    /// Bytes written.
    pub bytes: u64,
}

impl Materialized {
    fn add(&mut self, bytes: usize) {
        self.files += 1;
        self.bytes += bytes as u64;
    }
}

/// Writes `source` under `target`, creating it if needed. Existing files
/// with the same relative path are overwritten.
pub fn materialize(source: &ArtifactSource, target: &Path) -> Result<Materialized> {
    fs::create_dir_all(target).map_err(|err| ManagerError::io(target, err))?;
    match source {
        ArtifactSource::File { name, bytes } => {
            let file_name = Path::new(name)
                .file_name()
                .and_then(|name| name.to_str())
                .filter(|name| !name.is_empty())
                .ok_or_else(|| ManagerError::artifact(target, format!("invalid file name '{name}'")))?;

            if file_name.to_ascii_lowercase().ends_with(".zip") {
                debug!(archive = file_name, target = %target.display(), "Extracting archive.");
                let mut report = Materialized::default();
                for entry in read_zip_entries(bytes)
                    .map_err(|err| ManagerError::artifact(target.join(file_name), err.to_string()))?
                {
                    write_file(target, Path::new(&entry.relative_path), &entry.bytes)?;
                    report.add(entry.bytes.len());
                }
                Ok(report)
            } else {
                write_file(target, Path::new(file_name), bytes)?;
                let mut report = Materialized::default();
                report.add(bytes.len());
                Ok(report)
            }
        }
        ArtifactSource::Batch(files) => {
            let wrapper = common_wrapper(files);
            let mut report = Materialized::default();
            for file in files {
                let relative = relative_path(&file.relative_path)
                    .ok_or_else(|| ManagerError::InvalidPath(file.relative_path.clone()))?;
                let relative = match &wrapper {
                    Some(wrapper) => relative
                        .strip_prefix(wrapper)
                        .map_or_else(|_| relative.clone(), Path::to_path_buf),
                    None => relative,
                };
                write_file(target, &relative, &file.bytes)?;
                report.add(file.bytes.len());
            }
            Ok(report)
        }
    }
}

/// Normal components of `raw` only. `None` for absolute or escaping paths.
fn relative_path(raw: &str) -> Option<PathBuf> {
    let mut path = PathBuf::new();
    for component in Path::new(&raw.replace('\\', "/")).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!path.as_os_str().is_empty()).then_some(path)
}

/// The first path component when every file sits below the same single
/// directory.
fn common_wrapper(files: &[UploadedFile]) -> Option<PathBuf> {
    let mut wrapper: Option<PathBuf> = None;
    for file in files {
        let path = relative_path(&file.relative_path)?;
        let mut components = path.components();
        let first = components.next()?;
        components.next()?;
        let first = PathBuf::from(first.as_os_str());
        match &wrapper {
            Some(existing) if *existing != first => return None,
            Some(_) => {}
            None => wrapper = Some(first),
        }
    }
    wrapper
}

fn write_file(target: &Path, relative: &Path, bytes: &[u8]) -> Result<()> {
    let path = target.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| ManagerError::io(parent, err))?;
    }
    fs::write(&path, bytes).map_err(|err| ManagerError::io(&path, err))
}

fn read_zip_entries(bytes: &[u8]) -> Result<Vec<UploadedFile>> {
    let invalid = |reason: String| ManagerError::artifact("<upload>", reason);
    let mut archive =
        ZipArchive::new(Cursor::new(bytes)).map_err(|err| invalid(format!("bad archive: {err}")))?;

    let mut files = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| invalid(format!("bad archive entry {index}: {err}")))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry
            .enclosed_name()
            .ok_or_else(|| ManagerError::InvalidPath(entry.name().to_string()))?;
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|err| invalid(format!("failed to read {}: {err}", name.display())))?;
        files.push(UploadedFile {
            relative_path: name.to_string_lossy().into_owned(),
            bytes: contents,
        });
    }
    Ok(files)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, bytes) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn file(path: &str, bytes: &[u8]) -> UploadedFile {
        UploadedFile {
            relative_path: path.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn plain_file_is_stored_by_name() {
        let dir = TempDir::new().unwrap();
        let source = ArtifactSource::File {
            name: "weights.bin".to_string(),
            bytes: vec![1, 2, 3],
        };
        let report = materialize(&source, dir.path()).unwrap();
        assert_eq!(report, Materialized { files: 1, bytes: 3 });
        assert_eq!(fs::read(dir.path().join("weights.bin")).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn zip_file_is_extracted_and_not_kept() {
        let dir = TempDir::new().unwrap();
        let source = ArtifactSource::File {
            name: "bundle.ZIP".to_string(),
            bytes: zip_of(&[("src/recomserver.py", b"app = 1"), ("README", b"hi")]),
        };
        let report = materialize(&source, dir.path()).unwrap();
        assert_eq!(report.files, 2);
        assert!(dir.path().join("src/recomserver.py").is_file());
        assert!(!dir.path().join("bundle.ZIP").exists());
    }

    #[test]
    fn corrupt_zip_is_an_artifact_error() {
        let dir = TempDir::new().unwrap();
        let source = ArtifactSource::File {
            name: "bundle.zip".to_string(),
            bytes: b"not a zip".to_vec(),
        };
        assert!(matches!(
            materialize(&source, dir.path()),
            Err(ManagerError::Artifact { .. })
        ));
    }

    #[test]
    fn batch_strips_single_wrapper_directory() {
        let dir = TempDir::new().unwrap();
        let source = ArtifactSource::Batch(vec![
            file("project/src/rewardserver.py", b"x"),
            file("project/model/weights.bin", b"yy"),
        ]);
        materialize(&source, dir.path()).unwrap();
        assert!(dir.path().join("src/rewardserver.py").is_file());
        assert!(dir.path().join("model/weights.bin").is_file());
        assert!(!dir.path().join("project").exists());
    }

    #[test]
    fn batch_without_shared_wrapper_keeps_paths() {
        let dir = TempDir::new().unwrap();
        let source = ArtifactSource::Batch(vec![file("a/one", b"1"), file("b/two", b"2")]);
        materialize(&source, dir.path()).unwrap();
        assert!(dir.path().join("a/one").is_file());
        assert!(dir.path().join("b/two").is_file());
    }

    #[test]
    fn batch_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let source = ArtifactSource::Batch(vec![file("../evil", b"x")]);
        assert!(matches!(
            materialize(&source, dir.path()),
            Err(ManagerError::InvalidPath(_))
        ));
    }

    #[test]
    fn zip_bundle_becomes_stripped_batch() {
        let dir = TempDir::new().unwrap();
        let bundle = zip_of(&[("proj/src/recomserver.py", b"a"), ("proj/conf.yaml", b"b")]);
        let source = ArtifactSource::from_zip_bundle(&bundle).unwrap();
        materialize(&source, dir.path()).unwrap();
        assert!(dir.path().join("src/recomserver.py").is_file());
        assert!(dir.path().join("conf.yaml").is_file());
    }
}
