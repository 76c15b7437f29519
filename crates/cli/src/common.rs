use indicatif::{ProgressBar, ProgressStyle};
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Directories never uploaded with a model folder.
const SKIPPED_DIRS: [&str; 3] = [".ipynb_checkpoints", "__pycache__", ".git"];

pub fn spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner.set_message(message.to_string());
    spinner
}

pub fn format_elapsed_ms(start: Instant) -> String {
    let elapsed = start.elapsed();
    if elapsed.as_secs() == 0 {
        return format!("{}ms", elapsed.as_millis());
    }
    let seconds = elapsed.as_secs();
    let remaining_ms = elapsed.subsec_millis();
    format!("{seconds}s {remaining_ms}ms")
}

/// Runs `f` behind a spinner and returns its value, printing nothing.
pub async fn with_spinner<T, F, Fut>(description: &str, f: F) -> Result<(T, Instant), String>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let spinner = spinner(description);
    let start = Instant::now();
    let result = f().await;
    spinner.finish_and_clear();
    result.map(|value| (value, start))
}

/// Zips `dir` with its own name as the single top-level folder.
///
/// `dir` may be relative or end in `.` or `..`; the folder name is taken
/// from its canonical form.
pub fn zip_directory(dir: &Path) -> Result<Vec<u8>, String> {
    let dir = std::fs::canonicalize(dir)
        .map_err(|err| format!("Cannot upload {}: {err}", dir.display()))?;
    let dir = dir.as_path();
    let root_name = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| format!("Cannot upload {}: not a named directory", dir.display()))?;

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    let mut files = 0usize;

    let walker = WalkDir::new(dir).sort_by_file_name().into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir()
            && SKIPPED_DIRS
                .iter()
                .any(|skipped| entry.file_name() == *skipped))
    });
    for entry in walker {
        let entry = entry.map_err(|err| format!("Failed to read {}: {err}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|err| format!("Failed to relativize {}: {err}", entry.path().display()))?;
        let name = std::iter::once(root_name.clone())
            .chain(
                relative
                    .components()
                    .map(|part| part.as_os_str().to_string_lossy().into_owned()),
            )
            .collect::<Vec<_>>()
            .join("/");

        let bytes = std::fs::read(entry.path())
            .map_err(|err| format!("Failed to read {}: {err}", entry.path().display()))?;
        writer
            .start_file(name.as_str(), options)
            .map_err(|err| format!("Failed to add {name} to bundle: {err}"))?;
        writer
            .write_all(&bytes)
            .map_err(|err| format!("Failed to add {name} to bundle: {err}"))?;
        files += 1;
    }

    if files == 0 {
        return Err(format!("{} contains no files", dir.display()));
    }
    let cursor = writer
        .finish()
        .map_err(|err| format!("Failed to finish bundle: {err}"))?;
    Ok(cursor.into_inner())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    #[test]
    fn elapsed_under_a_second_is_in_millis() {
        assert!(format_elapsed_ms(Instant::now()).ends_with("ms"));
    }

    #[test]
    fn bundle_wraps_files_in_directory_name() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("ranker");
        std::fs::create_dir_all(model.join("src/__pycache__")).unwrap();
        std::fs::write(model.join("weights.bin"), b"abc").unwrap();
        std::fs::write(model.join("src/recomserver.py"), b"app = None").unwrap();
        std::fs::write(model.join("src/__pycache__/x.pyc"), b"junk").unwrap();

        let bytes = zip_directory(&model).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, ["ranker/src/recomserver.py", "ranker/weights.bin"]);

        let mut content = String::new();
        archive
            .by_name("ranker/weights.bin")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "abc");
    }

    #[test]
    fn bundle_name_comes_from_the_resolved_directory() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("ranker");
        std::fs::create_dir_all(model.join("src")).unwrap();
        std::fs::write(model.join("weights.bin"), b"abc").unwrap();

        for path in [model.join("src").join(".."), model.join(".")] {
            let bytes = zip_directory(&path).unwrap();
            let archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
            let names: Vec<&str> = archive.file_names().collect();
            assert_eq!(names, ["ranker/weights.bin"], "{}", path.display());
        }
    }

    #[test]
    fn missing_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = zip_directory(&dir.path().join("absent")).unwrap_err();
        assert!(err.contains("Cannot upload"), "{err}");
    }

    #[test]
    fn empty_directory_is_rejected() {
        let dir = TempDir::new().unwrap();
        let model = dir.path().join("empty");
        std::fs::create_dir_all(&model).unwrap();
        assert!(zip_directory(&model).is_err());
    }
}
