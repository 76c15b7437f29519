//! Start scripts for service instances.
//!
//! Layout under a version directory:
//!
//! ```text
//! <version>/scripts/<kind>_<port>.sh     generated launcher
//! <version>/logs/<kind>_<port>.log       server log
//! <version>/logs/run_<kind>_<port>.log   launcher stdout/stderr
//! <version>/start_services.sh            starts every instance
//! ```

use optiflux_common::{ServiceInstance, ServiceKind};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{ManagerError, Result};

/// Start scripts, relative to the version directory.
pub const SCRIPTS_DIR: &str = "scripts";
/// Instance and launcher logs, relative to the version directory.
pub const LOGS_DIR: &str = "logs";
/// Script starting every instance at once.
pub const START_ALL_SCRIPT: &str = "start_services.sh";

/// Paths derived for one `(kind, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPaths {
    /// `scripts/<kind>_<port>.sh`.
    pub script: PathBuf,
    /// `logs/<kind>_<port>.log`, written by the server.
    pub log: PathBuf,
    /// `logs/run_<kind>_<port>.log`, the launcher's own output.
    pub launcher_log: PathBuf,
}

impl ScriptPaths {
    /// Paths of `kind` on `port` inside `version_dir`.
    pub fn new(version_dir: &Path, kind: ServiceKind, port: u16) -> Self {
        let logs = version_dir.join(LOGS_DIR);
        Self {
            script: version_dir
                .join(SCRIPTS_DIR)
                .join(format!("{kind}_{port}.sh")),
            log: logs.join(format!("{kind}_{port}.log")),
            launcher_log: logs.join(format!("run_{kind}_{port}.log")),
        }
    }
}

/// Script body binding `instance.workers` workers to `instance.port` with the
/// version directory as working directory.
pub fn render_start_script(
    launcher: &str,
    version_dir: &Path,
    kind: ServiceKind,
    instance: &ServiceInstance,
    log: &Path,
) -> String {
    format!(
        "#!/bin/bash\n\
         cd {chdir} || exit 1\n\
         exec {launcher} --workers {workers} --bind :{port} \
         --worker-class uvicorn.workers.UvicornWorker --preload \
         --chdir {chdir} {entry} --log-file {log} --log-level info\n",
        chdir = shell_quote(&version_dir.display().to_string()),
        launcher = shell_quote(launcher),
        workers = instance.workers,
        port = instance.port,
        entry = kind.entry_point(),
        log = shell_quote(&log.display().to_string()),
    )
}

/// Writes `<version>/scripts/<kind>_<port>.sh` and marks it executable.
/// Regenerating with the same inputs produces the same file.
pub fn generate_start_script(
    launcher: &str,
    version_dir: &Path,
    kind: ServiceKind,
    instance: &ServiceInstance,
) -> Result<ScriptPaths> {
    let paths = ScriptPaths::new(version_dir, kind, instance.port);
    create_dir(&version_dir.join(SCRIPTS_DIR))?;
    create_dir(&version_dir.join(LOGS_DIR))?;

    let body = render_start_script(launcher, version_dir, kind, instance, &paths.log);
    write_executable(&paths.script, &body)?;
    debug!(script = %paths.script.display(), %kind, port = instance.port, "Generated start script.");
    Ok(paths)
}

/// Writes `<version>/start_services.sh`, which starts every given instance in
/// the background and waits for them.
pub fn generate_start_all_script(version_dir: &Path, scripts: &[ScriptPaths]) -> Result<PathBuf> {
    let mut body = String::from("#!/bin/bash\n");
    for paths in scripts {
        body.push_str(&format!(
            "nohup sh {} > {} 2>&1 &\n",
            shell_quote(&paths.script.display().to_string()),
            shell_quote(&paths.launcher_log.display().to_string()),
        ));
    }
    body.push_str("wait\n");

    let path = version_dir.join(START_ALL_SCRIPT);
    write_executable(&path, &body)?;
    Ok(path)
}

/// Single-quotes `value` for sh unless it is made of safe characters only.
pub fn shell_quote(value: &str) -> String {
    let safe = !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "/._-:+=,@".contains(ch));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|err| ManagerError::io(path, err))
}

fn write_executable(path: &Path, body: &str) -> Result<()> {
    fs::write(path, body).map_err(|err| ManagerError::io(path, err))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(|err| ManagerError::io(path, err))?;
    }
    Ok(())
}
