//! OS process control for service instances.
//!
//! Service processes are detached after launch and never tracked by handle.
//! Ownership of a port is re-derived from the OS listener table each time it
//! matters.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use sysinfo::{Pid, Signal, System};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::LaunchSettings;
use crate::error::{ManagerError, Result};
use crate::prober::PortProber;
use crate::script::{ScriptPaths, shell_quote};

/// How long output readers may linger after the command exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a bounded command run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Exit status zero.
    Success {
        /// Combined stdout and stderr.
        output: String,
    },
    /// Non-zero exit or death by signal.
    Failed {
        /// Exit status, absent after a signal.
        code: Option<i32>,
        /// Combined stdout and stderr.
        output: String,
    },
    /// Killed after exceeding its time bound.
    TimedOut {
        /// The bound that was exceeded.
        after: Duration,
    },
}

impl CommandOutcome {
    /// True for [`CommandOutcome::Success`].
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Captured output, or a description of the timeout.
    pub fn describe(&self) -> String {
        match self {
            Self::Success { output } => output.clone(),
            Self::Failed { code, output } => match code {
                Some(code) => format!("exited with status {code}: {}", output.trim()),
                None => format!("terminated by signal: {}", output.trim()),
            },
            Self::TimedOut { after } => format!("timed out after {}s", after.as_secs()),
        }
    }
}

/// What [`ProcessController::ensure_port_free`] had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRelease {
    /// Nothing was listening.
    AlreadyFree,
    /// Listeners were killed.
    Reclaimed {
        /// Killed listener pids.
        pids: Vec<u32>,
    },
}

/// Runs `command` through `sh -c` in its own process group and waits at most
/// `timeout` for it to exit. On timeout the whole process tree is killed.
pub async fn run_to_completion(command: &str, timeout: Duration) -> Result<CommandOutcome> {
    debug!(command, timeout_secs = timeout.as_secs(), "Running command.");
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|err| ManagerError::Internal(format!("Failed to spawn 'sh': {err}")))?;
    let pid = child.id();
    let stdout = spawn_reader(child.stdout.take());
    let stderr = spawn_reader(child.stderr.take());

    let waited = tokio::time::timeout(timeout, child.wait()).await;
    match waited {
        Ok(Ok(status)) => {
            let mut output = drain(stdout).await;
            output.push_str(&drain(stderr).await);
            if status.success() {
                Ok(CommandOutcome::Success { output })
            } else {
                Ok(CommandOutcome::Failed {
                    code: status.code(),
                    output,
                })
            }
        }
        Ok(Err(err)) => Err(ManagerError::Internal(format!(
            "Failed to wait for command: {err}"
        ))),
        Err(_) => {
            warn!(command, timeout_secs = timeout.as_secs(), "Command timed out.");
            if let Some(pid) = pid {
                if let Err(err) =
                    kill_process_tree_async(pid, Signal::Kill, "timed out command").await
                {
                    debug!(pid, error = %err, "Failed to kill timed out command tree.");
                }
            }
            let _ = child.kill().await;
            stdout.abort();
            stderr.abort();
            Ok(CommandOutcome::TimedOut { after: timeout })
        }
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn drain(reader: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await {
        Ok(Ok(output)) => output,
        _ => String::new(),
    }
}

/// PIDs of processes with a TCP socket listening on `port`.
///
/// Uses `lsof` when available and falls back to `/proc` on Linux.
pub async fn listening_pids(port: u16) -> Vec<u32> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) => {
            let mut pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect();
            pids.sort_unstable();
            pids.dedup();
            pids
        }
        Err(err) => {
            debug!(port, error = %err, "lsof unavailable, reading /proc.");
            tokio::task::spawn_blocking(move || procfs_listening_pids(port))
                .await
                .unwrap_or_default()
        }
    }
}

/// Maps `port` to listening socket inodes via `/proc/net/tcp{,6}`, then finds
/// the processes holding those sockets.
fn procfs_listening_pids(port: u16) -> Vec<u32> {
    const TCP_LISTEN: &str = "0A";

    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(contents) = fs::read_to_string(table) else {
            continue;
        };
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 || fields[3] != TCP_LISTEN {
                continue;
            }
            let local_port = fields[1]
                .rsplit_once(':')
                .and_then(|(_, hex)| u16::from_str_radix(hex, 16).ok());
            if local_port == Some(port) {
                inodes.insert(fields[9].to_string());
            }
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let mut pids = Vec::new();
    let Ok(entries) = fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|name| name.parse().ok()) else {
            continue;
        };
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let holds_socket = fds.flatten().any(|fd| {
            fs::read_link(fd.path()).is_ok_and(|target| {
                target
                    .to_str()
                    .and_then(|t| t.strip_prefix("socket:["))
                    .and_then(|t| t.strip_suffix(']'))
                    .is_some_and(|inode| inodes.contains(inode))
            })
        });
        if holds_socket {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    pids
}

/// Signals `pid` and all of its descendants, children first.
///
/// Descendants that started before the root are skipped, which guards
/// against PID reuse between the scan and the signal.
pub fn kill_process_tree(pid: u32, signal: Signal, label: &str) -> Result<()> {
    let root_pid = Pid::from_u32(pid);
    let mut sys = System::new_all();
    sys.refresh_all();

    let root_process = sys
        .process(root_pid)
        .ok_or_else(|| ManagerError::NotFound(format!("{label} process {pid}")))?;
    let root_start_time = root_process.start_time();
    let parents = build_parent_map(&sys);

    debug!(pid, root_start_time, process = label, ?signal, "Signalling process tree.");
    signal_tree(&sys, &parents, root_pid, root_start_time, signal, label);
    Ok(())
}

/// [`kill_process_tree`] on the blocking pool.
pub async fn kill_process_tree_async(pid: u32, signal: Signal, label: &str) -> Result<()> {
    let label = label.to_string();
    tokio::task::spawn_blocking(move || kill_process_tree(pid, signal, &label))
        .await
        .map_err(|err| ManagerError::Internal(format!("Failed to spawn blocking task: {err}")))?
}

fn build_parent_map(sys: &System) -> HashMap<Pid, Vec<Pid>> {
    let mut parents: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            parents.entry(parent).or_default().push(*pid);
        }
    }
    parents
}

fn signal_tree(
    sys: &System,
    parents: &HashMap<Pid, Vec<Pid>>,
    pid: Pid,
    root_start_time: u64,
    signal: Signal,
    label: &str,
) {
    if let Some(children) = parents.get(&pid) {
        for child_pid in children {
            signal_tree(sys, parents, *child_pid, root_start_time, signal, label);
        }
    }

    let Some(process) = sys.process(pid) else {
        return;
    };
    if process.start_time() < root_start_time {
        debug!(?pid, process = label, "Skipping process that predates the root.");
        return;
    }
    if process.kill_with(signal).unwrap_or(false) {
        debug!(?pid, process_name = ?process.name(), process = label, "Signalled process.");
    } else {
        warn!(?pid, process_name = ?process.name(), process = label, "Failed to signal process.");
    }
}

/// Frees ports, launches start scripts and optionally waits for liveness.
#[derive(Debug, Clone)]
pub struct ProcessController {
    prober: PortProber,
    settings: LaunchSettings,
}

impl ProcessController {
    /// A controller checking ports with `prober` and launching per `settings`.
    pub fn new(prober: PortProber, settings: LaunchSettings) -> Self {
        Self { prober, settings }
    }

    /// Launch settings in use.
    pub const fn settings(&self) -> &LaunchSettings {
        &self.settings
    }

    /// Terminates whatever listens on `port`.
    ///
    /// Owners get SIGTERM and the configured grace period. Anything still
    /// listening afterwards gets SIGKILL.
    pub async fn ensure_port_free(&self, port: u16) -> Result<PortRelease> {
        let pids = listening_pids(port).await;
        if pids.is_empty() {
            if self.prober.probe(port).await {
                warn!(port, "Port accepts connections but no owning process was found.");
            }
            return Ok(PortRelease::AlreadyFree);
        }

        warn!(port, ?pids, "Port is occupied, terminating owner.");
        for pid in &pids {
            if let Err(err) = kill_process_tree_async(*pid, Signal::Term, "port owner").await {
                debug!(pid, error = %err, "Failed to terminate port owner.");
            }
        }
        tokio::time::sleep(self.settings.kill_grace).await;

        let survivors = listening_pids(port).await;
        for pid in &survivors {
            warn!(port, pid, "Port owner ignored SIGTERM, killing.");
            if let Err(err) = kill_process_tree_async(*pid, Signal::Kill, "port owner").await {
                debug!(pid, error = %err, "Failed to kill port owner.");
            }
        }
        if !survivors.is_empty() {
            tokio::time::sleep(self.settings.kill_grace).await;
        }

        info!(port, ?pids, "Port reclaimed.");
        Ok(PortRelease::Reclaimed { pids })
    }

    /// Starts `paths.script` detached with `nohup`, output going to the
    /// launcher log. Returns once the shell has backgrounded the script.
    pub async fn launch(&self, paths: &ScriptPaths) -> Result<CommandOutcome> {
        launch(&paths.script, &paths.launcher_log, self.settings.timeout).await
    }

    /// Polls `port` until it accepts connections or the configured wait runs
    /// out. Returns true immediately when no wait is configured.
    pub async fn wait_until_live(&self, port: u16) -> bool {
        let Some(max_wait) = self.settings.liveness_wait else {
            return true;
        };
        wait_until_live(&self.prober, port, max_wait, self.settings.liveness_interval).await
    }
}

/// Starts `script` detached under `nohup`, sending its output to `log`.
/// Success means the shell backgrounded it, not that the service is up.
pub async fn launch(script: &Path, log: &Path, timeout: Duration) -> Result<CommandOutcome> {
    let command = format!(
        "nohup sh {} > {} 2>&1 &",
        shell_quote(&script.display().to_string()),
        shell_quote(&log.display().to_string()),
    );
    let outcome = run_to_completion(&command, timeout).await?;
    if outcome.is_success() {
        info!(script = %script.display(), log = %log.display(), "Launched service.");
    }
    Ok(outcome)
}

/// Polls `port` every `interval` until it accepts connections or
/// `max_wait` passes.
pub async fn wait_until_live(
    prober: &PortProber,
    port: u16,
    max_wait: Duration,
    interval: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + max_wait;
    loop {
        if prober.probe(port).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(port, wait_secs = max_wait.as_secs(), "Port did not become live in time.");
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
