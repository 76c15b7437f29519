//! Manager configuration.
//!
//! Values come from the process environment, then `.env.<profile>`, then
//! `.env`, then built-in defaults. The resulting [`ManagerConfig`] is built
//! once at startup and handed to every component that needs it.

use optiflux_common::{DEFAULT_SERVER_PORT, Environment};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::dotenv;
use crate::error::{ManagerError, Result};

/// Prefix of every configuration variable.
pub const ENV_PREFIX: &str = "OPTIFLUX_";

const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_PROBE_HOST: &str = "127.0.0.1";
const DEFAULT_LAUNCHER: &str = "gunicorn";
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 240;
const DEFAULT_PACING_SECS: u64 = 3;
const DEFAULT_KILL_GRACE_MS: u64 = 1000;
const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 500;
const DEFAULT_CACHE_TTL_SECS: u64 = 5;

/// Timing and tooling used when (re)starting service instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    /// Program invoked by generated start scripts.
    pub launcher: String,
    /// Hard wall-clock bound on the launch command.
    pub timeout: Duration,
    /// Delay between two consecutive instance launches.
    pub pacing: Duration,
    /// Time given to a terminated process to release its port.
    pub kill_grace: Duration,
    /// When set, wait up to this long for each port to accept connections.
    pub liveness_wait: Option<Duration>,
    /// Pause between two liveness checks.
    pub liveness_interval: Duration,
}

/// Where and how port liveness is checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSettings {
    /// Host the instances listen on.
    pub host: String,
    /// Connect timeout of one check.
    pub timeout: Duration,
}

/// Everything the manager and its HTTP server are configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// HTTP bind address.
    pub host: String,
    /// HTTP port.
    pub port: u16,
    /// Root of the dev environment.
    pub dev_root: PathBuf,
    /// Root of the preprod environment.
    pub preprod_root: PathBuf,
    /// Root of the prod environment.
    pub prod_root: PathBuf,
    /// Directory of the audit log.
    pub log_dir: PathBuf,
    /// TOML users file; without one every caller is anonymous.
    pub users_file: Option<PathBuf>,
    /// Port liveness checks.
    pub probe: ProbeSettings,
    /// Instance launching.
    pub launch: LaunchSettings,
    /// Lifetime of cached version scans.
    pub cache_ttl: Duration,
}

impl ManagerConfig {
    /// Loads the configuration for `profile` from the current directory's
    /// dotenv files and the process environment.
    pub fn load(profile: Option<&str>) -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|err| ManagerError::Config(format!("Failed to read current dir: {err}")))?;
        Self::load_from(&cwd, profile)
    }

    /// Like [`ManagerConfig::load`] with dotenv files read from `dir`.
    pub fn load_from(dir: &Path, profile: Option<&str>) -> Result<Self> {
        let mut vars = dotenv::read_vars(&dir.join(".env")).map_err(ManagerError::Config)?;
        if let Some(profile) = profile {
            let profile_path = dir.join(format!(".env.{profile}"));
            debug!(path = %profile_path.display(), "Loading profile dotenv file.");
            vars.extend(dotenv::read_vars(&profile_path).map_err(ManagerError::Config)?);
        }
        vars.extend(std::env::vars().filter(|(key, _)| key.starts_with(ENV_PREFIX)));
        Self::from_vars(&vars)
    }

    /// Builds the configuration from `OPTIFLUX_*` variables.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| vars.get(&format!("{ENV_PREFIX}{key}")).map(String::as_str);
        let path_or = |key: &str, default: &str| PathBuf::from(get(key).unwrap_or(default));

        let log_dir = match get("LOG_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_log_dir()?,
        };
        let liveness_wait_secs: u64 = parse_or(get("LIVENESS_WAIT_SECS"), "LIVENESS_WAIT_SECS", 0)?;

        Ok(Self {
            host: get("HOST").unwrap_or(DEFAULT_BIND_HOST).to_string(),
            port: parse_or(get("PORT"), "PORT", DEFAULT_SERVER_PORT)?,
            dev_root: path_or("DEV_ENV_DIR", "./dev"),
            preprod_root: path_or("PREPROD_ENV_DIR", "./preprod"),
            prod_root: path_or("PROD_ENV_DIR", "./prod"),
            log_dir,
            users_file: get("USERS_FILE").map(PathBuf::from),
            probe: ProbeSettings {
                host: get("PROBE_HOST").unwrap_or(DEFAULT_PROBE_HOST).to_string(),
                timeout: Duration::from_millis(parse_or(
                    get("PROBE_TIMEOUT_MS"),
                    "PROBE_TIMEOUT_MS",
                    DEFAULT_PROBE_TIMEOUT_MS,
                )?),
            },
            launch: LaunchSettings {
                launcher: get("GUNICORN_BIN").unwrap_or(DEFAULT_LAUNCHER).to_string(),
                timeout: Duration::from_secs(parse_or(
                    get("LAUNCH_TIMEOUT_SECS"),
                    "LAUNCH_TIMEOUT_SECS",
                    DEFAULT_LAUNCH_TIMEOUT_SECS,
                )?),
                pacing: Duration::from_secs(parse_or(
                    get("LAUNCH_PACING_SECS"),
                    "LAUNCH_PACING_SECS",
                    DEFAULT_PACING_SECS,
                )?),
                kill_grace: Duration::from_millis(parse_or(
                    get("KILL_GRACE_MS"),
                    "KILL_GRACE_MS",
                    DEFAULT_KILL_GRACE_MS,
                )?),
                liveness_wait: (liveness_wait_secs > 0)
                    .then(|| Duration::from_secs(liveness_wait_secs)),
                liveness_interval: Duration::from_millis(parse_or(
                    get("LIVENESS_INTERVAL_MS"),
                    "LIVENESS_INTERVAL_MS",
                    DEFAULT_LIVENESS_INTERVAL_MS,
                )?),
            },
            cache_ttl: Duration::from_secs(parse_or(
                get("CACHE_TTL_SECS"),
                "CACHE_TTL_SECS",
                DEFAULT_CACHE_TTL_SECS,
            )?),
        })
    }

    /// Configuration rooted at `base`: environments at `base/<env>`, logs at
    /// `base/logs`, no pacing and no kill grace.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            host: DEFAULT_PROBE_HOST.to_string(),
            port: 0,
            dev_root: base.join(Environment::Dev.as_str()),
            preprod_root: base.join(Environment::Preprod.as_str()),
            prod_root: base.join(Environment::Prod.as_str()),
            log_dir: base.join("logs"),
            users_file: None,
            probe: ProbeSettings {
                host: DEFAULT_PROBE_HOST.to_string(),
                timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            },
            launch: LaunchSettings {
                launcher: DEFAULT_LAUNCHER.to_string(),
                timeout: Duration::from_secs(DEFAULT_LAUNCH_TIMEOUT_SECS),
                pacing: Duration::ZERO,
                kill_grace: Duration::ZERO,
                liveness_wait: None,
                liveness_interval: Duration::from_millis(DEFAULT_LIVENESS_INTERVAL_MS),
            },
            cache_ttl: Duration::ZERO,
        }
    }

    /// Root directory of `env`.
    pub fn env_root(&self, env: Environment) -> &Path {
        match env {
            Environment::Dev => &self.dev_root,
            Environment::Preprod => &self.preprod_root,
            Environment::Prod => &self.prod_root,
        }
    }

    /// Creates every environment root and the log directory.
    pub fn ensure_environment_dirs(&self) -> Result<()> {
        for env in Environment::ALL {
            let root = self.env_root(env);
            std::fs::create_dir_all(root).map_err(|err| ManagerError::io(root, err))?;
        }
        std::fs::create_dir_all(&self.log_dir).map_err(|err| ManagerError::io(&self.log_dir, err))
    }

    /// The JSON-lines audit log.
    pub fn audit_log_path(&self) -> PathBuf {
        self.log_dir.join("operations.jsonl")
    }
}

fn default_log_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ManagerError::Config("Failed to determine home directory".to_string()))?;
    Ok(home.join(".optiflux").join("logs"))
}

fn parse_or<T: FromStr>(value: Option<&str>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.map_or(Ok(default), |raw| {
        raw.trim()
            .parse()
            .map_err(|err| ManagerError::Config(format!("{ENV_PREFIX}{key}='{raw}': {err}")))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(key, value)| (format!("{ENV_PREFIX}{key}"), (*value).to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ManagerConfig::from_vars(&vars(&[("LOG_DIR", "/var/log/optiflux")])).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8912);
        assert_eq!(config.launch.timeout, Duration::from_secs(240));
        assert_eq!(config.launch.pacing, Duration::from_secs(3));
        assert_eq!(config.probe.timeout, Duration::from_secs(1));
        assert_eq!(config.launch.liveness_wait, None);
        assert_eq!(config.env_root(Environment::Prod), Path::new("./prod"));
    }

    #[test]
    fn overrides_and_liveness_wait() {
        let config = ManagerConfig::from_vars(&vars(&[
            ("PORT", "9100"),
            ("DEV_ENV_DIR", "/srv/dev"),
            ("LIVENESS_WAIT_SECS", "15"),
            ("LOG_DIR", "/tmp"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.env_root(Environment::Dev), Path::new("/srv/dev"));
        assert_eq!(config.launch.liveness_wait, Some(Duration::from_secs(15)));
    }

    #[test]
    fn invalid_number_is_a_config_error() {
        let err = ManagerConfig::from_vars(&vars(&[("PORT", "eighty"), ("LOG_DIR", "/tmp")]))
            .unwrap_err();
        assert!(matches!(err, ManagerError::Config(message) if message.contains("OPTIFLUX_PORT")));
    }

    #[test]
    fn profile_file_overrides_base_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(".env"),
            "OPTIFLUX_PROD_ENV_DIR=/base/prod\nOPTIFLUX_LOG_DIR=/tmp\n",
        )
        .unwrap();
        std::fs::write(dir.path().join(".env.prod"), "OPTIFLUX_PROD_ENV_DIR=/srv/prod\n").unwrap();

        let base = ManagerConfig::load_from(dir.path(), None).unwrap();
        let prod = ManagerConfig::load_from(dir.path(), Some("prod")).unwrap();
        assert_eq!(base.prod_root, PathBuf::from("/base/prod"));
        assert_eq!(prod.prod_root, PathBuf::from("/srv/prod"));
    }

    #[test]
    fn ensure_environment_dirs_creates_roots() {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig::rooted_at(dir.path());
        config.ensure_environment_dirs().unwrap();
        for env in Environment::ALL {
            assert!(config.env_root(env).is_dir());
        }
        assert!(config.log_dir.is_dir());
    }
}
