//! Deployment lifecycle orchestration.
//!
//! [`Manager`] ties the registry, the script generator and the process
//! controller together. It is the enforcement point for authorization and
//! the only component that records audit entries.

use optiflux_common::{
    DeployReceipt, Environment, FileEntry, InstanceReport, InstanceStatus, LaunchedInstance,
    LogTail, ModelDescriptor, ModelPage, RestartReport, ServiceInstance, ServiceKind,
    ServiceStatusReport, VersionSummary,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::archive::{ArtifactSource, materialize};
use crate::audit::{AuditSink, JsonlAuditLog};
use crate::auth::{Authorizer, Caller, RolePolicy, require_operator};
use crate::browse;
use crate::cache::VersionCache;
use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::process::{CommandOutcome, ProcessController, listening_pids};
use crate::prober::PortProber;
use crate::registry::{self, checked_segment, descriptor_path};
use crate::script::{self, ScriptPaths};

/// Launcher log lines quoted in a liveness failure.
const LAUNCH_LOG_TAIL: usize = 20;

/// Runs blocking filesystem work off the async executor.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ManagerError::Internal(format!("Blocking task failed: {err}")))?
}

/// Resolved location of a model inside an environment.
#[derive(Debug, Clone)]
struct ModelLocation {
    env: Environment,
    name: String,
    dir: PathBuf,
}

impl ModelLocation {
    fn descriptor(&self) -> PathBuf {
        descriptor_path(&self.dir)
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.dir.join(version)
    }

    fn existing_version(&self, version: &str) -> Result<PathBuf> {
        let version = checked_segment("model_version", version)?;
        let dir = self.version_dir(version);
        if !dir.is_dir() {
            return Err(ManagerError::NotFound(format!(
                "version '{version}' of model '{}'",
                self.name
            )));
        }
        Ok(dir)
    }
}

fn parse_environment(env: &str) -> Result<Environment> {
    if env.trim().is_empty() {
        return Err(ManagerError::MissingParameter("env"));
    }
    env.parse()
        .map_err(|_| ManagerError::InvalidEnvironment(env.to_string()))
}

/// Entry point of every deployment operation.
#[derive(Debug, Clone)]
pub struct Manager {
    config: Arc<ManagerConfig>,
    prober: PortProber,
    controller: ProcessController,
    authorizer: Arc<dyn Authorizer>,
    audit: Arc<dyn AuditSink>,
    cache: Arc<VersionCache>,
}

impl Manager {
    /// A manager with role-based authorization and a JSON-lines audit log
    /// under the configured log directory.
    pub fn new(config: Arc<ManagerConfig>) -> Self {
        let prober = PortProber::from_settings(&config.probe);
        let controller = ProcessController::new(prober.clone(), config.launch.clone());
        Self {
            audit: Arc::new(JsonlAuditLog::new(config.audit_log_path())),
            cache: Arc::new(VersionCache::new(config.cache_ttl)),
            authorizer: Arc::new(RolePolicy),
            prober,
            controller,
            config,
        }
    }

    /// Replaces the authorization policy.
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    /// Replaces the audit sink.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Port checker shared by status reports and restarts.
    pub const fn prober(&self) -> &PortProber {
        &self.prober
    }

    /// Fails with `PermissionDenied` unless `caller` may perform `action`.
    pub fn authorize(&self, caller: &Caller, action: &'static str) -> Result<()> {
        require_operator(self.authorizer.as_ref(), caller, action)
    }

    fn locate(&self, env: &str, model: &str) -> Result<ModelLocation> {
        let env = parse_environment(env)?;
        let name = checked_segment("model_name", model)?.to_string();
        let dir = self.config.env_root(env).join(&name);
        Ok(ModelLocation { env, name, dir })
    }

    fn existing_model(&self, env: &str, model: &str) -> Result<ModelLocation> {
        let location = self.locate(env, model)?;
        if !location.descriptor().is_file() {
            return Err(ManagerError::NotFound(format!(
                "model '{}' in {}",
                location.name, location.env
            )));
        }
        Ok(location)
    }

    /// Stores an artifact as `<env>/<model>/<version>/`.
    ///
    /// Creates the model directory and, for a new model, an initial
    /// descriptor whose serving version is `version`.
    pub async fn deploy(
        &self,
        caller: &Caller,
        env: &str,
        model: &str,
        version: &str,
        source: ArtifactSource,
    ) -> Result<DeployReceipt> {
        let location = self.locate(env, model)?;
        let version = checked_segment("model_version", version)?.to_string();
        if source.is_empty() {
            return Err(ManagerError::MissingParameter("artifact"));
        }
        self.authorize(caller, "deploy")?;

        let started = Instant::now();
        let target = location.version_dir(&version);
        let (report, target) = {
            let location = location.clone();
            let version = version.clone();
            blocking(move || {
                std::fs::create_dir_all(&location.dir)
                    .map_err(|err| ManagerError::io(&location.dir, err))?;
                registry::load_or_init_seeded(&location.descriptor(), Some(&version))?;
                let report = materialize(&source, &target)?;
                Ok((report, target))
            })
            .await?
        };
        self.cache.invalidate(location.env, &location.name);

        info!(
            env = %location.env,
            model = %location.name,
            version,
            files = report.files,
            bytes = report.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Deployed version."
        );
        self.audit.record(
            &caller.name,
            "deploy",
            json!({
                "env": location.env,
                "model": location.name,
                "version": version,
                "files": report.files,
            }),
        );

        Ok(DeployReceipt {
            model_name: location.name,
            model_version: version,
            path: target.display().to_string(),
            files: report.files,
            bytes: report.bytes,
        })
    }

    /// Makes `version` the serving version and (re)starts every declared
    /// instance in descriptor order, pausing between launches.
    ///
    /// The first failed launch stops the batch. Instances launched before it
    /// keep running and are reported in the error's log context.
    pub async fn restart_all(
        &self,
        caller: &Caller,
        env: &str,
        model: &str,
        version: &str,
    ) -> Result<RestartReport> {
        self.authorize(caller, "restart services")?;
        let location = self.existing_model(env, model)?;
        let version_dir = location.existing_version(version)?;
        let version = checked_segment("model_version", version)?.to_string();

        let descriptor_file = location.descriptor();
        let descriptor = {
            let path = descriptor_file.clone();
            let version = version.clone();
            blocking(move || registry::set_current_version(&path, &version)).await?
        };
        self.cache.invalidate(location.env, &location.name);

        let instances: Vec<(ServiceKind, ServiceInstance)> = descriptor
            .services
            .iter()
            .map(|(kind, instance)| (kind, instance.clone()))
            .collect();
        {
            let version_dir = version_dir.clone();
            let scripts: Vec<ScriptPaths> = instances
                .iter()
                .map(|(kind, instance)| ScriptPaths::new(&version_dir, *kind, instance.port))
                .collect();
            blocking(move || script::generate_start_all_script(&version_dir, &scripts)).await?;
        }

        info!(
            env = %location.env,
            model = %location.name,
            version,
            instances = instances.len(),
            "Restarting services."
        );

        let mut launched = Vec::with_capacity(instances.len());
        for (position, (kind, instance)) in instances.into_iter().enumerate() {
            if position > 0 {
                tokio::time::sleep(self.controller.settings().pacing).await;
            }

            let result = self.restart_instance(&version_dir, kind, &instance).await;
            let (status, pid) = match &result {
                Ok(started) => (started.status, started.pid),
                Err(_) => (InstanceStatus::Error, None),
            };
            self.record_instance(&descriptor_file, kind, instance.port, status, pid)
                .await;

            match result {
                Ok(started) => launched.push(started),
                Err(err) => {
                    error!(
                        model = %location.name,
                        version,
                        %kind,
                        port = instance.port,
                        launched = launched.len(),
                        error = %err,
                        "Restart halted."
                    );
                    self.audit.record(
                        &caller.name,
                        "restart_failed",
                        json!({
                            "env": location.env,
                            "model": location.name,
                            "version": version,
                            "error": err.to_string(),
                        }),
                    );
                    return Err(err);
                }
            }
        }

        self.audit.record(
            &caller.name,
            "restart",
            json!({
                "env": location.env,
                "model": location.name,
                "version": version,
                "instances": launched.len(),
            }),
        );
        Ok(RestartReport {
            model_name: location.name,
            version,
            launched,
        })
    }

    async fn restart_instance(
        &self,
        version_dir: &Path,
        kind: ServiceKind,
        instance: &ServiceInstance,
    ) -> Result<LaunchedInstance> {
        let port = instance.port;
        self.controller.ensure_port_free(port).await?;

        let paths = {
            let launcher = self.controller.settings().launcher.clone();
            let version_dir = version_dir.to_path_buf();
            let instance = instance.clone();
            blocking(move || script::generate_start_script(&launcher, &version_dir, kind, &instance))
                .await?
        };

        let outcome = self.controller.launch(&paths).await?;
        match outcome {
            CommandOutcome::Success { .. } => {}
            CommandOutcome::Failed { .. } | CommandOutcome::TimedOut { .. } => {
                return Err(ManagerError::LaunchFailure {
                    kind,
                    port,
                    output: outcome.describe(),
                });
            }
        }

        if self.controller.settings().liveness_wait.is_none() {
            return Ok(LaunchedInstance {
                service: kind,
                port,
                status: InstanceStatus::Running,
                pid: None,
            });
        }

        if self.controller.wait_until_live(port).await {
            let pid = listening_pids(port).await.into_iter().next();
            debug!(%kind, port, ?pid, "Instance is live.");
            return Ok(LaunchedInstance {
                service: kind,
                port,
                status: InstanceStatus::Running,
                pid,
            });
        }

        let waited = self
            .controller
            .settings()
            .liveness_wait
            .unwrap_or_default()
            .as_secs_f64();
        warn!(%kind, port, waited, "Instance never accepted connections.");
        let tail = {
            let version_dir = version_dir.to_path_buf();
            blocking(move || {
                browse::tail_service_log(&version_dir, kind, port, LAUNCH_LOG_TAIL, true)
            })
            .await
        };
        let log = match tail {
            Ok(tail) if !tail.lines.is_empty() => tail.lines.join("\n"),
            Ok(_) => "<empty>".to_string(),
            Err(err) => format!("<unavailable: {err}>"),
        };
        Err(ManagerError::LaunchFailure {
            kind,
            port,
            output: format!("port not live after {waited:.1}s; launcher log:\n{log}"),
        })
    }

    /// Persists the advisory status of one instance. Failures are logged.
    async fn record_instance(
        &self,
        descriptor_file: &Path,
        kind: ServiceKind,
        port: u16,
        status: InstanceStatus,
        pid: Option<u32>,
    ) {
        let path = descriptor_file.to_path_buf();
        let result = blocking(move || {
            registry::update_descriptor(&path, None, |descriptor| {
                if let Some(instance) = descriptor.services.find_mut(kind, port) {
                    instance.status = status;
                    instance.pid = pid;
                }
                Ok(())
            })
        })
        .await;
        if let Err(err) = result {
            warn!(%kind, port, error = %err, "Failed to record instance status.");
        }
    }

    /// Probes every declared port of the model.
    pub async fn check_service_status(
        &self,
        env: &str,
        model: &str,
        version: &str,
    ) -> Result<ServiceStatusReport> {
        let location = self.existing_model(env, model)?;
        location.existing_version(version)?;
        let prober = self.prober.clone();
        blocking(move || {
            let descriptor = registry::load_or_init_descriptor(&location.descriptor())?;
            Ok(registry::check_service_status(&descriptor, &prober))
        })
        .await
    }

    /// Version directories of a model, newest first. Cached briefly.
    pub async fn scan_versions(&self, env: &str, model: &str) -> Result<Vec<VersionSummary>> {
        let location = self.locate(env, model)?;
        if let Some(cached) = self.cache.get(location.env, &location.name) {
            return Ok(cached);
        }
        let prober = self.prober.clone();
        let scan_location = location.clone();
        let versions = blocking(move || {
            let descriptor = registry::read_descriptor(&scan_location.descriptor())?;
            registry::scan_versions(&scan_location.dir, descriptor.as_ref(), Some(&prober))
        })
        .await?;
        self.cache
            .insert(location.env, &location.name, versions.clone());
        Ok(versions)
    }

    /// Descriptor of a model, created with defaults when missing.
    pub async fn load_or_init_descriptor(&self, env: &str, model: &str) -> Result<ModelDescriptor> {
        let location = self.locate(env, model)?;
        blocking(move || {
            std::fs::create_dir_all(&location.dir)
                .map_err(|err| ManagerError::io(&location.dir, err))?;
            registry::load_or_init_descriptor(&location.descriptor())
        })
        .await
    }

    /// Descriptor of an existing model, repaired if needed.
    pub async fn get_descriptor(&self, env: &str, model: &str) -> Result<ModelDescriptor> {
        let location = self.existing_model(env, model)?;
        blocking(move || registry::load_or_init_descriptor(&location.descriptor())).await
    }

    /// Replaces the descriptor of an existing model.
    pub async fn update_descriptor(
        &self,
        caller: &Caller,
        env: &str,
        model: &str,
        descriptor: ModelDescriptor,
    ) -> Result<ModelDescriptor> {
        self.authorize(caller, "update descriptors")?;
        let location = self.existing_model(env, model)?;
        let path = location.descriptor();
        let stored = descriptor.clone();
        blocking(move || registry::replace_descriptor(&path, &stored)).await?;
        self.cache.invalidate(location.env, &location.name);

        info!(env = %location.env, model = %location.name, "Descriptor replaced.");
        self.audit.record(
            &caller.name,
            "update_config",
            json!({"env": location.env, "model": location.name}),
        );
        Ok(descriptor)
    }

    /// One page of the models of an environment.
    pub async fn list_models(&self, env: &str, page: usize, per_page: usize) -> Result<ModelPage> {
        let env = parse_environment(env)?;
        let root = self.config.env_root(env).to_path_buf();
        let prober = self.prober.clone();
        blocking(move || registry::list_models(&root, page, per_page, &prober)).await
    }

    /// Stored entry `index` of `service` with the live state of its port.
    pub async fn service_instance_status(
        &self,
        env: &str,
        model: &str,
        service: &str,
        index: usize,
    ) -> Result<InstanceReport> {
        let location = self.existing_model(env, model)?;
        let kind: ServiceKind = service
            .parse()
            .map_err(|_| ManagerError::NotFound(format!("service '{service}'")))?;
        let prober = self.prober.clone();
        blocking(move || {
            let descriptor = registry::load_or_init_descriptor(&location.descriptor())?;
            browse::instance_status(&descriptor, kind, index, &prober)
        })
        .await
    }

    /// Entries of a version directory or of `sub_path` inside it.
    pub async fn list_version_files(
        &self,
        env: &str,
        model: &str,
        version: &str,
        sub_path: Option<String>,
    ) -> Result<Vec<FileEntry>> {
        let location = self.locate(env, model)?;
        let version_dir = location.existing_version(version)?;
        blocking(move || browse::list_files(&version_dir, sub_path.as_deref())).await
    }

    /// Text content of a file inside a version directory.
    pub async fn read_version_file(
        &self,
        env: &str,
        model: &str,
        version: &str,
        path: String,
    ) -> Result<String> {
        let location = self.locate(env, model)?;
        let version_dir = location.existing_version(version)?;
        blocking(move || browse::read_file(&version_dir, &path)).await
    }

    /// Last `lines` lines of an instance log, or of its launcher log.
    #[allow(clippy::too_many_arguments)]
    pub async fn tail_service_log(
        &self,
        env: &str,
        model: &str,
        version: &str,
        service: &str,
        port: u16,
        lines: usize,
        launcher: bool,
    ) -> Result<LogTail> {
        let location = self.locate(env, model)?;
        let version_dir = location.existing_version(version)?;
        let kind: ServiceKind = service
            .parse()
            .map_err(|_| ManagerError::NotFound(format!("service '{service}'")))?;
        blocking(move || browse::tail_service_log(&version_dir, kind, port, lines, launcher)).await
    }
}
