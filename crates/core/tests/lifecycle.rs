//! Deploy, scan and descriptor flows against a temporary environment tree.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use optiflux_common::{InstanceStatus, ModelDescriptor, ServiceInstance, ServiceKind};
use optiflux_core::{ArtifactSource, Caller, Manager, ManagerConfig, ManagerError, Role, UploadedFile};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn manager(dir: &TempDir) -> Manager {
    manager_with(dir, |_| {})
}

fn manager_with(dir: &TempDir, tune: impl FnOnce(&mut ManagerConfig)) -> Manager {
    let mut config = ManagerConfig::rooted_at(dir.path());
    tune(&mut config);
    config.ensure_environment_dirs().unwrap();
    Manager::new(Arc::new(config))
}

/// Two distinct ports nothing is listening on.
fn free_ports() -> (u16, u16) {
    let first = TcpListener::bind("127.0.0.1:0").unwrap();
    let second = TcpListener::bind("127.0.0.1:0").unwrap();
    (
        first.local_addr().unwrap().port(),
        second.local_addr().unwrap().port(),
    )
}

/// Deploys `ranker` 1.0.0 in dev with one instance per service on free ports.
async fn deployed(manager: &Manager) -> (u16, u16) {
    manager
        .deploy(&admin(), "dev", "ranker", "1.0.0", weights("model.bin"))
        .await
        .unwrap();
    let ports = free_ports();
    let mut descriptor = ModelDescriptor::initial(Some("1.0.0"));
    for kind in ServiceKind::ALL {
        descriptor.services.instances_mut(kind).clear();
    }
    descriptor
        .services
        .instances_mut(ServiceKind::Recommendation)
        .push(ServiceInstance::new(ports.0, 1));
    descriptor
        .services
        .instances_mut(ServiceKind::Reward)
        .push(ServiceInstance::new(ports.1, 1));
    manager
        .update_descriptor(&admin(), "dev", "ranker", descriptor)
        .await
        .unwrap();
    ports
}

fn admin() -> Caller {
    Caller::new("alice", Role::Admin)
}

fn weights(name: &str) -> ArtifactSource {
    ArtifactSource::File {
        name: name.to_string(),
        bytes: vec![7u8; 64],
    }
}

#[tokio::test]
async fn first_deploy_seeds_the_serving_version() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);

    manager
        .deploy(&admin(), "dev", "ranker", "1.0.0", weights("model.bin"))
        .await
        .unwrap();
    manager
        .deploy(&admin(), "dev", "ranker", "2.0.0", weights("model.bin"))
        .await
        .unwrap();

    let descriptor = manager.get_descriptor("dev", "ranker").await.unwrap();
    assert_eq!(descriptor.current_version.as_deref(), Some("1.0.0"));

    let versions = manager.scan_versions("dev", "ranker").await.unwrap();
    let names: Vec<&str> = versions.iter().map(|v| v.version.as_str()).collect();
    assert_eq!(names, ["2.0.0", "1.0.0"]);
    assert!(!versions[0].is_serving);
    assert!(versions[1].is_serving);
    assert_eq!(versions[1].size, 64);
}

#[tokio::test]
async fn folder_upload_strips_the_wrapper_directory() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let batch = ArtifactSource::Batch(vec![
        UploadedFile {
            relative_path: "bundle/src/recomserver.py".to_string(),
            bytes: b"app = None\n".to_vec(),
        },
        UploadedFile {
            relative_path: "bundle/weights.bin".to_string(),
            bytes: vec![0u8; 10],
        },
    ]);

    let receipt = manager
        .deploy(&admin(), "preprod", "ranker", "1.0.0", batch)
        .await
        .unwrap();
    assert_eq!(receipt.files, 2);

    let version_dir = dir.path().join("preprod/ranker/1.0.0");
    assert!(version_dir.join("src/recomserver.py").is_file());
    assert!(version_dir.join("weights.bin").is_file());

    let source = manager
        .read_version_file("preprod", "ranker", "1.0.0", "src/recomserver.py".to_string())
        .await
        .unwrap();
    assert_eq!(source, "app = None\n");
}

#[tokio::test]
async fn viewers_cannot_change_state() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let viewer = Caller::new("victor", Role::Viewer);

    let err = manager
        .deploy(&viewer, "dev", "ranker", "1.0.0", weights("model.bin"))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::PermissionDenied { .. }));
    assert!(!dir.path().join("dev/ranker").exists());

    manager
        .deploy(&admin(), "dev", "ranker", "1.0.0", weights("model.bin"))
        .await
        .unwrap();
    let err = manager
        .restart_all(&viewer, "dev", "ranker", "1.0.0")
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::PermissionDenied { .. }));
}

#[tokio::test]
async fn permission_is_checked_before_the_target_is_resolved() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    let viewer = Caller::new("victor", Role::Viewer);

    let err = manager
        .restart_all(&viewer, "dev", "ghost", "1.0.0")
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::PermissionDenied { .. }));

    let err = manager
        .update_descriptor(&viewer, "dev", "ghost", ModelDescriptor::initial(None))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::PermissionDenied { .. }));
}

#[tokio::test]
async fn instance_that_never_comes_up_halts_the_restart() {
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, |config| {
        config.launch.launcher = "/nonexistent/gunicorn".to_string();
        config.launch.liveness_wait = Some(Duration::from_secs(1));
        config.launch.liveness_interval = Duration::from_millis(100);
    });
    let (recom_port, reward_port) = deployed(&manager).await;

    let err = manager
        .restart_all(&admin(), "dev", "ranker", "1.0.0")
        .await
        .unwrap_err();
    match &err {
        ManagerError::LaunchFailure { kind, port, output } => {
            assert_eq!(*kind, ServiceKind::Recommendation);
            assert_eq!(*port, recom_port);
            assert!(output.contains("not live after"), "{output}");
            assert!(output.contains("launcher log"), "{output}");
        }
        other => panic!("expected a launch failure, got {other:?}"),
    }

    let descriptor = manager.get_descriptor("dev", "ranker").await.unwrap();
    assert_eq!(
        descriptor.services.recommendation[0].status,
        InstanceStatus::Error
    );
    assert_eq!(descriptor.services.reward[0].status, InstanceStatus::Stopped);

    let version_dir = dir.path().join("dev/ranker/1.0.0");
    assert!(version_dir.join(format!("scripts/recomserver_{recom_port}.sh")).is_file());
    assert!(!version_dir.join(format!("scripts/rewardserver_{reward_port}.sh")).exists());

    let audit = std::fs::read_to_string(manager.config().audit_log_path()).unwrap();
    assert!(audit.lines().last().unwrap().contains("restart_failed"));
}

#[tokio::test]
async fn launches_are_paced_in_descriptor_order() {
    let pacing = Duration::from_millis(1500);
    let dir = TempDir::new().unwrap();
    let manager = manager_with(&dir, |config| {
        config.launch.launcher = "true".to_string();
        config.launch.pacing = pacing;
    });
    let (recom_port, reward_port) = deployed(&manager).await;

    let started = Instant::now();
    let report = manager
        .restart_all(&admin(), "dev", "ranker", "1.0.0")
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // One pause between two launches, none before the first or after the last.
    assert!(elapsed >= pacing, "{elapsed:?}");
    assert!(elapsed < pacing * 2, "{elapsed:?}");

    let order: Vec<(ServiceKind, u16)> = report
        .launched
        .iter()
        .map(|instance| (instance.service, instance.port))
        .collect();
    assert_eq!(
        order,
        [
            (ServiceKind::Recommendation, recom_port),
            (ServiceKind::Reward, reward_port)
        ]
    );
    assert!(
        report
            .launched
            .iter()
            .all(|instance| instance.status == InstanceStatus::Running)
    );

    let descriptor = manager.get_descriptor("dev", "ranker").await.unwrap();
    assert!(
        descriptor
            .services
            .iter()
            .all(|(_, instance)| instance.status == InstanceStatus::Running)
    );
}

#[tokio::test]
async fn restart_rejects_unknown_targets() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);

    let err = manager
        .restart_all(&admin(), "dev", "ghost", "1.0.0")
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::NotFound(_)));

    manager
        .deploy(&admin(), "dev", "ranker", "1.0.0", weights("model.bin"))
        .await
        .unwrap();
    let err = manager
        .restart_all(&admin(), "dev", "ranker", "9.9.9")
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::NotFound(_)));

    let err = manager
        .restart_all(&admin(), "qa", "ranker", "1.0.0")
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::InvalidEnvironment(_)));
}

#[tokio::test]
async fn descriptor_updates_reject_duplicate_ports() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager
        .deploy(&admin(), "dev", "ranker", "1.0.0", weights("model.bin"))
        .await
        .unwrap();

    let mut descriptor = ModelDescriptor::initial(Some("1.0.0"));
    descriptor
        .services
        .instances_mut(ServiceKind::Reward)
        .push(ServiceInstance::new(8001, 1));
    let err = manager
        .update_descriptor(&admin(), "dev", "ranker", descriptor)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::InvalidParameter { .. }));

    let mut descriptor = ModelDescriptor::initial(Some("1.0.0"));
    descriptor
        .services
        .instances_mut(ServiceKind::Reward)
        .push(ServiceInstance::new(8003, 1));
    manager
        .update_descriptor(&admin(), "dev", "ranker", descriptor)
        .await
        .unwrap();
    let stored = manager.get_descriptor("dev", "ranker").await.unwrap();
    assert_eq!(stored.services.len(), 3);
}

#[tokio::test]
async fn operations_are_audited() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    manager
        .deploy(&admin(), "dev", "ranker", "1.0.0", weights("model.bin"))
        .await
        .unwrap();

    let log = std::fs::read_to_string(manager.config().audit_log_path()).unwrap();
    let entry: serde_json::Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(entry["actor"], "alice");
    assert_eq!(entry["action"], "deploy");
    assert_eq!(entry["details"]["version"], "1.0.0");
}

#[tokio::test]
async fn models_are_listed_per_environment() {
    let dir = TempDir::new().unwrap();
    let manager = manager(&dir);
    for model in ["ranker", "scorer"] {
        manager
            .deploy(&admin(), "prod", model, "1.0.0", weights("model.bin"))
            .await
            .unwrap();
    }

    let page = manager.list_models("prod", 1, 10).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.models.len(), 2);
    assert!(page.models.iter().all(|m| m.version_count == 1));

    let dev = manager.list_models("dev", 1, 10).await.unwrap();
    assert_eq!(dev.total, 0);
}
