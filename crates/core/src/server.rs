//! HTTP front end of the manager.

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use optiflux_common::{
    DeployReceipt, Envelope, FileEntry, InstanceReport, LogTail, ModelDescriptor, ModelPage,
    RestartReport, RestartRequest, ServiceStatusReport, UploadType, VersionSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::archive::ArtifactSource;
use crate::auth::{Caller, UserDirectory};
use crate::error::ManagerError;
use crate::manager::Manager;

/// Upper bound on a deploy request body.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;
const DEFAULT_PER_PAGE: usize = 10;
const DEFAULT_TAIL_LINES: usize = 200;

#[derive(Debug, Clone)]
struct AppState {
    manager: Arc<Manager>,
    users: Arc<UserDirectory>,
}

impl AppState {
    fn caller(&self, headers: &HeaderMap) -> Caller {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        self.users.resolve(token)
    }
}

/// A [`ManagerError`] rendered as an error envelope with a matching status.
#[derive(Debug)]
struct ApiError(ManagerError);

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed.");
        } else {
            debug!(error = %self.0, "Request rejected.");
        }
        (status, Json(Envelope::<()>::error(self.0.to_string()))).into_response()
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope::success(data)))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ModelQuery {
    env: String,
    model_name: String,
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    env: String,
    model_name: String,
    model_version: String,
}

#[derive(Debug, Deserialize)]
struct DeployQuery {
    env: String,
    model_name: String,
    model_version: String,
    filename: Option<String>,
    #[serde(default)]
    upload_type: UploadType,
}

#[derive(Debug, Deserialize)]
struct ModelsQuery {
    env: String,
    page: Option<usize>,
    per_page: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct UpdateConfigRequest {
    env: String,
    model_name: String,
    config: ModelDescriptor,
}

#[derive(Debug, Deserialize)]
struct InstanceQuery {
    env: String,
    model_name: String,
    service_name: String,
    instance_index: usize,
}

#[derive(Debug, Deserialize)]
struct FilesQuery {
    env: String,
    model_name: String,
    model_version: String,
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    env: String,
    model_name: String,
    model_version: String,
    service_name: String,
    port: u16,
    lines: Option<usize>,
    #[serde(default)]
    launcher: bool,
}

/// All API routes over a shared manager.
pub fn router(manager: Arc<Manager>, users: Arc<UserDirectory>) -> Router {
    let state = AppState { manager, users };
    Router::new()
        .route("/health", get(health))
        .route("/deploy", post(deploy))
        .route("/restart_services", post(restart_services))
        .route("/check_service_status", get(check_service_status))
        .route("/model_versions", get(model_versions))
        .route("/model_names", get(model_names))
        .route("/get_config", get(get_config))
        .route("/update_config", post(update_config))
        .route("/service_instance_status", get(service_instance_status))
        .route("/model_files", get(model_files))
        .route("/model_file_content", get(model_file_content))
        .route("/service_log", get(service_log))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// Serves the API on `listener` until Ctrl-C.
pub async fn serve(
    listener: TcpListener,
    manager: Arc<Manager>,
    users: Arc<UserDirectory>,
) -> Result<(), String> {
    let addr = listener
        .local_addr()
        .map_err(|err| format!("Failed to get listener address: {err}"))?;
    info!(%addr, "Manager listening.");

    axum::serve(listener, router(manager, users))
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested.");
            }
        })
        .await
        .map_err(|err| format!("Server error: {err}"))
}

async fn health() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

async fn deploy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<DeployQuery>,
    body: Bytes,
) -> ApiResult<DeployReceipt> {
    let caller = state.caller(&headers);
    state.manager.authorize(&caller, "deploy")?;
    let source = match query.upload_type {
        UploadType::File => ArtifactSource::File {
            name: query
                .filename
                .filter(|name| !name.trim().is_empty())
                .ok_or(ManagerError::MissingParameter("filename"))?,
            bytes: body.to_vec(),
        },
        UploadType::Folder => {
            tokio::task::spawn_blocking(move || ArtifactSource::from_zip_bundle(&body))
                .await
                .map_err(|err| ManagerError::Internal(format!("Bundle decoding failed: {err}")))??
        }
    };
    let receipt = state
        .manager
        .deploy(
            &caller,
            &query.env,
            &query.model_name,
            &query.model_version,
            source,
        )
        .await?;
    ok(receipt)
}

async fn restart_services(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<RestartRequest>,
) -> ApiResult<RestartReport> {
    let caller = state.caller(&headers);
    ok(state
        .manager
        .restart_all(
            &caller,
            &request.env,
            &request.model_name,
            &request.model_version,
        )
        .await?)
}

async fn check_service_status(
    State(state): State<AppState>,
    Query(query): Query<VersionQuery>,
) -> ApiResult<ServiceStatusReport> {
    ok(state
        .manager
        .check_service_status(&query.env, &query.model_name, &query.model_version)
        .await?)
}

async fn model_versions(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
) -> ApiResult<Vec<VersionSummary>> {
    ok(state
        .manager
        .scan_versions(&query.env, &query.model_name)
        .await?)
}

async fn model_names(
    State(state): State<AppState>,
    Query(query): Query<ModelsQuery>,
) -> ApiResult<ModelPage> {
    ok(state
        .manager
        .list_models(
            &query.env,
            query.page.unwrap_or(1),
            query.per_page.unwrap_or(DEFAULT_PER_PAGE),
        )
        .await?)
}

async fn get_config(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
) -> ApiResult<ModelDescriptor> {
    ok(state
        .manager
        .get_descriptor(&query.env, &query.model_name)
        .await?)
}

async fn update_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UpdateConfigRequest>,
) -> ApiResult<ModelDescriptor> {
    let caller = state.caller(&headers);
    ok(state
        .manager
        .update_descriptor(&caller, &request.env, &request.model_name, request.config)
        .await?)
}

async fn service_instance_status(
    State(state): State<AppState>,
    Query(query): Query<InstanceQuery>,
) -> ApiResult<InstanceReport> {
    ok(state
        .manager
        .service_instance_status(
            &query.env,
            &query.model_name,
            &query.service_name,
            query.instance_index,
        )
        .await?)
}

async fn model_files(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> ApiResult<Vec<FileEntry>> {
    ok(state
        .manager
        .list_version_files(&query.env, &query.model_name, &query.model_version, query.path)
        .await?)
}

async fn model_file_content(
    State(state): State<AppState>,
    Query(query): Query<FilesQuery>,
) -> ApiResult<String> {
    let path = query.path.ok_or(ManagerError::MissingParameter("path"))?;
    ok(state
        .manager
        .read_version_file(&query.env, &query.model_name, &query.model_version, path)
        .await?)
}

async fn service_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<LogTail> {
    ok(state
        .manager
        .tail_service_log(
            &query.env,
            &query.model_name,
            &query.model_version,
            &query.service_name,
            query.port,
            query.lines.unwrap_or(DEFAULT_TAIL_LINES),
            query.launcher,
        )
        .await?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::config::ManagerConfig;
    use optiflux_common::ResponseStatus;
    use tempfile::TempDir;

    struct TestServer {
        base: String,
        client: reqwest::Client,
        _dir: TempDir,
    }

    async fn start() -> TestServer {
        let dir = TempDir::new().unwrap();
        let config = ManagerConfig::rooted_at(dir.path());
        config.ensure_environment_dirs().unwrap();
        let mut users = UserDirectory::default();
        users.insert("alice", "t-alice", Role::Admin);
        users.insert("victor", "t-victor", Role::Viewer);

        let manager = Arc::new(Manager::new(Arc::new(config)));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(manager, Arc::new(users));
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        TestServer {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            _dir: dir,
        }
    }

    impl TestServer {
        async fn deploy(&self, token: Option<&str>, model: &str, version: &str) -> reqwest::Response {
            let mut request = self
                .client
                .post(format!(
                    "{}/deploy?env=dev&model_name={model}&model_version={version}&filename=model.bin",
                    self.base
                ))
                .body(vec![1u8, 2, 3, 4]);
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            request.send().await.unwrap()
        }
    }

    #[tokio::test]
    async fn health_is_ok() {
        let server = start().await;
        let response = server
            .client
            .get(format!("{}/health", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn deploy_requires_operator_role() {
        let server = start().await;
        assert_eq!(
            server.deploy(None, "m1", "1.0.0").await.status(),
            StatusCode::FORBIDDEN
        );
        let denied = server.deploy(Some("t-victor"), "m1", "1.0.0").await;
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        let body: Envelope<serde_json::Value> = denied.json().await.unwrap();
        assert_eq!(body.status, ResponseStatus::Error);
        assert!(body.message.unwrap().contains("victor"));
    }

    #[tokio::test]
    async fn deployed_version_is_listed_with_size() {
        let server = start().await;
        let response = server.deploy(Some("t-alice"), "m1", "1.0.0").await;
        assert_eq!(response.status(), StatusCode::OK);
        let receipt: Envelope<DeployReceipt> = response.json().await.unwrap();
        assert_eq!(receipt.into_result().unwrap().files, 1);

        let versions: Envelope<Vec<VersionSummary>> = server
            .client
            .get(format!("{}/model_versions?env=dev&model_name=m1", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let versions = versions.into_result().unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, "1.0.0");
        assert!(versions[0].size > 0);
        assert!(versions[0].is_serving);

        let config: Envelope<ModelDescriptor> = server
            .client
            .get(format!("{}/get_config?env=dev&model_name=m1", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let config = config.into_result().unwrap();
        assert_eq!(config.services.recommendation[0].port, 8001);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let server = start().await;
        let bad_env = server
            .client
            .get(format!("{}/model_versions?env=staging&model_name=m1", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_env.status(), StatusCode::BAD_REQUEST);

        let missing = server
            .client
            .get(format!("{}/get_config?env=dev&model_name=ghost", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let no_filename = server
            .client
            .post(format!(
                "{}/deploy?env=dev&model_name=m1&model_version=1.0.0",
                server.base
            ))
            .bearer_auth("t-alice")
            .body(vec![1u8])
            .send()
            .await
            .unwrap();
        assert_eq!(no_filename.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn folder_uploads_are_authorized_before_decoding() {
        let server = start().await;
        let upload = |token: Option<&str>| {
            let mut request = server
                .client
                .post(format!(
                    "{}/deploy?env=dev&model_name=m1&model_version=1.0.0&upload_type=folder",
                    server.base
                ))
                .body(b"not a zip".to_vec());
            if let Some(token) = token {
                request = request.bearer_auth(token);
            }
            request.send()
        };

        assert_eq!(upload(None).await.unwrap().status(), StatusCode::FORBIDDEN);
        assert_eq!(
            upload(Some("t-victor")).await.unwrap().status(),
            StatusCode::FORBIDDEN
        );

        let rejected = upload(Some("t-alice")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        let body: Envelope<serde_json::Value> = rejected.json().await.unwrap();
        assert!(body.message.unwrap().contains("bad archive"));
    }

    #[tokio::test]
    async fn unknown_instance_service_is_not_found() {
        let server = start().await;
        server.deploy(Some("t-alice"), "m1", "1.0.0").await;
        let response = server
            .client
            .get(format!(
                "{}/service_instance_status?env=dev&model_name=m1&service_name=cache&instance_index=0",
                server.base
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let out_of_range = server
            .client
            .get(format!(
                "{}/service_instance_status?env=dev&model_name=m1&service_name=recomserver&instance_index=5",
                server.base
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);
    }
}
