//! HTTP client for the deployment manager API.

use optiflux_common::{
    DeployReceipt, Envelope, ModelPage, RestartReport, RestartRequest, ServiceStatusReport,
    UploadType, VersionSummary,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Restarts pace instance launches on the server side and can take minutes.
const RESTART_TIMEOUT_SECS: u64 = 900;
const UPLOAD_TIMEOUT_SECS: u64 = 1800;

/// Artifact payload of a deploy request.
#[derive(Debug, Clone)]
pub enum Upload {
    File { name: String, bytes: Vec<u8> },
    /// A zipped directory whose entries share one top-level folder.
    Folder { bytes: Vec<u8> },
}

impl Upload {
    fn len(&self) -> usize {
        match self {
            Self::File { bytes, .. } | Self::Folder { bytes } => bytes.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

fn build_client() -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .no_gzip()
        .no_brotli()
        .no_deflate()
        .build()
        .map_err(|err| {
            warn!(error = %err, "Failed to build manager HTTP client.");
            format!("Failed to build HTTP client: {err}")
        })
}

fn build_url(base: &str, path: &str) -> String {
    format!("{}{path}", base.trim_end_matches('/'))
}

impl ManagerClient {
    pub fn new(base: &str, token: Option<String>) -> Result<Self, String> {
        Ok(Self {
            http: build_client()?,
            base: base.to_string(),
            token: token.filter(|token| !token.trim().is_empty()),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, String> {
        self.authorized(request).send().await.map_err(|err| {
            debug!(error = %err, what, "Manager request failed.");
            format!("{what} request failed: {err}")
        })
    }

    pub async fn health(&self) -> Result<bool, String> {
        let url = build_url(&self.base, "/health");
        debug!(%url, "Sending manager health request.");
        let response = self
            .send(
                self.http
                    .get(&url)
                    .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
                "Health",
            )
            .await?;
        Ok(response.status() == StatusCode::OK)
    }

    pub async fn deploy(
        &self,
        env: &str,
        model: &str,
        version: &str,
        upload: Upload,
    ) -> Result<DeployReceipt, String> {
        let url = build_url(&self.base, "/deploy");
        debug!(%url, env, model, version, bytes = upload.len(), "Uploading artifact.");
        let (upload_type, filename, bytes) = match upload {
            Upload::File { name, bytes } => (UploadType::File, Some(name), bytes),
            Upload::Folder { bytes } => (UploadType::Folder, None, bytes),
        };
        let mut query = vec![
            ("env", env.to_string()),
            ("model_name", model.to_string()),
            ("model_version", version.to_string()),
            ("upload_type", upload_type.as_str().to_string()),
        ];
        if let Some(filename) = filename {
            query.push(("filename", filename));
        }
        let request = self
            .http
            .post(&url)
            .query(&query)
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .body(bytes);
        decode(self.send(request, "Deploy").await?, "Deploy").await
    }

    pub async fn restart(&self, request: &RestartRequest) -> Result<RestartReport, String> {
        let url = build_url(&self.base, "/restart_services");
        debug!(%url, model = %request.model_name, version = %request.model_version, "Requesting restart.");
        let builder = self
            .http
            .post(&url)
            .json(request)
            .timeout(Duration::from_secs(RESTART_TIMEOUT_SECS));
        decode(self.send(builder, "Restart").await?, "Restart").await
    }

    pub async fn service_status(
        &self,
        env: &str,
        model: &str,
        version: &str,
    ) -> Result<ServiceStatusReport, String> {
        let url = build_url(&self.base, "/check_service_status");
        let request = self
            .http
            .get(&url)
            .query(&[("env", env), ("model_name", model), ("model_version", version)])
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        decode(self.send(request, "Status").await?, "Status").await
    }

    pub async fn versions(&self, env: &str, model: &str) -> Result<Vec<VersionSummary>, String> {
        let url = build_url(&self.base, "/model_versions");
        let request = self
            .http
            .get(&url)
            .query(&[("env", env), ("model_name", model)])
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        decode(self.send(request, "Versions").await?, "Versions").await
    }

    pub async fn models(&self, env: &str, page: usize, per_page: usize) -> Result<ModelPage, String> {
        let url = build_url(&self.base, "/model_names");
        let request = self
            .http
            .get(&url)
            .query(&[
                ("env", env.to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ])
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        decode(self.send(request, "Models").await?, "Models").await
    }
}

/// Unwraps the response envelope. Error envelopes carry the server's message.
async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, String> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| format!("{what} response could not be read: {err}"))?;
    debug!(%status, what, "Received manager response.");

    match serde_json::from_str::<Envelope<T>>(&body) {
        Ok(envelope) => envelope
            .into_result()
            .map_err(|message| format!("{what} failed ({status}): {message}")),
        Err(err) if status.is_success() => {
            Err(format!("{what} response could not be decoded: {err}"))
        }
        Err(_) => Err(format!("{what} failed with status {status}: {body}")),
    }
}
