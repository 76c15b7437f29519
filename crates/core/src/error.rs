//! Error type shared by every manager operation.

use axum::http::StatusCode;
use optiflux_common::ServiceKind;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors surfaced by the manager.
///
/// A corrupt descriptor and a port held by a stale process are recovered
/// internally and only logged, so neither has a variant here.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The environment name is not dev, preprod or prod.
    #[error("unknown environment '{0}' (expected dev, preprod or prod)")]
    InvalidEnvironment(String),

    /// A required parameter is absent or blank.
    #[error("missing required parameter '{0}'")]
    MissingParameter(&'static str),

    /// A parameter is present but unusable.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// The named model, version, service or file does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The caller may not perform a state-changing operation.
    #[error("{actor} is not allowed to {action}")]
    PermissionDenied {
        /// Caller name.
        actor: String,
        /// Refused operation.
        action: &'static str,
    },

    /// An uploaded artifact cannot be stored as sent.
    #[error("artifact error at {}: {reason}", path.display())]
    Artifact {
        /// Upload or target path.
        path: PathBuf,
        /// What is wrong with the artifact.
        reason: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A descriptor could not be read, written or locked.
    #[error("descriptor {}: {reason}", path.display())]
    Descriptor {
        /// Descriptor path.
        path: PathBuf,
        /// Failure detail.
        reason: String,
    },

    /// An instance failed to launch or never became live.
    #[error("failed to launch {kind} on port {port}: {output}")]
    LaunchFailure {
        /// Service kind.
        kind: ServiceKind,
        /// Instance port.
        port: u16,
        /// Launcher output or liveness detail.
        output: String,
    },

    /// A relative path escapes its base directory.
    #[error("invalid path '{0}'")]
    InvalidPath(String),

    /// The configuration cannot be loaded.
    #[error("configuration error: {0}")]
    Config(String),

    /// An unexpected failure inside the manager.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias of manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

impl ManagerError {
    /// An [`ManagerError::Io`] at `path`.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// An [`ManagerError::Artifact`] at `path`.
    pub fn artifact(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Artifact {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// A [`ManagerError::Descriptor`] for `path`.
    pub fn descriptor(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::Descriptor {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// An [`ManagerError::InvalidParameter`].
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// HTTP status reported for this error.
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidEnvironment(_)
            | Self::MissingParameter(_)
            | Self::InvalidParameter { .. }
            | Self::InvalidPath(_)
            | Self::Artifact { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PermissionDenied { .. } => StatusCode::FORBIDDEN,
            Self::Io { .. }
            | Self::Descriptor { .. }
            | Self::LaunchFailure { .. }
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
