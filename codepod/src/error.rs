use std::future::Future;
use std::time::Duration;

use codepod_protocol::{ErrorKind, ErrorPayload};
use thiserror::Error;

/// Errors surfaced at component boundaries.
///
/// Adapters (runtime, storage, ledger) work in `anyhow::Result`; the pool
/// manager, synchronizer and multiplexer convert into this enum before
/// returning to a caller.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("provisioning workspace for project {project_id} failed: {message}")]
    Provisioning { project_id: String, message: String },

    #[error("project {project_id}: {resource} usage {usage} exceeds limit {limit}")]
    ResourceExceeded {
        project_id: String,
        resource: String,
        usage: u64,
        limit: u64,
    },

    #[error("environment setup for project {project_id} failed at `{command}`: {message}")]
    EnvironmentSetup {
        project_id: String,
        command: String,
        message: String,
    },

    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} already exists")]
    DuplicateSession(String),

    #[error("workspace for project {project_id} is not live: {message}")]
    Liveness { project_id: String, message: String },

    #[error("sync for project {project_id} failed: {message}")]
    Sync { project_id: String, message: String },

    #[error("change watcher for project {project_id} failed: {message}")]
    Watcher { project_id: String, message: String },

    #[error("{operation} timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provisioning { .. } => ErrorKind::Provisioning,
            Self::ResourceExceeded { .. } => ErrorKind::ResourceExceeded,
            Self::EnvironmentSetup { .. } => ErrorKind::EnvironmentSetup,
            Self::SessionNotFound(_) => ErrorKind::SessionNotFound,
            Self::Liveness { .. } => ErrorKind::Liveness,
            Self::Sync { .. } => ErrorKind::Sync,
            Self::Watcher { .. } => ErrorKind::Watcher,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DuplicateSession(_) | Self::InvalidPath { .. } => ErrorKind::InvalidRequest,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Wrap an adapter error raised while provisioning. Errors that already
    /// carry a kind (timeouts, setup and resource failures) keep it.
    pub fn provisioning(project_id: &str, err: anyhow::Error) -> Self {
        match err.downcast::<RuntimeError>() {
            Ok(known) => known,
            Err(other) => Self::Provisioning {
                project_id: project_id.to_string(),
                message: format!("{:#}", other),
            },
        }
    }

    /// Wrap an adapter error raised by the file cache synchronizer.
    pub fn sync(project_id: &str, err: anyhow::Error) -> Self {
        match err.downcast::<RuntimeError>() {
            Ok(known) => known,
            Err(other) => Self::Sync {
                project_id: project_id.to_string(),
                message: format!("{:#}", other),
            },
        }
    }
}

impl From<&RuntimeError> for ErrorPayload {
    fn from(err: &RuntimeError) -> Self {
        err.payload()
    }
}

/// Run `fut` with a deadline, failing with [`RuntimeError::Timeout`].
pub async fn bounded<T, F>(operation: &str, limit: Duration, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RuntimeError::Timeout {
            operation: operation.to_string(),
            limit,
        }
        .into()),
    }
}
