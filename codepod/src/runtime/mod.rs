//! Container runtime seam.
//!
//! The pool manager owns every [`RuntimeHandle`]; sessions own the
//! [`ExecChannel`]s they open. Implementations: [`docker::DockerRuntime`]
//! (bollard) and [`local::LocalRuntime`] (plain host processes, for
//! development and tests).

pub mod docker;
#[cfg(test)]
pub(crate) mod fake;
pub mod local;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use codepod_protocol::{PortBinding, ResourceCeiling};
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::io::AsyncWrite;

use crate::error::bounded;

/// Opaque reference to a created instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    HostPath(PathBuf),
    /// Named volume managed by the runtime.
    Volume(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: MountSource,
    pub target: String,
}

/// Everything the runtime needs to create one workspace instance.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: String,
    /// Working directory inside the instance.
    pub working_dir: String,
    pub mounts: Vec<Mount>,
    pub ceiling: ResourceCeiling,
    /// Automatic restarts the runtime itself may perform on failure.
    pub restart_max_attempts: u32,
    pub ports: Vec<PortBinding>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
}

impl InstanceSpec {
    /// Host directory mounted at the working directory, if any.
    pub fn working_dir_source(&self) -> Option<&PathBuf> {
        self.mounts.iter().find_map(|m| match &m.source {
            MountSource::HostPath(path) if m.target == self.working_dir => Some(path),
            _ => None,
        })
    }
}

/// Live usage sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InstanceStats {
    pub running: bool,
    pub memory_usage: u64,
    /// Percent of one core.
    pub cpu_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub tty: bool,
    pub size: Option<TerminalSize>,
    pub working_dir: Option<String>,
    pub env: Vec<String>,
}

impl ExecRequest {
    /// Non-interactive `sh -c <script>`.
    pub fn shell(script: &str) -> Self {
        Self {
            command: vec!["sh".into(), "-c".into(), script.into()],
            ..Default::default()
        }
    }
}

/// Out-of-band control of a running exec.
#[async_trait]
pub trait ExecControl: Send + Sync {
    async fn resize(&self, size: TerminalSize) -> Result<()>;

    /// Exit code of the finished process; `None` if the runtime cannot tell.
    async fn exit_code(&self) -> Result<Option<i64>>;

    /// Best-effort termination of the process.
    async fn kill(&self) -> Result<()>;
}

/// A duplex exec stream plus its control handle.
pub struct ExecChannel {
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: BoxStream<'static, io::Result<Bytes>>,
    pub control: Arc<dyn ExecControl>,
}

impl std::fmt::Debug for ExecChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecChannel").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<RuntimeHandle>;

    async fn start(&self, handle: &RuntimeHandle) -> Result<()>;

    async fn exec(&self, handle: &RuntimeHandle, request: ExecRequest) -> Result<ExecChannel>;

    async fn inspect(&self, handle: &RuntimeHandle) -> Result<InstanceStats>;

    async fn restart(&self, handle: &RuntimeHandle) -> Result<()>;

    async fn remove(&self, handle: &RuntimeHandle, force: bool) -> Result<()>;
}

/// Collected result of a non-interactive exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: Option<i64>,
    pub output: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last `max_bytes` of output as lossy UTF-8.
    pub fn tail(&self, max_bytes: usize) -> String {
        let start = self.output.len().saturating_sub(max_bytes);
        String::from_utf8_lossy(&self.output[start..]).trim().to_string()
    }
}

/// Output kept by [`run_to_completion`]; older bytes are discarded.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Run a command to completion, capturing the tail of its merged output.
pub async fn run_to_completion(
    runtime: &dyn ContainerRuntime,
    handle: &RuntimeHandle,
    request: ExecRequest,
    limit: Duration,
) -> Result<ExecOutput> {
    let operation = format!("exec `{}`", request.command.join(" "));
    bounded(&operation, limit, async {
        let ExecChannel {
            input,
            mut output,
            control,
        } = runtime.exec(handle, request).await?;
        // No stdin for batch commands.
        drop(input);

        let mut captured = Vec::new();
        while let Some(chunk) = output.next().await {
            captured.extend_from_slice(&chunk?);
            if captured.len() > MAX_CAPTURED_OUTPUT {
                let excess = captured.len() - MAX_CAPTURED_OUTPUT;
                captured.drain(..excess);
            }
        }
        let exit_code = control.exit_code().await?;
        Ok(ExecOutput {
            exit_code,
            output: captured,
        })
    })
    .await
}
