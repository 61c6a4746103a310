//! Caller-facing facade over the pool manager, multiplexer and synchronizer.

use std::sync::Arc;

use anyhow::{Context, Result};
use codepod_protocol::InstanceInfo;
use tracing::info;

use crate::config::{Config, LedgerBackend, ObjectBackend, RuntimeBackend};
use crate::error::RuntimeError;
use crate::ledger::{FileLedger, LedgerStore, MemoryLedger};
use crate::metrics::MetricsRegistry;
use crate::runtime::docker::DockerRuntime;
use crate::runtime::local::LocalRuntime;
use crate::runtime::ContainerRuntime;
use crate::session::{SessionRegistry, TerminalMultiplexer, TerminalStream};
use crate::storage::{FsObjectStore, MemoryObjectStore, ObjectStore};
use crate::sync::{FileCacheSync, FlushReport};
use crate::workspace::WorkspaceManager;

pub struct Codepod {
    manager: Arc<WorkspaceManager>,
    terminals: TerminalMultiplexer,
}

impl Codepod {
    /// Build every backend named in `config`.
    pub async fn from_config(config: Config, metrics: Option<MetricsRegistry>) -> Result<Self> {
        let runtime: Arc<dyn ContainerRuntime> = match config.runtime.backend {
            RuntimeBackend::Docker => Arc::new(
                DockerRuntime::connect()
                    .await
                    .context("connecting to the Docker daemon")?,
            ),
            RuntimeBackend::Local => Arc::new(LocalRuntime::new()),
        };
        let store: Arc<dyn ObjectStore> = match config.storage.object_backend {
            ObjectBackend::Fs => Arc::new(FsObjectStore::new(&config.storage.object_root)),
            ObjectBackend::Memory => Arc::new(MemoryObjectStore::new()),
        };
        let ledger: Arc<dyn LedgerStore> = match config.storage.ledger_backend {
            LedgerBackend::File => Arc::new(
                FileLedger::open(&config.storage.ledger_path)
                    .await
                    .with_context(|| {
                        format!("opening ledger {}", config.storage.ledger_path.display())
                    })?,
            ),
            LedgerBackend::Memory => Arc::new(MemoryLedger::new()),
        };
        info!(
            runtime = runtime.name(),
            objects = ?config.storage.object_backend,
            ledger = ?config.storage.ledger_backend,
            cache_root = %config.sync.cache_root.display(),
            "codepod backends ready"
        );
        Ok(Self::with_backends(config, runtime, store, ledger, metrics))
    }

    pub fn with_backends(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn LedgerStore>,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        let sync = Arc::new(FileCacheSync::new(
            config.sync.clone(),
            store,
            ledger,
            metrics.clone(),
        ));
        let session_config = config.session.clone();
        let runtime_config = config.runtime.clone();
        let manager = WorkspaceManager::new(
            config,
            runtime,
            sync,
            Arc::new(SessionRegistry::new()),
            metrics,
        );
        let terminals =
            TerminalMultiplexer::new(Arc::clone(&manager), session_config, &runtime_config);
        Self { manager, terminals }
    }

    pub fn manager(&self) -> &Arc<WorkspaceManager> {
        &self.manager
    }

    pub async fn acquire_workspace(
        &self,
        project_id: &str,
        owner_user_id: &str,
    ) -> Result<InstanceInfo, RuntimeError> {
        self.manager.acquire(project_id, owner_user_id).await
    }

    /// Open a shell, acquiring the project's instance on behalf of
    /// `owner_user_id` if none is running.
    pub async fn open_terminal(
        &self,
        project_id: &str,
        owner_user_id: &str,
        session_id: &str,
    ) -> Result<TerminalStream, RuntimeError> {
        self.terminals
            .create_session(project_id, owner_user_id, session_id)
            .await
    }

    pub async fn send_input(&self, session_id: &str, data: &[u8]) -> Result<(), RuntimeError> {
        self.terminals.write(session_id, data).await
    }

    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), RuntimeError> {
        self.terminals.resize(session_id, cols, rows).await
    }

    pub async fn close_session(&self, session_id: &str) -> Result<(), RuntimeError> {
        self.terminals.terminate(session_id).await
    }

    pub async fn release_workspace(&self, project_id: &str) -> bool {
        self.manager.evict(project_id, true).await
    }

    /// Push a project's pending edits now instead of waiting for the debounce.
    pub async fn flush(&self, project_id: &str) -> Result<FlushReport, RuntimeError> {
        self.manager.sync().flush_now(project_id).await
    }

    pub async fn evict_idle(&self) -> usize {
        self.manager.evict_idle().await
    }

    pub async fn shutdown(&self) -> usize {
        self.manager.shutdown_all().await
    }
}
