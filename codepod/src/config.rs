use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::workspace::eviction::EvictionPolicy;

/// Top-level configuration for the codepod daemon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub resources: ResourceConfig,
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.resources.memory_bytes >= 64 * 1024 * 1024,
            "resources.memory_bytes must be >= 64 MiB"
        );
        anyhow::ensure!(
            self.resources.cpu_shares >= 2,
            "resources.cpu_shares must be >= 2"
        );
        anyhow::ensure!(
            self.resources.max_instances >= 1,
            "resources.max_instances must be >= 1"
        );
        anyhow::ensure!(
            self.resources.warn_threshold > 0.0
                && self.resources.warn_threshold <= self.resources.fail_threshold
                && self.resources.fail_threshold <= 1.0,
            "resources thresholds must satisfy 0 < warn_threshold <= fail_threshold <= 1"
        );
        anyhow::ensure!(
            !self.runtime.shell.is_empty(),
            "runtime.shell must not be empty"
        );
        anyhow::ensure!(
            self.runtime.workdir.starts_with('/'),
            "runtime.workdir must be an absolute path"
        );
        anyhow::ensure!(
            self.pool.reap_interval_secs >= 1,
            "pool.reap_interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.pool.provision_timeout_secs >= 1 && self.pool.exec_timeout_secs >= 1,
            "pool timeouts must be >= 1 second"
        );
        anyhow::ensure!(
            self.health.interval_secs >= 1,
            "health.interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.sync.scan_interval_ms >= 10,
            "sync.scan_interval_ms must be >= 10"
        );
        anyhow::ensure!(
            !self.sync.remote_prefix.is_empty()
                && !self.sync.remote_prefix.starts_with('/')
                && !self.sync.remote_prefix.ends_with('/'),
            "sync.remote_prefix must be non-empty without leading or trailing '/'"
        );
        anyhow::ensure!(
            self.session.output_buffer >= 1,
            "session.output_buffer must be >= 1"
        );
        anyhow::ensure!(
            self.session.default_cols >= 1 && self.session.default_rows >= 1,
            "session default size must be at least 1x1"
        );
        Ok(())
    }
}

/// Which container runtime backs workspace instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeBackend {
    Docker,
    /// Host processes rooted in the cache directory. No isolation.
    Local,
}

impl std::fmt::Display for RuntimeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Docker => write!(f, "docker"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Container runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: RuntimeBackend,
    /// Image every workspace instance is created from.
    pub image: String,
    /// Instance names are `<container_prefix>-<project_id>`.
    pub container_prefix: String,
    /// Working directory inside the instance; the cache directory is mounted here.
    pub workdir: String,
    /// Named volume shared by all instances for dependency caches.
    pub dependency_volume: String,
    pub dependency_mount: String,
    /// Command used for interactive sessions.
    pub shell: Vec<String>,
    /// Runtime-level automatic restart attempts on failure.
    pub restart_max_attempts: u32,
    /// Container ports published on the host.
    pub ports: Vec<u16>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            backend: RuntimeBackend::Docker,
            image: "node:20-bookworm".into(),
            container_prefix: "codepod".into(),
            workdir: "/workspace".into(),
            dependency_volume: "codepod-deps".into(),
            dependency_mount: "/deps".into(),
            shell: vec!["/bin/sh".into()],
            restart_max_attempts: 3,
            ports: Vec::new(),
        }
    }
}

/// Per-instance ceilings and pool capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub memory_bytes: u64,
    pub cpu_shares: u64,
    /// Maximum concurrent workspace instances.
    pub max_instances: usize,
    /// Post-start memory ratio above which provisioning fails.
    pub fail_threshold: f64,
    /// Usage ratio above which the health monitor warns.
    pub warn_threshold: f64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_bytes: 1024 * 1024 * 1024,
            cpu_shares: 1024,
            max_instances: 20,
            fail_threshold: 0.9,
            warn_threshold: 0.8,
        }
    }
}

/// Workspace pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Instances idle longer than this with no sessions are evicted.
    pub idle_timeout_secs: u64,
    pub eviction_policy: EvictionPolicy,
    pub provision_timeout_secs: u64,
    pub exec_timeout_secs: u64,
    /// Deadline for each bootstrap command.
    pub bootstrap_timeout_secs: u64,
    /// Interval of the idle reaper in `codepod serve`.
    pub reap_interval_secs: u64,
    pub bootstrap: BootstrapConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            eviction_policy: EvictionPolicy::Lru,
            provision_timeout_secs: 120,
            exec_timeout_secs: 10,
            bootstrap_timeout_secs: 600,
            reap_interval_secs: 60,
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

/// Commands run once inside a freshly started instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Global tool installs, run unconditionally in order.
    pub global_tools: Vec<String>,
    /// Dependency manifest, relative to the working directory.
    pub dependency_manifest: String,
    /// Run only when `dependency_manifest` exists.
    pub dependency_install: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            global_tools: vec!["npm install -g nodemon".into()],
            dependency_manifest: "package.json".into(),
            dependency_install: "npm install".into(),
        }
    }
}

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    pub sample_timeout_secs: u64,
    pub restart_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            sample_timeout_secs: 10,
            restart_timeout_secs: 60,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn sample_timeout(&self) -> Duration {
        Duration::from_secs(self.sample_timeout_secs)
    }

    pub fn restart_timeout(&self) -> Duration {
        Duration::from_secs(self.restart_timeout_secs)
    }
}

/// File cache synchronizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Per-project cache directories live at `<cache_root>/<project_id>`.
    pub cache_root: PathBuf,
    /// Remote keys are `<remote_prefix>/<project_id>/<relative path>`.
    pub remote_prefix: String,
    /// Checkpoints older than this force a full sync.
    pub staleness_secs: u64,
    /// A path must be unchanged this long before its change is admitted.
    pub quiescence_ms: u64,
    /// Delay after the last admitted change before flushing.
    pub flush_delay_ms: u64,
    pub scan_interval_ms: u64,
    /// Directory names never synchronized, at any depth (installed dependencies).
    pub exclude: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("/var/lib/codepod/cache"),
            remote_prefix: "projects".into(),
            staleness_secs: 24 * 60 * 60,
            quiescence_ms: 2000,
            flush_delay_ms: 5000,
            scan_interval_ms: 500,
            exclude: vec!["node_modules".into()],
        }
    }
}

impl SyncConfig {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectBackend {
    /// A directory tree standing in for a bucket.
    Fs,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// JSON state file, replaced atomically on every mutation.
    File,
    Memory,
}

/// Remote object storage and ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub object_backend: ObjectBackend,
    pub object_root: PathBuf,
    pub ledger_backend: LedgerBackend,
    pub ledger_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            object_backend: ObjectBackend::Fs,
            object_root: PathBuf::from("/var/lib/codepod/objects"),
            ledger_backend: LedgerBackend::File,
            ledger_path: PathBuf::from("/var/lib/codepod/ledger.json"),
        }
    }
}

/// Terminal session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Capacity of each session's output event channel.
    pub output_buffer: usize,
    pub default_cols: u16,
    pub default_rows: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_buffer: 256,
            default_cols: codepod_protocol::DEFAULT_COLS,
            default_rows: codepod_protocol::DEFAULT_ROWS,
        }
    }
}

/// Server / daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Exclusive lock preventing two daemons from sharing a cache root.
    pub lock_file: PathBuf,
    /// Port for the Prometheus `/metrics` endpoint; disabled when unset.
    pub metrics_port: Option<u16>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lock_file: PathBuf::from("/var/lib/codepod/codepod.lock"),
            metrics_port: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_defaults() {
        let config = Config::default();
        assert_eq!(config.runtime.backend, RuntimeBackend::Docker);
        assert_eq!(config.runtime.workdir, "/workspace");
        assert_eq!(config.runtime.restart_max_attempts, 3);
        assert_eq!(config.resources.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.resources.max_instances, 20);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.pool.eviction_policy, EvictionPolicy::Lru);
        assert_eq!(config.health.interval(), Duration::from_secs(30));
        assert_eq!(config.sync.staleness(), Duration::from_secs(86400));
        assert_eq!(config.sync.quiescence(), Duration::from_secs(2));
        assert_eq!(config.sync.flush_delay(), Duration::from_secs(5));
        assert_eq!(config.session.default_cols, 80);
        assert_eq!(config.session.default_rows, 24);
        assert!(config.server.metrics_port.is_none());
    }

    #[test]
    fn config_default_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn config_load_from_toml() {
        let toml_content = r#"
[runtime]
backend = "local"
shell = ["/bin/bash", "-i"]

[resources]
max_instances = 4

[pool]
eviction_policy = "full_sweep"

[pool.bootstrap]
global_tools = []

[sync]
remote_prefix = "tenants/acme"
flush_delay_ms = 250
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_content.as_bytes()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.runtime.backend, RuntimeBackend::Local);
        assert_eq!(config.runtime.shell, vec!["/bin/bash", "-i"]);
        assert_eq!(config.resources.max_instances, 4);
        assert_eq!(config.pool.eviction_policy, EvictionPolicy::FullSweep);
        assert!(config.pool.bootstrap.global_tools.is_empty());
        // Unset fields in a present section keep their defaults
        assert_eq!(config.pool.bootstrap.dependency_manifest, "package.json");
        assert_eq!(config.sync.remote_prefix, "tenants/acme");
        assert_eq!(config.sync.flush_delay(), Duration::from_millis(250));
        assert_eq!(config.sync.quiescence_ms, 2000);
        assert_eq!(config.health.interval_secs, 30);
    }

    #[test]
    fn config_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[resources]\nmax_instances = 0\n").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("max_instances"));
    }

    #[test]
    fn config_validation_rejects_inverted_thresholds() {
        let mut config = Config::default();
        config.resources.warn_threshold = 0.95;
        config.resources.fail_threshold = 0.9;
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_empty_shell() {
        let mut config = Config::default();
        config.runtime.shell.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_bad_remote_prefix() {
        let mut config = Config::default();
        config.sync.remote_prefix = "/projects".into();
        assert!(config.validate().is_err());

        config.sync.remote_prefix = "projects/".into();
        assert!(config.validate().is_err());

        config.sync.remote_prefix = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_validation_rejects_relative_workdir() {
        let mut config = Config::default();
        config.runtime.workdir = "workspace".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.runtime.image, config.runtime.image);
        assert_eq!(back.storage.ledger_backend, LedgerBackend::File);
        assert_eq!(back.resources.max_instances, config.resources.max_instances);
    }
}
