//! Scriptable in-memory runtime for pool manager and health monitor tests.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{ContainerRuntime, ExecChannel, ExecRequest, InstanceSpec, InstanceStats, RuntimeHandle};
use crate::config::Config;

#[derive(Debug, Default)]
pub struct FakeRuntime {
    pub creates: AtomicUsize,
    pub restarts: AtomicUsize,
    pub removes: AtomicUsize,
    /// Reported by `inspect`.
    pub running: AtomicBool,
    pub memory_usage: AtomicU64,
    /// Whether `restart` brings the instance back.
    pub restart_heals: AtomicBool,
    pub fail_inspect: AtomicBool,
    pub create_delay_ms: AtomicU64,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            restart_heals: AtomicBool::new(true),
            create_delay_ms: AtomicU64::new(50),
            ..Default::default()
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<RuntimeHandle> {
        let delay = self.create_delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RuntimeHandle {
            id: format!("fake-{}", n),
            name: spec.name.clone(),
        })
    }

    async fn start(&self, _handle: &RuntimeHandle) -> Result<()> {
        Ok(())
    }

    async fn exec(&self, _handle: &RuntimeHandle, _request: ExecRequest) -> Result<ExecChannel> {
        bail!("fake runtime does not exec")
    }

    async fn inspect(&self, _handle: &RuntimeHandle) -> Result<InstanceStats> {
        if self.fail_inspect.load(Ordering::SeqCst) {
            bail!("daemon unreachable");
        }
        Ok(InstanceStats {
            running: self.running.load(Ordering::SeqCst),
            memory_usage: self.memory_usage.load(Ordering::SeqCst),
            cpu_percent: 0.0,
        })
    }

    async fn restart(&self, _handle: &RuntimeHandle) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        if self.restart_heals.load(Ordering::SeqCst) {
            self.running.store(true, Ordering::SeqCst);
            self.fail_inspect.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn remove(&self, _handle: &RuntimeHandle, _force: bool) -> Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config rooted in `dir` with no bootstrap commands and fast sync timers.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.sync.cache_root = dir.join("cache");
    config.sync.quiescence_ms = 50;
    config.sync.flush_delay_ms = 100;
    config.sync.scan_interval_ms = 25;
    config.pool.bootstrap.global_tools.clear();
    config.pool.provision_timeout_secs = 5;
    config.pool.exec_timeout_secs = 5;
    config.health.interval_secs = 3600;
    config.health.sample_timeout_secs = 1;
    config.health.restart_timeout_secs = 1;
    config
}
