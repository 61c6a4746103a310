//! Per-instance health monitor.
//!
//! One task per running instance samples usage on a fixed interval. A down
//! instance, or a sample that errors or times out, triggers recovery: the
//! instance goes Degraded, gets exactly one restart, and is probed again.
//! If it is still not running it is force-removed.

use std::sync::Weak;
use std::time::Duration;

use codepod_protocol::InstanceState;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::error::bounded;
use crate::governor::UsageLevel;
use crate::metrics::EvictionReason;
use crate::runtime::{ContainerRuntime, InstanceStats, RuntimeHandle};
use crate::workspace::WorkspaceManager;

/// CPU use at or above this counts as activity for the idle rule.
const ACTIVE_CPU_PERCENT: f64 = 1.0;

/// Result of one liveness probe.
#[derive(Debug)]
pub enum Probe {
    Healthy(InstanceStats),
    Down(String),
}

/// Sample the instance once, bounded by `limit`.
pub async fn probe(
    runtime: &dyn ContainerRuntime,
    handle: &RuntimeHandle,
    limit: Duration,
) -> Probe {
    match bounded("sample instance", limit, runtime.inspect(handle)).await {
        Ok(stats) if stats.running => Probe::Healthy(stats),
        Ok(_) => Probe::Down("instance is not running".into()),
        Err(e) => Probe::Down(format!("{:#}", e)),
    }
}

/// What recovery did with a failing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Restarted,
    Removed,
    /// The instance was already replaced or removed by someone else.
    Gone,
}

pub(crate) fn spawn_monitor(
    manager: Weak<WorkspaceManager>,
    project_id: String,
    handle: RuntimeHandle,
    config: HealthConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run_monitor(manager, project_id, handle, config, cancel))
}

async fn run_monitor(
    manager: Weak<WorkspaceManager>,
    project_id: String,
    handle: RuntimeHandle,
    config: HealthConfig,
    cancel: CancellationToken,
) {
    let period = config.interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(project_id = %project_id, instance = %handle.id, "health monitor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };

        let sample = probe(manager.runtime().as_ref(), &handle, config.sample_timeout()).await;
        if cancel.is_cancelled() {
            break;
        }
        match sample {
            Probe::Healthy(stats) => observe(&manager, &project_id, &stats).await,
            Probe::Down(reason) => {
                match recover(&manager, &project_id, &handle, &reason, &config).await {
                    Recovery::Restarted => {}
                    Recovery::Removed | Recovery::Gone => break,
                }
            }
        }
    }
    debug!(project_id = %project_id, instance = %handle.id, "health monitor stopped");
}

/// Advisory usage check on a healthy sample.
async fn observe(manager: &WorkspaceManager, project_id: &str, stats: &InstanceStats) {
    match manager.governor().assess(stats) {
        UsageLevel::Normal => {}
        level => {
            warn!(
                project_id = %project_id,
                memory_bytes = stats.memory_usage,
                memory_limit = manager.governor().ceiling().memory_bytes,
                cpu_percent = stats.cpu_percent,
                level = ?level,
                "instance resource usage high"
            );
            if let Some(metrics) = manager.metrics() {
                metrics.record_resource_warning();
            }
        }
    }
    if stats.cpu_percent >= ACTIVE_CPU_PERCENT {
        manager.touch(project_id).await;
    }
}

/// One restart, one re-probe, then removal if the instance is still down.
pub async fn recover(
    manager: &WorkspaceManager,
    project_id: &str,
    handle: &RuntimeHandle,
    reason: &str,
    config: &HealthConfig,
) -> Recovery {
    let _guard = manager.lock_project(project_id).await;
    let current = manager.handle_of(project_id).await;
    if current.as_ref().map(|h| h.id.as_str()) != Some(handle.id.as_str()) {
        return Recovery::Gone;
    }

    warn!(
        project_id = %project_id,
        instance = %handle.id,
        reason = %reason,
        "liveness check failed, restarting instance"
    );
    manager.set_state(project_id, InstanceState::Degraded).await;
    if let Some(metrics) = manager.metrics() {
        metrics.record_restart();
    }

    let runtime = manager.runtime().as_ref();
    let restarted = bounded(
        "restart instance",
        config.restart_timeout(),
        runtime.restart(handle),
    )
    .await;
    let outcome = match restarted {
        Ok(()) => probe(runtime, handle, config.sample_timeout()).await,
        Err(e) => Probe::Down(format!("restart failed: {:#}", e)),
    };

    match outcome {
        Probe::Healthy(_) => {
            manager.set_state(project_id, InstanceState::Running).await;
            info!(
                project_id = %project_id,
                instance = %handle.id,
                "instance recovered after restart"
            );
            Recovery::Restarted
        }
        Probe::Down(after) => {
            error!(
                project_id = %project_id,
                instance = %handle.id,
                reason = %after,
                "instance still down after restart, removing"
            );
            manager
                .teardown_locked(project_id, EvictionReason::Liveness)
                .await;
            Recovery::Removed
        }
    }
}
