pub mod bootstrap;
pub mod eviction;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use chrono::Utc;
use codepod_protocol::{InstanceInfo, InstanceState, PortBinding};
use tokio::sync::{OwnedMutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::error::{bounded, RuntimeError};
use crate::governor::{CapacitySlot, ResourceGovernor};
use crate::health;
use crate::metrics::{AcquireResult, EvictionReason, MetricsRegistry};
use crate::runtime::{
    ContainerRuntime, ExecChannel, ExecRequest, InstanceSpec, Mount, MountSource, RuntimeHandle,
};
use crate::session::SessionRegistry;
use crate::sync::{validate_project_id, FileCacheSync};
use eviction::{overflow_victims, Candidate, EvictionPolicy};

/// A registered, started instance.
struct LiveInstance {
    info: InstanceInfo,
    handle: RuntimeHandle,
    /// Cancels the instance's health monitor.
    monitor: CancellationToken,
    /// Held for the instance's lifetime; released when the entry is dropped.
    _slot: CapacitySlot,
}

/// Owns every workspace instance: creation, reuse, eviction and teardown.
///
/// # Locking discipline
///
/// Two registry locks (`instances`, `creating`) and one single-flight lock
/// per project. The project lock serializes lifecycle changes for one
/// project (create, evict, health recovery) and may be held across runtime
/// I/O. The registry locks are never held across I/O and no method holds
/// both at once. Overflow eviction only `try_lock`s other projects, so two
/// projects evicting each other cannot deadlock.
pub struct WorkspaceManager {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    governor: ResourceGovernor,
    sync: Arc<FileCacheSync>,
    sessions: Arc<SessionRegistry>,
    metrics: Option<MetricsRegistry>,
    instances: RwLock<HashMap<String, LiveInstance>>,
    /// Instances being provisioned, for `get`/`list` only.
    creating: RwLock<HashMap<String, InstanceInfo>>,
    project_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    self_ref: Weak<WorkspaceManager>,
}

impl WorkspaceManager {
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        sync: Arc<FileCacheSync>,
        sessions: Arc<SessionRegistry>,
        metrics: Option<MetricsRegistry>,
    ) -> Arc<Self> {
        let governor = ResourceGovernor::new(&config.resources);
        Arc::new_cyclic(|self_ref| Self {
            config,
            runtime,
            governor,
            sync,
            sessions,
            metrics,
            instances: RwLock::new(HashMap::new()),
            creating: RwLock::new(HashMap::new()),
            project_locks: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sync(&self) -> &Arc<FileCacheSync> {
        &self.sync
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub(crate) fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    pub(crate) fn metrics(&self) -> Option<&MetricsRegistry> {
        self.metrics.as_ref()
    }

    /// Maximum concurrent instances.
    pub fn capacity(&self) -> usize {
        self.governor.capacity()
    }

    /// Capacity slots in use, including instances still provisioning.
    pub fn active_count(&self) -> usize {
        self.governor.active()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    fn project_lock(&self, project_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.project_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(project_id.to_string()).or_default())
    }

    /// Serialize lifecycle changes for one project.
    pub(crate) async fn lock_project(&self, project_id: &str) -> OwnedMutexGuard<()> {
        self.project_lock(project_id).lock_owned().await
    }

    fn try_lock_project(&self, project_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.project_lock(project_id).try_lock_owned().ok()
    }

    /// Return the project's running instance, creating one if needed.
    /// Concurrent calls for one project create at most one instance.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        project_id: &str,
        owner_user_id: &str,
    ) -> Result<InstanceInfo, RuntimeError> {
        validate_project_id(project_id)?;
        if let Some(info) = self.running_info(project_id).await {
            self.record_acquire(AcquireResult::Reused);
            return Ok(info);
        }

        let _guard = self.lock_project(project_id).await;
        if let Some(info) = self.running_info(project_id).await {
            self.record_acquire(AcquireResult::Reused);
            return Ok(info);
        }
        if self.instances.read().await.contains_key(project_id) {
            // Left behind by an interrupted recovery.
            self.teardown_locked(project_id, EvictionReason::Liveness).await;
        }

        let started = Instant::now();
        match self.provision(project_id, owner_user_id).await {
            Ok(info) => {
                self.record_acquire(AcquireResult::Created);
                if let Some(metrics) = &self.metrics {
                    metrics.record_provision(started.elapsed());
                }
                info!(
                    project_id = %project_id,
                    owner = %owner_user_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    active = self.governor.active(),
                    "workspace instance running"
                );
                Ok(info)
            }
            Err(e) => {
                self.record_acquire(AcquireResult::Failed);
                warn!(project_id = %project_id, kind = ?e.kind(), error = %e, "provisioning failed");
                Err(e)
            }
        }
    }

    fn record_acquire(&self, result: AcquireResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_acquire(result);
        }
    }

    async fn running_info(&self, project_id: &str) -> Option<InstanceInfo> {
        let instances = self.instances.read().await;
        instances
            .get(project_id)
            .filter(|live| live.info.state == InstanceState::Running)
            .map(|live| live.info.clone())
    }

    /// Caller holds the project lock.
    async fn provision(
        &self,
        project_id: &str,
        owner_user_id: &str,
    ) -> Result<InstanceInfo, RuntimeError> {
        let slot = self.reserve_slot(project_id).await?;

        let now = Utc::now();
        let mut info = InstanceInfo {
            project_id: project_id.to_string(),
            owner_user_id: owner_user_id.to_string(),
            state: InstanceState::Creating,
            created_at: now,
            last_activity_at: now,
            ceiling: self.governor.ceiling(),
            port_bindings: self.port_bindings(),
            working_dir: self.config.runtime.workdir.clone(),
        };
        self.creating
            .write()
            .await
            .insert(project_id.to_string(), info.clone());
        let result = self.create_and_prepare(project_id, owner_user_id).await;
        self.creating.write().await.remove(project_id);
        let handle = result?;

        let monitor = CancellationToken::new();
        info.state = InstanceState::Running;
        info.last_activity_at = Utc::now();
        self.instances.write().await.insert(
            project_id.to_string(),
            LiveInstance {
                info: info.clone(),
                handle: handle.clone(),
                monitor: monitor.clone(),
                _slot: slot,
            },
        );
        health::spawn_monitor(
            self.self_ref.clone(),
            project_id.to_string(),
            handle,
            self.config.health.clone(),
            monitor,
        );
        Ok(info)
    }

    async fn create_and_prepare(
        &self,
        project_id: &str,
        owner_user_id: &str,
    ) -> Result<RuntimeHandle, RuntimeError> {
        let root = self.sync.initialize(project_id).await?;
        let spec = self.instance_spec(project_id, owner_user_id, &root);

        let created = bounded(
            "create instance",
            self.config.pool.provision_timeout(),
            self.runtime.create_instance(&spec),
        )
        .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                self.discard(project_id, None).await;
                return Err(RuntimeError::provisioning(project_id, e));
            }
        };
        debug!(project_id = %project_id, instance = %handle.id, "instance created");

        if let Err(e) = self.prepare(project_id, &handle, &root).await {
            self.discard(project_id, Some(&handle)).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Start, gate on resource usage, then bootstrap.
    async fn prepare(
        &self,
        project_id: &str,
        handle: &RuntimeHandle,
        root: &Path,
    ) -> Result<(), RuntimeError> {
        let timeout = self.config.pool.provision_timeout();
        bounded("start instance", timeout, self.runtime.start(handle))
            .await
            .map_err(|e| RuntimeError::provisioning(project_id, e))?;

        let stats = bounded("inspect instance", timeout, self.runtime.inspect(handle))
            .await
            .map_err(|e| RuntimeError::provisioning(project_id, e))?;
        if !stats.running {
            return Err(RuntimeError::Provisioning {
                project_id: project_id.to_string(),
                message: "instance exited right after start".into(),
            });
        }
        self.governor.check_resources(project_id, &stats)?;

        let steps = bootstrap::plan(&self.config.pool.bootstrap, root);
        bootstrap::run(
            self.runtime.as_ref(),
            handle,
            project_id,
            &self.config.runtime.workdir,
            &steps,
            self.config.pool.bootstrap_timeout(),
        )
        .await
    }

    /// Undo a partial provisioning. Failures are logged; the caller already
    /// has the error that matters.
    async fn discard(&self, project_id: &str, handle: Option<&RuntimeHandle>) {
        if let Err(e) = self.sync.stop(project_id).await {
            warn!(project_id = %project_id, error = %e, "final flush after failed provisioning");
        }
        if let Some(handle) = handle {
            self.remove_instance(project_id, handle).await;
        }
    }

    async fn remove_instance(&self, project_id: &str, handle: &RuntimeHandle) {
        let removed = bounded(
            "remove instance",
            self.config.pool.provision_timeout(),
            self.runtime.remove(handle, true),
        )
        .await;
        if let Err(e) = removed {
            warn!(
                project_id = %project_id,
                instance = %handle.id,
                error = %format!("{:#}", e),
                "failed to remove instance"
            );
        }
    }

    fn instance_spec(&self, project_id: &str, owner_user_id: &str, root: &Path) -> InstanceSpec {
        let rt = &self.config.runtime;
        InstanceSpec {
            name: format!("{}-{}", rt.container_prefix, project_id),
            image: rt.image.clone(),
            working_dir: rt.workdir.clone(),
            mounts: vec![
                Mount {
                    source: MountSource::HostPath(root.to_path_buf()),
                    target: rt.workdir.clone(),
                },
                Mount {
                    source: MountSource::Volume(rt.dependency_volume.clone()),
                    target: rt.dependency_mount.clone(),
                },
            ],
            ceiling: self.governor.ceiling(),
            restart_max_attempts: rt.restart_max_attempts,
            ports: self.port_bindings(),
            labels: HashMap::from([
                ("codepod.project".to_string(), project_id.to_string()),
                ("codepod.owner".to_string(), owner_user_id.to_string()),
            ]),
            env: vec![format!("npm_config_cache={}/npm", rt.dependency_mount)],
        }
    }

    fn port_bindings(&self) -> Vec<PortBinding> {
        self.config
            .runtime
            .ports
            .iter()
            .map(|&container_port| PortBinding {
                container_port,
                host_port: None,
            })
            .collect()
    }

    /// Take a capacity slot, evicting per the configured policy when full.
    async fn reserve_slot(&self, project_id: &str) -> Result<CapacitySlot, RuntimeError> {
        if let Some(slot) = self.governor.try_reserve() {
            return Ok(slot);
        }

        let policy = self.config.pool.eviction_policy;
        let candidates: Vec<Candidate> = {
            let instances = self.instances.read().await;
            instances
                .values()
                .map(|live| Candidate {
                    project_id: live.info.project_id.clone(),
                    last_activity_at: live.info.last_activity_at,
                    sessions: 0,
                })
                .collect()
        };
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .map(|mut c| {
                c.sessions = self.sessions.count_for_project(&c.project_id);
                c
            })
            .collect();

        info!(
            project_id = %project_id,
            policy = %policy,
            capacity = self.governor.capacity(),
            "pool at capacity, evicting"
        );
        for victim in overflow_victims(policy, candidates) {
            if victim == project_id {
                continue;
            }
            // Busy projects are skipped rather than waited on.
            let Some(_guard) = self.try_lock_project(&victim) else {
                debug!(victim = %victim, "skipping busy project during overflow eviction");
                continue;
            };
            self.teardown_locked(&victim, EvictionReason::Capacity).await;
            if policy == EvictionPolicy::Lru {
                if let Some(slot) = self.governor.try_reserve() {
                    return Ok(slot);
                }
            }
        }

        self.governor
            .try_reserve()
            .ok_or_else(|| RuntimeError::Provisioning {
                project_id: project_id.to_string(),
                message: format!(
                    "pool at capacity ({} instances) and nothing could be evicted",
                    self.governor.capacity()
                ),
            })
    }

    /// Remove the project's instance if `force`, or if it is idle with no
    /// sessions. Returns whether an instance was removed.
    #[instrument(skip(self))]
    pub async fn evict(&self, project_id: &str, force: bool) -> bool {
        let _guard = self.lock_project(project_id).await;
        if !force && !self.is_idle(project_id).await {
            return false;
        }
        let reason = if force {
            EvictionReason::Forced
        } else {
            EvictionReason::Idle
        };
        self.teardown_locked(project_id, reason).await
    }

    async fn is_idle(&self, project_id: &str) -> bool {
        let last_activity = {
            let instances = self.instances.read().await;
            match instances.get(project_id) {
                Some(live) => live.info.last_activity_at,
                None => return false,
            }
        };
        eviction::is_idle(
            last_activity,
            self.sessions.count_for_project(project_id),
            self.config.pool.idle_timeout(),
            Utc::now(),
        )
    }

    /// Apply the idle rule to every instance. Returns how many were removed.
    pub async fn evict_idle(&self) -> usize {
        let projects: Vec<String> = self.instances.read().await.keys().cloned().collect();
        let mut removed = 0;
        for project_id in projects {
            if self.is_idle(&project_id).await && self.evict(&project_id, false).await {
                removed += 1;
            }
        }
        self.prune_project_locks().await;
        removed
    }

    async fn prune_project_locks(&self) {
        let live: Vec<String> = self.instances.read().await.keys().cloned().collect();
        let mut locks = match self.project_locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|project_id, lock| {
            live.contains(project_id) || Arc::strong_count(lock) > 1
        });
    }

    /// Tear down the project's instance. Caller holds the project lock.
    ///
    /// Order: health monitor, change watcher (with a final flush), sessions,
    /// the runtime instance, and last the capacity slot.
    pub(crate) async fn teardown_locked(&self, project_id: &str, reason: EvictionReason) -> bool {
        let (handle, monitor) = {
            let mut instances = self.instances.write().await;
            let Some(live) = instances.get_mut(project_id) else {
                return false;
            };
            live.info.state = InstanceState::Stopping;
            (live.handle.clone(), live.monitor.clone())
        };

        monitor.cancel();
        match self.sync.stop(project_id).await {
            Ok(Some(report)) if !report.is_empty() => {
                debug!(project_id = %project_id, uploaded = report.uploaded, "final flush at teardown")
            }
            Ok(_) => {}
            Err(e) => warn!(project_id = %project_id, error = %e, "final flush failed at teardown"),
        }
        let sessions = self.sessions.close_project(project_id).await;
        self.remove_instance(project_id, &handle).await;

        // Dropping the entry releases its capacity slot.
        let removed = self.instances.write().await.remove(project_id);
        drop(removed);

        if let Some(metrics) = &self.metrics {
            metrics.record_eviction(reason);
        }
        info!(
            project_id = %project_id,
            instance = %handle.id,
            reason = ?reason,
            sessions_closed = sessions,
            state = %InstanceState::Terminated,
            "workspace instance removed"
        );
        true
    }

    /// Handle of the registered instance, whatever its state.
    pub(crate) async fn handle_of(&self, project_id: &str) -> Option<RuntimeHandle> {
        self.instances
            .read()
            .await
            .get(project_id)
            .map(|live| live.handle.clone())
    }

    pub(crate) async fn set_state(&self, project_id: &str, state: InstanceState) {
        if let Some(live) = self.instances.write().await.get_mut(project_id) {
            live.info.state = state;
        }
    }

    /// Record activity on the project's instance.
    pub async fn touch(&self, project_id: &str) -> bool {
        match self.instances.write().await.get_mut(project_id) {
            Some(live) => {
                live.info.last_activity_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, project_id: &str) -> bool {
        self.running_info(project_id).await.is_some()
    }

    /// Open an exec channel in the project's running instance.
    pub async fn open_exec(
        &self,
        project_id: &str,
        request: ExecRequest,
    ) -> Result<ExecChannel, RuntimeError> {
        let handle = {
            let instances = self.instances.read().await;
            match instances.get(project_id) {
                Some(live) if live.info.state == InstanceState::Running => live.handle.clone(),
                _ => {
                    return Err(RuntimeError::Liveness {
                        project_id: project_id.to_string(),
                        message: "no running instance".into(),
                    })
                }
            }
        };
        bounded(
            "open exec channel",
            self.config.pool.exec_timeout(),
            self.runtime.exec(&handle, request),
        )
        .await
        .map_err(|e| match e.downcast::<RuntimeError>() {
            Ok(known) => known,
            Err(other) => RuntimeError::Liveness {
                project_id: project_id.to_string(),
                message: format!("{:#}", other),
            },
        })
    }

    pub async fn get(&self, project_id: &str) -> Option<InstanceInfo> {
        let live = self
            .instances
            .read()
            .await
            .get(project_id)
            .map(|live| live.info.clone());
        match live {
            Some(info) => Some(info),
            None => self.creating.read().await.get(project_id).cloned(),
        }
    }

    /// Snapshot of every instance, provisioning ones included.
    pub async fn list(&self) -> Vec<InstanceInfo> {
        let mut all: Vec<InstanceInfo> = self
            .instances
            .read()
            .await
            .values()
            .map(|live| live.info.clone())
            .collect();
        let creating: Vec<InstanceInfo> = self.creating.read().await.values().cloned().collect();
        all.extend(creating);
        all.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        all
    }

    /// Force-remove every instance. Used at daemon shutdown.
    pub async fn shutdown_all(&self) -> usize {
        let projects: Vec<String> = self.instances.read().await.keys().cloned().collect();
        let mut removed = 0;
        for project_id in &projects {
            if self.evict(project_id, true).await {
                removed += 1;
            }
        }
        info!(removed, "all workspace instances shut down");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::runtime::fake::{test_config, FakeRuntime};
    use crate::runtime::local::LocalRuntime;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use codepod_protocol::ErrorKind;
    use std::sync::atomic::Ordering;

    struct Harness {
        _dir: tempfile::TempDir,
        runtime: Arc<FakeRuntime>,
        store: Arc<MemoryObjectStore>,
        manager: Arc<WorkspaceManager>,
    }

    fn harness_with(edit: impl FnOnce(&mut Config)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        edit(&mut config);
        let runtime = Arc::new(FakeRuntime::new());
        let store = Arc::new(MemoryObjectStore::new());
        let sync = Arc::new(FileCacheSync::new(
            config.sync.clone(),
            store.clone(),
            Arc::new(MemoryLedger::new()),
            None,
        ));
        let manager = WorkspaceManager::new(
            config,
            runtime.clone(),
            sync,
            Arc::new(SessionRegistry::new()),
            Some(MetricsRegistry::new()),
        );
        Harness {
            _dir: dir,
            runtime,
            store,
            manager,
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    #[tokio::test]
    async fn test_concurrent_acquire_creates_one_instance() {
        let h = harness();
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let manager = Arc::clone(&h.manager);
                tokio::spawn(async move { manager.acquire("p1", &format!("user-{i}")).await })
            })
            .collect();
        let mut created_at = Vec::new();
        for task in tasks {
            let info = task.await.unwrap().unwrap();
            assert_eq!(info.state, InstanceState::Running);
            created_at.push(info.created_at);
        }
        created_at.dedup();
        assert_eq!(created_at.len(), 1);
        assert_eq!(h.runtime.creates(), 1);
        assert_eq!(h.manager.active_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_reuses_running_instance() {
        let h = harness();
        let first = h.manager.acquire("p1", "u1").await.unwrap();
        let second = h.manager.acquire("p1", "u2").await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        // Owner is whoever created it.
        assert_eq!(second.owner_user_id, "u1");
        assert_eq!(h.runtime.creates(), 1);
    }

    #[tokio::test]
    async fn test_lru_overflow_evicts_least_recent() {
        let h = harness_with(|c| c.resources.max_instances = 2);
        h.manager.acquire("p1", "u").await.unwrap();
        h.manager.acquire("p2", "u").await.unwrap();
        h.manager.touch("p1").await;

        h.manager.acquire("p3", "u").await.unwrap();
        let live: Vec<_> = h
            .manager
            .list()
            .await
            .into_iter()
            .map(|i| i.project_id)
            .collect();
        assert_eq!(live, vec!["p1", "p3"]);
        assert_eq!(h.runtime.removes(), 1);
        assert!(h.manager.active_count() <= 2);
    }

    #[tokio::test]
    async fn test_full_sweep_overflow_removes_everything() {
        let h = harness_with(|c| {
            c.resources.max_instances = 2;
            c.pool.eviction_policy = EvictionPolicy::FullSweep;
        });
        h.manager.acquire("p1", "u").await.unwrap();
        h.manager.acquire("p2", "u").await.unwrap();
        h.manager.acquire("p3", "u").await.unwrap();
        let live: Vec<_> = h
            .manager
            .list()
            .await
            .into_iter()
            .map(|i| i.project_id)
            .collect();
        assert_eq!(live, vec!["p3"]);
        assert_eq!(h.runtime.removes(), 2);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded_under_concurrency() {
        let h = harness_with(|c| c.resources.max_instances = 3);
        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&h.manager);
                tokio::spawn(async move { manager.acquire(&format!("p{i}"), "u").await })
            })
            .collect();
        let watcher = {
            let manager = Arc::clone(&h.manager);
            tokio::spawn(async move {
                let mut peak = 0;
                for _ in 0..100 {
                    peak = peak.max(manager.active_count());
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                peak
            })
        };
        for task in tasks {
            let _ = task.await.unwrap();
        }
        assert!(watcher.await.unwrap() <= 3);
        assert!(h.manager.list().await.len() <= 3);
    }

    #[tokio::test]
    async fn test_resource_gate_tears_down_and_releases_slot() {
        let h = harness();
        h.runtime
            .memory_usage
            .store(h.manager.governor().memory_fail_limit() + 1, Ordering::SeqCst);

        let err = h.manager.acquire("p1", "u").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExceeded);
        assert_eq!(h.runtime.removes(), 1);
        assert_eq!(h.manager.active_count(), 0);
        assert!(h.manager.get("p1").await.is_none());
        assert!(!h.manager.sync().is_active("p1"));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_environment_setup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.pool.bootstrap.global_tools = vec!["echo nope; exit 7".into()];
        let sync = Arc::new(FileCacheSync::new(
            config.sync.clone(),
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryLedger::new()),
            None,
        ));
        let manager = WorkspaceManager::new(
            config,
            Arc::new(LocalRuntime::new()),
            sync,
            Arc::new(SessionRegistry::new()),
            None,
        );

        let err = manager.acquire("p1", "u").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentSetup);
        assert!(err.to_string().contains("nope"), "{err}");
        assert_eq!(manager.active_count(), 0);

        // The failed instance is gone, so a retry can create a fresh one.
        let err = manager.acquire("p1", "u").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EnvironmentSetup);
    }

    #[tokio::test]
    async fn test_evict_respects_idle_rule() {
        let h = harness();
        h.manager.acquire("p1", "u").await.unwrap();
        assert!(!h.manager.evict("p1", false).await);
        assert_eq!(h.manager.evict_idle().await, 0);
        assert!(h.manager.evict("p1", true).await);
        assert!(!h.manager.evict("p1", true).await);
        assert_eq!(h.manager.active_count(), 0);

        let h = harness_with(|c| c.pool.idle_timeout_secs = 0);
        h.manager.acquire("p1", "u").await.unwrap();
        assert_eq!(h.manager.evict_idle().await, 1);
        assert!(h.manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_flushes_pending_edits() {
        let h = harness();
        h.manager.acquire("p1", "u").await.unwrap();
        let root = h.manager.sync().cache_dir("p1");
        std::fs::write(root.join("main.js"), "edit").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(h.manager.evict("p1", true).await);
        assert_eq!(
            h.store.get("projects/p1/main.js").await.unwrap().unwrap(),
            b"edit"
        );
    }

    #[tokio::test]
    async fn test_acquire_rejects_invalid_project_id() {
        let h = harness();
        let err = h.manager.acquire("../etc", "u").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
        assert_eq!(h.runtime.creates(), 0);
    }
}
