//! File cache synchronizer.
//!
//! Each project has a local cache directory at `<cache_root>/<project_id>`
//! mirroring the remote objects under `<remote_prefix>/<project_id>/`. The
//! directory is materialized before an instance starts (full or incremental
//! sync), then a change watcher and a debounced flush task keep the remote
//! copy current until [`FileCacheSync::stop`].

pub mod flush;
pub mod pending;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use codepod_protocol::ChangeType;
use futures::{StreamExt, TryStreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::SyncConfig;
use crate::error::RuntimeError;
use crate::ledger::{LedgerStore, SyncCheckpoint};
use crate::metrics::MetricsRegistry;
use crate::storage::ObjectStore;

pub use flush::FlushReport;
use flush::Flusher;
use pending::PendingChanges;
use watcher::ChangeWatcher;

/// Concurrent downloads during a full sync.
const DOWNLOAD_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

/// What a materialization did to the cache directory.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub mode: SyncMode,
    pub files_written: usize,
    pub files_removed: usize,
    /// Ledger sequences replayed, in replay order. Empty for a full sync.
    pub applied_sequences: Vec<u64>,
    pub checkpoint: DateTime<Utc>,
}

struct ProjectSync {
    root: PathBuf,
    flusher: Arc<Flusher>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct FileCacheSync {
    config: SyncConfig,
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn LedgerStore>,
    metrics: Option<MetricsRegistry>,
    projects: Mutex<HashMap<String, ProjectSync>>,
    /// Flushers of stopped projects whose final flush failed. Their pending
    /// sets must reach remote storage before the cache is materialized again.
    stranded: Mutex<HashMap<String, Arc<Flusher>>>,
}

/// Remote key of a project-relative path.
pub fn remote_key(prefix: &str, project_id: &str, rel: &str) -> String {
    format!("{}/{}/{}", prefix, project_id, rel)
}

/// Project ids become directory names and key segments.
pub fn validate_project_id(project_id: &str) -> Result<(), RuntimeError> {
    let valid = !project_id.is_empty()
        && project_id.len() <= 128
        && !project_id.starts_with('.')
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RuntimeError::InvalidPath {
            path: project_id.to_string(),
            reason: "project id must be 1-128 characters of [A-Za-z0-9._-] not starting with '.'"
                .into(),
        })
    }
}

/// Relative paths from the ledger or the remote listing must stay inside the
/// cache directory.
pub fn validate_relative(path: &str) -> Result<(), RuntimeError> {
    let invalid = |reason: &str| RuntimeError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    };
    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') {
        return Err(invalid("absolute path"));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(invalid("disallowed character"));
    }
    if path
        .split('/')
        .any(|part| part.is_empty() || part == "." || part == "..")
    {
        return Err(invalid("empty or relative component"));
    }
    Ok(())
}

async fn write_local(root: &Path, rel: &str, data: &[u8]) -> Result<()> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(&path, data)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn remove_local(root: &Path, rel: &str) -> Result<bool> {
    let path = root.join(rel);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

impl FileCacheSync {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn LedgerStore>,
        metrics: Option<MetricsRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            metrics,
            projects: Mutex::new(HashMap::new()),
            stranded: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self, project_id: &str) -> PathBuf {
        self.config.cache_root.join(project_id)
    }

    fn project_prefix(&self, project_id: &str) -> String {
        format!("{}/{}/", self.config.remote_prefix, project_id)
    }

    pub fn is_active(&self, project_id: &str) -> bool {
        self.projects
            .lock()
            .map(|p| p.contains_key(project_id))
            .unwrap_or(false)
    }

    /// Admitted changes not yet flushed, including those left over from a
    /// stop whose final flush failed.
    pub fn pending_count(&self, project_id: &str) -> usize {
        let active = self
            .projects
            .lock()
            .ok()
            .and_then(|p| p.get(project_id).map(|s| s.flusher.pending.len()))
            .unwrap_or(0);
        active + self.stranded_count(project_id)
    }

    fn stranded_count(&self, project_id: &str) -> usize {
        self.stranded
            .lock()
            .ok()
            .and_then(|s| s.get(project_id).map(|f| f.pending.len()))
            .unwrap_or(0)
    }

    fn take_stranded(&self, project_id: &str) -> Option<Arc<Flusher>> {
        self.stranded.lock().ok().and_then(|mut s| s.remove(project_id))
    }

    fn strand(&self, project_id: &str, flusher: Arc<Flusher>) {
        if let Ok(mut stranded) = self.stranded.lock() {
            stranded.insert(project_id.to_string(), flusher);
        }
    }

    /// Push changes a failed stop left behind. On failure they stay stranded
    /// and the error is returned.
    async fn flush_stranded(
        &self,
        project_id: &str,
    ) -> Result<Option<FlushReport>, RuntimeError> {
        let Some(flusher) = self.take_stranded(project_id) else {
            return Ok(None);
        };
        match flusher.flush_once().await {
            Ok(report) => {
                info!(
                    project_id = %project_id,
                    uploaded = report.uploaded,
                    deleted = report.deleted,
                    "flushed changes left over from a failed stop"
                );
                Ok(Some(report))
            }
            Err(e) => {
                self.strand(project_id, flusher);
                Err(RuntimeError::sync(project_id, e))
            }
        }
    }

    /// Materialize the project's cache directory and start watching it.
    /// Calling it for an already active project returns its directory.
    #[instrument(skip(self))]
    pub async fn initialize(&self, project_id: &str) -> Result<PathBuf, RuntimeError> {
        validate_project_id(project_id)?;
        if let Some(root) = self.active_root(project_id) {
            return Ok(root);
        }

        // Replaying or re-downloading over unflushed edits would either
        // clobber them or bake them into the watcher baseline.
        self.flush_stranded(project_id).await?;

        let report = self.materialize(project_id).await?;
        let root = self.cache_dir(project_id);

        let mut watcher = ChangeWatcher::new(project_id, root.clone(), self.config.quiescence())
            .with_excluded(self.config.exclude.iter().cloned());
        let tracked = watcher.prime().await?;

        let pending = Arc::new(PendingChanges::new());
        let flusher = Arc::new(Flusher {
            project_id: project_id.to_string(),
            root: root.clone(),
            remote_prefix: self.config.remote_prefix.clone(),
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            pending: Arc::clone(&pending),
            metrics: self.metrics.clone(),
            flush_lock: tokio::sync::Mutex::new(()),
        });

        let mut projects = self
            .projects
            .lock()
            .map_err(|_| RuntimeError::Sync {
                project_id: project_id.to_string(),
                message: "sync registry lock poisoned".into(),
            })?;
        if let Some(existing) = projects.get(project_id) {
            return Ok(existing.root.clone());
        }

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(watcher::run_watcher(
                watcher,
                pending,
                self.config.scan_interval(),
                cancel.clone(),
            )),
            tokio::spawn(flush::run_flusher(
                Arc::clone(&flusher),
                self.config.flush_delay(),
                cancel.clone(),
            )),
        ];
        projects.insert(
            project_id.to_string(),
            ProjectSync {
                root: root.clone(),
                flusher,
                cancel,
                tasks,
            },
        );
        drop(projects);

        info!(
            project_id = %project_id,
            mode = %report.mode,
            files_written = report.files_written,
            files_removed = report.files_removed,
            tracked,
            "project cache ready, watching for changes"
        );
        Ok(root)
    }

    fn active_root(&self, project_id: &str) -> Option<PathBuf> {
        self.projects
            .lock()
            .ok()
            .and_then(|p| p.get(project_id).map(|s| s.root.clone()))
    }

    /// Bring the cache directory up to date without starting the watcher.
    /// Chooses a full sync when there is no checkpoint, the checkpoint is
    /// stale, or the directory is missing; otherwise replays the ledger.
    pub async fn materialize(&self, project_id: &str) -> Result<SyncReport, RuntimeError> {
        validate_project_id(project_id)?;
        let root = self.cache_dir(project_id);
        let checkpoint = self
            .ledger
            .get_checkpoint(project_id)
            .await
            .map_err(|e| RuntimeError::sync(project_id, e))?;

        let staleness = chrono::Duration::from_std(self.config.staleness())
            .unwrap_or(chrono::Duration::MAX);
        let since = match checkpoint {
            Some(cp) if Utc::now() - cp.last_sync <= staleness => {
                if tokio::fs::try_exists(&root).await.unwrap_or(false) {
                    Some(cp.last_sync)
                } else {
                    None
                }
            }
            _ => None,
        };

        let result = match since {
            Some(since) => self.incremental_sync(project_id, &root, since).await,
            None => self.full_sync(project_id, &root).await,
        };
        result.map_err(|e| RuntimeError::sync(project_id, e))
    }

    /// Replace the cache directory with the remote tree.
    #[instrument(skip(self, root))]
    pub async fn full_sync(&self, project_id: &str, root: &Path) -> Result<SyncReport> {
        let started = Utc::now();
        if tokio::fs::try_exists(root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(root)
                .await
                .with_context(|| format!("clearing {}", root.display()))?;
        }
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("creating {}", root.display()))?;

        let prefix = self.project_prefix(project_id);
        let keys = self
            .store
            .list(&prefix)
            .await
            .with_context(|| format!("listing {}", prefix))?;

        let written: Vec<bool> = futures::stream::iter(keys)
            .map(|key| {
                let prefix = &prefix;
                async move {
                    let rel = key.strip_prefix(prefix.as_str()).unwrap_or(&key).to_string();
                    validate_relative(&rel)?;
                    // Deleted between list and get
                    let Some(data) = self.store.get(&key).await? else {
                        return Ok(false);
                    };
                    write_local(root, &rel, &data).await?;
                    Ok::<bool, anyhow::Error>(true)
                }
            })
            .buffer_unordered(DOWNLOAD_CONCURRENCY)
            .try_collect()
            .await?;

        self.ledger
            .put_checkpoint(SyncCheckpoint {
                project_id: project_id.to_string(),
                last_sync: started,
            })
            .await
            .context("writing checkpoint after full sync")?;

        let files_written = written.into_iter().filter(|w| *w).count();
        info!(project_id = %project_id, files_written, "full sync complete");
        Ok(SyncReport {
            mode: SyncMode::Full,
            files_written,
            files_removed: 0,
            applied_sequences: Vec::new(),
            checkpoint: started,
        })
    }

    /// Replay ledger records newer than `since`, in sequence order.
    #[instrument(skip(self, root))]
    pub async fn incremental_sync(
        &self,
        project_id: &str,
        root: &Path,
        since: DateTime<Utc>,
    ) -> Result<SyncReport> {
        let started = Utc::now();
        let mut records = self
            .ledger
            .query_changes_since(project_id, since)
            .await
            .context("querying change ledger")?;
        records.sort_by_key(|r| r.sequence);

        let mut report = SyncReport {
            mode: SyncMode::Incremental,
            files_written: 0,
            files_removed: 0,
            applied_sequences: Vec::with_capacity(records.len()),
            checkpoint: started,
        };
        for record in records {
            validate_relative(&record.path)?;
            let key = remote_key(&self.config.remote_prefix, project_id, &record.path);
            match record.change_type {
                ChangeType::Create | ChangeType::Update => {
                    match self
                        .store
                        .get(&key)
                        .await
                        .with_context(|| format!("fetching {}", key))?
                    {
                        Some(data) => {
                            write_local(root, &record.path, &data).await?;
                            report.files_written += 1;
                        }
                        None => {
                            // Gone remotely since; a later Delete record follows.
                            if remove_local(root, &record.path).await? {
                                report.files_removed += 1;
                            }
                        }
                    }
                }
                ChangeType::Delete => {
                    if remove_local(root, &record.path).await? {
                        report.files_removed += 1;
                    }
                }
            }
            report.applied_sequences.push(record.sequence);
        }

        self.ledger
            .put_checkpoint(SyncCheckpoint {
                project_id: project_id.to_string(),
                last_sync: started,
            })
            .await
            .context("writing checkpoint after incremental sync")?;

        info!(
            project_id = %project_id,
            applied = report.applied_sequences.len(),
            "incremental sync complete"
        );
        Ok(report)
    }

    /// Flush the project's pending changes immediately. A stopped project
    /// with changes left over from a failed stop is flushed too.
    pub async fn flush_now(&self, project_id: &str) -> Result<FlushReport, RuntimeError> {
        let active = self
            .projects
            .lock()
            .ok()
            .and_then(|p| p.get(project_id).map(|s| Arc::clone(&s.flusher)));
        let Some(flusher) = active else {
            return self
                .flush_stranded(project_id)
                .await?
                .ok_or_else(|| RuntimeError::Sync {
                    project_id: project_id.to_string(),
                    message: "project is not being synchronized".into(),
                });
        };
        flusher
            .flush_once()
            .await
            .map_err(|e| RuntimeError::sync(project_id, e))
    }

    /// Stop watching a project. The watcher's final scan admits anything still
    /// settling and one last flush pushes it. On failure the project is still
    /// stopped, but its unflushed changes are kept and pushed before the next
    /// `initialize` touches the cache directory.
    #[instrument(skip(self))]
    pub async fn stop(&self, project_id: &str) -> Result<Option<FlushReport>, RuntimeError> {
        let entry = self
            .projects
            .lock()
            .ok()
            .and_then(|mut p| p.remove(project_id));
        let Some(entry) = entry else {
            return Ok(None);
        };

        entry.cancel.cancel();
        for task in entry.tasks {
            if let Err(e) = task.await {
                warn!(project_id = %project_id, error = %e, "sync task panicked");
            }
        }

        let report = match entry.flusher.flush_once().await {
            Ok(report) => report,
            Err(e) => {
                warn!(
                    project_id = %project_id,
                    pending = entry.flusher.pending.len(),
                    error = %e,
                    "final flush failed, keeping unflushed changes"
                );
                self.strand(project_id, entry.flusher);
                return Err(RuntimeError::sync(project_id, e));
            }
        };
        info!(
            project_id = %project_id,
            uploaded = report.uploaded,
            deleted = report.deleted,
            "stopped synchronizing project"
        );
        Ok(Some(report))
    }

    /// Project ids currently being synchronized.
    pub fn active_projects(&self) -> Vec<String> {
        self.projects
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, NewChange};
    use crate::storage::memory::StoreOp;
    use crate::storage::MemoryObjectStore;
    use std::time::Duration;

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryObjectStore>,
        ledger: Arc<MemoryLedger>,
        sync: FileCacheSync,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            cache_root: dir.path().join("cache"),
            remote_prefix: "projects".into(),
            staleness_secs: 24 * 60 * 60,
            quiescence_ms: 100,
            flush_delay_ms: 150,
            scan_interval_ms: 25,
            exclude: vec!["node_modules".into()],
        };
        let store = Arc::new(MemoryObjectStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let sync = FileCacheSync::new(config, store.clone(), ledger.clone(), None);
        Harness {
            _dir: dir,
            store,
            ledger,
            sync,
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not met within 5s");
    }

    #[test]
    fn test_validate_relative() {
        assert!(validate_relative("a.txt").is_ok());
        assert!(validate_relative("b/c.txt").is_ok());
        assert!(validate_relative("").is_err());
        assert!(validate_relative("/etc/passwd").is_err());
        assert!(validate_relative("../x").is_err());
        assert!(validate_relative("a/./b").is_err());
        assert!(validate_relative("a//b").is_err());
    }

    #[test]
    fn test_validate_project_id() {
        assert!(validate_project_id("proj-42_a.b").is_ok());
        assert!(validate_project_id("").is_err());
        assert!(validate_project_id("..").is_err());
        assert!(validate_project_id("a/b").is_err());
    }

    #[tokio::test]
    async fn test_full_sync_reproduces_tree_and_checkpoints() {
        let h = harness();
        h.store.put("projects/p1/a.txt", b"x".to_vec()).await.unwrap();
        h.store.put("projects/p1/b/c.txt", b"y".to_vec()).await.unwrap();
        h.store.put("projects/p2/other.txt", b"z".to_vec()).await.unwrap();

        let before = Utc::now();
        let report = h.sync.materialize("p1").await.unwrap();
        assert_eq!(report.mode, SyncMode::Full);
        assert_eq!(report.files_written, 2);

        let root = h.sync.cache_dir("p1");
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "x");
        assert_eq!(std::fs::read_to_string(root.join("b/c.txt")).unwrap(), "y");
        assert!(!root.join("other.txt").exists());

        let cp = h.ledger.get_checkpoint("p1").await.unwrap().unwrap();
        assert!(cp.last_sync >= before);
    }

    #[tokio::test]
    async fn test_full_sync_clears_stale_local_files() {
        let h = harness();
        let root = h.sync.cache_dir("p1");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("leftover.txt"), "old").unwrap();
        h.store.put("projects/p1/a.txt", b"x".to_vec()).await.unwrap();

        h.sync.materialize("p1").await.unwrap();
        assert!(!root.join("leftover.txt").exists());
        assert!(root.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_stale_checkpoint_forces_full_sync() {
        let h = harness();
        std::fs::create_dir_all(h.sync.cache_dir("p1")).unwrap();
        h.ledger
            .put_checkpoint(SyncCheckpoint {
                project_id: "p1".into(),
                last_sync: Utc::now() - chrono::Duration::hours(25),
            })
            .await
            .unwrap();
        let report = h.sync.materialize("p1").await.unwrap();
        assert_eq!(report.mode, SyncMode::Full);
    }

    #[tokio::test]
    async fn test_incremental_sync_applies_only_newer_records_in_order() {
        let h = harness();
        let root = h.sync.cache_dir("p1");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("doomed.txt"), "bye").unwrap();
        std::fs::write(root.join("untouched.txt"), "local").unwrap();

        let t = Utc::now() - chrono::Duration::minutes(10);
        let append = |path: &str, change_type, offset_secs: i64| NewChange {
            project_id: "p1".into(),
            path: path.into(),
            change_type,
            timestamp: t + chrono::Duration::seconds(offset_secs),
        };
        h.ledger
            .append_change(append("untouched.txt", ChangeType::Update, -5))
            .await
            .unwrap();
        h.ledger
            .append_change(append("new.txt", ChangeType::Create, 1))
            .await
            .unwrap();
        h.ledger
            .append_change(append("doomed.txt", ChangeType::Delete, 2))
            .await
            .unwrap();
        h.ledger
            .append_change(append("new.txt", ChangeType::Update, 3))
            .await
            .unwrap();
        h.ledger
            .put_checkpoint(SyncCheckpoint {
                project_id: "p1".into(),
                last_sync: t,
            })
            .await
            .unwrap();
        h.store
            .put("projects/p1/new.txt", b"v2".to_vec())
            .await
            .unwrap();
        h.store
            .put("projects/p1/untouched.txt", b"remote".to_vec())
            .await
            .unwrap();

        let report = h.sync.materialize("p1").await.unwrap();
        assert_eq!(report.mode, SyncMode::Incremental);
        assert_eq!(report.applied_sequences, vec![2, 3, 4]);
        assert_eq!(std::fs::read_to_string(root.join("new.txt")).unwrap(), "v2");
        assert!(!root.join("doomed.txt").exists());
        // Record 1 predates the checkpoint
        assert_eq!(
            std::fs::read_to_string(root.join("untouched.txt")).unwrap(),
            "local"
        );
        let cp = h.ledger.get_checkpoint("p1").await.unwrap().unwrap();
        assert!(cp.last_sync > t);
    }

    #[tokio::test]
    async fn test_incremental_sync_rejects_escaping_paths() {
        let h = harness();
        std::fs::create_dir_all(h.sync.cache_dir("p1")).unwrap();
        let t = Utc::now() - chrono::Duration::minutes(1);
        h.ledger
            .put_checkpoint(SyncCheckpoint {
                project_id: "p1".into(),
                last_sync: t,
            })
            .await
            .unwrap();
        h.ledger
            .append_change(NewChange {
                project_id: "p1".into(),
                path: "../../etc/passwd".into(),
                change_type: ChangeType::Delete,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        let err = h.sync.materialize("p1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidPath { .. }));
    }

    #[tokio::test]
    async fn test_local_edit_reaches_remote_with_one_record() {
        let h = harness();
        h.store.put("projects/p1/a.txt", b"x".to_vec()).await.unwrap();
        let root = h.sync.initialize("p1").await.unwrap();
        let since = Utc::now();

        std::fs::write(root.join("a.txt"), "edited").unwrap();
        let store = h.store.clone();
        wait_for(|| {
            store
                .journal()
                .iter()
                .filter(|op| **op == StoreOp::Put("projects/p1/a.txt".into()))
                .count()
                == 2
        })
        .await;

        assert_eq!(
            h.store.get("projects/p1/a.txt").await.unwrap().unwrap(),
            b"edited"
        );
        // Allow the ledger append that follows the upload to land.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let records = h
            .ledger
            .query_changes_since("p1", since - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "a.txt");
        assert_eq!(records[0].change_type, ChangeType::Update);

        h.sync.stop("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_delete_removes_remote_and_records_delete() {
        let h = harness();
        h.store.put("projects/p1/gone.txt", b"x".to_vec()).await.unwrap();
        let root = h.sync.initialize("p1").await.unwrap();

        std::fs::remove_file(root.join("gone.txt")).unwrap();
        let store = h.store.clone();
        wait_for(|| {
            store
                .journal()
                .contains(&StoreOp::Delete("projects/p1/gone.txt".into()))
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let records = h
            .ledger
            .query_changes_since("p1", chrono::DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].change_type, ChangeType::Delete);
        h.sync.stop("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_rapid_edits_produce_single_write() {
        let h = harness();
        let root = h.sync.initialize("p1").await.unwrap();

        for i in 0..6 {
            std::fs::write(root.join("notes.md"), format!("draft {}", i)).unwrap();
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        let store = h.store.clone();
        wait_for(|| !store.journal().is_empty()).await;
        // Well past another quiescence + flush window
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(
            h.store.journal(),
            vec![StoreOp::Put("projects/p1/notes.md".into())]
        );
        assert_eq!(
            h.store.get("projects/p1/notes.md").await.unwrap().unwrap(),
            b"draft 5"
        );
        h.sync.stop("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_unsettled_edits() {
        let h = harness();
        let root = h.sync.initialize("p1").await.unwrap();
        std::fs::write(root.join("late.txt"), "last words").unwrap();

        let report = h.sync.stop("p1").await.unwrap().unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(
            h.store.get("projects/p1/late.txt").await.unwrap().unwrap(),
            b"last words"
        );
        assert!(!h.sync.is_active("p1"));
        assert!(h.sync.stop("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_ignores_own_downloads() {
        let h = harness();
        h.store.put("projects/p1/a.txt", b"x".to_vec()).await.unwrap();
        let first = h.sync.initialize("p1").await.unwrap();
        let second = h.sync.initialize("p1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.sync.active_projects(), vec!["p1".to_string()]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.sync.pending_count("p1"), 0);
        let report = h.sync.flush_now("p1").await.unwrap();
        assert!(report.is_empty());
        // Only the seed put; the download was not echoed back.
        assert_eq!(h.store.journal().len(), 1);
        h.sync.stop("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_stop_keeps_edits_for_next_initialize() {
        let h = harness();
        let root = h.sync.initialize("p1").await.unwrap();
        std::fs::write(root.join("work.txt"), "unsaved").unwrap();

        h.store.fail_next_puts(1);
        let err = h.sync.stop("p1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Sync { .. }));
        assert!(!h.sync.is_active("p1"));
        assert_eq!(h.sync.pending_count("p1"), 1);
        assert!(h.store.get("projects/p1/work.txt").await.unwrap().is_none());

        // Checkpoint is fresh, so this is an incremental sync over the edit.
        let root = h.sync.initialize("p1").await.unwrap();
        assert_eq!(
            h.store.get("projects/p1/work.txt").await.unwrap().unwrap(),
            b"unsaved"
        );
        assert_eq!(std::fs::read(root.join("work.txt")).unwrap(), b"unsaved");
        let records = h
            .ledger
            .query_changes_since("p1", DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, "work.txt");
        assert_eq!(h.sync.pending_count("p1"), 0);
        h.sync.stop("p1").await.unwrap();
    }

    #[tokio::test]
    async fn test_initialize_fails_while_leftover_edits_cannot_flush() {
        let h = harness();
        let root = h.sync.initialize("p1").await.unwrap();
        std::fs::write(root.join("work.txt"), "unsaved").unwrap();

        h.store.fail_next_puts(2);
        assert!(h.sync.stop("p1").await.is_err());
        let err = h.sync.initialize("p1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Sync { .. }));
        assert!(!h.sync.is_active("p1"));
        assert_eq!(std::fs::read(root.join("work.txt")).unwrap(), b"unsaved");

        let report = h.sync.flush_now("p1").await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(h.sync.pending_count("p1"), 0);
    }

    #[tokio::test]
    async fn test_flush_now_requires_active_project() {
        let h = harness();
        let err = h.sync.flush_now("p1").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Sync { .. }));
    }
}
