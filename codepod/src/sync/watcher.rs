//! Change watcher for a project's cache directory.
//!
//! A polling scanner: every tick it walks the tree, computes a SHA-256
//! signature per regular file (re-hashing only when size or mtime moved), and
//! compares against the last admitted view. A differing path becomes a
//! candidate; it is admitted once its observed signature has held for the
//! quiescence window. Hidden paths (any component starting with `.`) and
//! excluded directory names are never reported.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use codepod_protocol::ChangeType;
use sha2::{Digest, Sha256};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pending::PendingChanges;
use crate::error::RuntimeError;

#[derive(Debug, Clone)]
struct CachedSignature {
    len: u64,
    modified: Option<SystemTime>,
    digest: String,
}

#[derive(Debug, Clone)]
struct Candidate {
    observed: Option<String>,
    since: Instant,
}

pub struct ChangeWatcher {
    project_id: String,
    root: PathBuf,
    quiescence: Duration,
    /// Signatures as of the last admission for each path.
    baseline: HashMap<String, String>,
    candidates: HashMap<String, Candidate>,
    cache: HashMap<String, CachedSignature>,
    excluded: Arc<HashSet<String>>,
}

impl ChangeWatcher {
    pub fn new(project_id: &str, root: PathBuf, quiescence: Duration) -> Self {
        Self {
            project_id: project_id.to_string(),
            root,
            quiescence,
            baseline: HashMap::new(),
            candidates: HashMap::new(),
            cache: HashMap::new(),
            excluded: Arc::new(HashSet::new()),
        }
    }

    /// Skip directories with any of these names, at any depth.
    pub fn with_excluded<I: IntoIterator<Item = String>>(mut self, names: I) -> Self {
        self.excluded = Arc::new(names.into_iter().collect());
        self
    }

    /// Take the current tree as the baseline without reporting anything.
    pub async fn prime(&mut self) -> Result<usize, RuntimeError> {
        let current = self.scan().await?;
        let count = current.len();
        self.baseline = current;
        self.candidates.clear();
        Ok(count)
    }

    /// Scan once and return changes whose quiescence window has elapsed.
    pub async fn poll(&mut self) -> Result<Vec<(String, ChangeType)>, RuntimeError> {
        let current = self.scan().await?;
        Ok(self.evaluate(current, Instant::now(), false))
    }

    /// Scan once and admit every outstanding difference immediately.
    pub async fn poll_final(&mut self) -> Result<Vec<(String, ChangeType)>, RuntimeError> {
        let current = self.scan().await?;
        Ok(self.evaluate(current, Instant::now(), true))
    }

    fn evaluate(
        &mut self,
        current: HashMap<String, String>,
        now: Instant,
        force: bool,
    ) -> Vec<(String, ChangeType)> {
        let paths: HashSet<String> = self
            .baseline
            .keys()
            .chain(current.keys())
            .chain(self.candidates.keys())
            .cloned()
            .collect();

        let mut admitted = Vec::new();
        for path in paths {
            let observed = current.get(&path).cloned();
            let base = self.baseline.get(&path);
            if observed.as_ref() == base {
                // Unchanged, or reverted before it settled.
                self.candidates.remove(&path);
                continue;
            }

            let settled = match self.candidates.get(&path) {
                Some(c) if c.observed == observed => {
                    force || now.duration_since(c.since) >= self.quiescence
                }
                _ => {
                    self.candidates.insert(
                        path.clone(),
                        Candidate {
                            observed: observed.clone(),
                            since: now,
                        },
                    );
                    force
                }
            };
            if !settled {
                continue;
            }

            let change_type = match (base.is_some(), observed.is_some()) {
                (false, _) => ChangeType::Create,
                (true, true) => ChangeType::Update,
                (true, false) => ChangeType::Delete,
            };
            match observed {
                Some(sig) => {
                    self.baseline.insert(path.clone(), sig);
                }
                None => {
                    self.baseline.remove(&path);
                }
            }
            self.candidates.remove(&path);
            admitted.push((path, change_type));
        }
        admitted.sort_by(|a, b| a.0.cmp(&b.0));
        admitted
    }

    async fn scan(&mut self) -> Result<HashMap<String, String>, RuntimeError> {
        let root = self.root.clone();
        let cache = std::mem::take(&mut self.cache);
        let excluded = Arc::clone(&self.excluded);
        let joined =
            tokio::task::spawn_blocking(move || scan_tree(&root, cache, &excluded)).await;
        match joined {
            Ok(Ok((current, cache))) => {
                self.cache = cache;
                Ok(current)
            }
            Ok(Err(e)) => Err(RuntimeError::Watcher {
                project_id: self.project_id.clone(),
                message: format!("scanning {}: {}", self.root.display(), e),
            }),
            Err(e) => Err(RuntimeError::Watcher {
                project_id: self.project_id.clone(),
                message: format!("scan task failed: {}", e),
            }),
        }
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Files modified this recently are always re-hashed; a same-size rewrite
/// inside one mtime tick would otherwise look unchanged.
const RACY_WINDOW: Duration = Duration::from_secs(2);

type ScanResult = (HashMap<String, String>, HashMap<String, CachedSignature>);

fn scan_tree(
    root: &Path,
    mut previous: HashMap<String, CachedSignature>,
    excluded: &HashSet<String>,
) -> std::io::Result<ScanResult> {
    let started = SystemTime::now();
    let mut current = HashMap::new();
    let mut cache = HashMap::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            // A subdirectory removed mid-scan
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir != root => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if is_hidden(&entry.file_name()) {
                continue;
            }
            let path = entry.path();
            let meta = match std::fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if meta.is_dir() {
                if !excluded.contains(entry.file_name().to_string_lossy().as_ref()) {
                    stack.push(path);
                }
                continue;
            }
            if !meta.is_file() {
                continue;
            }

            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let modified = meta.modified().ok();
            let trusted = modified
                .and_then(|m| started.duration_since(m).ok())
                .is_some_and(|age| age > RACY_WINDOW);

            let signature = match previous.remove(&key) {
                Some(sig) if trusted && sig.len == meta.len() && sig.modified == modified => sig,
                _ => {
                    let data = match std::fs::read(&path) {
                        Ok(data) => data,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e),
                    };
                    CachedSignature {
                        len: meta.len(),
                        modified,
                        digest: hex::encode(Sha256::digest(&data)),
                    }
                }
            };
            current.insert(key.clone(), signature.digest.clone());
            cache.insert(key, signature);
        }
    }
    Ok((current, cache))
}

/// Scan until cancelled, feeding admitted changes into `pending`. On
/// cancellation one last forced scan admits whatever is still settling.
pub(crate) async fn run_watcher(
    mut watcher: ChangeWatcher,
    pending: Arc<PendingChanges>,
    scan_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match watcher.poll().await {
            Ok(changes) => {
                for (path, change_type) in changes {
                    debug!(
                        project_id = %watcher.project_id,
                        path = %path,
                        change = %change_type,
                        "change admitted"
                    );
                    pending.admit(path, change_type);
                }
            }
            Err(e) => warn!(error = %e, "change watcher scan failed"),
        }
    }

    match watcher.poll_final().await {
        Ok(changes) => {
            for (path, change_type) in changes {
                pending.admit(path, change_type);
            }
        }
        Err(e) => warn!(error = %e, "final change watcher scan failed"),
    }
}
