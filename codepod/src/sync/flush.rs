//! Debounced write-back of admitted changes to remote storage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use codepod_protocol::ChangeType;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pending::{PendingChange, PendingChanges};
use super::remote_key;
use crate::ledger::{ChangeRecord, LedgerStore, NewChange, SyncCheckpoint};
use crate::metrics::{FlushResult, MetricsRegistry};
use crate::storage::ObjectStore;

/// Outcome of one drain of the pending set.
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    pub uploaded: usize,
    pub deleted: usize,
    /// Changes dropped because the local file vanished before upload.
    pub skipped: usize,
    pub records: Vec<ChangeRecord>,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.uploaded == 0 && self.deleted == 0 && self.skipped == 0
    }
}

pub(crate) struct Flusher {
    pub project_id: String,
    pub root: PathBuf,
    pub remote_prefix: String,
    pub store: Arc<dyn ObjectStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub pending: Arc<PendingChanges>,
    pub metrics: Option<MetricsRegistry>,
    /// Serializes drains so two batches never race on the same path.
    pub flush_lock: Mutex<()>,
}

impl Flusher {
    /// Drain and apply every pending change. On the first failure the failed
    /// change and everything after it go back into the pending set.
    pub async fn flush_once(&self) -> Result<FlushReport> {
        let _guard = self.flush_lock.lock().await;
        let batch = self.pending.drain();
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let mut report = FlushReport::default();
        for (idx, change) in batch.iter().enumerate() {
            match self.apply(change).await {
                Ok(Some(record)) => {
                    match record.change_type {
                        ChangeType::Delete => report.deleted += 1,
                        _ => report.uploaded += 1,
                    }
                    report.records.push(record);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    let remaining = batch[idx..].to_vec();
                    let restored = self.pending.requeue(remaining);
                    warn!(
                        project_id = %self.project_id,
                        path = %change.path,
                        applied = report.records.len(),
                        requeued = restored,
                        error = %e,
                        "flush failed mid-batch, remaining changes requeued"
                    );
                    self.record_metric(FlushResult::Failed);
                    return Err(e);
                }
            }
        }

        self.ledger
            .put_checkpoint(SyncCheckpoint {
                project_id: self.project_id.clone(),
                last_sync: Utc::now(),
            })
            .await
            .context("writing checkpoint after flush")?;

        self.record_metric(FlushResult::Ok);
        info!(
            project_id = %self.project_id,
            uploaded = report.uploaded,
            deleted = report.deleted,
            skipped = report.skipped,
            "flushed changes to remote storage"
        );
        Ok(report)
    }

    async fn apply(&self, change: &PendingChange) -> Result<Option<ChangeRecord>> {
        let key = remote_key(&self.remote_prefix, &self.project_id, &change.path);
        match change.change_type {
            ChangeType::Create | ChangeType::Update => {
                let local = self.root.join(&change.path);
                let data = match tokio::fs::read(&local).await {
                    Ok(data) => data,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // The watcher will admit the delete on its own.
                        debug!(
                            project_id = %self.project_id,
                            path = %change.path,
                            "file vanished before upload"
                        );
                        return Ok(None);
                    }
                    Err(e) => {
                        return Err(e).with_context(|| format!("reading {}", local.display()))
                    }
                };
                self.store
                    .put(&key, data)
                    .await
                    .with_context(|| format!("uploading {}", key))?;
            }
            ChangeType::Delete => {
                self.store
                    .delete(&key)
                    .await
                    .with_context(|| format!("deleting {}", key))?;
            }
        }

        let record = self
            .ledger
            .append_change(NewChange {
                project_id: self.project_id.clone(),
                path: change.path.clone(),
                change_type: change.change_type,
                timestamp: Utc::now(),
            })
            .await
            .with_context(|| format!("recording {} of {}", change.change_type, change.path))?;
        Ok(Some(record))
    }

    fn record_metric(&self, result: FlushResult) {
        if let Some(metrics) = &self.metrics {
            metrics.record_flush(result);
        }
    }
}

/// Flush `delay` after the most recent admission until cancelled. A failed
/// flush is retried after another `delay`.
pub(crate) async fn run_flusher(flusher: Arc<Flusher>, delay: Duration, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = flusher.pending.notified() => {}
        }

        // Debounce: keep sleeping while admissions keep arriving.
        while let Some(last) = flusher.pending.last_admitted() {
            let due = last + delay;
            if tokio::time::Instant::now() >= due {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(due) => {}
            }
        }

        if flusher.pending.is_empty() {
            continue;
        }
        if flusher.flush_once().await.is_err() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => flusher.pending.wake(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::storage::memory::StoreOp;
    use crate::storage::MemoryObjectStore;

    fn flusher(
        root: PathBuf,
        store: Arc<MemoryObjectStore>,
        ledger: Arc<MemoryLedger>,
    ) -> Flusher {
        Flusher {
            project_id: "p1".into(),
            root,
            remote_prefix: "projects".into(),
            store,
            ledger,
            pending: Arc::new(PendingChanges::new()),
            metrics: None,
            flush_lock: Mutex::new(()),
        }
    }

    #[tokio::test]
    async fn test_flush_uploads_deletes_and_records() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put("projects/p1/old.txt", b"x".to_vec()).await.unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let f = flusher(dir.path().to_path_buf(), store.clone(), ledger.clone());

        f.pending.admit("a.txt".into(), ChangeType::Create);
        f.pending.admit("old.txt".into(), ChangeType::Delete);
        let report = f.flush_once().await.unwrap();

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.deleted, 1);
        assert_eq!(
            store.get("projects/p1/a.txt").await.unwrap().unwrap(),
            b"hello"
        );
        assert!(store.get("projects/p1/old.txt").await.unwrap().is_none());
        let sequences: Vec<u64> = report.records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert!(ledger.get_checkpoint("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failure_requeues_rest_of_batch() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), "1").unwrap();
        std::fs::write(dir.path().join("b"), "2").unwrap();
        std::fs::write(dir.path().join("c"), "3").unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let mut f = flusher(dir.path().to_path_buf(), store.clone(), ledger.clone());
        // "a" goes through, "b" fails once
        f.store = FailAfter::new(store.clone(), 1) as Arc<dyn ObjectStore>;

        f.pending.admit("a".into(), ChangeType::Create);
        f.pending.admit("b".into(), ChangeType::Create);
        f.pending.admit("c".into(), ChangeType::Create);

        assert!(f.flush_once().await.is_err());
        assert_eq!(f.pending.len(), 2);
        assert!(ledger.get_checkpoint("p1").await.unwrap().is_none());

        let report = f.flush_once().await.unwrap();
        assert_eq!(report.uploaded, 2);
        let all = ledger
            .query_changes_since("p1", chrono::DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap();
        let paths: Vec<_> = all.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
        assert!(store
            .journal()
            .contains(&StoreOp::Put("projects/p1/c".into())));
    }

    #[tokio::test]
    async fn test_vanished_file_is_skipped_without_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let f = flusher(dir.path().to_path_buf(), store.clone(), ledger.clone());
        f.pending.admit("ghost.txt".into(), ChangeType::Update);
        let report = f.flush_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn test_debounced_loop_writes_once_for_rapid_admissions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "final").unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let f = Arc::new(flusher(dir.path().to_path_buf(), store.clone(), ledger.clone()));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_flusher(
            Arc::clone(&f),
            Duration::from_millis(200),
            cancel.clone(),
        ));

        for _ in 0..5 {
            f.pending.admit("a.txt".into(), ChangeType::Update);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            store.journal(),
            vec![StoreOp::Put("projects/p1/a.txt".into())]
        );
    }

    /// Object store wrapper that lets `ok` puts through, then fails one.
    struct FailAfter {
        inner: Arc<MemoryObjectStore>,
        remaining_ok: std::sync::atomic::AtomicUsize,
        failed: std::sync::atomic::AtomicBool,
    }

    impl FailAfter {
        fn new(inner: Arc<MemoryObjectStore>, ok: usize) -> Arc<Self> {
            Arc::new(Self {
                inner,
                remaining_ok: std::sync::atomic::AtomicUsize::new(ok),
                failed: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl ObjectStore for FailAfter {
        async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
            use std::sync::atomic::Ordering;
            let allowed = self
                .remaining_ok
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if !allowed && !self.failed.swap(true, Ordering::SeqCst) {
                anyhow::bail!("injected failure for {}", key);
            }
            self.inner.put(key, data).await
        }
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
        async fn copy(&self, from: &str, to: &str) -> Result<()> {
            self.inner.copy(from, to).await
        }
    }
}
