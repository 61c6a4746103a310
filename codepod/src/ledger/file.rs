use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{ChangeRecord, LedgerState, LedgerStore, NewChange, SyncCheckpoint};

/// Ledger persisted as a JSON file, rewritten atomically after every mutation.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl FileLedger {
    /// Open the ledger at `path`, starting empty if the file does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = Self::load(&path).await?;
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Read a ledger file without opening it for writes.
    pub async fn load(path: &Path) -> Result<LedgerState> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            info!(path = %path.display(), "no ledger file, starting fresh");
            return Ok(LedgerState::default());
        }
        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading ledger file: {}", path.display()))?;
        let state: LedgerState = serde_json::from_str(&data)
            .with_context(|| format!("parsing ledger file: {}", path.display()))?;
        if state.schema_version > LedgerState::SCHEMA_VERSION {
            warn!(
                version = state.schema_version,
                "ledger file has newer schema version than supported (1), some fields may be lost"
            );
        }
        Ok(state)
    }

    async fn persist(&self, state: &LedgerState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }

        let mut snapshot = state.clone();
        snapshot.schema_version = LedgerState::SCHEMA_VERSION;
        let data = serde_json::to_string_pretty(&snapshot).context("serializing ledger")?;

        // Write to temp file then rename (atomic on same filesystem)
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("writing temp ledger file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming temp ledger file to: {}", self.path.display()))?;

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&self.path, perms).await.ok();
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for FileLedger {
    async fn get_checkpoint(&self, project_id: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self.state.lock().await.checkpoint(project_id))
    }

    async fn put_checkpoint(&self, checkpoint: SyncCheckpoint) -> Result<()> {
        // The lock is held across the write so snapshots land in mutation order.
        let mut state = self.state.lock().await;
        let previous = state.checkpoint(&checkpoint.project_id);
        state.set_checkpoint(checkpoint.clone());
        if let Err(e) = self.persist(&state).await {
            match previous {
                Some(prev) => state.set_checkpoint(prev),
                None => {
                    state.checkpoints.remove(&checkpoint.project_id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn append_change(&self, change: NewChange) -> Result<ChangeRecord> {
        let mut state = self.state.lock().await;
        let record = state.append(change);
        if let Err(e) = self.persist(&state).await {
            if let Some(log) = state.changes.get_mut(&record.project_id) {
                log.pop();
            }
            return Err(e);
        }
        Ok(record)
    }

    async fn query_changes_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>> {
        Ok(self.state.lock().await.since(project_id, since))
    }

    async fn list_checkpoints(&self) -> Result<Vec<SyncCheckpoint>> {
        Ok(self.state.lock().await.all_checkpoints())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codepod_protocol::ChangeType;

    #[tokio::test]
    async fn test_reopen_preserves_records_and_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let t0 = Utc::now();

        {
            let ledger = FileLedger::open(&path).await.unwrap();
            ledger
                .append_change(NewChange {
                    project_id: "p1".into(),
                    path: "a.txt".into(),
                    change_type: ChangeType::Create,
                    timestamp: t0,
                })
                .await
                .unwrap();
            ledger
                .put_checkpoint(SyncCheckpoint {
                    project_id: "p1".into(),
                    last_sync: t0,
                })
                .await
                .unwrap();
        }

        let ledger = FileLedger::open(&path).await.unwrap();
        assert_eq!(
            ledger.get_checkpoint("p1").await.unwrap().unwrap().last_sync,
            t0
        );
        let next = ledger
            .append_change(NewChange {
                project_id: "p1".into(),
                path: "a.txt".into(),
                change_type: ChangeType::Delete,
                timestamp: t0,
            })
            .await
            .unwrap();
        assert_eq!(next.sequence, 2);

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FileLedger::open(dir.path().join("none.json")).await.unwrap();
        assert!(ledger.list_checkpoints().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileLedger::open(&path).await.unwrap_err();
        assert!(format!("{:#}", err).contains("parsing ledger file"));
    }
}
