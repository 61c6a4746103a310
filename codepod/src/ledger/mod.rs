//! Change ledger and sync checkpoints.
//!
//! The ledger is append-only per project. It assigns sequence numbers itself,
//! starting at 1 and increasing by exactly one per appended record, so callers
//! can never produce gaps or reorderings.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codepod_protocol::ChangeType;
use serde::{Deserialize, Serialize};

pub use file::FileLedger;
pub use memory::MemoryLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub project_id: String,
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

/// A change to append; the ledger assigns the sequence.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub project_id: String,
    pub path: String,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub project_id: String,
    pub last_sync: DateTime<Utc>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    async fn get_checkpoint(&self, project_id: &str) -> Result<Option<SyncCheckpoint>>;

    async fn put_checkpoint(&self, checkpoint: SyncCheckpoint) -> Result<()>;

    async fn append_change(&self, change: NewChange) -> Result<ChangeRecord>;

    /// Records with `timestamp > since`, ascending by sequence.
    async fn query_changes_since(
        &self,
        project_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>>;

    async fn list_checkpoints(&self) -> Result<Vec<SyncCheckpoint>>;
}

/// Ledger contents shared by the in-memory and file-backed stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub checkpoints: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub changes: BTreeMap<String, Vec<ChangeRecord>>,
}

impl LedgerState {
    pub const SCHEMA_VERSION: u32 = 1;

    pub fn checkpoint(&self, project_id: &str) -> Option<SyncCheckpoint> {
        self.checkpoints
            .get(project_id)
            .map(|last_sync| SyncCheckpoint {
                project_id: project_id.to_string(),
                last_sync: *last_sync,
            })
    }

    pub fn set_checkpoint(&mut self, checkpoint: SyncCheckpoint) {
        self.checkpoints
            .insert(checkpoint.project_id, checkpoint.last_sync);
    }

    pub fn append(&mut self, change: NewChange) -> ChangeRecord {
        let log = self.changes.entry(change.project_id.clone()).or_default();
        let sequence = log.last().map(|r| r.sequence + 1).unwrap_or(1);
        let record = ChangeRecord {
            project_id: change.project_id,
            path: change.path,
            change_type: change.change_type,
            timestamp: change.timestamp,
            sequence,
        };
        log.push(record.clone());
        record
    }

    pub fn since(&self, project_id: &str, since: DateTime<Utc>) -> Vec<ChangeRecord> {
        // Each log is stored in sequence order.
        self.changes
            .get(project_id)
            .map(|log| {
                log.iter()
                    .filter(|r| r.timestamp > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_checkpoints(&self) -> Vec<SyncCheckpoint> {
        self.checkpoints
            .iter()
            .map(|(project_id, last_sync)| SyncCheckpoint {
                project_id: project_id.clone(),
                last_sync: *last_sync,
            })
            .collect()
    }
}
