use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{ChangeRecord, LedgerState, LedgerStore, NewChange, SyncCheckpoint};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn get_checkpoint(&self, project_id: &str) -> Result<Option<SyncCheckpoint>> {
        Ok(self.state.lock().await.checkpoint(project_id))
    }

    async fn put_checkpoint(&self, checkpoint: SyncCheckpoint) -> Result<()> {
        self.state.lock().await.set_checkpoint(checkpoint);
        Ok(())
    }

    async fn append_change(&self, change: NewChange) -> Result<ChangeRecord> {
        Ok(self.state.lock().await.append(change))
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
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_appends_stay_gap_free() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .append_change(NewChange {
                        project_id: "p1".into(),
                        path: format!("f{}", i),
                        change_type: ChangeType::Create,
                        timestamp: Utc::now(),
                    })
                    .await
                    .unwrap()
                    .sequence
            }));
        }
        let mut sequences: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=32).collect::<Vec<u64>>());
    }
}
