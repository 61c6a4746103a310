//! Per-project set of admitted, not yet flushed changes.
//!
//! The change watcher produces into it and the flush task drains it. At most
//! one entry exists per path; later admissions replace earlier ones.

use std::collections::HashMap;
use std::sync::Mutex;

use codepod_protocol::ChangeType;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub path: String,
    pub change_type: ChangeType,
    /// Admission order; later admissions have larger generations.
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, PendingChange>,
    next_generation: u64,
    last_admitted: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct PendingChanges {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Collapse a new event onto an existing pending one for the same path.
fn merge(existing: ChangeType, incoming: ChangeType) -> ChangeType {
    match (existing, incoming) {
        // Still unknown to the remote.
        (ChangeType::Create, ChangeType::Update) => ChangeType::Create,
        // The remote still holds the old object.
        (ChangeType::Delete, ChangeType::Create) => ChangeType::Update,
        (_, latest) => latest,
    }
}

impl PendingChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admitted change and wake the flush task.
    pub fn admit(&self, path: String, change_type: ChangeType) {
        {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner.next_generation += 1;
            let generation = inner.next_generation;
            let change_type = match inner.entries.get(&path) {
                Some(existing) => merge(existing.change_type, change_type),
                None => change_type,
            };
            inner.entries.insert(
                path.clone(),
                PendingChange {
                    path,
                    change_type,
                    generation,
                },
            );
            inner.last_admitted = Some(Instant::now());
        }
        self.notify.notify_one();
    }

    /// Take every pending change, oldest admission first.
    pub fn drain(&self) -> Vec<PendingChange> {
        let Ok(mut inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut batch: Vec<PendingChange> = inner.entries.drain().map(|(_, c)| c).collect();
        batch.sort_by_key(|c| c.generation);
        batch
    }

    /// Put back changes from a failed flush. A path admitted again since the
    /// drain keeps its newer entry.
    pub fn requeue(&self, changes: Vec<PendingChange>) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let mut restored = 0;
        for change in changes {
            if !inner.entries.contains_key(&change.path) {
                inner.entries.insert(change.path.clone(), change);
                restored += 1;
            }
        }
        restored
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_admitted(&self) -> Option<Instant> {
        self.inner.lock().ok().and_then(|i| i.last_admitted)
    }

    /// Wake the flush task without admitting anything.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}
