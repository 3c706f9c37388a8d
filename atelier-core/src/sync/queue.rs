/// Outbound sync queue.
///
/// Local mutations that could not be confirmed written to the remote wait here
/// in FIFO order until the caller drains the queue (typically on reconnect).
/// Each item carries a bounded retry count; an item that runs out of retries
/// is moved to the dead-letter list instead of being dropped.
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::remote::RemoteError;
use crate::storage::local::FileProjectStore;
use crate::storage::StorageError;
use crate::types::{now_millis, ProjectState};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueOperation {
    Save,
    Delete,
    Update,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: String,
    pub project_id: String,
    pub operation: QueueOperation,
    #[serde(default)]
    pub data: Option<ProjectState>,
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
}

impl SyncQueueItem {
    pub fn new(
        project_id: impl Into<String>,
        operation: QueueOperation,
        data: Option<ProjectState>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            operation,
            data,
            timestamp: now_millis(),
            retry_count: 0,
            max_retries,
        }
    }

    pub fn save(state: ProjectState, max_retries: u32) -> Self {
        Self::new(state.id.clone(), QueueOperation::Save, Some(state), max_retries)
    }

    pub fn delete(project_id: impl Into<String>, max_retries: u32) -> Self {
        Self::new(project_id, QueueOperation::Delete, None, max_retries)
    }

    pub fn is_exhausted(&self) -> bool {
        self.retry_count > self.max_retries
    }

    fn carries_state(&self) -> bool {
        matches!(self.operation, QueueOperation::Save | QueueOperation::Update)
    }
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub sent: usize,
    /// Items moved to the dead-letter list during this pass.
    pub exhausted: Vec<SyncQueueItem>,
    pub remaining: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueue {
    #[serde(default)]
    pending: VecDeque<SyncQueueItem>,
    #[serde(default)]
    exhausted: Vec<SyncQueueItem>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl SyncQueue {
    /// In-memory queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue persisted at `path`. A missing file starts an empty queue.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let mut queue = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<SyncQueue>(&content).map_err(|e| {
                StorageError::InvalidProject(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SyncQueue::default(),
            Err(e) => return Err(e.into()),
        };
        if !queue.pending.is_empty() {
            log::info!(
                "[atelier.sync.queue] Loaded {} pending item(s) from {:?}",
                queue.pending.len(),
                path
            );
        }
        queue.path = Some(path);
        Ok(queue)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = &SyncQueueItem> {
        self.pending.iter()
    }

    pub fn exhausted(&self) -> &[SyncQueueItem] {
        &self.exhausted
    }

    /// Append an item. Pending saves/updates of the same project are
    /// superseded: the newest state is the only one worth sending.
    pub fn enqueue(&mut self, item: SyncQueueItem) -> Result<(), StorageError> {
        let before = self.pending.len();
        self.pending
            .retain(|p| !(p.project_id == item.project_id && p.carries_state()));
        let superseded = before - self.pending.len();

        log::info!(
            "[atelier.sync.queue] Queued {:?} for {} ({} superseded)",
            item.operation,
            item.project_id,
            superseded
        );
        self.pending.push_back(item);
        self.persist()
    }

    /// Move a dead-lettered item back to the end of the pending queue with
    /// a fresh retry budget. Returns false if no such item exists.
    pub fn requeue_exhausted(&mut self, item_id: &str) -> Result<bool, StorageError> {
        let Some(pos) = self.exhausted.iter().position(|i| i.id == item_id) else {
            return Ok(false);
        };
        let mut item = self.exhausted.remove(pos);
        item.retry_count = 0;
        self.pending.push_back(item);
        self.persist()?;
        Ok(true)
    }

    /// Send pending items front to back.
    ///
    /// Stops at the first failure so order is preserved; the failed item's
    /// retry count goes up and, once exhausted, it moves to the dead-letter
    /// list and draining continues with the next item.
    pub fn drain_with<F>(&mut self, mut send: F) -> Result<DrainReport, StorageError>
    where
        F: FnMut(&SyncQueueItem) -> Result<(), RemoteError>,
    {
        let mut report = DrainReport::default();

        while let Some(item) = self.pending.front_mut() {
            match send(&*item) {
                Ok(()) => {
                    self.pending.pop_front();
                    report.sent += 1;
                }
                Err(e) => {
                    item.retry_count += 1;
                    if !item.is_exhausted() {
                        log::warn!(
                            "[atelier.sync.queue] Send failed for {} (attempt {}): {}",
                            item.project_id,
                            item.retry_count,
                            e
                        );
                        break;
                    }
                    if let Some(item) = self.pending.pop_front() {
                        log::error!(
                            "[atelier.sync.queue] Giving up on {:?} for {} after {} attempts: {}",
                            item.operation,
                            item.project_id,
                            item.retry_count,
                            e
                        );
                        report.exhausted.push(item.clone());
                        self.exhausted.push(item);
                    }
                }
            }
        }

        report.remaining = self.pending.len();
        self.persist()?;
        Ok(report)
    }

    fn persist(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        FileProjectStore::atomic_write(path, &content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn offline() -> RemoteError {
        RemoteError::Unavailable("offline".to_string())
    }

    #[test]
    fn test_newer_save_supersedes_pending_save() {
        let mut queue = SyncQueue::new();
        queue
            .enqueue(SyncQueueItem::save(ProjectState::new("p1", 1), 3))
            .unwrap();
        queue
            .enqueue(SyncQueueItem::save(ProjectState::new("p2", 1), 3))
            .unwrap();
        queue
            .enqueue(SyncQueueItem::save(ProjectState::new("p1", 2), 3))
            .unwrap();

        let items: Vec<_> = queue.pending().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].project_id, "p2");
        assert_eq!(items[1].data.as_ref().unwrap().updated_at, 2);
    }

    #[test]
    fn test_delete_keeps_order_with_saves() {
        let mut queue = SyncQueue::new();
        queue.enqueue(SyncQueueItem::delete("p1", 3)).unwrap();
        queue
            .enqueue(SyncQueueItem::save(ProjectState::new("p1", 2), 3))
            .unwrap();
        let ops: Vec<_> = queue.pending().map(|i| i.operation).collect();
        assert_eq!(ops, vec![QueueOperation::Delete, QueueOperation::Save]);
    }

    #[test]
    fn test_drain_sends_in_order() {
        let mut queue = SyncQueue::new();
        queue.enqueue(SyncQueueItem::delete("a", 3)).unwrap();
        queue.enqueue(SyncQueueItem::delete("b", 3)).unwrap();

        let mut sent = Vec::new();
        let report = queue
            .drain_with(|item| {
                sent.push(item.project_id.clone());
                Ok(())
            })
            .unwrap();
        assert_eq!(sent, vec!["a", "b"]);
        assert_eq!(report.sent, 2);
        assert_eq!(report.remaining, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_failure_stops_drain_and_counts_retry() {
        let mut queue = SyncQueue::new();
        queue.enqueue(SyncQueueItem::delete("a", 3)).unwrap();
        queue.enqueue(SyncQueueItem::delete("b", 3)).unwrap();

        let report = queue.drain_with(|_| Err(offline())).unwrap();
        assert_eq!(report.sent, 0);
        assert_eq!(report.remaining, 2);
        assert_eq!(queue.pending().next().unwrap().retry_count, 1);
        assert_eq!(queue.pending().nth(1).unwrap().retry_count, 0);
    }

    #[test]
    fn test_exhausted_item_moves_to_dead_letter() {
        let mut queue = SyncQueue::new();
        queue.enqueue(SyncQueueItem::delete("a", 1)).unwrap();
        queue.enqueue(SyncQueueItem::delete("b", 1)).unwrap();

        let first = queue.drain_with(|_| Err(offline())).unwrap();
        assert!(first.exhausted.is_empty());

        // Second failure exceeds maxRetries for "a"; "b" then gets its first attempt.
        let second = queue.drain_with(|_| Err(offline())).unwrap();
        assert_eq!(second.exhausted.len(), 1);
        assert_eq!(second.exhausted[0].project_id, "a");
        assert_eq!(second.remaining, 1);
        assert_eq!(queue.exhausted().len(), 1);

        let id = queue.exhausted()[0].id.clone();
        assert!(queue.requeue_exhausted(&id).unwrap());
        assert!(queue.exhausted().is_empty());
        assert_eq!(queue.len(), 2);
        assert!(!queue.requeue_exhausted(&id).unwrap());
    }

    #[test]
    fn test_queue_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");

        let mut queue = SyncQueue::open(&path).unwrap();
        queue
            .enqueue(SyncQueueItem::save(ProjectState::new("p1", 7), 3))
            .unwrap();
        queue.drain_with(|_| Err(offline())).unwrap();

        let reopened = SyncQueue::open(&path).unwrap();
        let item = reopened.pending().next().unwrap();
        assert_eq!(item.project_id, "p1");
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.data, Some(ProjectState::new("p1", 7)));
    }

    #[test]
    fn test_item_json_shape() {
        let item = SyncQueueItem::delete("p1", 3);
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["projectId"], "p1");
        assert_eq!(value["operation"], "delete");
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["maxRetries"], 3);
        assert!(value["data"].is_null());
    }
}
