/// Observable sync status for the active project.
///
/// One publisher owns the current `SyncSnapshot`; the orchestrator is the
/// only writer. Every transition replaces the whole snapshot in a single
/// `watch` send, so readers never observe a status paired with stale
/// conflict or error data.
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{ConflictData, SyncStatus};

/// Why the last sync step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SyncFailure {
    #[serde(rename_all = "camelCase")]
    LocalLoad { project_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    LocalSave { project_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    RemoteSubscription { project_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    MismatchedProject { expected: String, received: String },
    #[serde(rename_all = "camelCase")]
    Merge { project_id: String, message: String },
    #[serde(rename_all = "camelCase")]
    QueueExhausted { item_id: String, project_id: String },
}

impl std::fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalLoad { project_id, message } => {
                write!(f, "failed to load {}: {}", project_id, message)
            }
            Self::LocalSave { project_id, message } => {
                write!(f, "failed to save {}: {}", project_id, message)
            }
            Self::RemoteSubscription { project_id, message } => {
                write!(f, "failed to subscribe to {}: {}", project_id, message)
            }
            Self::MismatchedProject { expected, received } => {
                write!(f, "expected project {}, received {}", expected, received)
            }
            Self::Merge { project_id, message } => {
                write!(f, "failed to merge {}: {}", project_id, message)
            }
            Self::QueueExhausted { item_id, project_id } => write!(
                f,
                "sync queue item {} for {} exhausted its retries",
                item_id, project_id
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub last_sync_time: Option<i64>,
    pub conflict_data: Option<ConflictData>,
    pub error: Option<SyncFailure>,
}

impl Default for SyncSnapshot {
    fn default() -> Self {
        Self {
            status: SyncStatus::Synced,
            last_sync_time: None,
            conflict_data: None,
            error: None,
        }
    }
}

pub struct SyncStatusPublisher {
    tx: watch::Sender<SyncSnapshot>,
}

impl Default for SyncStatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncSnapshot::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> SyncStatusReader {
        SyncStatusReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn current(&self) -> SyncSnapshot {
        self.tx.borrow().clone()
    }

    fn publish(&self, next: SyncSnapshot) {
        let previous = self.tx.send_replace(next);
        let current = self.tx.borrow();
        if previous.status != current.status {
            log::info!(
                "[atelier.sync.status] {} -> {}",
                previous.status,
                current.status
            );
        }
    }

    pub(crate) fn set_syncing(&self) {
        let last_sync_time = self.tx.borrow().last_sync_time;
        self.publish(SyncSnapshot {
            status: SyncStatus::Syncing,
            last_sync_time,
            conflict_data: None,
            error: None,
        });
    }

    pub(crate) fn set_synced(&self, at: i64) {
        self.publish(SyncSnapshot {
            status: SyncStatus::Synced,
            last_sync_time: Some(at),
            conflict_data: None,
            error: None,
        });
    }

    pub(crate) fn set_conflict(&self, data: ConflictData) {
        log::info!(
            "[atelier.sync.status] {} conflicting field(s) in project {}",
            data.conflicts.len(),
            data.project_id
        );
        let last_sync_time = self.tx.borrow().last_sync_time;
        self.publish(SyncSnapshot {
            status: SyncStatus::Conflict,
            last_sync_time,
            conflict_data: Some(data),
            error: None,
        });
    }

    pub(crate) fn set_error(&self, failure: SyncFailure) {
        log::warn!("[atelier.sync.status] Sync error: {}", failure);
        let last_sync_time = self.tx.borrow().last_sync_time;
        self.publish(SyncSnapshot {
            status: SyncStatus::Error,
            last_sync_time,
            conflict_data: None,
            error: Some(failure),
        });
    }

    pub(crate) fn set_offline(&self, failure: SyncFailure) {
        log::warn!("[atelier.sync.status] Offline: {}", failure);
        let last_sync_time = self.tx.borrow().last_sync_time;
        self.publish(SyncSnapshot {
            status: SyncStatus::Offline,
            last_sync_time,
            conflict_data: None,
            error: Some(failure),
        });
    }

    /// Back to the idle value, keeping the last sync time.
    pub(crate) fn reset(&self) {
        let last_sync_time = self.tx.borrow().last_sync_time;
        self.publish(SyncSnapshot {
            last_sync_time,
            ..SyncSnapshot::default()
        });
    }
}

/// Read side of the status publisher. Cheap to clone.
#[derive(Clone)]
pub struct SyncStatusReader {
    rx: watch::Receiver<SyncSnapshot>,
}

impl SyncStatusReader {
    pub fn current(&self) -> SyncSnapshot {
        self.rx.borrow().clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.rx.borrow().status
    }

    /// Wait for the next transition. `None` once the publisher is gone.
    pub async fn changed(&mut self) -> Option<SyncSnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Conflict, ProjectState};
    use serde_json::json;

    fn conflict_data() -> ConflictData {
        let local = ProjectState::new("p1", 1).with_field("modelDescription", json!("tall"));
        let remote = ProjectState::new("p1", 1).with_field("modelDescription", json!("short"));
        ConflictData {
            project_id: "p1".to_string(),
            conflicts: vec![Conflict {
                field: "modelDescription".to_string(),
                local: Some(json!("tall")),
                remote: Some(json!("short")),
                timestamp: 5,
            }],
            local,
            remote,
        }
    }

    #[test]
    fn test_initial_snapshot() {
        let publisher = SyncStatusPublisher::new();
        let snapshot = publisher.current();
        assert_eq!(snapshot.status, SyncStatus::Synced);
        assert!(snapshot.last_sync_time.is_none());
        assert!(snapshot.conflict_data.is_none());
        assert!(snapshot.error.is_none());
    }

    #[test]
    fn test_transitions_replace_whole_snapshot() {
        let publisher = SyncStatusPublisher::new();
        let reader = publisher.subscribe();

        publisher.set_conflict(conflict_data());
        assert_eq!(reader.status(), SyncStatus::Conflict);
        assert_eq!(reader.current().conflict_data.unwrap().conflicts.len(), 1);

        publisher.set_synced(42);
        let snapshot = reader.current();
        assert_eq!(snapshot.status, SyncStatus::Synced);
        assert_eq!(snapshot.last_sync_time, Some(42));
        assert!(snapshot.conflict_data.is_none());

        publisher.set_error(SyncFailure::LocalSave {
            project_id: "p1".to_string(),
            message: "disk full".to_string(),
        });
        let snapshot = reader.current();
        assert_eq!(snapshot.status, SyncStatus::Error);
        assert_eq!(snapshot.last_sync_time, Some(42));
        assert!(matches!(snapshot.error, Some(SyncFailure::LocalSave { .. })));

        publisher.reset();
        assert_eq!(reader.current(), SyncSnapshot {
            last_sync_time: Some(42),
            ..SyncSnapshot::default()
        });
    }

    #[tokio::test]
    async fn test_reader_observes_changes() {
        let publisher = SyncStatusPublisher::new();
        let mut reader = publisher.subscribe();

        publisher.set_syncing();
        let snapshot = reader.changed().await.unwrap();
        assert_eq!(snapshot.status, SyncStatus::Syncing);
    }

    #[test]
    fn test_failure_json_shape() {
        let failure = SyncFailure::QueueExhausted {
            item_id: "i1".to_string(),
            project_id: "p1".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"kind": "queueExhausted", "itemId": "i1", "projectId": "p1"})
        );
    }
}
