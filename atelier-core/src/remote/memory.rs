/// In-process remote document store with live subscribers.
///
/// Behaves like a hosted document database: every write is delivered to all
/// subscribers of that document, the writer's own subscription included.
/// Connectivity can be switched off to exercise offline handling.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{RemoteError, RemoteProjects, SnapshotCallback, Subscription};
use crate::types::ProjectState;

type SharedCallback = Arc<dyn Fn(Option<ProjectState>) + Send + Sync>;

struct Subscriber {
    project_id: String,
    callback: SharedCallback,
}

#[derive(Default)]
struct RemoteInner {
    documents: HashMap<String, ProjectState>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    offline: bool,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<RemoteInner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_online(&self, online: bool) {
        self.inner.lock().unwrap().offline = !online;
        log::info!(
            "[atelier.remote.memory] Remote is now {}",
            if online { "online" } else { "offline" }
        );
    }

    pub fn is_online(&self) -> bool {
        !self.inner.lock().unwrap().offline
    }

    pub fn document(&self, project_id: &str) -> Option<ProjectState> {
        self.inner.lock().unwrap().documents.get(project_id).cloned()
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .subscribers
            .values()
            .filter(|s| s.project_id == project_id)
            .count()
    }

    /// Write a document the way another device would, regardless of this
    /// client's connectivity.
    pub fn put_document(&self, state: ProjectState) {
        let project_id = state.id.clone();
        self.inner
            .lock()
            .unwrap()
            .documents
            .insert(project_id.clone(), state.clone());
        self.notify(&project_id, Some(state));
    }

    /// Remove a document the way another device would.
    pub fn remove_document(&self, project_id: &str) {
        self.inner.lock().unwrap().documents.remove(project_id);
        self.notify(project_id, None);
    }

    /// Deliver a snapshot to every subscriber of a project.
    /// Callbacks run outside the lock so they may call back into the remote.
    fn notify(&self, project_id: &str, snapshot: Option<ProjectState>) {
        let callbacks: Vec<SharedCallback> = self
            .inner
            .lock()
            .unwrap()
            .subscribers
            .values()
            .filter(|s| s.project_id == project_id)
            .map(|s| s.callback.clone())
            .collect();

        for callback in callbacks {
            callback(snapshot.clone());
        }
    }

    fn ensure_reachable(&self, user_id: &str) -> Result<(), RemoteError> {
        if user_id.is_empty() {
            return Err(RemoteError::Unauthenticated);
        }
        if !self.is_online() {
            return Err(RemoteError::Unavailable("memory remote is offline".to_string()));
        }
        Ok(())
    }
}

impl RemoteProjects for MemoryRemote {
    fn subscribe(
        &self,
        project_id: &str,
        user_id: &str,
        on_change: SnapshotCallback,
    ) -> Result<Subscription, RemoteError> {
        self.ensure_reachable(user_id)?;

        let callback: SharedCallback = Arc::from(on_change);
        let (subscriber_id, current) = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_subscriber;
            inner.next_subscriber += 1;
            inner.subscribers.insert(
                id,
                Subscriber {
                    project_id: project_id.to_string(),
                    callback: callback.clone(),
                },
            );
            (id, inner.documents.get(project_id).cloned())
        };

        callback(current);

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().unwrap().subscribers.remove(&subscriber_id);
            }
        }))
    }

    fn push_project(&self, user_id: &str, state: &ProjectState) -> Result<(), RemoteError> {
        self.ensure_reachable(user_id)?;
        self.put_document(state.clone());
        Ok(())
    }

    fn delete_project(&self, user_id: &str, project_id: &str) -> Result<(), RemoteError> {
        self.ensure_reachable(user_id)?;
        self.remove_document(project_id);
        Ok(())
    }
}
