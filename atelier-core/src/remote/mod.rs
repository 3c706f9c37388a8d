#[cfg(feature = "folder-remote")]
pub mod folder;
pub mod memory;

use std::fmt;

use crate::types::ProjectState;

/// Invoked with the current remote document on every remote change;
/// `None` when the document does not exist (yet).
pub type SnapshotCallback = Box<dyn Fn(Option<ProjectState>) + Send + Sync>;

/// Remote document store with per-project live subscriptions.
/// Implementations: MemoryRemote (in-process), FolderRemote (shared directory).
pub trait RemoteProjects: Send + Sync {
    /// Open a live subscription to one project document.
    ///
    /// Implementations call `on_change` once with the current document (or
    /// `None`) and again on every subsequent write, including writes made by
    /// this client. The subscription stays open until the returned handle is
    /// released.
    fn subscribe(
        &self,
        project_id: &str,
        user_id: &str,
        on_change: SnapshotCallback,
    ) -> Result<Subscription, RemoteError>;

    /// Write a project's full state to the remote store.
    fn push_project(&self, user_id: &str, state: &ProjectState) -> Result<(), RemoteError>;

    /// Delete a project document from the remote store.
    fn delete_project(&self, user_id: &str, project_id: &str) -> Result<(), RemoteError>;
}

/// Handle for a live subscription.
/// Released on `unsubscribe` or on drop, whichever comes first.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release_now();
    }

    pub fn is_active(&self) -> bool {
        self.release.is_some()
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    #[error("Not authenticated")]
    Unauthenticated,

    #[error("Remote rejected {project_id}: {reason}")]
    Rejected { project_id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
