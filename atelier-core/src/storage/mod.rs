pub mod local;
pub mod memory;

use crate::types::ProjectState;

/// Abstract storage trait for on-device project persistence.
/// Implementations: FileProjectStore (filesystem), MemoryProjectStore (in-process).
///
/// A store only persists what it is given; it never merges.
pub trait ProjectStore: Send + Sync {
    /// Read a project's full state. `Ok(None)` when nothing is stored for the id.
    fn load_project(&self, project_id: &str) -> Result<Option<ProjectState>, StorageError>;

    /// Write a project's full state. Repeating an identical write is a no-op.
    fn save_project(&self, project_id: &str, state: &ProjectState) -> Result<(), StorageError>;

    /// Remove a project. Removing a missing project succeeds.
    fn delete_project(&self, project_id: &str) -> Result<(), StorageError>;

    /// Ids of all stored projects, sorted.
    fn list_projects(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Project id mismatch: stored under {key}, state is {state}")]
    IdMismatch { key: String, state: String },

    #[error("Invalid project file: {0}")]
    InvalidProject(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub(crate) fn ensure_key_matches(project_id: &str, state: &ProjectState) -> Result<(), StorageError> {
    if state.id != project_id {
        return Err(StorageError::IdMismatch {
            key: project_id.to_string(),
            state: state.id.clone(),
        });
    }
    Ok(())
}
