/// In-process project storage. Used for ephemeral sessions and tests.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{ensure_key_matches, ProjectStore, StorageError};
use crate::types::ProjectState;

#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<HashMap<String, ProjectState>>,
    writes: AtomicUsize,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes that actually changed stored content.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl ProjectStore for MemoryProjectStore {
    fn load_project(&self, project_id: &str) -> Result<Option<ProjectState>, StorageError> {
        Ok(self.projects.read().unwrap().get(project_id).cloned())
    }

    fn save_project(&self, project_id: &str, state: &ProjectState) -> Result<(), StorageError> {
        ensure_key_matches(project_id, state)?;
        let mut projects = self.projects.write().unwrap();
        if projects.get(project_id) == Some(state) {
            return Ok(());
        }
        projects.insert(project_id.to_string(), state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete_project(&self, project_id: &str) -> Result<(), StorageError> {
        if self.projects.write().unwrap().remove(project_id).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn list_projects(&self) -> Result<Vec<String>, StorageError> {
        let mut ids: Vec<String> = self.projects.read().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
