/// Local filesystem storage backend.
///
/// Keeps one JSON document per project under a root directory with:
/// - SHA-256 file names (first 12 hex chars of the project id)
/// - Atomic writes (write to .tmp, fsync, rename)
/// - Content hashing so repeated identical writes skip the disk
/// - Mutex-guarded writes per project to prevent concurrent modification

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use sha2::{Digest, Sha256};

use super::{ensure_key_matches, ProjectStore, StorageError};
use crate::types::ProjectState;

/// What we last read or wrote for a project.
#[derive(Debug, Clone)]
struct StoredProject {
    /// SHA-256 of the last read/written content
    content_hash: String,
    /// Monotonic write generation, incremented on every change
    generation: u64,
}

/// Project storage backed by a directory of JSON files.
pub struct FileProjectStore {
    root: PathBuf,
    /// project_id -> last known content
    projects: RwLock<HashMap<String, StoredProject>>,
    /// Per-project write mutex to prevent concurrent modification
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Global generation counter (monotonic, shared across all projects)
    next_generation: AtomicU64,
}

impl FileProjectStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            projects: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic file name for a project id: SHA-256 first 12 hex chars.
    pub fn file_name_for(project_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(project_id.as_bytes());
        let result = hasher.finalize();
        format!("{}.json", hex::encode(&result[..6]))
    }

    pub fn project_path(&self, project_id: &str) -> PathBuf {
        self.root.join(Self::file_name_for(project_id))
    }

    /// Write generation of a project (changes whenever its file is rewritten).
    pub fn generation(&self, project_id: &str) -> Option<u64> {
        self.projects
            .read()
            .unwrap()
            .get(project_id)
            .map(|p| p.generation)
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn content_hash(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn remember(&self, project_id: &str, content_hash: String) {
        let generation = self.next_generation();
        self.projects.write().unwrap().insert(
            project_id.to_string(),
            StoredProject {
                content_hash,
                generation,
            },
        );
    }

    fn get_write_lock(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn read_state(path: &Path) -> Result<(ProjectState, String), StorageError> {
        let content = fs::read_to_string(path)?;
        let state: ProjectState = serde_json::from_str(&content)
            .map_err(|e| StorageError::InvalidProject(format!("{}: {}", path.display(), e)))?;
        Ok((state, content))
    }

    /// Atomic write with fsync: write to .tmp, fsync, rename, fsync directory.
    /// Refuses to write empty content over a non-empty file.
    pub(crate) fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
        if content.trim().is_empty() {
            if let Ok(existing) = fs::read_to_string(path) {
                if !existing.trim().is_empty() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "Refusing to overwrite non-empty file with empty content",
                    ));
                }
            }
        }

        let tmp_path = path.with_extension("atelier-sync.tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        // fsync directory for rename durability
        if let Some(dir) = path.parent() {
            if let Ok(d) = fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }
        Ok(())
    }
}

impl ProjectStore for FileProjectStore {
    fn load_project(&self, project_id: &str) -> Result<Option<ProjectState>, StorageError> {
        let path = self.project_path(project_id);
        if !path.exists() {
            return Ok(None);
        }

        let (state, content) = Self::read_state(&path)?;
        if state.id != project_id {
            return Err(StorageError::InvalidProject(format!(
                "{} holds project {}, expected {}",
                path.display(),
                state.id,
                project_id
            )));
        }

        let hash = Self::content_hash(&content);
        let unchanged = self
            .projects
            .read()
            .unwrap()
            .get(project_id)
            .is_some_and(|p| p.content_hash == hash);
        if !unchanged {
            self.remember(project_id, hash);
        }
        Ok(Some(state))
    }

    fn save_project(&self, project_id: &str, state: &ProjectState) -> Result<(), StorageError> {
        ensure_key_matches(project_id, state)?;

        let lock = self.get_write_lock(project_id);
        let _guard = lock.lock().unwrap();

        let path = self.project_path(project_id);
        let content = serde_json::to_string_pretty(state)?;
        let hash = Self::content_hash(&content);

        let unchanged = self
            .projects
            .read()
            .unwrap()
            .get(project_id)
            .is_some_and(|p| p.content_hash == hash);
        if unchanged && path.exists() {
            log::debug!("[atelier.storage.save] {} unchanged, skipping write", project_id);
            return Ok(());
        }

        Self::atomic_write(&path, &content)?;
        self.remember(project_id, hash);
        log::debug!(
            "[atelier.storage.save] Wrote project {} (syncVersion {})",
            project_id,
            state.sync_version
        );
        Ok(())
    }

    fn delete_project(&self, project_id: &str) -> Result<(), StorageError> {
        let lock = self.get_write_lock(project_id);
        let _guard = lock.lock().unwrap();

        match fs::remove_file(self.project_path(project_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.projects.write().unwrap().remove(project_id);
        Ok(())
    }

    fn list_projects(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_state(&path) {
                Ok((state, _)) => ids.push(state.id),
                Err(e) => {
                    log::warn!(
                        "[atelier.storage.list] Skipping unreadable project file {:?}: {}",
                        path,
                        e
                    );
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
