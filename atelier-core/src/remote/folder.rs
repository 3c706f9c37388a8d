/// Remote store backed by a shared directory (network mount, synced folder).
///
/// Each user gets a subdirectory; each project is one JSON document in it,
/// named like the local store names its files. Subscriptions watch the user
/// directory with notify-debouncer-full and re-read the document after every
/// debounced batch that touches it.
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult};

use super::{RemoteError, RemoteProjects, SnapshotCallback, Subscription};
use crate::storage::local::FileProjectStore;
use crate::types::ProjectState;

/// Debounce window for cloud-synced folders that write in bursts.
const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

pub struct FolderRemote {
    root: PathBuf,
}

impl FolderRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn user_dir(&self, user_id: &str) -> Result<PathBuf, RemoteError> {
        if user_id.is_empty() {
            return Err(RemoteError::Unauthenticated);
        }
        Ok(self.root.join(user_id))
    }

    pub fn document_path(&self, user_id: &str, project_id: &str) -> Result<PathBuf, RemoteError> {
        Ok(self
            .user_dir(user_id)?
            .join(FileProjectStore::file_name_for(project_id)))
    }
}

/// Current document at `path`, `None` if absent.
fn read_document(path: &Path, project_id: &str) -> Result<Option<ProjectState>, RemoteError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let state: ProjectState = serde_json::from_str(&content)?;
    if state.id != project_id {
        return Err(RemoteError::Rejected {
            project_id: project_id.to_string(),
            reason: format!("{} holds project {}", path.display(), state.id),
        });
    }
    Ok(Some(state))
}

fn touches(result: &DebounceEventResult, target: &Path) -> bool {
    let Some(name) = target.file_name() else {
        return false;
    };
    match result {
        Ok(events) => events.iter().any(|event| {
            !matches!(event.kind, EventKind::Access(_))
                && event.paths.iter().any(|p| p.file_name() == Some(name))
        }),
        Err(errors) => {
            for e in errors {
                log::error!("[atelier.remote.folder] Watch error: {}", e);
            }
            false
        }
    }
}

impl RemoteProjects for FolderRemote {
    fn subscribe(
        &self,
        project_id: &str,
        user_id: &str,
        on_change: SnapshotCallback,
    ) -> Result<Subscription, RemoteError> {
        let dir = self.user_dir(user_id)?;
        fs::create_dir_all(&dir)?;
        let path = self.document_path(user_id, project_id)?;

        on_change(read_document(&path, project_id)?);

        let watched = path.clone();
        let id = project_id.to_string();
        let mut debouncer = new_debouncer(
            DEBOUNCE_DURATION,
            None,
            move |result: DebounceEventResult| {
                if !touches(&result, &watched) {
                    return;
                }
                match read_document(&watched, &id) {
                    Ok(snapshot) => on_change(snapshot),
                    Err(e) => {
                        log::warn!(
                            "[atelier.remote.folder] Ignoring unreadable document for {}: {}",
                            id,
                            e
                        );
                    }
                }
            },
        )
        .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        debouncer
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

        log::info!(
            "[atelier.remote.folder] Watching project {} at {:?}",
            project_id,
            path
        );

        let project_id = project_id.to_string();
        Ok(Subscription::new(move || {
            drop(debouncer);
            log::info!("[atelier.remote.folder] Stopped watching project {}", project_id);
        }))
    }

    fn push_project(&self, user_id: &str, state: &ProjectState) -> Result<(), RemoteError> {
        fs::create_dir_all(self.user_dir(user_id)?)?;
        let path = self.document_path(user_id, &state.id)?;
        let content = serde_json::to_string_pretty(state)?;
        FileProjectStore::atomic_write(&path, &content)?;
        log::debug!(
            "[atelier.remote.folder] Pushed project {} (syncVersion {})",
            state.id,
            state.sync_version
        );
        Ok(())
    }

    fn delete_project(&self, user_id: &str, project_id: &str) -> Result<(), RemoteError> {
        match fs::remove_file(self.document_path(user_id, project_id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
