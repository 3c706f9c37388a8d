pub mod conflict;
pub mod entry_identity;
pub mod merge;

use crate::types::ProjectState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("Project mismatch: local {local}, remote {remote}")]
    MismatchedProject { local: String, remote: String },

    #[error("Invalid merge strategy: {0}")]
    InvalidStrategy(String),
}

/// Both snapshots must describe the same project.
pub(crate) fn ensure_same_project(
    local: &ProjectState,
    remote: &ProjectState,
) -> Result<(), MergeError> {
    if local.id != remote.id {
        return Err(MergeError::MismatchedProject {
            local: local.id.clone(),
            remote: remote.id.clone(),
        });
    }
    Ok(())
}
