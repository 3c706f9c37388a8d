/// Sync settings, persisted as `settings.json` next to the local project store.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::merge::merge::{MergePolicy, TieBreak};
use crate::storage::local::FileProjectStore;
use crate::storage::StorageError;
use crate::sync::queue::DEFAULT_MAX_RETRIES;
use crate::types::FieldSchema;

pub const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// Resolve conflicts with a smart merge instead of prompting.
    #[serde(default = "default_auto_merge")]
    pub auto_merge: bool,
    #[serde(default)]
    pub tie_break: TieBreak,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How long to wait for the first remote snapshot before settling on `synced`.
    #[serde(default = "default_initial_sync_timeout_ms")]
    pub initial_sync_timeout_ms: u64,
    #[serde(default)]
    pub schema: FieldSchema,
}

fn default_auto_merge() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_sync_timeout_ms() -> u64 {
    10_000
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_merge: default_auto_merge(),
            tie_break: TieBreak::default(),
            max_retries: default_max_retries(),
            initial_sync_timeout_ms: default_initial_sync_timeout_ms(),
            schema: FieldSchema::default(),
        }
    }
}

impl SyncSettings {
    pub fn merge_policy(&self) -> MergePolicy {
        MergePolicy {
            tie_break: self.tie_break,
            schema: self.schema.clone(),
        }
    }
}

/// Load settings from path. Returns defaults if the file doesn't exist or can't be parsed.
pub fn load_settings(path: &Path) -> SyncSettings {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!(
                "[atelier.config] Failed to parse settings {}: {}",
                path.display(),
                e
            );
            SyncSettings::default()
        }),
        Err(_) => {
            log::info!(
                "[atelier.config] No settings at {}, using defaults",
                path.display()
            );
            SyncSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &SyncSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    FileProjectStore::atomic_write(path, &content)?;
    Ok(())
}
