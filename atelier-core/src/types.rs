use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Domain field names of a styling project document.
pub const FIELD_MODEL_DESCRIPTION: &str = "modelDescription";
pub const FIELD_MODEL_IMAGE: &str = "modelImage";
pub const FIELD_GENERATION_SETTINGS: &str = "generationSettings";
pub const FIELD_ACTIVE_OUTFIT: &str = "activeOutfit";
pub const FIELD_WARDROBE: &str = "wardrobe";
pub const FIELD_GENERATION_HISTORY: &str = "generationHistory";
pub const FIELD_VIDEO_HISTORY: &str = "videoHistory";
pub const FIELD_STYLING_HISTORY: &str = "stylingHistory";

/// Canonical field order. Conflict lists and merge output follow it;
/// fields not listed here come after, sorted by name.
pub const DEFAULT_FIELD_ORDER: &[&str] = &[
    FIELD_MODEL_DESCRIPTION,
    FIELD_MODEL_IMAGE,
    FIELD_GENERATION_SETTINGS,
    FIELD_ACTIVE_OUTFIT,
    FIELD_WARDROBE,
    FIELD_GENERATION_HISTORY,
    FIELD_VIDEO_HISTORY,
    FIELD_STYLING_HISTORY,
];

/// Append-only fields. They are unioned on merge and never reported as conflicts.
pub const DEFAULT_MONOTONIC_FIELDS: &[&str] = &[
    FIELD_WARDROBE,
    FIELD_GENERATION_HISTORY,
    FIELD_VIDEO_HISTORY,
    FIELD_STYLING_HISTORY,
];

/// Current wall clock in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// The unit of synchronization: one project document.
///
/// Domain fields are kept opaque and flattened into the same JSON object as
/// the sync metadata, so the on-disk and remote shape is the plain document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub id: String,
    pub updated_at: i64,
    #[serde(default)]
    pub sync_version: u64,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl ProjectState {
    pub fn new(id: impl Into<String>, updated_at: i64) -> Self {
        Self {
            id: id.into(),
            updated_at,
            sync_version: 0,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_sync_version(mut self, sync_version: u64) -> Self {
        self.sync_version = sync_version;
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Value of a domain field. An explicit `null` reads as absent.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name).filter(|v| !v.is_null())
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// True when every domain field matches, ignoring `updatedAt` and `syncVersion`.
    pub fn same_content(&self, other: &ProjectState) -> bool {
        self.fields
            .keys()
            .chain(other.fields.keys())
            .all(|name| self.field(name) == other.field(name))
    }
}

/// Which domain fields exist, in what order they are reported, and which of
/// them merge additively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSchema {
    #[serde(default)]
    pub order: Vec<String>,
    #[serde(default)]
    pub monotonic: BTreeSet<String>,
}

impl Default for FieldSchema {
    fn default() -> Self {
        Self {
            order: DEFAULT_FIELD_ORDER.iter().map(|s| s.to_string()).collect(),
            monotonic: DEFAULT_MONOTONIC_FIELDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl FieldSchema {
    pub fn is_monotonic(&self, field: &str) -> bool {
        self.monotonic.contains(field)
    }

    /// Union of the field names of both states: schema order first, then the
    /// remaining names sorted.
    pub fn ordered_fields(&self, a: &ProjectState, b: &ProjectState) -> Vec<String> {
        let mut present: BTreeSet<&str> = a
            .fields
            .keys()
            .chain(b.fields.keys())
            .map(String::as_str)
            .collect();

        let mut ordered = Vec::with_capacity(present.len());
        for name in &self.order {
            if present.remove(name.as_str()) {
                ordered.push(name.clone());
            }
        }
        ordered.extend(present.into_iter().map(str::to_string));
        ordered
    }
}

/// A field-level disagreement between a local and a remote snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub field: String,
    pub local: Option<Value>,
    pub remote: Option<Value>,
    /// When the conflict was detected, not when either value was written.
    pub timestamp: i64,
}

impl Conflict {
    /// The same conflict seen from the other side.
    pub fn swapped(&self) -> Self {
        Self {
            field: self.field.clone(),
            local: self.remote.clone(),
            remote: self.local.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Pending manual resolution for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictData {
    pub project_id: String,
    pub local: ProjectState,
    pub remote: ProjectState,
    pub conflicts: Vec<Conflict>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Syncing,
    Offline,
    Error,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Offline => "offline",
            SyncStatus::Error => "error",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_project_state_json_shape() {
        let state = ProjectState::new("p1", 1000)
            .with_sync_version(3)
            .with_field(FIELD_MODEL_DESCRIPTION, json!("tall model"))
            .with_field(FIELD_WARDROBE, json!([{"id": "item1"}]));

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["id"], "p1");
        assert_eq!(value["updatedAt"], 1000);
        assert_eq!(value["syncVersion"], 3);
        assert_eq!(value["modelDescription"], "tall model");
        assert_eq!(value["wardrobe"][0]["id"], "item1");
    }

    #[test]
    fn test_project_state_round_trip_keeps_nested_history() {
        let state = ProjectState::new("p1", 1000)
            .with_sync_version(7)
            .with_field(
                FIELD_GENERATION_HISTORY,
                json!([{"id": "g1", "timestamp": 5, "settings": {"steps": 30, "seed": null}}]),
            )
            .with_field(FIELD_STYLING_HISTORY, json!({"look-1": [{"id": "s1"}]}));

        let text = serde_json::to_string(&state).unwrap();
        let back: ProjectState = serde_json::from_str(&text).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_missing_sync_version_defaults_to_zero() {
        let state: ProjectState =
            serde_json::from_str(r#"{"id":"p1","updatedAt":5,"modelDescription":"x"}"#).unwrap();
        assert_eq!(state.sync_version, 0);
        assert_eq!(state.field(FIELD_MODEL_DESCRIPTION), Some(&json!("x")));
    }

    #[test]
    fn test_null_field_reads_as_absent() {
        let a = ProjectState::new("p1", 1).with_field("modelImage", Value::Null);
        let b = ProjectState::new("p1", 2);
        assert_eq!(a.field("modelImage"), None);
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_ordered_fields_schema_first_then_sorted() {
        let a = ProjectState::new("p1", 1)
            .with_field("zeta", json!(1))
            .with_field(FIELD_WARDROBE, json!([]));
        let b = ProjectState::new("p1", 1)
            .with_field("alpha", json!(1))
            .with_field(FIELD_MODEL_DESCRIPTION, json!("m"));

        let order = FieldSchema::default().ordered_fields(&a, &b);
        assert_eq!(order, vec![FIELD_MODEL_DESCRIPTION, FIELD_WARDROBE, "alpha", "zeta"]);
    }

    #[test]
    fn test_sync_status_serializes_lowercase() {
        assert_eq!(serde_json::to_value(SyncStatus::Conflict).unwrap(), json!("conflict"));
        assert_eq!(SyncStatus::Offline.to_string(), "offline");
    }
}
