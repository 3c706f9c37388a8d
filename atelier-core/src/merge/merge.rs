/// Two-way merge of a local and a remote project snapshot.
///
/// Strategies, applied to conflicting (non-monotonic) fields:
/// - prefer-local: local value wins
/// - prefer-remote: remote value wins
/// - smart: value from the state with the higher updatedAt wins, field by
///   field; an exact tie goes to the tie-break policy (remote by default)
///
/// Monotonic fields merge the same way under every strategy:
/// - arrays: union by entry id, local order first, then remote-only entries
/// - maps keyed by sub-id: union of keys, values merged recursively
/// - same entry on both sides: higher revision, then later timestamp wins;
///   an undecided entry follows the active strategy
///
/// The merged state always gets syncVersion = max + 1 and an updatedAt no
/// earlier than either input.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::entry_identity::{compare_freshness, extract_entry_id};
use super::{ensure_same_project, MergeError};
use crate::types::{now_millis, FieldSchema, ProjectState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    PreferLocal,
    PreferRemote,
    #[default]
    Smart,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::PreferLocal => "prefer-local",
            MergeStrategy::PreferRemote => "prefer-remote",
            MergeStrategy::Smart => "smart",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prefer-local" => Ok(MergeStrategy::PreferLocal),
            "prefer-remote" => Ok(MergeStrategy::PreferRemote),
            "smart" => Ok(MergeStrategy::Smart),
            other => Err(MergeError::InvalidStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side wins a smart merge when both states carry the same updatedAt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    #[default]
    PreferRemote,
    PreferLocal,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePolicy {
    pub tie_break: TieBreak,
    pub schema: FieldSchema,
}

/// Stateless merger configured with a policy.
#[derive(Debug, Clone, Default)]
pub struct Merger {
    policy: MergePolicy,
}

impl Merger {
    pub fn new(policy: MergePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    pub fn merge(
        &self,
        local: &ProjectState,
        remote: &ProjectState,
        strategy: MergeStrategy,
    ) -> Result<ProjectState, MergeError> {
        self.merge_at(local, remote, strategy, now_millis())
    }

    /// Merge with an explicit merge time (milliseconds).
    pub fn merge_at(
        &self,
        local: &ProjectState,
        remote: &ProjectState,
        strategy: MergeStrategy,
        now: i64,
    ) -> Result<ProjectState, MergeError> {
        ensure_same_project(local, remote)?;

        let remote_wins = match strategy {
            MergeStrategy::PreferLocal => false,
            MergeStrategy::PreferRemote => true,
            MergeStrategy::Smart => self.remote_is_fresher(local, remote),
        };

        let schema = &self.policy.schema;
        let mut fields = BTreeMap::new();
        let mut taken_remote: usize = 0;

        for name in schema.ordered_fields(local, remote) {
            let local_raw = local.fields.get(&name);
            let remote_raw = remote.fields.get(&name);
            let ours = local.field(&name);
            let theirs = remote.field(&name);

            let merged = if schema.is_monotonic(&name) {
                merge_monotonic(ours, theirs, remote_wins).or_else(|| local_raw.or(remote_raw).cloned())
            } else if ours == theirs {
                local_raw.or(remote_raw).cloned()
            } else if remote_wins {
                taken_remote += 1;
                remote_raw.cloned()
            } else {
                local_raw.cloned()
            };

            if let Some(value) = merged {
                fields.insert(name, value);
            }
        }

        let merged = ProjectState {
            id: local.id.clone(),
            updated_at: now.max(local.updated_at).max(remote.updated_at),
            sync_version: local.sync_version.max(remote.sync_version) + 1,
            fields,
        };

        log::debug!(
            "[atelier.merge] {} merge of {}: v{} + v{} -> v{} ({} fields from remote)",
            strategy,
            merged.id,
            local.sync_version,
            remote.sync_version,
            merged.sync_version,
            taken_remote
        );

        Ok(merged)
    }

    fn remote_is_fresher(&self, local: &ProjectState, remote: &ProjectState) -> bool {
        match local.updated_at.cmp(&remote.updated_at) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.policy.tie_break == TieBreak::PreferRemote,
        }
    }
}

/// Merge two snapshots with the default policy.
pub fn merge_project_states(
    local: &ProjectState,
    remote: &ProjectState,
    strategy: MergeStrategy,
) -> Result<ProjectState, MergeError> {
    Merger::default().merge(local, remote, strategy)
}

fn merge_monotonic(ours: Option<&Value>, theirs: Option<&Value>, remote_wins: bool) -> Option<Value> {
    match (ours, theirs) {
        (None, None) => None,
        (Some(v), None) | (None, Some(v)) => Some(v.clone()),
        (Some(l), Some(r)) => Some(merge_monotonic_value(l, r, remote_wins)),
    }
}

fn merge_monotonic_value(ours: &Value, theirs: &Value, remote_wins: bool) -> Value {
    if ours == theirs {
        return ours.clone();
    }
    match (ours, theirs) {
        (Value::Array(l), Value::Array(r)) => Value::Array(union_entries(l, r, remote_wins)),
        (Value::Object(l), Value::Object(r))
            if extract_entry_id(ours).is_none() && extract_entry_id(theirs).is_none() =>
        {
            Value::Object(union_keyed(l, r, remote_wins))
        }
        _ => pick_entry(ours, theirs, remote_wins),
    }
}

/// Union of two entry lists by id. Entries without an id are de-duplicated by value.
fn union_entries(ours: &[Value], theirs: &[Value], remote_wins: bool) -> Vec<Value> {
    let remote_by_id: HashMap<String, &Value> = theirs
        .iter()
        .filter_map(|entry| extract_entry_id(entry).map(|id| (id, entry)))
        .collect();

    let mut local_ids = HashSet::new();
    let mut merged = Vec::with_capacity(ours.len().max(theirs.len()));

    for entry in ours {
        match extract_entry_id(entry) {
            Some(id) => {
                let value = match remote_by_id.get(&id) {
                    Some(remote_entry) => pick_entry(entry, remote_entry, remote_wins),
                    None => entry.clone(),
                };
                local_ids.insert(id);
                merged.push(value);
            }
            None => merged.push(entry.clone()),
        }
    }

    let mut added_ids = HashSet::new();
    for entry in theirs {
        match extract_entry_id(entry) {
            Some(id) => {
                if !local_ids.contains(&id) && added_ids.insert(id) {
                    merged.push(entry.clone());
                }
            }
            None => {
                if !ours.contains(entry) && !merged.contains(entry) {
                    merged.push(entry.clone());
                }
            }
        }
    }

    merged
}

/// Union of two maps keyed by sub-id.
fn union_keyed(ours: &Map<String, Value>, theirs: &Map<String, Value>, remote_wins: bool) -> Map<String, Value> {
    let mut merged = ours.clone();
    for (key, remote_value) in theirs {
        let value = match ours.get(key) {
            Some(local_value) => merge_monotonic_value(local_value, remote_value, remote_wins),
            None => remote_value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

/// Choose between two versions of the same entry.
fn pick_entry(ours: &Value, theirs: &Value, remote_wins: bool) -> Value {
    match compare_freshness(ours, theirs) {
        Some(Ordering::Greater) => ours.clone(),
        Some(Ordering::Less) => theirs.clone(),
        _ if remote_wins => theirs.clone(),
        _ => ours.clone(),
    }
}
