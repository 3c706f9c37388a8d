/// Field-level conflict detection between two snapshots of one project.
///
/// Every domain field present on either side is compared with deep JSON
/// equality. A field present on one side and absent on the other differs.
/// Monotonic fields are merged additively and never reported. The result
/// follows the schema's field order, so the same inputs always give the
/// same list.
use crate::types::{now_millis, Conflict, FieldSchema, ProjectState};

use super::{ensure_same_project, MergeError};

/// Detect conflicts using the default field schema.
pub fn detect_conflicts(
    local: &ProjectState,
    remote: &ProjectState,
) -> Result<Vec<Conflict>, MergeError> {
    detect_conflicts_with(local, remote, &FieldSchema::default(), now_millis())
}

/// Detect conflicts under an explicit schema, stamping each entry with `detected_at`.
pub fn detect_conflicts_with(
    local: &ProjectState,
    remote: &ProjectState,
    schema: &FieldSchema,
    detected_at: i64,
) -> Result<Vec<Conflict>, MergeError> {
    ensure_same_project(local, remote)?;

    let conflicts = schema
        .ordered_fields(local, remote)
        .into_iter()
        .filter(|field| !schema.is_monotonic(field))
        .filter_map(|field| {
            let ours = local.field(&field);
            let theirs = remote.field(&field);
            if ours == theirs {
                return None;
            }
            Some(Conflict {
                local: ours.cloned(),
                remote: theirs.cloned(),
                field,
                timestamp: detected_at,
            })
        })
        .collect();

    Ok(conflicts)
}

/// Names of all fields that differ, monotonic fields included.
pub fn changed_fields(local: &ProjectState, remote: &ProjectState, schema: &FieldSchema) -> Vec<String> {
    schema
        .ordered_fields(local, remote)
        .into_iter()
        .filter(|field| local.field(field) != remote.field(field))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FIELD_GENERATION_SETTINGS, FIELD_MODEL_DESCRIPTION, FIELD_WARDROBE};
    use serde_json::json;

    fn make_state(updated_at: i64) -> ProjectState {
        ProjectState::new("p1", updated_at).with_sync_version(1)
    }

    #[test]
    fn test_identical_states_have_no_conflicts() {
        let state = make_state(1000)
            .with_field(FIELD_MODEL_DESCRIPTION, json!("tall model"))
            .with_field(FIELD_GENERATION_SETTINGS, json!({"steps": 30}));
        assert!(detect_conflicts(&state, &state).unwrap().is_empty());
    }

    #[test]
    fn test_differing_scalar_is_a_conflict() {
        let local = make_state(1000).with_field(FIELD_MODEL_DESCRIPTION, json!("tall model"));
        let remote = make_state(1000).with_field(FIELD_MODEL_DESCRIPTION, json!("short model"));

        let conflicts = detect_conflicts_with(&local, &remote, &FieldSchema::default(), 42).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, FIELD_MODEL_DESCRIPTION);
        assert_eq!(conflicts[0].local, Some(json!("tall model")));
        assert_eq!(conflicts[0].remote, Some(json!("short model")));
        assert_eq!(conflicts[0].timestamp, 42);
    }

    #[test]
    fn test_nested_objects_compare_deeply() {
        let local = make_state(1).with_field(FIELD_GENERATION_SETTINGS, json!({"a": {"b": [1, 2]}}));
        let same = make_state(2).with_field(FIELD_GENERATION_SETTINGS, json!({"a": {"b": [1, 2]}}));
        let other = make_state(2).with_field(FIELD_GENERATION_SETTINGS, json!({"a": {"b": [2, 1]}}));

        assert!(detect_conflicts(&local, &same).unwrap().is_empty());
        assert_eq!(detect_conflicts(&local, &other).unwrap().len(), 1);
    }

    #[test]
    fn test_field_missing_on_one_side_is_a_conflict() {
        let local = make_state(1).with_field("lighting", json!("soft"));
        let remote = make_state(1);

        let conflicts = detect_conflicts(&local, &remote).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].remote, None);
    }

    #[test]
    fn test_monotonic_fields_never_conflict() {
        let local = make_state(1000).with_field(FIELD_WARDROBE, json!(["item1"]));
        let remote = make_state(2000).with_field(FIELD_WARDROBE, json!(["item1", "item2"]));

        assert!(detect_conflicts(&local, &remote).unwrap().is_empty());
        assert_eq!(
            changed_fields(&local, &remote, &FieldSchema::default()),
            vec![FIELD_WARDROBE.to_string()]
        );
    }

    #[test]
    fn test_conflict_detection_is_symmetric() {
        let a = make_state(1)
            .with_field(FIELD_MODEL_DESCRIPTION, json!("a"))
            .with_field("pose", json!("standing"))
            .with_field(FIELD_WARDROBE, json!(["x"]));
        let b = make_state(2)
            .with_field(FIELD_MODEL_DESCRIPTION, json!("b"))
            .with_field("background", json!("studio"));

        let schema = FieldSchema::default();
        let ab = detect_conflicts_with(&a, &b, &schema, 7).unwrap();
        let ba = detect_conflicts_with(&b, &a, &schema, 7).unwrap();

        assert_eq!(ab.len(), ba.len());
        for conflict in &ab {
            assert!(ba.contains(&conflict.swapped()));
        }
    }

    #[test]
    fn test_output_follows_schema_order() {
        let local = make_state(1)
            .with_field("zeta", json!(1))
            .with_field(FIELD_GENERATION_SETTINGS, json!({"steps": 1}))
            .with_field(FIELD_MODEL_DESCRIPTION, json!("a"));
        let remote = make_state(1)
            .with_field("zeta", json!(2))
            .with_field(FIELD_GENERATION_SETTINGS, json!({"steps": 2}))
            .with_field(FIELD_MODEL_DESCRIPTION, json!("b"));

        let fields: Vec<String> = detect_conflicts(&local, &remote)
            .unwrap()
            .into_iter()
            .map(|c| c.field)
            .collect();
        assert_eq!(fields, vec![FIELD_MODEL_DESCRIPTION, FIELD_GENERATION_SETTINGS, "zeta"]);
    }

    #[test]
    fn test_mismatched_projects_fail() {
        let local = ProjectState::new("p1", 1);
        let remote = ProjectState::new("p2", 1);
        assert_eq!(
            detect_conflicts(&local, &remote).unwrap_err(),
            MergeError::MismatchedProject {
                local: "p1".to_string(),
                remote: "p2".to_string(),
            }
        );
    }
}
