/// Entry identity helpers for monotonic fields.
///
/// History entries are JSON objects with a stable id under `id`. Older
/// documents used `entryId` or `requestId`, which are accepted as fallbacks.
/// Freshness comes from an explicit `revision` marker when both entries carry
/// one, otherwise from the entry's own timestamp.
use std::cmp::Ordering;

use serde_json::Value;

const ID_KEYS: &[&str] = &["id", "entryId", "requestId"];
const REVISION_KEY: &str = "revision";
const TIMESTAMP_KEYS: &[&str] = &["updatedAt", "timestamp", "createdAt"];

/// Extract the stable id of an entry. Plain strings and numbers have no id.
pub fn extract_entry_id(entry: &Value) -> Option<String> {
    let obj = entry.as_object()?;
    ID_KEYS.iter().find_map(|key| match obj.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Explicit revision marker of an entry, if any.
pub fn entry_revision(entry: &Value) -> Option<i64> {
    entry.as_object()?.get(REVISION_KEY)?.as_i64()
}

/// Implicit timestamp of an entry in milliseconds.
///
/// Accepts plain millisecond numbers, RFC 3339 strings and the
/// `{ seconds, nanoseconds }` shape document stores use for server timestamps.
pub fn entry_timestamp(entry: &Value) -> Option<i64> {
    let obj = entry.as_object()?;
    TIMESTAMP_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(parse_timestamp))
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        Value::Object(obj) => {
            let seconds = obj
                .get("seconds")
                .or_else(|| obj.get("_seconds"))?
                .as_i64()?;
            let nanos = obj
                .get("nanoseconds")
                .or_else(|| obj.get("_nanoseconds"))
                .and_then(Value::as_i64)
                .unwrap_or(0);
            seconds
                .checked_mul(1000)?
                .checked_add(nanos / 1_000_000)
        }
        _ => None,
    }
}

/// Compare two versions of the same entry.
///
/// `Greater` means `a` is fresher. Revisions are compared first, then
/// timestamps. `None` when neither signal is available on both sides or the
/// signals tie.
pub fn compare_freshness(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(ra), Some(rb)) = (entry_revision(a), entry_revision(b)) {
        if ra != rb {
            return Some(ra.cmp(&rb));
        }
    }
    match (entry_timestamp(a), entry_timestamp(b)) {
        (Some(ta), Some(tb)) if ta != tb => Some(ta.cmp(&tb)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_entry_id() {
        assert_eq!(extract_entry_id(&json!({"id": "g1"})), Some("g1".to_string()));
        assert_eq!(extract_entry_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(
            extract_entry_id(&json!({"requestId": "req-9"})),
            Some("req-9".to_string())
        );
        assert_eq!(extract_entry_id(&json!({"id": ""})), None);
        assert_eq!(extract_entry_id(&json!("item1")), None);
    }

    #[test]
    fn test_entry_timestamp_formats() {
        assert_eq!(entry_timestamp(&json!({"timestamp": 1500})), Some(1500));
        assert_eq!(
            entry_timestamp(&json!({"createdAt": "1970-01-01T00:00:02Z"})),
            Some(2000)
        );
        assert_eq!(
            entry_timestamp(&json!({"updatedAt": {"seconds": 3, "nanoseconds": 500000000}})),
            Some(3500)
        );
        assert_eq!(entry_timestamp(&json!({"id": "x"})), None);
    }

    #[test]
    fn test_out_of_range_server_timestamp_is_ignored() {
        assert_eq!(entry_timestamp(&json!({"updatedAt": {"seconds": i64::MAX}})), None);
        assert_eq!(
            entry_timestamp(&json!({"updatedAt": {"seconds": i64::MAX / 1000, "nanoseconds": 999_999_999}})),
            None
        );
    }

    #[test]
    fn test_updated_at_takes_precedence_over_created_at() {
        let entry = json!({"createdAt": 100, "updatedAt": 900});
        assert_eq!(entry_timestamp(&entry), Some(900));
    }

    #[test]
    fn test_revision_beats_timestamp() {
        let a = json!({"id": "e", "revision": 3, "timestamp": 100});
        let b = json!({"id": "e", "revision": 2, "timestamp": 900});
        assert_eq!(compare_freshness(&a, &b), Some(Ordering::Greater));
    }

    #[test]
    fn test_equal_revision_falls_back_to_timestamp() {
        let a = json!({"id": "e", "revision": 2, "timestamp": 100});
        let b = json!({"id": "e", "revision": 2, "timestamp": 900});
        assert_eq!(compare_freshness(&a, &b), Some(Ordering::Less));
    }

    #[test]
    fn test_no_signal_is_undecided() {
        let a = json!({"id": "e", "label": "a"});
        let b = json!({"id": "e", "label": "b"});
        assert_eq!(compare_freshness(&a, &b), None);
        assert_eq!(compare_freshness(&json!({"timestamp": 5}), &json!({"timestamp": 5})), None);
    }
}
