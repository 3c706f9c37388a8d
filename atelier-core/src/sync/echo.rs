/// Echo suppression for our own remote writes.
///
/// Before every push: fingerprint the pushed state and register it.
/// On remote snapshot: fingerprint it and check against pending fingerprints.
/// Match found: consume the fingerprint, the snapshot is our own write coming back.
/// No match: another device wrote, process the snapshot.
/// TTL (60s) is cleanup only; fingerprints are consumed on match regardless.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::types::ProjectState;

const FINGERPRINT_TTL: Duration = Duration::from_secs(60);

/// SHA-256 of a state's canonical JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateFingerprint(pub String);

impl StateFingerprint {
    pub fn from_state(state: &ProjectState) -> Self {
        // Map keys are ordered, so the encoding is canonical.
        let encoded = serde_json::to_vec(state).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&encoded);
        Self(hex::encode(hasher.finalize()))
    }
}

struct PendingEcho {
    fingerprint: StateFingerprint,
    registered_at: Instant,
}

#[derive(Default)]
pub struct EchoTracker {
    /// project_id -> pushes not yet seen back (several may be in flight)
    pending: HashMap<String, Vec<PendingEcho>>,
}

impl EchoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a state about to be pushed.
    pub fn register(&mut self, state: &ProjectState) {
        self.pending
            .entry(state.id.clone())
            .or_default()
            .push(PendingEcho {
                fingerprint: StateFingerprint::from_state(state),
                registered_at: Instant::now(),
            });
    }

    /// True (and consumed) when `snapshot` is one of our pending pushes.
    pub fn check_and_consume(&mut self, snapshot: &ProjectState) -> bool {
        let fingerprint = StateFingerprint::from_state(snapshot);
        let Some(entries) = self.pending.get_mut(&snapshot.id) else {
            return false;
        };
        let Some(pos) = entries.iter().position(|e| e.fingerprint == fingerprint) else {
            return false;
        };
        // Anything registered before the echoed push has been overwritten remotely.
        entries.drain(..=pos);
        if entries.is_empty() {
            self.pending.remove(&snapshot.id);
        }
        true
    }

    /// Forget a push that never reached the remote.
    pub fn forget(&mut self, state: &ProjectState) {
        let fingerprint = StateFingerprint::from_state(state);
        if let Some(entries) = self.pending.get_mut(&state.id) {
            if let Some(pos) = entries.iter().rposition(|e| e.fingerprint == fingerprint) {
                entries.remove(pos);
            }
            if entries.is_empty() {
                self.pending.remove(&state.id);
            }
        }
    }

    pub fn cleanup_expired(&mut self) {
        let now = Instant::now();
        self.pending.retain(|_, entries| {
            entries.retain(|e| now.duration_since(e.registered_at) < FINGERPRINT_TTL);
            !entries.is_empty()
        });
    }

    pub fn has_pending(&self, project_id: &str) -> bool {
        self.pending.get(project_id).is_some_and(|e| !e.is_empty())
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(version: u64) -> ProjectState {
        ProjectState::new("p1", 100)
            .with_sync_version(version)
            .with_field("wardrobe", json!(["item1"]))
    }

    #[test]
    fn test_fingerprint_ignores_field_insertion_order() {
        let a = ProjectState::new("p1", 1)
            .with_field("wardrobe", json!([]))
            .with_field("modelImage", json!("a.png"));
        let b = ProjectState::new("p1", 1)
            .with_field("modelImage", json!("a.png"))
            .with_field("wardrobe", json!([]));
        assert_eq!(StateFingerprint::from_state(&a), StateFingerprint::from_state(&b));
    }

    #[test]
    fn test_register_and_consume() {
        let mut tracker = EchoTracker::new();
        tracker.register(&state(1));
        assert!(tracker.has_pending("p1"));
        assert!(tracker.check_and_consume(&state(1)));
        assert!(!tracker.has_pending("p1"));
        assert!(!tracker.check_and_consume(&state(1)));
    }

    #[test]
    fn test_foreign_state_is_not_an_echo() {
        let mut tracker = EchoTracker::new();
        tracker.register(&state(1));
        assert!(!tracker.check_and_consume(&state(2)));
        assert!(tracker.has_pending("p1"));
    }

    #[test]
    fn test_later_echo_consumes_earlier_pushes() {
        let mut tracker = EchoTracker::new();
        tracker.register(&state(1));
        tracker.register(&state(2));
        tracker.register(&state(3));
        assert!(tracker.check_and_consume(&state(2)));
        assert!(tracker.has_pending("p1"));
        assert!(!tracker.check_and_consume(&state(1)));
        assert!(tracker.check_and_consume(&state(3)));
        assert!(!tracker.has_pending("p1"));
    }

    #[test]
    fn test_forget_failed_push() {
        let mut tracker = EchoTracker::new();
        tracker.register(&state(1));
        tracker.forget(&state(1));
        assert!(!tracker.has_pending("p1"));
    }

    #[test]
    fn test_cleanup_expired() {
        let mut tracker = EchoTracker::new();
        tracker.register(&state(1));
        if let Some(entries) = tracker.pending.get_mut("p1") {
            entries[0].registered_at = Instant::now() - Duration::from_secs(120);
        }
        tracker.cleanup_expired();
        assert!(!tracker.has_pending("p1"));
    }
}
