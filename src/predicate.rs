//! Change predicate for watch events
//!
//! The watch delivers an event for every write to a MicroApplication,
//! including the status writes the operator makes itself. The predicate
//! decides which events are real changes worth a sync.

use std::collections::HashMap;
use std::sync::Mutex;

use kube::ResourceExt;

use crate::crd::MicroApplication;

/// Decides whether an observed object should trigger reconciliation
pub trait ChangePredicate: Send + Sync {
    /// Whether `app` differs from what was last seen in a way that matters
    fn should_reconcile(&self, app: &MicroApplication) -> bool;
}

/// Triggers on creation and on spec changes
///
/// Tracks `metadata.generation`, which the API server bumps on spec changes
/// but not on status or metadata-only updates. An object deleted and created
/// again under the same name is recognized by its new uid.
#[derive(Debug, Default)]
pub struct GenerationChanged {
    seen: Mutex<HashMap<(String, String), (String, Option<i64>)>>,
}

impl GenerationChanged {
    /// Empty predicate; the first observation of every object triggers
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget an object, so its next observation triggers again
    pub fn forget(&self, namespace: &str, name: &str) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.remove(&(namespace.to_string(), name.to_string()));
        }
    }
}

impl ChangePredicate for GenerationChanged {
    fn should_reconcile(&self, app: &MicroApplication) -> bool {
        let key = (app.namespace().unwrap_or_default(), app.name_any());
        let current = (app.uid().unwrap_or_default(), app.metadata.generation);

        let Ok(mut seen) = self.seen.lock() else {
            // poisoned: err on the side of syncing
            return true;
        };
        match seen.get(&key) {
            Some(previous) if *previous == current => false,
            _ => {
                seen.insert(key, current);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MicroApplicationSpec, MicroApplicationStatus, SyncPhase};

    fn app(uid: &str, generation: i64) -> MicroApplication {
        let mut app = MicroApplication::new(
            "guestbook",
            MicroApplicationSpec {
                repo_url: "https://github.com/example/guestbook".to_string(),
                path: None,
                target_revision: None,
            },
        );
        app.metadata.namespace = Some("team-a".to_string());
        app.metadata.uid = Some(uid.to_string());
        app.metadata.generation = Some(generation);
        app
    }

    /// Story: The first sighting of an application triggers a sync
    #[test]
    fn story_creation_triggers() {
        let p = GenerationChanged::new();
        assert!(p.should_reconcile(&app("u1", 1)));
    }

    /// Story: The operator's own status write does not trigger another sync
    #[test]
    fn story_status_update_does_not_trigger() {
        let p = GenerationChanged::new();
        let mut a = app("u1", 1);
        assert!(p.should_reconcile(&a));

        a.status = Some(MicroApplicationStatus::with_phase(SyncPhase::Synced).allowed(true));
        a.metadata.resource_version = Some("42".to_string());
        assert!(!p.should_reconcile(&a));
    }

    /// Story: Editing the spec triggers a sync
    #[test]
    fn story_spec_change_triggers() {
        let p = GenerationChanged::new();
        assert!(p.should_reconcile(&app("u1", 1)));
        assert!(p.should_reconcile(&app("u1", 2)));
        assert!(!p.should_reconcile(&app("u1", 2)));
    }

    #[test]
    fn recreated_object_triggers() {
        let p = GenerationChanged::new();
        assert!(p.should_reconcile(&app("u1", 1)));
        assert!(p.should_reconcile(&app("u2", 1)));
    }

    #[test]
    fn forget_makes_next_observation_trigger() {
        let p = GenerationChanged::new();
        let a = app("u1", 1);
        assert!(p.should_reconcile(&a));
        p.forget("team-a", "guestbook");
        assert!(p.should_reconcile(&a));
    }

    #[test]
    fn objects_are_tracked_independently() {
        let p = GenerationChanged::new();
        let mut other = app("u9", 1);
        other.metadata.name = Some("other".to_string());
        assert!(p.should_reconcile(&app("u1", 1)));
        assert!(p.should_reconcile(&other));
        assert!(!p.should_reconcile(&app("u1", 1)));
    }
}
