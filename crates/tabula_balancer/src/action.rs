//! Action log: every action the balancer issued, kept until it expires.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use tabula_common::ActionId;

use crate::planner::ActionKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ActionState {
    pub fn is_finished(self) -> bool {
        matches!(self, ActionState::Completed | ActionState::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TabletAction {
    pub id: ActionId,
    pub bundle: String,
    pub group: String,
    pub kind: ActionKind,
    pub state: ActionState,
    pub error: Option<String>,
    #[serde(skip)]
    pub created_at: Instant,
    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: Mutex<BTreeMap<ActionId, TabletAction>>,
    next_id: AtomicU64,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bundle: &str, group: &str, kind: ActionKind) -> ActionId {
        let id = ActionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.actions.lock().insert(
            id,
            TabletAction {
                id,
                bundle: bundle.to_string(),
                group: group.to_string(),
                kind,
                state: ActionState::Pending,
                error: None,
                created_at: Instant::now(),
                finished_at: None,
            },
        );
        id
    }

    pub fn start(&self, id: ActionId) {
        if let Some(action) = self.actions.lock().get_mut(&id) {
            action.state = ActionState::Running;
        }
    }

    pub fn finish(&self, id: ActionId, error: Option<String>) {
        if let Some(action) = self.actions.lock().get_mut(&id) {
            action.state = if error.is_some() {
                ActionState::Failed
            } else {
                ActionState::Completed
            };
            action.error = error;
            action.finished_at = Some(Instant::now());
        }
    }

    /// Drop finished actions older than `ttl`. Returns how many were dropped.
    pub fn expire(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut actions = self.actions.lock();
        let before = actions.len();
        actions.retain(|_, a| match a.finished_at {
            Some(at) => now.duration_since(at) < ttl,
            None => true,
        });
        before - actions.len()
    }

    pub fn get(&self, id: ActionId) -> Option<TabletAction> {
        self.actions.lock().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<TabletAction> {
        self.actions.lock().values().cloned().collect()
    }

    pub fn active_count(&self, bundle: &str, group: &str) -> usize {
        self.actions
            .lock()
            .values()
            .filter(|a| a.bundle == bundle && a.group == group && !a.state.is_finished())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use tabula_common::{CellId, TabletId};

    use super::*;

    fn kind() -> ActionKind {
        ActionKind::Move {
            path: "//t".into(),
            tablet: TabletId(1),
            cell: CellId(2),
        }
    }

    #[test]
    fn test_lifecycle_and_expiry() {
        let registry = ActionRegistry::new();
        let a = registry.register("b", "default", kind());
        let b = registry.register("b", "default", kind());
        assert_ne!(a, b);
        assert_eq!(registry.active_count("b", "default"), 2);

        registry.start(a);
        assert_eq!(registry.get(a).unwrap().state, ActionState::Running);
        registry.finish(a, None);
        registry.finish(b, Some("no such cell".into()));
        assert_eq!(registry.get(a).unwrap().state, ActionState::Completed);
        let failed = registry.get(b).unwrap();
        assert_eq!(failed.state, ActionState::Failed);
        assert_eq!(failed.error.as_deref(), Some("no such cell"));
        assert_eq!(registry.active_count("b", "default"), 0);

        assert_eq!(registry.expire(Duration::from_secs(60)), 0);
        assert_eq!(registry.expire(Duration::ZERO), 2);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_unfinished_actions_never_expire() {
        let registry = ActionRegistry::new();
        registry.register("b", "g", kind());
        assert_eq!(registry.expire(Duration::ZERO), 0);
        assert_eq!(registry.active_count("b", "g"), 1);
        assert_eq!(registry.active_count("b", "other"), 0);
    }

    #[test]
    fn test_action_serializes_for_orchid() {
        let registry = ActionRegistry::new();
        let id = registry.register("b", "g", kind());
        let json = serde_json::to_value(registry.get(id).unwrap()).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["kind"]["move"]["path"], "//t");
    }
}
