use std::{
    collections::HashSet,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// Session ids currently backed by a live agent process.
///
/// Every operation takes the lock once, so a rename is never observed half-done.
#[derive(Debug, Default)]
pub struct ActiveExecutions {
    ids: RwLock<HashSet<String>>,
}

impl ActiveExecutions {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.ids.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.ids.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, session_id: impl Into<String>) {
        self.write().insert(session_id.into());
    }

    /// Claims `session_id` unless it is already active. Check and insert happen under one lock.
    pub fn try_register(&self, session_id: impl Into<String>) -> bool {
        self.write().insert(session_id.into())
    }

    /// Returns whether the id was registered.
    pub fn unregister(&self, session_id: &str) -> bool {
        self.write().remove(session_id)
    }

    /// Rename `old` to `new`. No-op when `old` is absent or equal to `new`.
    pub fn update_session_id(&self, old: &str, new: &str) -> bool {
        if old == new {
            return false;
        }
        let mut ids = self.write();
        if !ids.remove(old) {
            return false;
        }
        ids.insert(new.to_string());
        true
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.read().contains(session_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn rename_moves_membership() {
        let active = ActiveExecutions::new();
        active.register("CODEX:cGF0aA==:tmp");

        assert!(active.update_session_id("CODEX:cGF0aA==:tmp", "CODEX:cGF0aA==:real"));
        assert!(!active.is_active("CODEX:cGF0aA==:tmp"));
        assert!(active.is_active("CODEX:cGF0aA==:real"));
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn rename_of_unknown_or_same_id_is_noop() {
        let active = ActiveExecutions::new();
        assert!(!active.update_session_id("missing", "other"));
        assert!(!active.is_active("other"));

        active.register("a");
        assert!(!active.update_session_id("a", "a"));
        assert!(active.is_active("a"));
        assert!(active.unregister("a"));
        assert!(!active.unregister("a"));
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins() {
        let active = Arc::new(ActiveExecutions::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let active = active.clone();
                tokio::spawn(async move { active.try_register("OPENCODE:cGF0aA==:abc123") })
            })
            .collect();
        let mut claimed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_registrations_are_all_kept() {
        let active = Arc::new(ActiveExecutions::new());
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let active = active.clone();
                tokio::spawn(async move {
                    active.register(format!("s{i}"));
                    active.update_session_id(&format!("s{i}"), &format!("r{i}"));
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(active.len(), 32);
        assert!((0..32).all(|i| active.is_active(&format!("r{i}"))));
    }
}
