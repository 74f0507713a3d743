use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

/// Mutual-exclusion table mapping a resource name to the task currently
/// holding it. Acquisition is all-or-nothing under a single mutex, so two
/// tasks can never interleave partial acquisitions.
#[derive(Default)]
pub struct ResourceLockTable {
    held: Mutex<HashMap<String, String>>,
}

impl ResourceLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires every resource for `task_id`, or none of them. Returns
    /// false without side effects when any resource is already held by a
    /// different task.
    pub fn try_acquire_all(&self, task_id: &str, resources: &[String]) -> bool {
        let mut held = self.held.lock();

        let contended = resources
            .iter()
            .any(|r| held.get(r).is_some_and(|holder| holder != task_id));
        if contended {
            return false;
        }

        for resource in resources {
            held.insert(resource.clone(), task_id.to_string());
        }
        if !resources.is_empty() {
            debug!(task_id = %task_id, count = resources.len(), "Acquired resource locks");
        }
        true
    }

    pub fn release_all(&self, task_id: &str) {
        let mut held = self.held.lock();
        let before = held.len();
        held.retain(|_, holder| holder != task_id);
        if held.len() < before {
            debug!(task_id = %task_id, released = before - held.len(), "Released resource locks");
        }
    }

    pub fn holder(&self, resource: &str) -> Option<String> {
        self.held.lock().get(resource).cloned()
    }

    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    pub fn clear(&self) {
        self.held.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_acquire_and_release() {
        let table = ResourceLockTable::new();

        assert!(table.try_acquire_all("t1", &resources(&["a", "b"])));
        assert_eq!(table.holder("a").as_deref(), Some("t1"));

        table.release_all("t1");
        assert_eq!(table.held_count(), 0);
    }

    #[test]
    fn test_all_or_nothing() {
        let table = ResourceLockTable::new();

        assert!(table.try_acquire_all("t1", &resources(&["a"])));
        // t2 wants "a" and "b"; "a" is held, so "b" must not be taken either.
        assert!(!table.try_acquire_all("t2", &resources(&["b", "a"])));
        assert!(table.holder("b").is_none());
    }

    #[test]
    fn test_single_holder_per_resource() {
        let table = ResourceLockTable::new();

        assert!(table.try_acquire_all("t1", &resources(&["config.json"])));
        assert!(!table.try_acquire_all("t2", &resources(&["config.json"])));
        assert_eq!(table.holder("config.json").as_deref(), Some("t1"));

        table.release_all("t1");
        assert!(table.try_acquire_all("t2", &resources(&["config.json"])));
    }

    #[test]
    fn test_reacquire_by_same_holder() {
        let table = ResourceLockTable::new();

        assert!(table.try_acquire_all("t1", &resources(&["a"])));
        assert!(table.try_acquire_all("t1", &resources(&["a", "b"])));
        assert_eq!(table.held_count(), 2);
    }

    #[test]
    fn test_empty_resource_set_always_succeeds() {
        let table = ResourceLockTable::new();
        assert!(table.try_acquire_all("t1", &[]));
        assert_eq!(table.held_count(), 0);
    }
}
