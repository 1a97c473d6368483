//! Shared data bag: mutable key/value context for a run and all of its
//! nested sub-runs.
//!
//! Cloning a `DataBag` clones the handle, never the contents — a nested
//! sequencer always sees the same map as its parent. Only one step body
//! runs at a time per run, so the mutex here guards against nothing
//! more exotic than sibling runs touching the bag concurrently.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared key/value context. Created once per top-level run, handed by
/// reference to every nested run spawned from it.
#[derive(Debug, Clone, Default)]
pub struct DataBag {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl DataBag {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.inner.lock().expect("data bag poisoned")
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.lock().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Identity check: do both handles point at the same map?
    pub fn ptr_eq(a: &DataBag, b: &DataBag) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clones_share_the_same_map() {
        let bag = DataBag::new();
        let alias = bag.clone();

        bag.insert("setpoint", json!(19.5));
        assert_eq!(alias.get("setpoint"), Some(json!(19.5)));
        assert!(DataBag::ptr_eq(&bag, &alias));
    }

    #[test]
    fn separate_bags_are_distinct() {
        let a = DataBag::new();
        let b = DataBag::new();
        a.insert("k", json!(1));

        assert!(b.get("k").is_none());
        assert!(!DataBag::ptr_eq(&a, &b));
    }

    #[test]
    fn remove_returns_the_value() {
        let bag = DataBag::new();
        bag.insert("k", json!("v"));
        assert_eq!(bag.remove("k"), Some(json!("v")));
        assert!(bag.is_empty());
    }
}
