//! Container name/id → task id registry
//!
//! Shared between the manager (writes on create/remove) and the events
//! monitor (reads while demultiplexing the engine stream).

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredContainer {
    pub name: String,
    pub container_id: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerRegistry {
    // keyed by container name
    entries: Arc<RwLock<HashMap<String, RegisteredContainer>>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RegisteredContainer>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RegisteredContainer>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(
        &self,
        name: impl Into<String>,
        container_id: impl Into<String>,
        task_id: impl Into<String>,
    ) {
        let entry = RegisteredContainer {
            name: name.into(),
            container_id: container_id.into(),
            task_id: task_id.into(),
        };
        self.write().insert(entry.name.clone(), entry);
    }

    /// Forget by name, full id or id prefix
    pub fn forget(&self, name_or_id: &str) -> Option<RegisteredContainer> {
        let mut entries = self.write();
        let key = entries
            .values()
            .find(|e| Self::matches(e, name_or_id))
            .map(|e| e.name.clone())?;
        entries.remove(&key)
    }

    pub fn lookup(&self, name_or_id: &str) -> Option<RegisteredContainer> {
        self.read()
            .values()
            .find(|e| Self::matches(e, name_or_id))
            .cloned()
    }

    pub fn task_for(&self, name_or_id: &str) -> Option<String> {
        self.lookup(name_or_id).map(|e| e.task_id)
    }

    pub fn container_for_task(&self, task_id: &str) -> Option<RegisteredContainer> {
        self.read().values().find(|e| e.task_id == task_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Engines print 12-char short ids in some outputs and 64-char ids in events
    fn matches(entry: &RegisteredContainer, name_or_id: &str) -> bool {
        if name_or_id.is_empty() {
            return false;
        }
        entry.name == name_or_id
            || entry.container_id == name_or_id
            || (name_or_id.len() >= 12 && entry.container_id.starts_with(name_or_id))
            || (entry.container_id.len() >= 12 && name_or_id.starts_with(&entry.container_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_name_and_id() {
        let registry = ContainerRegistry::new();
        registry.register("apex-task-t1", "0123456789abcdef0123", "t1");

        assert_eq!(registry.task_for("apex-task-t1").as_deref(), Some("t1"));
        assert_eq!(registry.task_for("0123456789ab").as_deref(), Some("t1"));
        assert_eq!(
            registry.task_for("0123456789abcdef0123").as_deref(),
            Some("t1")
        );
        assert!(registry.task_for("0123").is_none());
        assert!(registry.task_for("").is_none());
        assert_eq!(
            registry.container_for_task("t1").map(|e| e.name),
            Some("apex-task-t1".to_string())
        );
    }

    #[test]
    fn test_forget() {
        let registry = ContainerRegistry::new();
        registry.register("apex-task-t1", "0123456789abcdef", "t1");
        registry.register("apex-task-t2", "fedcba9876543210", "t2");

        assert!(registry.forget("0123456789abcdef").is_some());
        assert!(registry.forget("apex-task-t1").is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup("apex-task-t2").is_some());
    }
}
