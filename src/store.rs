//! In-memory container registry
//!
//! A single mutex guards the map; every operation is a short map mutation,
//! never I/O. Containers themselves are shared out as `Arc`s, so lifecycle
//! operations hold no store lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::container::Container;

#[derive(Default)]
pub struct ContainerStore {
    containers: Mutex<HashMap<String, Arc<Container>>>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: Arc<Container>) {
        self.containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(container.id.clone(), container);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    pub fn delete(&self, id: &str) -> Option<Arc<Container>> {
        self.containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All containers, newest creation time first. The ordering is stable
    /// across calls: ties break on id.
    pub fn list(&self) -> Vec<Arc<Container>> {
        let mut all: Vec<Arc<Container>> = self
            .containers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerConfig, HostConfig};

    fn container(id: &str) -> Arc<Container> {
        Arc::new(Container::new(
            id.to_string(),
            format!("/{}", id),
            "/bin/true".to_string(),
            Vec::new(),
            ContainerConfig::default(),
            HostConfig::default(),
            "img".to_string(),
            "vfs".to_string(),
            "native".to_string(),
            std::env::temp_dir().join(id),
        ))
    }

    #[test]
    fn test_add_get_delete() {
        let store = ContainerStore::new();
        store.add(container("aaa"));
        assert!(store.get("aaa").is_some());
        assert!(store.get("bbb").is_none());
        assert_eq!(store.len(), 1);

        let removed = store.delete("aaa").unwrap();
        assert_eq!(removed.id, "aaa");
        assert!(store.is_empty());
        assert!(store.delete("aaa").is_none());
    }

    #[test]
    fn test_list_newest_first() {
        let store = ContainerStore::new();
        for id in ["one", "two", "three"] {
            store.add(container(id));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let listed = store.list();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, "three");
        assert_eq!(listed[2].id, "one");
    }

    #[test]
    fn test_concurrent_access() {
        let store = Arc::new(ContainerStore::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store.add(container(&format!("c{}", i)));
                assert!(store.get(&format!("c{}", i)).is_some());
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(), 8);
    }
}
