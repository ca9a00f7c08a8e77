//! Prefix-unique lookup over container ids
//!
//! A 16-way trie over fixed-width hex ids. A prefix resolves only when it
//! selects exactly one id; shorter prefixes fail as ambiguous. The index is
//! a pure accelerator over the container store and can always be rebuilt
//! from it.

use std::sync::RwLock;

use crate::errors::{DaemonError, Result};

#[derive(Default)]
struct Node {
    children: [Option<Box<Node>>; 16],
    /// Number of ids stored at or below this node.
    count: usize,
    terminal: bool,
}

/// Concurrent prefix index. Writers take the lock exclusively; lookups share
/// it.
#[derive(Default)]
pub struct TruncIndex {
    root: RwLock<Node>,
}

fn digits(id: &str) -> Result<Vec<usize>> {
    if id.is_empty() {
        return Err(DaemonError::Validation(
            "id prefix cannot be empty".to_string(),
        ));
    }
    id.chars()
        .map(|c| {
            c.to_digit(16)
                .map(|d| d as usize)
                .ok_or_else(|| DaemonError::Validation(format!("illegal character in id: {:?}", c)))
        })
        .collect()
}

impl TruncIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids in the index.
    pub fn len(&self) -> usize {
        self.root.read().unwrap_or_else(|p| p.into_inner()).count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add a full id. Duplicate insertion is a conflict.
    pub fn insert(&self, id: &str) -> Result<()> {
        let path = digits(id)?;
        let mut root = self.root.write().unwrap_or_else(|p| p.into_inner());

        // Check before touching counts so a duplicate leaves the trie intact.
        let mut node: &Node = &root;
        let mut exists = true;
        for &d in &path {
            match node.children[d].as_deref() {
                Some(child) => node = child,
                None => {
                    exists = false;
                    break;
                }
            }
        }
        if exists && node.terminal {
            return Err(DaemonError::Conflict(format!("id already exists: {}", id)));
        }

        let mut node: &mut Node = &mut root;
        node.count += 1;
        for &d in &path {
            node = &mut **node.children[d].get_or_insert_with(Box::default);
            node.count += 1;
        }
        node.terminal = true;
        Ok(())
    }

    /// Remove a full id.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = digits(id)?;
        let mut root = self.root.write().unwrap_or_else(|p| p.into_inner());

        {
            let mut node: &Node = &root;
            for &d in &path {
                node = node.children[d]
                    .as_deref()
                    .ok_or_else(|| DaemonError::NotFound(id.to_string()))?;
            }
            if !node.terminal {
                return Err(DaemonError::NotFound(id.to_string()));
            }
        }

        let mut node: &mut Node = &mut root;
        node.count -= 1;
        for &d in &path {
            if node.children[d].as_deref().expect("checked above").count == 1 {
                node.children[d] = None;
                return Ok(());
            }
            let child = &mut **node.children[d].as_mut().expect("checked above");
            child.count -= 1;
            node = child;
        }
        node.terminal = false;
        Ok(())
    }

    /// Resolve `prefix` to the unique full id it selects.
    pub fn get(&self, prefix: &str) -> Result<String> {
        let path = digits(prefix)?;
        let root = self.root.read().unwrap_or_else(|p| p.into_inner());

        let mut node: &Node = &root;
        for &d in &path {
            node = node.children[d]
                .as_deref()
                .ok_or_else(|| DaemonError::NotFound(prefix.to_string()))?;
        }
        if node.count > 1 {
            return Err(DaemonError::AmbiguousPrefix(prefix.to_string()));
        }

        // Exactly one id below: follow the only populated branch to the leaf.
        let mut id = prefix.to_string();
        let mut node = node;
        while !node.terminal {
            let (d, child) = node
                .children
                .iter()
                .enumerate()
                .find_map(|(d, c)| c.as_deref().map(|c| (d, c)))
                .expect("count > 0 implies a populated branch");
            id.push(char::from_digit(d as u32, 16).expect("digit < 16"));
            node = child;
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "a9eb172552348a9a49180694790b33a1097f546456d041b6e82e4d7716ddb721";
    const ID_B: &str = "a9eb89b7bde793d529eaa2b1d871023f4edcca12eb96981e4ba4c2b0cf6bb3b4";
    const ID_C: &str = "6e4d7716ddb7210694790b33a1097f546456d041b6e82ea9eb17255234852348";

    #[test]
    fn test_insert_and_get_full_id() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        assert_eq!(index.get(ID_A).unwrap(), ID_A);
    }

    #[test]
    fn test_get_unique_prefix() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        index.insert(ID_C).unwrap();
        assert_eq!(index.get("a9").unwrap(), ID_A);
        assert_eq!(index.get("6e").unwrap(), ID_C);
    }

    #[test]
    fn test_ambiguous_prefix() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        index.insert(ID_B).unwrap();
        assert!(matches!(
            index.get("a9eb"),
            Err(DaemonError::AmbiguousPrefix(_))
        ));
        // One more character disambiguates.
        assert_eq!(index.get("a9eb1").unwrap(), ID_A);
        assert_eq!(index.get("a9eb8").unwrap(), ID_B);
    }

    #[test]
    fn test_not_found() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        assert!(matches!(index.get("ff"), Err(DaemonError::NotFound(_))));
    }

    #[test]
    fn test_empty_prefix_rejected() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        assert!(index.get("").is_err());
    }

    #[test]
    fn test_non_hex_rejected() {
        let index = TruncIndex::new();
        assert!(index.insert("zzzz").is_err());
        assert!(index.get("g").is_err());
    }

    #[test]
    fn test_duplicate_insert_conflict() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        assert!(matches!(
            index.insert(ID_A),
            Err(DaemonError::Conflict(_))
        ));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_delete_restores_uniqueness() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        index.insert(ID_B).unwrap();
        index.delete(ID_B).unwrap();
        assert_eq!(index.get("a9").unwrap(), ID_A);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_delete_unknown() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        assert!(index.delete(ID_B).is_err());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_delete_then_reinsert() {
        let index = TruncIndex::new();
        index.insert(ID_A).unwrap();
        index.delete(ID_A).unwrap();
        assert!(index.is_empty());
        index.insert(ID_A).unwrap();
        assert_eq!(index.get("a9").unwrap(), ID_A);
    }

    #[test]
    fn test_concurrent_insert_lookup() {
        use std::sync::Arc;
        let index = Arc::new(TruncIndex::new());
        let mut handles = Vec::new();
        for i in 0..8u32 {
            let index = Arc::clone(&index);
            handles.push(std::thread::spawn(move || {
                let id = format!("{:08x}{}", i, &ID_A[8..]);
                index.insert(&id).unwrap();
                assert_eq!(index.get(&id).unwrap(), id);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(index.len(), 8);
    }
}
