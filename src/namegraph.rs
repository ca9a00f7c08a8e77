//! Persistent name graph: human names and links to container ids
//!
//! A directed graph of slash-rooted paths stored in an embedded SQLite
//! database (`linkgraph.db`). Each path maps to a container id; links are
//! child paths under a parent's name (`/web/db` aliases `db` under `/web`).
//! This layer does not prevent cycles; that is the caller's concern.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};

use crate::errors::{DaemonError, Result};

/// Entity id of the root path `/`.
const ROOT_ENTITY: &str = "0";

/// Name graph over a single SQLite connection. The connection mutex
/// serializes all access; transactions keep multi-statement operations
/// atomic.
pub struct NameGraph {
    conn: Mutex<Option<Connection>>,
}

fn split_path(path: &str) -> Result<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(DaemonError::Validation(format!(
            "path must be rooted at /: {}",
            path
        )));
    }
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return Err(DaemonError::Validation("path names the root".to_string()));
    }
    Ok(parts)
}

impl NameGraph {
    /// Open (creating if necessary) the graph database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory graph, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entity (id TEXT PRIMARY KEY);
             CREATE TABLE IF NOT EXISTS edge (
                 parent_id TEXT NOT NULL,
                 entity_id TEXT NOT NULL,
                 name      TEXT NOT NULL,
                 UNIQUE (parent_id, name)
             );
             CREATE INDEX IF NOT EXISTS edge_entity ON edge (entity_id);",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO entity (id) VALUES (?1)",
            params![ROOT_ENTITY],
        )?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        let conn = guard
            .as_ref()
            .ok_or_else(|| DaemonError::InvalidState("name graph is closed".to_string()))?;
        f(conn)
    }

    fn resolve(conn: &Connection, parts: &[&str]) -> Result<Option<String>> {
        let mut current = ROOT_ENTITY.to_string();
        for part in parts {
            let next: Option<String> = conn
                .query_row(
                    "SELECT entity_id FROM edge WHERE parent_id = ?1 AND name = ?2",
                    params![current, part],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            match next {
                Some(id) => current = id,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Associate `path` with `id`. Fails with a conflict if the path is
    /// already taken.
    pub fn set(&self, path: &str, id: &str) -> Result<()> {
        let parts = split_path(path)?;
        self.with_conn(|conn| {
            let (dirs, name) = parts.split_at(parts.len() - 1);
            let parent = Self::resolve(conn, dirs)?
                .ok_or_else(|| DaemonError::NotFound(format!("Could not find entity for {}", path)))?;

            let taken: Option<String> = conn
                .query_row(
                    "SELECT entity_id FROM edge WHERE parent_id = ?1 AND name = ?2",
                    params![parent, name[0]],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;
            if taken.is_some() {
                return Err(DaemonError::Conflict(format!(
                    "name is not unique: {}",
                    path
                )));
            }

            conn.execute("INSERT OR IGNORE INTO entity (id) VALUES (?1)", params![id])?;
            conn.execute(
                "INSERT INTO edge (parent_id, entity_id, name) VALUES (?1, ?2, ?3)",
                params![parent, id, name[0]],
            )?;
            Ok(())
        })
    }

    /// Container id associated with `path`, if any.
    pub fn get(&self, path: &str) -> Option<String> {
        let parts = split_path(path).ok()?;
        self.with_conn(|conn| Self::resolve(conn, &parts))
            .ok()
            .flatten()
            .filter(|id| id != ROOT_ENTITY)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Remove the edge named by `path`. The entity itself stays until purged.
    pub fn delete(&self, path: &str) -> Result<()> {
        let parts = split_path(path)?;
        self.with_conn(|conn| {
            let (dirs, name) = parts.split_at(parts.len() - 1);
            let parent = Self::resolve(conn, dirs)?
                .ok_or_else(|| DaemonError::NotFound(path.to_string()))?;
            let removed = conn.execute(
                "DELETE FROM edge WHERE parent_id = ?1 AND name = ?2",
                params![parent, name[0]],
            )?;
            if removed == 0 {
                return Err(DaemonError::NotFound(path.to_string()));
            }
            Ok(())
        })
    }

    /// Remove every edge referencing `id` (as target or as parent) and the
    /// entity itself. Returns the number of edges removed.
    pub fn purge(&self, id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM edge WHERE entity_id = ?1 OR parent_id = ?1",
                params![id],
            )?;
            conn.execute("DELETE FROM entity WHERE id = ?1", params![id])?;
            Ok(removed)
        })
    }

    /// Number of paths referring to `id`.
    pub fn refs(&self, id: &str) -> usize {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM edge WHERE entity_id = ?1",
                params![id],
                |row| row.get::<_, i64>(0),
            )? as usize)
        })
        .unwrap_or(0)
    }

    /// Walk the subtree under `root`, yielding `(path, id)` pairs.
    ///
    /// `depth` limits how many levels are descended; negative means
    /// unlimited (a cyclic graph will then not terminate, as documented).
    pub fn walk(&self, root: &str, depth: i32) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let root_entity = if root == "/" {
                ROOT_ENTITY.to_string()
            } else {
                let parts = split_path(root)?;
                Self::resolve(conn, &parts)?
                    .ok_or_else(|| DaemonError::NotFound(root.to_string()))?
            };
            let prefix = if root == "/" { "" } else { root.trim_end_matches('/') };

            let mut out = Vec::new();
            let mut queue = vec![(prefix.to_string(), root_entity, 0i32)];
            while let Some((path, entity, level)) = queue.pop() {
                if depth >= 0 && level >= depth {
                    continue;
                }
                let mut stmt = conn.prepare(
                    "SELECT name, entity_id FROM edge WHERE parent_id = ?1 ORDER BY name",
                )?;
                let children: Vec<(String, String)> = stmt
                    .query_map(params![entity], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<std::result::Result<_, _>>()?;
                for (name, child) in children {
                    let child_path = format!("{}/{}", path, name);
                    out.push((child_path.clone(), child.clone()));
                    queue.push((child_path, child, level + 1));
                }
            }
            Ok(out)
        })
    }

    /// Close the underlying database. Later calls fail with an invalid-state
    /// error; used by the ordered shutdown hook.
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(conn) = guard.take()
            && let Err((_, e)) = conn.close()
        {
            log::warn!("error closing name graph: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> NameGraph {
        NameGraph::open_in_memory().unwrap()
    }

    #[test]
    fn test_set_and_get() {
        let g = graph();
        g.set("/web", "id1").unwrap();
        assert_eq!(g.get("/web"), Some("id1".to_string()));
        assert!(g.exists("/web"));
        assert!(!g.exists("/db"));
    }

    #[test]
    fn test_set_duplicate_is_conflict() {
        let g = graph();
        g.set("/web", "id1").unwrap();
        let err = g.set("/web", "id2").unwrap_err();
        assert!(matches!(err, DaemonError::Conflict(_)));
        // Original mapping untouched.
        assert_eq!(g.get("/web"), Some("id1".to_string()));
    }

    #[test]
    fn test_link_paths() {
        let g = graph();
        g.set("/web", "web-id").unwrap();
        g.set("/web/db", "db-id").unwrap();
        assert_eq!(g.get("/web/db"), Some("db-id".to_string()));
        // The same container can carry several names.
        g.set("/db", "db-id").unwrap();
        assert_eq!(g.refs("db-id"), 2);
    }

    #[test]
    fn test_set_under_missing_parent() {
        let g = graph();
        let err = g.set("/missing/alias", "id1").unwrap_err();
        assert!(matches!(err, DaemonError::NotFound(_)));
    }

    #[test]
    fn test_delete_edge() {
        let g = graph();
        g.set("/web", "id1").unwrap();
        g.delete("/web").unwrap();
        assert!(!g.exists("/web"));
        assert!(g.delete("/web").is_err());
        // Name can be reused after deletion.
        g.set("/web", "id2").unwrap();
    }

    #[test]
    fn test_purge_removes_all_references() {
        let g = graph();
        g.set("/web", "web-id").unwrap();
        g.set("/db", "db-id").unwrap();
        g.set("/web/db", "db-id").unwrap();
        let removed = g.purge("db-id").unwrap();
        assert_eq!(removed, 2);
        assert!(!g.exists("/db"));
        assert!(!g.exists("/web/db"));
        assert!(g.exists("/web"));
        assert_eq!(g.refs("db-id"), 0);
    }

    #[test]
    fn test_walk_from_root() {
        let g = graph();
        g.set("/web", "web-id").unwrap();
        g.set("/db", "db-id").unwrap();
        g.set("/web/db", "db-id").unwrap();

        let mut all = g.walk("/", -1).unwrap();
        all.sort();
        assert_eq!(
            all,
            vec![
                ("/db".to_string(), "db-id".to_string()),
                ("/web".to_string(), "web-id".to_string()),
                ("/web/db".to_string(), "db-id".to_string()),
            ]
        );
    }

    #[test]
    fn test_walk_depth_limited() {
        let g = graph();
        g.set("/web", "web-id").unwrap();
        g.set("/web/db", "db-id").unwrap();

        let shallow = g.walk("/", 1).unwrap();
        assert_eq!(shallow.len(), 1);
        assert_eq!(shallow[0].0, "/web");

        let sub = g.walk("/web", 1).unwrap();
        assert_eq!(sub, vec![("/web/db".to_string(), "db-id".to_string())]);
    }

    #[test]
    fn test_invalid_paths() {
        let g = graph();
        assert!(g.set("web", "id1").is_err());
        assert!(g.set("/", "id1").is_err());
        assert_eq!(g.get("not-rooted"), None);
    }

    #[test]
    fn test_close_then_use() {
        let g = graph();
        g.set("/web", "id1").unwrap();
        g.close();
        assert!(g.set("/db", "id2").is_err());
        assert_eq!(g.get("/web"), None);
    }

    #[test]
    fn test_persistence_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("linkgraph.db");
        {
            let g = NameGraph::open(&db).unwrap();
            g.set("/web", "id1").unwrap();
            g.close();
        }
        let g = NameGraph::open(&db).unwrap();
        assert_eq!(g.get("/web"), Some("id1".to_string()));
    }
}
