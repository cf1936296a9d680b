//! Monitor Store
//!
//! Durable relational state for the monitor: formations and nodes, backed
//! by SQLite. All role fields are written here and nowhere else; the store
//! is the single writer that serializes the monitor's view of each group.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::fsm::Role;
use crate::pg::Lsn;
use crate::protocol::Health;

/// A formation row
#[derive(Debug, Clone)]
pub struct FormationRecord {
    pub name: String,
    pub kind: String,
    pub dbname: String,
    pub has_secondary: bool,
    pub number_sync_standbys: i32,
}

/// A node row
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: i64,
    pub formation: String,
    pub group_id: i32,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub system_identifier: Option<u64>,
    pub current_role: Role,
    pub assigned_role: Role,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
    pub reported_lsn: Lsn,
    pub pg_is_running: bool,
    pub sync_state: String,
    pub health: Health,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl NodeRecord {
    /// Whether the node heart-beat within the given window
    pub fn is_fresh(&self, window: chrono::Duration, now: DateTime<Utc>) -> bool {
        match self.last_seen_at {
            Some(seen) => now - seen < window,
            None => false,
        }
    }

    /// Whether this node may win a failover election
    pub fn is_failover_candidate(&self) -> bool {
        self.candidate_priority > 0 && self.replication_quorum
    }
}

fn health_to_int(h: Health) -> i64 {
    match h {
        Health::Unknown => -1,
        Health::Bad => 0,
        Health::Good => 1,
    }
}

fn health_from_int(i: i64) -> Health {
    match i {
        1 => Health::Good,
        0 => Health::Bad,
        _ => Health::Unknown,
    }
}

/// Persistent monitor state backed by SQLite
pub struct MonitorStore {
    /// Database connection
    conn: Mutex<Connection>,
}

impl MonitorStore {
    /// Create or open the monitor database
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("monitor.db");
        let conn = Connection::open(db_path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS formation (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL DEFAULT 'standalone',
                dbname TEXT NOT NULL DEFAULT 'postgres',
                has_secondary INTEGER NOT NULL DEFAULT 1,
                number_sync_standbys INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS node (
                node_id INTEGER PRIMARY KEY AUTOINCREMENT,
                formation TEXT NOT NULL REFERENCES formation(name),
                group_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                system_identifier TEXT,
                current_role TEXT NOT NULL,
                assigned_role TEXT NOT NULL,
                candidate_priority INTEGER NOT NULL DEFAULT 50,
                replication_quorum INTEGER NOT NULL DEFAULT 1,
                reported_lsn INTEGER NOT NULL DEFAULT 0,
                pg_is_running INTEGER NOT NULL DEFAULT 0,
                sync_state TEXT NOT NULL DEFAULT '',
                health INTEGER NOT NULL DEFAULT -1,
                last_seen_at INTEGER,
                UNIQUE(formation, name)
            );

            CREATE INDEX IF NOT EXISTS idx_node_group
                ON node(formation, group_id);
            "#,
        )?;
        Ok(())
    }

    fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeRecord> {
        let system_identifier: Option<String> = row.get("system_identifier")?;
        let current_role: String = row.get("current_role")?;
        let assigned_role: String = row.get("assigned_role")?;
        let last_seen: Option<i64> = row.get("last_seen_at")?;
        Ok(NodeRecord {
            node_id: row.get("node_id")?,
            formation: row.get("formation")?,
            group_id: row.get("group_id")?,
            name: row.get("name")?,
            host: row.get("host")?,
            port: row.get::<_, i64>("port")? as u16,
            system_identifier: system_identifier.and_then(|s| s.parse().ok()),
            current_role: current_role.parse().unwrap_or(Role::Init),
            assigned_role: assigned_role.parse().unwrap_or(Role::Init),
            candidate_priority: row.get("candidate_priority")?,
            replication_quorum: row.get::<_, i64>("replication_quorum")? != 0,
            reported_lsn: Lsn(row.get::<_, i64>("reported_lsn")? as u64),
            pg_is_running: row.get::<_, i64>("pg_is_running")? != 0,
            sync_state: row.get("sync_state")?,
            health: health_from_int(row.get("health")?),
            last_seen_at: last_seen.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        })
    }

    const NODE_COLUMNS: &'static str = "node_id, formation, group_id, name, host, port, \
         system_identifier, current_role, assigned_role, candidate_priority, \
         replication_quorum, reported_lsn, pg_is_running, sync_state, health, last_seen_at";

    // ========== Formations ==========

    /// Fetch a formation, creating it with defaults on first reference
    pub async fn ensure_formation(&self, name: &str, dbname: &str) -> Result<FormationRecord> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO formation (name, dbname) VALUES (?1, ?2)",
            params![name, dbname],
        )?;
        Self::formation_inner(&conn, name)?
            .ok_or_else(|| Error::Monitor(format!("formation {name} not found after insert")))
    }

    fn formation_inner(conn: &Connection, name: &str) -> Result<Option<FormationRecord>> {
        let row = conn
            .query_row(
                "SELECT name, kind, dbname, has_secondary, number_sync_standbys
                   FROM formation WHERE name = ?1",
                params![name],
                |row| {
                    Ok(FormationRecord {
                        name: row.get(0)?,
                        kind: row.get(1)?,
                        dbname: row.get(2)?,
                        has_secondary: row.get::<_, i64>(3)? != 0,
                        number_sync_standbys: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Look up a formation
    pub async fn get_formation(&self, name: &str) -> Result<Option<FormationRecord>> {
        let conn = self.conn.lock().await;
        Self::formation_inner(&conn, name)
    }

    /// Allow or refuse standbys in a formation's groups
    pub async fn set_has_secondary(&self, name: &str, value: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE formation SET has_secondary = ?2 WHERE name = ?1",
            params![name, value as i64],
        )?;
        if changed == 0 {
            return Err(Error::Monitor(format!("formation {name} not found")));
        }
        Ok(())
    }

    /// Change the synchronous standby requirement of a formation
    pub async fn set_number_sync_standbys(&self, name: &str, value: i32) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE formation SET number_sync_standbys = ?2 WHERE name = ?1",
            params![name, value],
        )?;
        if changed == 0 {
            return Err(Error::Monitor(format!("formation {name} not found")));
        }
        Ok(())
    }

    // ========== Nodes ==========

    /// Create a node; enforces name uniqueness within the formation
    #[allow(clippy::too_many_arguments)]
    pub async fn create_node(
        &self,
        formation: &str,
        group_id: i32,
        name: &str,
        host: &str,
        port: u16,
        candidate_priority: i32,
        replication_quorum: bool,
        assigned_role: Role,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            r#"
            INSERT INTO node
                (formation, group_id, name, host, port,
                 current_role, assigned_role, candidate_priority, replication_quorum)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                formation,
                group_id,
                name,
                host,
                port as i64,
                Role::Init.as_str(),
                assigned_role.as_str(),
                candidate_priority,
                replication_quorum as i64,
            ],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::NameCollision(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch one node
    pub async fn get_node(&self, node_id: i64) -> Result<Option<NodeRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM node WHERE node_id = ?1", Self::NODE_COLUMNS);
        let row = conn
            .query_row(&sql, params![node_id], Self::row_to_node)
            .optional()?;
        Ok(row)
    }

    /// Fetch a node by formation and name
    pub async fn get_node_by_name(&self, formation: &str, name: &str) -> Result<Option<NodeRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM node WHERE formation = ?1 AND name = ?2",
            Self::NODE_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![formation, name], Self::row_to_node)
            .optional()?;
        Ok(row)
    }

    /// All nodes of a group, ordered by node id
    pub async fn group_nodes(&self, formation: &str, group_id: i32) -> Result<Vec<NodeRecord>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM node WHERE formation = ?1 AND group_id = ?2 ORDER BY node_id",
            Self::NODE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![formation, group_id], Self::row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    /// All nodes, optionally restricted to one formation
    pub async fn all_nodes(&self, formation: Option<&str>) -> Result<Vec<NodeRecord>> {
        let conn = self.conn.lock().await;
        let mut nodes = Vec::new();
        match formation {
            Some(f) => {
                let sql = format!(
                    "SELECT {} FROM node WHERE formation = ?1 ORDER BY formation, group_id, node_id",
                    Self::NODE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![f], Self::row_to_node)?;
                for row in rows {
                    nodes.push(row?);
                }
            }
            None => {
                let sql = format!(
                    "SELECT {} FROM node ORDER BY formation, group_id, node_id",
                    Self::NODE_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], Self::row_to_node)?;
                for row in rows {
                    nodes.push(row?);
                }
            }
        }
        Ok(nodes)
    }

    /// Distinct (formation, group) pairs, for the health scanner
    pub async fn groups(&self) -> Result<Vec<(String, i32)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT DISTINCT formation, group_id FROM node")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Next unused group id within a formation
    pub async fn next_group_id(&self, formation: &str) -> Result<i32> {
        let conn = self.conn.lock().await;
        let max: Option<i32> = conn.query_row(
            "SELECT MAX(group_id) FROM node WHERE formation = ?1",
            params![formation],
            |row| row.get(0),
        )?;
        Ok(max.map_or(0, |m| m + 1))
    }

    /// Record a heartbeat's reported state. The reported LSN is kept
    /// monotonic: a lower value is ignored and logged, never written.
    pub async fn update_reported_state(
        &self,
        node_id: i64,
        current_role: Role,
        pg_is_running: bool,
        reported_lsn: Lsn,
        sync_state: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let previous: Option<i64> = conn
            .query_row(
                "SELECT reported_lsn FROM node WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        let previous = previous.ok_or(Error::NodeNotFound(node_id))?;

        let lsn = if (reported_lsn.0 as i64) < previous {
            tracing::warn!(
                "node {} reported LSN {} below previous {}, keeping previous",
                node_id,
                reported_lsn,
                Lsn(previous as u64)
            );
            previous
        } else {
            reported_lsn.0 as i64
        };

        conn.execute(
            r#"
            UPDATE node
               SET current_role = ?2,
                   pg_is_running = ?3,
                   reported_lsn = ?4,
                   sync_state = ?5,
                   health = 1,
                   last_seen_at = ?6
             WHERE node_id = ?1
            "#,
            params![
                node_id,
                current_role.as_str(),
                pg_is_running as i64,
                lsn,
                sync_state,
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Assign a new goal role
    pub async fn set_assigned_role(&self, node_id: i64, role: Role) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE node SET assigned_role = ?2 WHERE node_id = ?1",
            params![node_id, role.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::NodeNotFound(node_id));
        }
        Ok(())
    }

    /// Mark a node's health
    pub async fn set_health(&self, node_id: i64, health: Health) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE node SET health = ?2 WHERE node_id = ?1",
            params![node_id, health_to_int(health)],
        )?;
        Ok(())
    }

    /// Publish the system identifier. Immutable once set: a different value
    /// is an invariant violation and aborts the write.
    pub async fn set_system_identifier(&self, node_id: i64, ident: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        let existing: Option<Option<String>> = conn
            .query_row(
                "SELECT system_identifier FROM node WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()?;
        let existing = existing.ok_or(Error::NodeNotFound(node_id))?;

        if let Some(current) = existing.and_then(|s| s.parse::<u64>().ok()) {
            if current != ident {
                return Err(Error::SystemIdentifierMismatch {
                    expected: current,
                    found: ident,
                });
            }
            return Ok(());
        }

        conn.execute(
            "UPDATE node SET system_identifier = ?2 WHERE node_id = ?1",
            params![node_id, ident.to_string()],
        )?;
        Ok(())
    }

    /// Change per-node election settings
    pub async fn set_node_settings(
        &self,
        node_id: i64,
        candidate_priority: Option<i32>,
        replication_quorum: Option<bool>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        if let Some(priority) = candidate_priority {
            conn.execute(
                "UPDATE node SET candidate_priority = ?2 WHERE node_id = ?1",
                params![node_id, priority],
            )?;
        }
        if let Some(quorum) = replication_quorum {
            conn.execute(
                "UPDATE node SET replication_quorum = ?2 WHERE node_id = ?1",
                params![node_id, quorum as i64],
            )?;
        }
        Ok(())
    }

    /// Backdate a node's last contact (test hook for liveness logic)
    #[cfg(test)]
    pub async fn set_last_seen(&self, node_id: i64, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE node SET last_seen_at = ?2 WHERE node_id = ?1",
            params![node_id, at.timestamp_millis()],
        )?;
        Ok(())
    }

    /// Delete a node row (after it reached the dropped state)
    pub async fn delete_node(&self, node_id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM node WHERE node_id = ?1", params![node_id])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_two_nodes() -> (MonitorStore, i64, i64) {
        let store = MonitorStore::in_memory().unwrap();
        store.ensure_formation("default", "app").await.unwrap();
        let a = store
            .create_node("default", 0, "node-a", "10.0.0.1", 5432, 50, true, Role::Single)
            .await
            .unwrap();
        let b = store
            .create_node("default", 0, "node-b", "10.0.0.2", 5432, 50, true, Role::WaitStandby)
            .await
            .unwrap();
        (store, a, b)
    }

    #[tokio::test]
    async fn test_create_and_fetch_nodes() {
        let (store, a, b) = store_with_two_nodes().await;
        assert_ne!(a, b);

        let node = store.get_node(a).await.unwrap().unwrap();
        assert_eq!(node.name, "node-a");
        assert_eq!(node.current_role, Role::Init);
        assert_eq!(node.assigned_role, Role::Single);
        assert_eq!(node.health, Health::Unknown);

        let group = store.group_nodes("default", 0).await.unwrap();
        assert_eq!(group.len(), 2);
    }

    #[tokio::test]
    async fn test_name_collision() {
        let (store, _, _) = store_with_two_nodes().await;
        let err = store
            .create_node("default", 0, "node-a", "10.0.0.9", 5432, 50, true, Role::WaitStandby)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
    }

    #[tokio::test]
    async fn test_reported_lsn_is_monotonic() {
        let (store, a, _) = store_with_two_nodes().await;
        store
            .update_reported_state(a, Role::Single, true, Lsn(0x3000), "")
            .await
            .unwrap();
        store
            .update_reported_state(a, Role::Single, true, Lsn(0x2000), "")
            .await
            .unwrap();
        let node = store.get_node(a).await.unwrap().unwrap();
        assert_eq!(node.reported_lsn, Lsn(0x3000));

        store
            .update_reported_state(a, Role::Single, true, Lsn(0x4000), "")
            .await
            .unwrap();
        let node = store.get_node(a).await.unwrap().unwrap();
        assert_eq!(node.reported_lsn, Lsn(0x4000));
    }

    #[tokio::test]
    async fn test_system_identifier_is_immutable() {
        let (store, a, _) = store_with_two_nodes().await;
        store.set_system_identifier(a, 7015).await.unwrap();
        // Same value is fine (idempotent publication)
        store.set_system_identifier(a, 7015).await.unwrap();
        let err = store.set_system_identifier(a, 9999).await.unwrap_err();
        assert!(matches!(err, Error::SystemIdentifierMismatch { .. }));
    }

    #[tokio::test]
    async fn test_register_drop_register_gets_fresh_id() {
        let (store, a, _) = store_with_two_nodes().await;
        store.delete_node(a).await.unwrap();
        let a2 = store
            .create_node("default", 0, "node-a", "10.0.0.1", 5432, 50, true, Role::WaitStandby)
            .await
            .unwrap();
        assert_ne!(a, a2);
    }

    #[tokio::test]
    async fn test_formation_settings() {
        let (store, _, _) = store_with_two_nodes().await;
        let formation = store.get_formation("default").await.unwrap().unwrap();
        assert_eq!(formation.number_sync_standbys, 1);
        store.set_number_sync_standbys("default", 2).await.unwrap();
        let formation = store.get_formation("default").await.unwrap().unwrap();
        assert_eq!(formation.number_sync_standbys, 2);
    }
}
