//! Host-Based Authentication
//!
//! Owns one marker-delimited block inside `pg_hba.conf`. The desired entry
//! set is a pure function of the current peer list; every tick the keeper
//! recomputes it, diffs against the block on disk, and rewrites + reloads
//! only when something changed.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::protocol::PeerNode;

const BLOCK_BEGIN: &str = "# BEGIN steward";
const BLOCK_END: &str = "# END steward";

/// Manager for the steward-owned block of pg_hba.conf
#[derive(Debug, Clone)]
pub struct HbaManager {
    hba_path: PathBuf,
}

impl HbaManager {
    /// Create a manager for the pg_hba.conf inside the given PGDATA
    pub fn new(pgdata: &Path) -> Self {
        Self {
            hba_path: pgdata.join("pg_hba.conf"),
        }
    }

    #[cfg(test)]
    fn at(path: PathBuf) -> Self {
        Self { hba_path: path }
    }

    /// Entries permitting replication and control connections from the
    /// given peers only
    pub fn desired_entries(peers: &[PeerNode], replication_user: &str, dbname: &str) -> Vec<String> {
        let mut entries = Vec::new();
        for peer in peers {
            let host = host_spec(&peer.host);
            entries.push(format!(
                "host replication {replication_user} {host} trust"
            ));
            entries.push(format!("host {dbname} {replication_user} {host} trust"));
        }
        entries.sort();
        entries.dedup();
        entries
    }

    /// Read the entries currently inside the managed block
    pub fn current_entries(&self) -> Result<Vec<String>> {
        if !self.hba_path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.hba_path)?;
        let mut inside = false;
        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim() == BLOCK_BEGIN {
                inside = true;
                continue;
            }
            if line.trim() == BLOCK_END {
                inside = false;
                continue;
            }
            if inside && !line.trim().is_empty() {
                entries.push(line.trim().to_string());
            }
        }
        Ok(entries)
    }

    /// Make the managed block equal to the desired entries.
    /// Returns true when the file was rewritten (caller must reload).
    pub fn ensure(&self, desired: &[String]) -> Result<bool> {
        let mut current = self.current_entries()?;
        current.sort();
        let mut wanted: Vec<String> = desired.to_vec();
        wanted.sort();
        if current == wanted {
            return Ok(false);
        }

        let content = if self.hba_path.exists() {
            std::fs::read_to_string(&self.hba_path)?
        } else {
            String::new()
        };

        // Strip any previous managed block
        let mut kept = Vec::new();
        let mut inside = false;
        for line in content.lines() {
            if line.trim() == BLOCK_BEGIN {
                inside = true;
                continue;
            }
            if line.trim() == BLOCK_END {
                inside = false;
                continue;
            }
            if !inside {
                kept.push(line.to_string());
            }
        }

        // Trailing blank lines accumulate across rewrites otherwise
        while kept.last().map_or(false, |l| l.trim().is_empty()) {
            kept.pop();
        }

        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(BLOCK_BEGIN);
        out.push('\n');
        for entry in &wanted {
            out.push_str(entry);
            out.push('\n');
        }
        out.push_str(BLOCK_END);
        out.push('\n');

        write_atomic(&self.hba_path, out.as_bytes())?;
        tracing::info!(
            "rewrote pg_hba.conf managed block with {} entries",
            wanted.len()
        );
        Ok(true)
    }
}

/// CIDR spec for a peer host: addresses get a host mask, names pass through
fn host_spec(host: &str) -> String {
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        format!("{host}/32")
    } else if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("{host}/128")
    } else {
        host.to_string()
    }
}

/// Write a file through a temp file and rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Role;
    use crate::pg::Lsn;
    use crate::protocol::Health;

    fn peer(name: &str, host: &str) -> PeerNode {
        PeerNode {
            node_id: 2,
            name: name.to_string(),
            host: host.to_string(),
            port: 5432,
            current_role: Role::Secondary,
            health: Health::Good,
            reported_lsn: Lsn::ZERO,
        }
    }

    #[test]
    fn test_desired_entries() {
        let peers = vec![peer("node-b", "10.0.0.2"), peer("node-c", "db3.internal")];
        let entries = HbaManager::desired_entries(&peers, "replicator", "app");
        assert!(entries.contains(&"host replication replicator 10.0.0.2/32 trust".to_string()));
        assert!(entries.contains(&"host replication replicator db3.internal trust".to_string()));
        assert!(entries.contains(&"host app replicator 10.0.0.2/32 trust".to_string()));
    }

    #[test]
    fn test_ensure_writes_once_per_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        std::fs::write(&path, "local all all trust\n").unwrap();

        let hba = HbaManager::at(path.clone());
        let desired = HbaManager::desired_entries(&[peer("node-b", "10.0.0.2")], "replicator", "app");

        assert!(hba.ensure(&desired).unwrap());
        // Same desired set: no rewrite
        assert!(!hba.ensure(&desired).unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("local all all trust\n"));
        assert!(content.contains(BLOCK_BEGIN));
        assert!(content.contains("10.0.0.2/32"));
    }

    #[test]
    fn test_stale_peers_are_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        std::fs::write(&path, "").unwrap();

        let hba = HbaManager::at(path.clone());
        let two = HbaManager::desired_entries(
            &[peer("node-b", "10.0.0.2"), peer("node-c", "10.0.0.3")],
            "replicator",
            "app",
        );
        hba.ensure(&two).unwrap();

        let one = HbaManager::desired_entries(&[peer("node-b", "10.0.0.2")], "replicator", "app");
        assert!(hba.ensure(&one).unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("10.0.0.3"));
        assert_eq!(content.matches(BLOCK_BEGIN).count(), 1);
    }
}
