//! Managed PostgreSQL Configuration
//!
//! Steward owns one configuration file, `steward.conf`, included from
//! `postgresql.conf`. Settings that must be in place before the server
//! starts (recovery target, read-only gate, tuning) are written here; a
//! running server picks changes up on reload.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::pg::hba::write_atomic;

const CONF_NAME: &str = "steward.conf";
const INCLUDE_LINE: &str = "include 'steward.conf'";

/// Manager for the steward-owned configuration file
#[derive(Debug, Clone)]
pub struct ManagedConf {
    pgdata: PathBuf,
}

impl ManagedConf {
    pub fn new(pgdata: &Path) -> Self {
        Self {
            pgdata: pgdata.to_path_buf(),
        }
    }

    fn conf_path(&self) -> PathBuf {
        self.pgdata.join(CONF_NAME)
    }

    /// Baseline settings for a managed instance
    pub fn base_settings(port: u16) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        settings.insert("port".to_string(), port.to_string());
        settings.insert("listen_addresses".to_string(), "'*'".to_string());
        settings.insert("wal_level".to_string(), "replica".to_string());
        settings.insert("hot_standby".to_string(), "on".to_string());
        settings.insert("synchronous_commit".to_string(), "on".to_string());
        settings.insert("max_wal_senders".to_string(), "12".to_string());
        settings.insert("max_replication_slots".to_string(), "12".to_string());
        settings
    }

    /// Ensure postgresql.conf includes the managed file
    pub fn ensure_included(&self) -> Result<()> {
        let main = self.pgdata.join("postgresql.conf");
        let content = if main.exists() {
            std::fs::read_to_string(&main)?
        } else {
            String::new()
        };
        if content.lines().any(|l| l.trim() == INCLUDE_LINE) {
            return Ok(());
        }
        let mut out = content;
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(INCLUDE_LINE);
        out.push('\n');
        write_atomic(&main, out.as_bytes())?;
        Ok(())
    }

    /// Read the settings currently written to the managed file
    pub fn current(&self) -> Result<BTreeMap<String, String>> {
        let path = self.conf_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let mut settings = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                settings.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Ok(settings)
    }

    /// Write the managed file from the desired settings.
    /// Returns true when the file changed (caller reloads or restarts).
    pub fn write(&self, settings: &BTreeMap<String, String>) -> Result<bool> {
        if self.current()? == *settings {
            return Ok(false);
        }
        let mut out = String::from("# managed by steward, do not edit\n");
        for (key, value) in settings {
            out.push_str(&format!("{key} = {value}\n"));
        }
        write_atomic(&self.conf_path(), out.as_bytes())?;
        Ok(true)
    }

    /// Configure the instance as a standby of the given upstream
    pub fn write_standby_config(
        &self,
        mut settings: BTreeMap<String, String>,
        upstream_conninfo: &str,
        slot_name: &str,
    ) -> Result<bool> {
        settings.insert(
            "primary_conninfo".to_string(),
            format!("'{upstream_conninfo}'"),
        );
        settings.insert("primary_slot_name".to_string(), format!("'{slot_name}'"));
        let changed = self.write(&settings)?;
        let signal = self.pgdata.join("standby.signal");
        if !signal.exists() {
            std::fs::write(&signal, b"")?;
            return Ok(true);
        }
        Ok(changed)
    }

    /// Drop the recovery settings so no further WAL can arrive
    pub fn write_detached_standby_config(
        &self,
        mut settings: BTreeMap<String, String>,
    ) -> Result<bool> {
        settings.remove("primary_conninfo");
        settings.remove("primary_slot_name");
        let changed = self.write(&settings)?;
        let signal = self.pgdata.join("standby.signal");
        if !signal.exists() {
            std::fs::write(&signal, b"")?;
            return Ok(true);
        }
        Ok(changed)
    }

    /// Whether the standby signal file is present
    pub fn is_standby(&self) -> bool {
        self.pgdata.join("standby.signal").exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_reread() {
        let dir = tempfile::tempdir().unwrap();
        let conf = ManagedConf::new(dir.path());

        let settings = ManagedConf::base_settings(5433);
        assert!(conf.write(&settings).unwrap());
        assert!(!conf.write(&settings).unwrap());
        assert_eq!(conf.current().unwrap(), settings);
    }

    #[test]
    fn test_include_is_added_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("postgresql.conf"), "shared_buffers = 128MB\n").unwrap();
        let conf = ManagedConf::new(dir.path());

        conf.ensure_included().unwrap();
        conf.ensure_included().unwrap();

        let content = std::fs::read_to_string(dir.path().join("postgresql.conf")).unwrap();
        assert_eq!(content.matches(INCLUDE_LINE).count(), 1);
    }

    #[test]
    fn test_standby_config_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let conf = ManagedConf::new(dir.path());

        let base = ManagedConf::base_settings(5432);
        conf.write_standby_config(base.clone(), "host=db1 port=5432 user=replicator", "steward_2")
            .unwrap();
        assert!(conf.is_standby());
        let current = conf.current().unwrap();
        assert!(current["primary_conninfo"].contains("db1"));

        conf.write_detached_standby_config(base).unwrap();
        let current = conf.current().unwrap();
        assert!(!current.contains_key("primary_conninfo"));
        assert!(conf.is_standby());
    }
}
