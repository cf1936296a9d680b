//! Keeper State Files
//!
//! The keeper's durable bookkeeping: the binary state record holding its
//! identity and FSM position, the init sentinel marking a PGDATA mid-init,
//! and the pid file guarding exclusive ownership of the data directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fsm::Role;
use crate::protocol::FrameHeader;

/// Bump when the record layout changes
const STATE_FILE_VERSION: u32 = 1;

/// The keeper's persistent state record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperState {
    /// Record layout version
    pub version: u32,
    /// Monitor-assigned node id
    pub node_id: i64,
    /// Group within the formation
    pub group_id: i32,
    /// Role last confirmed by a completed transition
    pub current_role: Role,
    /// Goal role last received from the monitor
    pub assigned_role: Role,
    /// PostgreSQL system identifier (0 until PGDATA exists)
    pub system_identifier: u64,
    /// Last successful monitor contact, epoch milliseconds
    pub last_monitor_contact: i64,
}

impl KeeperState {
    /// Fresh state for a node that just registered
    pub fn new(node_id: i64, group_id: i32, assigned_role: Role) -> Self {
        Self {
            version: STATE_FILE_VERSION,
            node_id,
            group_id,
            current_role: Role::Init,
            assigned_role,
            system_identifier: 0,
            last_monitor_contact: 0,
        }
    }

    /// Load the record, verifying checksum and version
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < FrameHeader::SIZE {
            return Err(Error::StateFileCorrupted(format!(
                "{}: truncated ({} bytes)",
                path.display(),
                bytes.len()
            )));
        }
        let mut header_bytes = [0u8; FrameHeader::SIZE];
        header_bytes.copy_from_slice(&bytes[..FrameHeader::SIZE]);
        let header = FrameHeader::from_bytes(&header_bytes);

        let body = &bytes[FrameHeader::SIZE..];
        if body.len() != header.length as usize {
            return Err(Error::StateFileCorrupted(format!(
                "{}: length mismatch",
                path.display()
            )));
        }
        if crc32fast::hash(body) != header.checksum {
            return Err(Error::StateFileCorrupted(format!(
                "{}: checksum mismatch",
                path.display()
            )));
        }

        let state: KeeperState = bincode::deserialize(body)?;
        if state.version != STATE_FILE_VERSION {
            return Err(Error::StateFileCorrupted(format!(
                "{}: version {} not supported",
                path.display(),
                state.version
            )));
        }
        Ok(state)
    }

    /// Write the record atomically (temp file, fsync, rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let body = bincode::serialize(self)?;
        let header = FrameHeader::new(&body);

        let mut bytes = Vec::with_capacity(FrameHeader::SIZE + body.len());
        bytes.extend_from_slice(&header.to_bytes());
        bytes.extend_from_slice(&body);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Marker distinguishing "PGDATA exists and belongs to us mid-init" from
/// "PGDATA was handed over by the operator". Present from registration
/// until the node first reaches single or secondary.
#[derive(Debug, Clone)]
pub struct InitSentinel {
    path: PathBuf,
}

impl InitSentinel {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn create(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, b"")?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Pid file enforcing one keeper per data directory. The first line holds
/// the main pid; further lines list supervised children.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Take ownership, refusing when another live keeper holds the file
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Some(pid) = content
                .lines()
                .next()
                .and_then(|line| line.trim().parse::<i32>().ok())
            {
                if pid != std::process::id() as i32 && process_alive(pid) {
                    return Err(Error::PgdataOwned(format!(
                        "{} held by pid {}",
                        path.display(),
                        pid
                    )));
                }
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, format!("{}\n", std::process::id()))?;
        Ok(Self { path })
    }

    /// Rewrite the child manifest below the main pid
    pub fn set_children(&self, children: &[&str]) -> Result<()> {
        let mut content = format!("{}\n", std::process::id());
        for child in children {
            content.push_str(child);
            content.push('\n');
        }
        std::fs::write(&self.path, content)?;
        Ok(())
    }

    /// Release the file on clean shutdown
    pub fn release(self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Signal 0 probe: does the pid exist?
fn process_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.state");

        let mut state = KeeperState::new(3, 0, Role::WaitStandby);
        state.system_identifier = 7015282526388021354;
        state.save(&path).unwrap();

        let loaded = KeeperState::load(&path).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.state");

        let state = KeeperState::new(1, 0, Role::Single);
        state.save(&path).unwrap();
        state.save(&path).unwrap();
        assert_eq!(KeeperState::load(&path).unwrap(), state);
    }

    #[test]
    fn test_corrupted_state_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.state");

        let state = KeeperState::new(3, 0, Role::Secondary);
        state.save(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = KeeperState::load(&path).unwrap_err();
        assert!(matches!(err, Error::StateFileCorrupted(_)));
    }

    #[test]
    fn test_sentinel_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let sentinel = InitSentinel::new(dir.path().join("steward.init"));
        assert!(!sentinel.exists());
        sentinel.create().unwrap();
        assert!(sentinel.exists());
        sentinel.remove().unwrap();
        sentinel.remove().unwrap();
        assert!(!sentinel.exists());
    }

    #[test]
    fn test_pid_file_guards_against_live_owner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.pid");

        // Our own pid: re-acquire succeeds (restart after crash)
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        let pid_file = PidFile::acquire(path.clone()).unwrap();
        pid_file.set_children(&["pg_basebackup:4242"]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("pg_basebackup:4242"));
        pid_file.release().unwrap();
        assert!(!path.exists());

        // A dead pid is taken over
        std::fs::write(&path, "999999999\n").unwrap();
        let pid_file = PidFile::acquire(path.clone()).unwrap();
        pid_file.release().unwrap();
    }
}
