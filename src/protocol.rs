//! Monitor Protocol
//!
//! Defines the wire protocol between keepers (and stewardctl) and the
//! monitor. Every request is idempotent: repeating a call with the same
//! payload yields the same answer modulo state advancement on the monitor.

use serde::{Deserialize, Serialize};

use crate::fsm::Role;
use crate::pg::Lsn;

/// Health of a node as tracked by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Unknown,
    Good,
    Bad,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Unknown => write!(f, "unknown"),
            Health::Good => write!(f, "good"),
            Health::Bad => write!(f, "bad"),
        }
    }
}

/// Address of a node's PostgreSQL instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    pub node_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
}

/// A peer of the calling node, with enough state to derive local resources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNode {
    pub node_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub current_role: Role,
    pub health: Health,
    pub reported_lsn: Lsn,
}

/// One row of `show state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub formation: String,
    pub group_id: i32,
    pub node_id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub current_role: Role,
    pub assigned_role: Role,
    pub reported_lsn: Lsn,
    pub health: Health,
    pub candidate_priority: i32,
    pub replication_quorum: bool,
}

/// Protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Node lifecycle ==========
    /// First contact: create the node, receive identity and initial goal
    Register {
        formation: String,
        group: Option<i32>,
        name: String,
        host: String,
        port: u16,
        dbname: String,
        candidate_priority: i32,
        replication_quorum: bool,
        system_identifier: Option<u64>,
        /// The role the keeper believes it is in (normally `init`)
        desired_role: Option<Role>,
    },

    /// Registration result
    Registered {
        node_id: i64,
        group_id: i32,
        assigned_role: Role,
    },

    /// Periodic heartbeat carrying the locally observed state
    NodeActive {
        node_id: i64,
        group_id: i32,
        current_role: Role,
        pg_is_running: bool,
        current_lsn: Lsn,
        sync_state: String,
    },

    /// Heartbeat answer carrying the goal state
    Assignment {
        node_id: i64,
        group_id: i32,
        assigned_role: Role,
    },

    /// Publish the system identifier once PGDATA exists
    SetSystemIdentifier { node_id: i64, system_identifier: u64 },

    /// Remove a node from its group
    RemoveNode { node_id: i64 },

    // ========== Topology queries ==========
    /// Who is the primary of this group?
    GetPrimary { formation: String, group: i32 },

    /// Primary lookup result ("none" is a valid answer)
    PrimaryNode { node: Option<NodeAddress> },

    /// Everyone else in the calling node's group
    GetOtherNodes {
        node_id: i64,
        role_filter: Option<Role>,
    },

    /// Peer listing
    OtherNodes { nodes: Vec<PeerNode> },

    /// Replication settings the caller should apply
    GetSettings { node_id: i64 },

    /// Settings answer
    Settings {
        number_sync_standbys: i32,
        synchronous_standby_names: String,
    },

    // ========== Operator surface ==========
    /// Change the formation-wide synchronous standby requirement
    SetGroupSettings {
        formation: String,
        number_sync_standbys: i32,
    },

    /// Change per-node election settings
    SetNodeSettings {
        node_id: i64,
        candidate_priority: Option<i32>,
        replication_quorum: Option<bool>,
    },

    /// Pause a standby for maintenance
    StartMaintenance { node_id: i64 },

    /// Bring a standby back from maintenance
    StopMaintenance { node_id: i64 },

    /// Operator-initiated failover of a healthy group
    PerformFailover { formation: String, group: i32 },

    /// Formation-wide state listing
    CurrentState { formation: Option<String> },

    /// State listing answer
    State { nodes: Vec<NodeSummary> },

    /// Plain acknowledgment
    Ack,

    // ========== Error ==========
    /// Error response
    Error { code: ErrorCode, message: String },
}

/// Error codes for protocol errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Caller's node id is not registered
    UnknownNode,
    /// Caller's group id does not match the monitor's records
    StaleGroup,
    /// Node name already taken in the formation
    NameCollision,
    /// Group does not accept another node
    GroupFull,
    /// Setting rejected (bound check or unsatisfiable quorum)
    InvalidSetting,
    /// Assignment or report outside the legal transition set
    FsmViolation,
    /// Internal monitor error
    Internal,
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Register { .. } => "Register",
            Message::Registered { .. } => "Registered",
            Message::NodeActive { .. } => "NodeActive",
            Message::Assignment { .. } => "Assignment",
            Message::SetSystemIdentifier { .. } => "SetSystemIdentifier",
            Message::RemoveNode { .. } => "RemoveNode",
            Message::GetPrimary { .. } => "GetPrimary",
            Message::PrimaryNode { .. } => "PrimaryNode",
            Message::GetOtherNodes { .. } => "GetOtherNodes",
            Message::OtherNodes { .. } => "OtherNodes",
            Message::GetSettings { .. } => "GetSettings",
            Message::Settings { .. } => "Settings",
            Message::SetGroupSettings { .. } => "SetGroupSettings",
            Message::SetNodeSettings { .. } => "SetNodeSettings",
            Message::StartMaintenance { .. } => "StartMaintenance",
            Message::StopMaintenance { .. } => "StopMaintenance",
            Message::PerformFailover { .. } => "PerformFailover",
            Message::CurrentState { .. } => "CurrentState",
            Message::State { .. } => "State",
            Message::Ack => "Ack",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_serialization() {
        let msg = Message::NodeActive {
            node_id: 3,
            group_id: 0,
            current_role: Role::Secondary,
            pg_is_running: true,
            current_lsn: "0/3100".parse().unwrap(),
            sync_state: "sync".to_string(),
        };

        let bytes = msg.serialize().unwrap();
        let restored = Message::deserialize(&bytes).unwrap();

        match restored {
            Message::NodeActive {
                node_id,
                current_role,
                current_lsn,
                ..
            } => {
                assert_eq!(node_id, 3);
                assert_eq!(current_role, Role::Secondary);
                assert_eq!(current_lsn, Lsn(0x3100));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"node active payload";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }
}
