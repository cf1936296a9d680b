//! Keeper
//!
//! The per-node agent. Keeps its identity and FSM position on local disk,
//! heartbeats the monitor every tick, and reconciles the local PostgreSQL
//! instance with the goal role the monitor assigns.

pub mod service;
pub mod state_file;
pub mod transitions;

pub use service::Keeper;
pub use state_file::{InitSentinel, KeeperState, PidFile};
pub use transitions::KeeperTransitions;
