//! Monitor
//!
//! The single authoritative process of a steward deployment. Keeps the
//! formation/group/node tables in a durable store, tracks liveness, and
//! computes goal-state assignments for every keeper heartbeat.

pub mod health;
pub mod orchestrator;
pub mod service;
pub mod store;

pub use health::HealthScanner;
pub use orchestrator::Orchestrator;
pub use service::MonitorService;
pub use store::{FormationRecord, MonitorStore, NodeRecord};
