//! PostgreSQL Control Interface
//!
//! The narrow surface through which the keeper drives the local database
//! instance: admin tools, SQL queries, managed configuration, HBA rules,
//! and LSN handling.

pub mod conf;
pub mod ctl;
pub mod hba;
pub mod lsn;
pub mod sql;

pub use conf::ManagedConf;
pub use ctl::PgCtl;
pub use hba::HbaManager;
pub use lsn::Lsn;
pub use sql::{PgExecutor, ReplicationSlot, StandbyStatus};
