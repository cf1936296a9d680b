//! Steward Error Types

use thiserror::Error;

/// Result type alias for steward operations
pub type Result<T> = std::result::Result<T, Error>;

/// Steward error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // PostgreSQL admin-tool errors
    #[error("{tool} failed with exit code {code}: {stderr}")]
    PgCommand {
        tool: String,
        code: i32,
        stderr: String,
    },

    #[error("{tool} was killed before completing")]
    PgCommandKilled { tool: String },

    #[error("PostgreSQL did not reach running state within {0} seconds")]
    PgStartTimeout(u64),

    // PostgreSQL SQL errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed: {0}")]
    QueryExecution(String),

    // Monitor errors
    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Monitor store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Node not found: {0}")]
    NodeNotFound(i64),

    #[error("Node {node_id} belongs to group {group}, caller reported another")]
    StaleGroup { node_id: i64, group: i32 },

    #[error("Node name already registered in formation: {0}")]
    NameCollision(String),

    #[error("Group {group} in formation {formation} does not accept another node")]
    GroupFull { formation: String, group: i32 },

    #[error("Setting rejected: {0}")]
    InvalidSetting(String),

    // FSM errors
    #[error("No transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Transition {from} -> {to} failed permanently: {reason}")]
    TransitionFailed {
        from: String,
        to: String,
        reason: String,
    },

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown role name: {0}")]
    UnknownRole(String),

    #[error("Protocol serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Local state errors
    #[error("State file error: {0}")]
    StateFile(String),

    #[error("State file corrupted: {0}")]
    StateFileCorrupted(String),

    #[error("Data directory {0} is owned by another keeper")]
    PgdataOwned(String),

    #[error("System identifier mismatch: expected {expected}, found {found}")]
    SystemIdentifierMismatch { expected: u64, found: u64 },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Shutdown
    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable on the next keeper tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Database(_)
                | Error::QueryExecution(_)
                | Error::PgCommand { .. }
                | Error::PgStartTimeout(_)
        )
    }

    /// Check if this error requires operator intervention
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::SystemIdentifierMismatch { .. }
                | Error::TransitionFailed { .. }
                | Error::PgdataOwned(_)
                | Error::Config(_)
                | Error::ConfigParse(_)
        )
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::ConfigParse(_) => exit_codes::BAD_CONFIG,
            Error::IllegalTransition { .. }
            | Error::TransitionFailed { .. }
            | Error::UnknownRole(_) => exit_codes::BAD_STATE,
            Error::Monitor(_)
            | Error::NodeNotFound(_)
            | Error::StaleGroup { .. }
            | Error::NameCollision(_)
            | Error::GroupFull { .. }
            | Error::InvalidSetting(_) => exit_codes::MONITOR,
            Error::PgCommand { .. }
            | Error::PgCommandKilled { .. }
            | Error::PgStartTimeout(_) => exit_codes::PG_CTL,
            Error::Database(_) | Error::QueryExecution(_) => exit_codes::PG_SQL,
            Error::ShuttingDown => exit_codes::QUIT,
            _ => exit_codes::INTERNAL,
        }
    }
}

/// Process exit codes
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const INTERNAL: i32 = 1;
    pub const BAD_ARGS: i32 = 2;
    pub const BAD_CONFIG: i32 = 3;
    pub const BAD_STATE: i32 = 4;
    pub const MONITOR: i32 = 5;
    pub const PG_CTL: i32 = 6;
    pub const PG_SQL: i32 = 7;
    pub const QUIT: i32 = 12;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Network("connection reset".into()).is_retryable());
        assert!(Error::ConnectionTimeout("10.0.0.2:6000".into()).is_retryable());
        assert!(!Error::Config("missing role".into()).is_retryable());
        assert!(!Error::SystemIdentifierMismatch {
            expected: 7,
            found: 8
        }
        .is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::Config("x".into()).exit_code(), 3);
        assert_eq!(
            Error::IllegalTransition {
                from: "single".into(),
                to: "demoted".into()
            }
            .exit_code(),
            4
        );
        assert_eq!(Error::Monitor("x".into()).exit_code(), 5);
        assert_eq!(
            Error::PgCommand {
                tool: "pg_ctl".into(),
                code: 1,
                stderr: String::new()
            }
            .exit_code(),
            6
        );
        assert_eq!(Error::QueryExecution("x".into()).exit_code(), 7);
        assert_eq!(Error::ShuttingDown.exit_code(), 12);
    }
}
