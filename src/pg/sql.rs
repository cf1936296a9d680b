//! PostgreSQL SQL Surface
//!
//! Executes control queries against the managed instance: recovery status,
//! WAL positions, replication slots, and configuration changes.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::pg::lsn::Lsn;

/// One row of pg_stat_replication, as seen from the primary
#[derive(Debug, Clone)]
pub struct StandbyStatus {
    /// application_name, which carries the peer's slot name
    pub application_name: String,
    /// sync_state: async, potential, sync, quorum
    pub sync_state: String,
    /// Last WAL position the standby replayed
    pub replay_lsn: Lsn,
}

/// One physical replication slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub restart_lsn: Option<Lsn>,
    pub active: bool,
}

/// SQL executor for the managed PostgreSQL instance
pub struct PgExecutor {
    /// Connection pool (dropped and rebuilt across restarts of the server)
    pool: Arc<RwLock<Option<PgPool>>>,
    /// Connection URL
    url: String,
    /// Pool sizing
    pool_size: u32,
    connect_timeout: Duration,
    /// Whether this is a mock executor (for testing)
    is_mock: bool,
}

impl PgExecutor {
    /// Create a new executor; the pool connects lazily on first use
    pub fn new(url: String, pool_size: u32, connect_timeout: Duration) -> Self {
        Self {
            pool: Arc::new(RwLock::new(None)),
            url,
            pool_size,
            connect_timeout,
            is_mock: false,
        }
    }

    /// Create a mock executor for testing
    pub fn new_mock() -> Self {
        Self {
            pool: Arc::new(RwLock::new(None)),
            url: String::new(),
            pool_size: 1,
            connect_timeout: Duration::from_secs(1),
            is_mock: true,
        }
    }

    /// Drop the pool so the next query reconnects (used across restarts)
    pub async fn invalidate(&self) {
        let mut guard = self.pool.write().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }
    }

    async fn pool(&self) -> Result<PgPool> {
        {
            let guard = self.pool.read().await;
            if let Some(pool) = guard.as_ref() {
                return Ok(pool.clone());
            }
        }

        let pool = PgPoolOptions::new()
            .max_connections(self.pool_size)
            .acquire_timeout(self.connect_timeout)
            .connect(&self.url)
            .await?;

        let mut guard = self.pool.write().await;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    /// Check if connection is possible at all
    pub async fn health_check(&self) -> Result<bool> {
        if self.is_mock {
            return Ok(true);
        }
        let pool = self.pool().await?;
        let result: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
        Ok(result.0 == 1)
    }

    /// Whether the server runs in recovery (standby) mode
    pub async fn is_in_recovery(&self) -> Result<bool> {
        if self.is_mock {
            return Ok(false);
        }
        let pool = self.pool().await?;
        let in_recovery: bool = sqlx::query_scalar("SELECT pg_is_in_recovery()")
            .fetch_one(&pool)
            .await?;
        Ok(in_recovery)
    }

    /// Current WAL position: flush LSN on a primary, the furthest of
    /// received and replayed WAL on a standby
    pub async fn current_wal_lsn(&self) -> Result<Lsn> {
        if self.is_mock {
            return Ok(Lsn::ZERO);
        }
        let pool = self.pool().await?;
        let lsn_text: String = sqlx::query_scalar(
            r#"
            SELECT CASE WHEN pg_is_in_recovery()
                   THEN coalesce(greatest(pg_last_wal_receive_lsn(),
                                          pg_last_wal_replay_lsn()),
                                 '0/0'::pg_lsn)::text
                   ELSE pg_current_wal_flush_lsn()::text
              END
            "#,
        )
        .fetch_one(&pool)
        .await?;
        lsn_text.parse()
    }

    /// Replication standbys attached to this primary
    pub async fn standby_states(&self) -> Result<Vec<StandbyStatus>> {
        if self.is_mock {
            return Ok(vec![]);
        }
        let pool = self.pool().await?;
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT application_name, sync_state, replay_lsn::text FROM pg_stat_replication",
        )
        .fetch_all(&pool)
        .await?;

        rows.into_iter()
            .map(|(application_name, sync_state, replay)| {
                Ok(StandbyStatus {
                    application_name,
                    sync_state,
                    replay_lsn: replay.as_deref().unwrap_or("0/0").parse()?,
                })
            })
            .collect()
    }

    /// Whether a WAL receiver is currently streaming
    pub async fn wal_receiver_active(&self) -> Result<bool> {
        if self.is_mock {
            return Ok(false);
        }
        let pool = self.pool().await?;
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM pg_stat_wal_receiver")
            .fetch_one(&pool)
            .await?;
        Ok(count > 0)
    }

    /// System identifier from the running server's control data
    pub async fn system_identifier(&self) -> Result<u64> {
        if self.is_mock {
            return Ok(0);
        }
        let pool = self.pool().await?;
        let ident: String =
            sqlx::query_scalar("SELECT system_identifier::text FROM pg_control_system()")
                .fetch_one(&pool)
                .await?;
        ident
            .parse()
            .map_err(|_| Error::QueryExecution(format!("bad system identifier: {ident}")))
    }

    /// List physical replication slots
    pub async fn list_slots(&self) -> Result<Vec<ReplicationSlot>> {
        if self.is_mock {
            return Ok(vec![]);
        }
        let pool = self.pool().await?;
        let rows: Vec<(String, Option<String>, bool)> = sqlx::query_as(
            "SELECT slot_name, restart_lsn::text, active
               FROM pg_replication_slots WHERE slot_type = 'physical'",
        )
        .fetch_all(&pool)
        .await?;

        rows.into_iter()
            .map(|(slot_name, restart, active)| {
                let restart_lsn = match restart {
                    Some(text) => Some(text.parse()?),
                    None => None,
                };
                Ok(ReplicationSlot {
                    slot_name,
                    restart_lsn,
                    active,
                })
            })
            .collect()
    }

    /// Create a physical slot; no-op when it already exists
    pub async fn create_slot(&self, name: &str) -> Result<()> {
        if self.is_mock {
            return Ok(());
        }
        let pool = self.pool().await?;
        // Reserve WAL right away so the slot can be advanced manually
        sqlx::query(
            "SELECT pg_create_physical_replication_slot($1, true)
              WHERE NOT EXISTS
                (SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
        )
        .bind(name)
        .execute(&pool)
        .await?;
        Ok(())
    }

    /// Drop a slot; no-op when it does not exist
    pub async fn drop_slot(&self, name: &str) -> Result<()> {
        if self.is_mock {
            return Ok(());
        }
        let pool = self.pool().await?;
        sqlx::query(
            "SELECT pg_drop_replication_slot(slot_name)
               FROM pg_replication_slots
              WHERE slot_name = $1 AND NOT active",
        )
        .bind(name)
        .execute(&pool)
        .await?;
        Ok(())
    }

    /// Advance a slot to the given position (standby-side slot upkeep; the
    /// streaming receiver does not write these)
    pub async fn advance_slot(&self, name: &str, lsn: Lsn) -> Result<()> {
        if self.is_mock {
            return Ok(());
        }
        let pool = self.pool().await?;
        sqlx::query(
            "SELECT pg_replication_slot_advance(slot_name, $2::pg_lsn)
               FROM pg_replication_slots
              WHERE slot_name = $1 AND restart_lsn < $2::pg_lsn",
        )
        .bind(name)
        .bind(lsn.to_string())
        .execute(&pool)
        .await?;
        Ok(())
    }

    /// ALTER SYSTEM a setting and reload
    pub async fn alter_system(&self, name: &str, value: &str) -> Result<()> {
        if self.is_mock {
            return Ok(());
        }
        let pool = self.pool().await?;
        // ALTER SYSTEM does not take bind parameters
        let sql = format!("ALTER SYSTEM SET {} = {}", name, quote_literal(value));
        sqlx::query(&sql).execute(&pool).await?;
        sqlx::query("SELECT pg_reload_conf()").execute(&pool).await?;
        Ok(())
    }

    /// Set synchronous_standby_names and reload
    pub async fn set_synchronous_standby_names(&self, value: &str) -> Result<()> {
        self.alter_system("synchronous_standby_names", value).await
    }

    /// The read-only gate used during promotion and demotion
    pub async fn set_default_transaction_read_only(&self, on: bool) -> Result<()> {
        self.alter_system("default_transaction_read_only", if on { "on" } else { "off" })
            .await
    }

    /// Current value of a setting
    pub async fn show_setting(&self, name: &str) -> Result<String> {
        if self.is_mock {
            return Ok(String::new());
        }
        let pool = self.pool().await?;
        let value: String = sqlx::query_scalar("SELECT current_setting($1, true)")
            .bind(name)
            .fetch_one(&pool)
            .await?;
        Ok(value)
    }

    /// Create the replication role when missing
    pub async fn ensure_replication_user(&self, name: &str, password: Option<&str>) -> Result<()> {
        if self.is_mock {
            return Ok(());
        }
        let pool = self.pool().await?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_roles WHERE rolname = $1)")
                .bind(name)
                .fetch_one(&pool)
                .await?;
        if !exists {
            let sql = match password {
                Some(pw) => format!(
                    "CREATE ROLE {} REPLICATION LOGIN PASSWORD {}",
                    quote_ident(name),
                    quote_literal(pw)
                ),
                None => format!("CREATE ROLE {} REPLICATION LOGIN", quote_ident(name)),
            };
            sqlx::query(&sql).execute(&pool).await?;
        }
        Ok(())
    }

    /// Create the application database when missing
    pub async fn ensure_database(&self, dbname: &str) -> Result<()> {
        if self.is_mock {
            return Ok(());
        }
        let pool = self.pool().await?;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(dbname)
                .fetch_one(&pool)
                .await?;
        if !exists {
            let sql = format!("CREATE DATABASE {}", quote_ident(dbname));
            sqlx::query(&sql).execute(&pool).await?;
        }
        Ok(())
    }

    /// Request an immediate checkpoint
    pub async fn checkpoint(&self) -> Result<()> {
        if self.is_mock {
            return Ok(());
        }
        let pool = self.pool().await?;
        sqlx::query("CHECKPOINT").execute(&pool).await?;
        Ok(())
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.invalidate().await;
    }
}

/// Quote a value as a SQL string literal
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote an identifier
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_executor_defaults() {
        let executor = PgExecutor::new_mock();
        assert!(executor.health_check().await.unwrap());
        assert!(!executor.is_in_recovery().await.unwrap());
        assert_eq!(executor.current_wal_lsn().await.unwrap(), Lsn::ZERO);
        assert!(executor.list_slots().await.unwrap().is_empty());
        executor.create_slot("steward_2").await.unwrap();
        executor.drop_slot("steward_2").await.unwrap();
    }

    #[test]
    fn test_quoting() {
        assert_eq!(quote_literal("ANY 1 (node_b)"), "'ANY 1 (node_b)'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
        assert_eq!(quote_ident("my db"), "\"my db\"");
    }
}
