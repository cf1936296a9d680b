//! Keeper Service
//!
//! The main ticking loop. Each tick observes the local PostgreSQL, reports
//! to the monitor, executes the assigned transition when it differs from
//! the current role, and reconciles declarative resources (replication
//! slots and HBA entries) against the current peer list.
//!
//! Signal convention: handlers only set a sticky atomic flag; the loop
//! polls the flags between blocking operations. TERM finishes the tick in
//! flight, INT breaks out as fast as possible.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::StewardConfig;
use crate::error::{Error, Result};
use crate::fsm::{legal_transitions_from, lookup, Role, TransitionKind};
use crate::keeper::state_file::{InitSentinel, KeeperState, PidFile};
use crate::keeper::transitions::{KeeperTransitions, REPLICATION_USER};
use crate::net::MonitorClient;
use crate::pg::{HbaManager, PgCtl, PgExecutor};
use crate::protocol::Message;
use crate::retry::{RestartTracker, RetryPolicy};

/// The keeper process
pub struct Keeper {
    config: StewardConfig,
    client: Arc<MonitorClient>,
    ctl: PgCtl,
    sql: Arc<PgExecutor>,
    hba: HbaManager,
    transitions: KeeperTransitions,
    sentinel: InitSentinel,
    term_requested: Arc<AtomicBool>,
    int_requested: Arc<AtomicBool>,
    restarts: tokio::sync::Mutex<RestartTracker>,
}

impl Keeper {
    /// Assemble a keeper from its configuration
    pub fn new(config: StewardConfig) -> Result<Self> {
        let monitor_address = config
            .steward
            .monitor
            .clone()
            .ok_or_else(|| Error::Config("steward.monitor is required".into()))?;
        let client = Arc::new(MonitorClient::new(monitor_address));
        let ctl = PgCtl::new(
            config.postgres.bindir.clone(),
            config.postgres.pgdata.clone(),
            config.postgres.port,
        );
        let sql = Arc::new(PgExecutor::new(
            config.postgres_url(),
            config.postgres.pool_size,
            Duration::from_secs(config.postgres.connect_timeout_secs),
        ));
        let transitions = KeeperTransitions::new(
            config.clone(),
            ctl.clone(),
            Arc::clone(&sql),
            Arc::clone(&client),
        );
        let restarts = tokio::sync::Mutex::new(RestartTracker::new(
            Duration::from_secs(config.timeout.postgresql_restart_failure_timeout),
            config.timeout.postgresql_restart_failure_max_retries,
        ));

        Ok(Self {
            hba: HbaManager::new(&config.postgres.pgdata),
            sentinel: InitSentinel::new(config.init_sentinel_path()),
            config,
            client,
            ctl,
            sql,
            transitions,
            term_requested: Arc::new(AtomicBool::new(false)),
            int_requested: Arc::new(AtomicBool::new(false)),
            restarts,
        })
    }

    /// Install TERM/INT handlers that set the sticky flags
    fn install_signal_handlers(&self) -> Result<()> {
        let term_flag = Arc::clone(&self.term_requested);
        let mut term = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            term.recv().await;
            tracing::info!("SIGTERM received, finishing the current transition");
            term_flag.store(true, Ordering::SeqCst);
        });

        let int_flag = Arc::clone(&self.int_requested);
        let mut int = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            int.recv().await;
            tracing::info!("SIGINT received, fast shutdown");
            int_flag.store(true, Ordering::SeqCst);
        });
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        self.term_requested.load(Ordering::SeqCst) || self.int_requested.load(Ordering::SeqCst)
    }

    /// Run until shutdown or drop
    pub async fn run(&self) -> Result<()> {
        self.install_signal_handlers()?;
        let pid_file = PidFile::acquire(self.config.pid_file_path())?;

        let state_path = self.config.state_file_path();
        let mut state = if state_path.exists() {
            let state = KeeperState::load(&state_path)?;
            tracing::info!(
                "resuming as node {} in group {} ({} -> {})",
                state.node_id,
                state.group_id,
                state.current_role,
                state.assigned_role
            );
            state
        } else {
            self.register().await?
        };
        state.save(&state_path)?;

        let tick = self.config.keeper_sleep_time();
        loop {
            if self.shutdown_requested() {
                break;
            }

            if let Err(e) = self.tick(&mut state).await {
                tracing::error!("tick failed: {}", e);
                if e.is_permanent() {
                    tracing::error!("operator intervention required, standing by");
                }
            }
            state.save(&state_path)?;

            if state.current_role == Role::Dropped {
                // Confirm the drop so the monitor forgets this node
                let observed = self.observe().await;
                let _ = self.heartbeat(&state, &observed).await;
                tracing::info!("node dropped, exiting");
                pid_file.release()?;
                return Ok(());
            }

            self.sleep_interruptible(tick).await;
        }

        // Graceful: persist what we confirmed, nothing more
        state.save(&state_path)?;
        pid_file.release()?;
        if self.int_requested.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// First contact with the monitor
    async fn register(&self) -> Result<KeeperState> {
        self.sentinel.create()?;

        let system_identifier = if self.ctl.pgdata_exists() {
            Some(self.ctl.system_identifier().await?)
        } else {
            None
        };

        let message = Message::Register {
            formation: self.config.steward.formation.clone(),
            group: self.config.steward.group,
            name: self
                .config
                .steward
                .name
                .clone()
                .ok_or_else(|| Error::Config("steward.name is required".into()))?,
            host: self
                .config
                .steward
                .hostname
                .clone()
                .ok_or_else(|| Error::Config("steward.hostname is required".into()))?,
            port: self.config.postgres.port,
            dbname: self.config.postgres.dbname.clone(),
            candidate_priority: 50,
            replication_quorum: true,
            system_identifier,
            desired_role: Some(Role::Init),
        };

        let response = self
            .client
            .call_with_retry(&RetryPolicy::monitor_calls(), message)
            .await?;
        match response {
            Message::Registered {
                node_id,
                group_id,
                assigned_role,
            } => {
                tracing::info!(
                    "registered as node {} in group {}, assigned {}",
                    node_id,
                    group_id,
                    assigned_role
                );
                let mut state = KeeperState::new(node_id, group_id, assigned_role);
                state.system_identifier = system_identifier.unwrap_or(0);
                state.last_monitor_contact = Utc::now().timestamp_millis();
                Ok(state)
            }
            other => Err(Error::Protocol(format!(
                "unexpected answer to Register: {}",
                other.type_name()
            ))),
        }
    }

    /// One pass of the keeper loop
    async fn tick(&self, state: &mut KeeperState) -> Result<()> {
        let observed = self.observe().await;

        match self.heartbeat(state, &observed).await {
            Ok(assigned) => {
                state.assigned_role = assigned;
                state.last_monitor_contact = Utc::now().timestamp_millis();
            }
            Err(e) => {
                tracing::warn!("monitor unreachable: {}", e);
                self.maybe_self_demote(state).await?;
                return Ok(());
            }
        }

        if state.assigned_role != state.current_role {
            self.advance(state).await?;
        }

        if observed.pg_is_running && !self.shutdown_requested() {
            if let Err(e) = self.reconcile_resources(state).await {
                tracing::warn!("resource reconcile failed: {}", e);
            }
        }

        self.publish_system_identifier(state).await;
        Ok(())
    }

    /// Execute the assigned transition, keeping state only on success
    async fn advance(&self, state: &mut KeeperState) -> Result<()> {
        let (from, to) = (state.current_role, state.assigned_role);
        let Some(kind) = lookup(from, to) else {
            let legal: Vec<String> = legal_transitions_from(from)
                .iter()
                .map(Role::to_string)
                .collect();
            tracing::error!(
                "no transition from {} to {} (legal: {}), leaving state untouched",
                from,
                to,
                legal.join(", ")
            );
            return Err(Error::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        };

        match self.transitions.execute(kind, state).await {
            Ok(()) => {
                state.current_role = to;
                tracing::info!("transition complete, now {}", to);
                if matches!(to, Role::Single | Role::Secondary) {
                    self.sentinel.remove()?;
                }
                self.restarts.lock().await.record_success();
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("transition {} -> {} will retry: {}", from, to, e);
                self.note_restart_failure(state, &e).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Count pg_ctl start failures; past the budget a writable node
    /// demotes itself rather than flapping
    async fn note_restart_failure(&self, state: &mut KeeperState, e: &Error) -> Result<()> {
        if !matches!(e, Error::PgCommand { tool, .. } if tool == "pg_ctl") {
            return Ok(());
        }
        let within_budget = self.restarts.lock().await.record_failure();
        if !within_budget && state.current_role.is_writable() {
            tracing::error!("restart budget exhausted, demoting this node");
            self.transitions.execute(TransitionKind::Demote, state).await?;
            state.current_role = Role::Demoted;
        }
        Ok(())
    }

    /// Locally observed PostgreSQL state
    async fn observe(&self) -> Observed {
        let pg_is_running = self.ctl.is_running().await.unwrap_or(false);
        if !pg_is_running {
            return Observed {
                pg_is_running: false,
                current_lsn: crate::pg::Lsn::ZERO,
                sync_state: String::new(),
            };
        }

        let current_lsn = self.sql.current_wal_lsn().await.unwrap_or(crate::pg::Lsn::ZERO);
        let sync_state = match self.sql.is_in_recovery().await {
            Ok(false) => {
                let states = self.sql.standby_states().await.unwrap_or_default();
                states
                    .iter()
                    .map(|s| format!("{}={}", s.application_name, s.sync_state))
                    .collect::<Vec<_>>()
                    .join(",")
            }
            _ => String::new(),
        };
        Observed {
            pg_is_running,
            current_lsn,
            sync_state,
        }
    }

    /// Heartbeat under the interactive retry policy
    async fn heartbeat(&self, state: &KeeperState, observed: &Observed) -> Result<Role> {
        let message = Message::NodeActive {
            node_id: state.node_id,
            group_id: state.group_id,
            current_role: state.current_role,
            pg_is_running: observed.pg_is_running,
            current_lsn: observed.current_lsn,
            sync_state: observed.sync_state.clone(),
        };
        let response = self
            .client
            .call_with_retry(&RetryPolicy::interactive(), message)
            .await?;
        match response {
            Message::Assignment { assigned_role, .. } => Ok(assigned_role),
            other => Err(Error::Protocol(format!(
                "unexpected answer to NodeActive: {}",
                other.type_name()
            ))),
        }
    }

    /// Split-network guard: a primary that cannot reach the monitor for
    /// longer than the partition timeout stops accepting writes on its own
    async fn maybe_self_demote(&self, state: &mut KeeperState) -> Result<()> {
        if !state.current_role.is_writable() {
            return Ok(());
        }
        let silence = Utc::now().timestamp_millis() - state.last_monitor_contact;
        let limit = self.config.network_partition_timeout().as_millis() as i64;
        if state.last_monitor_contact > 0 && silence > limit {
            tracing::error!(
                "no monitor contact for {}ms while primary, demoting ourselves",
                silence
            );
            self.transitions
                .execute(TransitionKind::Demote, state)
                .await?;
            state.current_role = Role::Demoted;
        }
        Ok(())
    }

    /// Recompute the desired slot and HBA sets from the peer list and
    /// apply the difference
    async fn reconcile_resources(&self, state: &KeeperState) -> Result<()> {
        if matches!(
            state.current_role,
            Role::Init | Role::WaitStandby | Role::Demoted | Role::Dropped | Role::Maintenance
        ) {
            return Ok(());
        }

        let response = self
            .client
            .call(Message::GetOtherNodes {
                node_id: state.node_id,
                role_filter: None,
            })
            .await?;
        let Message::OtherNodes { nodes: peers } = response else {
            return Ok(());
        };

        let in_recovery = self.sql.is_in_recovery().await?;
        let local_lsn = self.sql.current_wal_lsn().await?;

        let desired: Vec<(String, crate::pg::Lsn)> = peers
            .iter()
            .filter(|p| p.current_role != Role::Dropped)
            .map(|p| (self.config.slot_name(p.node_id), p.reported_lsn))
            .collect();

        let existing = self.sql.list_slots().await?;
        for (name, peer_lsn) in &desired {
            if !existing.iter().any(|s| &s.slot_name == name) {
                self.sql.create_slot(name).await?;
            }
            // The streaming receiver never writes standby-side slots;
            // advance them by hand, never past our own WAL
            if in_recovery {
                let target = (*peer_lsn).min(local_lsn);
                if !target.is_zero() {
                    self.sql.advance_slot(name, target).await?;
                }
            }
        }
        for slot in &existing {
            let ours = slot.slot_name == self.config.slot_name(state.node_id);
            let managed = slot.slot_name.starts_with("steward_");
            if managed && !ours && !desired.iter().any(|(name, _)| name == &slot.slot_name) {
                self.sql.drop_slot(&slot.slot_name).await?;
            }
        }

        let entries =
            HbaManager::desired_entries(&peers, REPLICATION_USER, &self.config.postgres.dbname);
        if self.hba.ensure(&entries)? {
            self.ctl.reload().await?;
        }
        Ok(())
    }

    /// Publish the system identifier once PGDATA exists
    async fn publish_system_identifier(&self, state: &mut KeeperState) {
        if state.system_identifier != 0 || !self.ctl.pgdata_exists() {
            return;
        }
        let Ok(ident) = self.ctl.system_identifier().await else {
            return;
        };
        let message = Message::SetSystemIdentifier {
            node_id: state.node_id,
            system_identifier: ident,
        };
        match self.client.call(message).await {
            Ok(_) => state.system_identifier = ident,
            Err(e) => tracing::debug!("system identifier publication deferred: {}", e),
        }
    }

    /// Sleep the tick interval, waking early on shutdown
    async fn sleep_interruptible(&self, duration: Duration) {
        let slice = Duration::from_millis(200);
        let mut remaining = duration;
        while !remaining.is_zero() && !self.shutdown_requested() {
            let step = remaining.min(slice);
            tokio::time::sleep(step).await;
            remaining = remaining.saturating_sub(step);
        }
    }
}

/// One tick's local observation
struct Observed {
    pg_is_running: bool,
    current_lsn: crate::pg::Lsn,
    sync_state: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper(dir: &std::path::Path) -> Keeper {
        let toml = format!(
            r#"
[steward]
role = "keeper"
monitor = "127.0.0.1:1"
name = "node-a"
hostname = "db1.internal"
data_dir = "{data}"

[postgres]
pgdata = "{pgdata}"
"#,
            data = dir.join("steward").display(),
            pgdata = dir.join("pgdata").display(),
        );
        let config = StewardConfig::from_str(&toml).unwrap();
        Keeper::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_observe_without_postgres() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = keeper(dir.path());
        let observed = keeper.observe().await;
        assert!(!observed.pg_is_running);
        assert!(observed.current_lsn.is_zero());
    }

    #[tokio::test]
    async fn test_illegal_assignment_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = keeper(dir.path());

        let mut state = KeeperState::new(1, 0, Role::Primary);
        state.current_role = Role::Secondary;
        // secondary -> primary has no arc; the keeper refuses and stays
        let err = keeper.advance(&mut state).await.unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
        assert_eq!(state.current_role, Role::Secondary);
    }

    #[tokio::test]
    async fn test_self_demote_requires_writable_role() {
        let dir = tempfile::tempdir().unwrap();
        let keeper = keeper(dir.path());

        let mut state = KeeperState::new(1, 0, Role::Secondary);
        state.current_role = Role::Secondary;
        state.last_monitor_contact = 1; // ancient
        keeper.maybe_self_demote(&mut state).await.unwrap();
        assert_eq!(state.current_role, Role::Secondary);
    }
}
