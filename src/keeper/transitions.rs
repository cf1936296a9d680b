//! Transition Executor
//!
//! The keeper-side procedures behind each arc of the state machine. Every
//! procedure is idempotent and built from guarded sub-steps: a keeper
//! killed mid-transition re-runs the whole procedure on restart and each
//! sub-step checks its pre-condition before acting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::StewardConfig;
use crate::error::{Error, Result};
use crate::fsm::{Role, TransitionKind};
use crate::keeper::state_file::{InitSentinel, KeeperState};
use crate::net::MonitorClient;
use crate::pg::ctl::wait_until;
use crate::pg::{HbaManager, Lsn, ManagedConf, PgCtl, PgExecutor};
use crate::protocol::{Message, NodeAddress, PeerNode};

/// Role used for streaming replication between group members
pub const REPLICATION_USER: &str = "steward_replicator";

/// Executes goal-state transitions against the local PostgreSQL
pub struct KeeperTransitions {
    config: StewardConfig,
    ctl: PgCtl,
    sql: Arc<PgExecutor>,
    conf: ManagedConf,
    hba: HbaManager,
    client: Arc<MonitorClient>,
    sentinel: InitSentinel,
}

impl KeeperTransitions {
    pub fn new(
        config: StewardConfig,
        ctl: PgCtl,
        sql: Arc<PgExecutor>,
        client: Arc<MonitorClient>,
    ) -> Self {
        let pgdata = config.postgres.pgdata.clone();
        let sentinel = InitSentinel::new(config.init_sentinel_path());
        Self {
            conf: ManagedConf::new(&pgdata),
            hba: HbaManager::new(&pgdata),
            config,
            ctl,
            sql,
            client,
            sentinel,
        }
    }

    fn node_name(&self) -> &str {
        self.config.steward.name.as_deref().unwrap_or("steward")
    }

    /// Run the procedure for one transition
    pub async fn execute(&self, kind: TransitionKind, state: &KeeperState) -> Result<()> {
        tracing::info!("executing transition {:?}", kind);
        match kind {
            TransitionKind::Wait => Ok(()),
            TransitionKind::InitAsSingle => self.init_as_single(state).await,
            TransitionKind::OpenForStandby | TransitionKind::JoinPrimary => {
                self.open_for_standby(state).await
            }
            TransitionKind::InitAsStandby => self.init_as_standby(state).await,
            TransitionKind::ConfirmSecondary => self.confirm_secondary(state).await,
            TransitionKind::EnableSyncRep => self.enable_sync_rep(state).await,
            TransitionKind::DisableSyncRep => self.disable_sync_rep().await,
            TransitionKind::ApplySettings => self.apply_settings(state).await,
            TransitionKind::ConfirmPrimary => self.confirm_primary().await,
            TransitionKind::ConfirmSingle => self.confirm_single().await,
            TransitionKind::PreparePromotion => self.prepare_promotion(state).await,
            TransitionKind::StopReplication => self.stop_replication().await,
            TransitionKind::Promote => self.promote(state).await,
            TransitionKind::Drain => self.drain().await,
            TransitionKind::Demote => self.demote().await,
            TransitionKind::RewindOrRebuild => self.rewind_or_rebuild(state).await,
            TransitionKind::ReportLsn => self.report_lsn().await,
            TransitionKind::FastForward => self.fast_forward(state).await,
            TransitionKind::JoinSecondary => self.join_secondary(state).await,
            TransitionKind::StartMaintenance => self.start_maintenance().await,
            TransitionKind::DropNode => self.drop_node().await,
        }
    }

    // ========== Monitor lookups ==========

    async fn primary_address(&self, state: &KeeperState) -> Result<NodeAddress> {
        let response = self
            .client
            .call(Message::GetPrimary {
                formation: self.config.steward.formation.clone(),
                group: state.group_id,
            })
            .await?;
        match response {
            Message::PrimaryNode { node: Some(node) } => Ok(node),
            Message::PrimaryNode { node: None } => Err(Error::Network(
                "group has no primary yet, retrying".to_string(),
            )),
            other => Err(Error::Protocol(format!(
                "unexpected answer to GetPrimary: {}",
                other.type_name()
            ))),
        }
    }

    async fn peers(&self, state: &KeeperState) -> Result<Vec<PeerNode>> {
        let response = self
            .client
            .call(Message::GetOtherNodes {
                node_id: state.node_id,
                role_filter: None,
            })
            .await?;
        match response {
            Message::OtherNodes { nodes } => Ok(nodes),
            other => Err(Error::Protocol(format!(
                "unexpected answer to GetOtherNodes: {}",
                other.type_name()
            ))),
        }
    }

    async fn fetch_sync_standby_names(&self, state: &KeeperState) -> Result<String> {
        let response = self
            .client
            .call(Message::GetSettings {
                node_id: state.node_id,
            })
            .await?;
        match response {
            Message::Settings {
                synchronous_standby_names,
                ..
            } => Ok(synchronous_standby_names),
            other => Err(Error::Protocol(format!(
                "unexpected answer to GetSettings: {}",
                other.type_name()
            ))),
        }
    }

    // ========== Local plumbing ==========

    fn base_settings(&self) -> BTreeMap<String, String> {
        let mut settings = ManagedConf::base_settings(self.config.postgres.port);
        for (key, value) in self.ctl.ssl_settings(&self.config.ssl) {
            settings.insert(key, value);
        }
        settings
    }

    fn replication_conninfo(&self, host: &str, port: u16) -> String {
        let mut conninfo = format!(
            "host={} port={} user={} application_name={}",
            host,
            port,
            REPLICATION_USER,
            self.node_name()
        );
        if let Some(passfile) = &self.config.replication.password_file {
            conninfo.push_str(&format!(" passfile={}", passfile.display()));
        }
        conninfo
    }

    async fn restart_with_fresh_pool(&self) -> Result<()> {
        self.ctl.restart().await?;
        self.sql.invalidate().await;
        Ok(())
    }

    async fn start_with_fresh_pool(&self) -> Result<()> {
        self.ctl.start().await?;
        self.sql.invalidate().await;
        Ok(())
    }

    async fn basebackup_from(&self, upstream: &NodeAddress, state: &KeeperState) -> Result<()> {
        let conninfo = self.replication_conninfo(&upstream.host, upstream.port);
        let slot = self.config.slot_name(state.node_id);
        let backup_dir = if self.config.replication.backup_directory.is_absolute() {
            self.config.replication.backup_directory.clone()
        } else {
            self.config
                .steward
                .data_dir
                .join(&self.config.replication.backup_directory)
        };
        self.ctl.stop().await?;
        self.sql.invalidate().await;
        self.ctl
            .basebackup(
                &conninfo,
                &slot,
                &backup_dir,
                self.config.replication.maximum_backup_rate.as_deref(),
            )
            .await
    }

    fn configure_standby(&self, upstream: &NodeAddress, state: &KeeperState) -> Result<()> {
        self.conf.ensure_included()?;
        let conninfo = self.replication_conninfo(&upstream.host, upstream.port);
        self.conf.write_standby_config(
            self.base_settings(),
            &conninfo,
            &self.config.slot_name(state.node_id),
        )?;
        Ok(())
    }

    /// Verify the local cluster still is the cluster we published
    async fn check_system_identifier(&self, state: &KeeperState) -> Result<()> {
        if state.system_identifier == 0 || !self.ctl.pgdata_exists() {
            return Ok(());
        }
        let found = self.ctl.system_identifier().await?;
        if found != state.system_identifier {
            return Err(Error::SystemIdentifierMismatch {
                expected: state.system_identifier,
                found,
            });
        }
        Ok(())
    }

    // ========== Transition procedures ==========

    /// init -> single: create the cluster and open it for writes
    async fn init_as_single(&self, state: &KeeperState) -> Result<()> {
        self.ctl.initdb().await?;
        self.conf.ensure_included()?;
        self.conf.write(&self.base_settings())?;
        if self.config.ssl.self_signed {
            let hostname = self.config.steward.hostname.as_deref().unwrap_or("localhost");
            let (cert, key) = self.ctl.write_self_signed_cert(hostname).await?;
            let mut settings = self.base_settings();
            settings.insert("ssl".to_string(), "on".to_string());
            settings.insert("ssl_cert_file".to_string(), format!("'{}'", cert.display()));
            settings.insert("ssl_key_file".to_string(), format!("'{}'", key.display()));
            self.conf.write(&settings)?;
        }

        self.start_with_fresh_pool().await?;
        self.sql
            .ensure_replication_user(REPLICATION_USER, None)
            .await?;
        self.sql.ensure_database(&self.config.postgres.dbname).await?;
        self.sql.set_default_transaction_read_only(false).await?;
        self.check_system_identifier(state).await
    }

    /// single/wait-primary/primary -> accept a standby: slots and HBA
    async fn open_for_standby(&self, state: &KeeperState) -> Result<()> {
        self.start_with_fresh_pool().await?;
        let peers = self.peers(state).await?;
        for peer in &peers {
            self.sql
                .create_slot(&self.config.slot_name(peer.node_id))
                .await?;
        }
        let entries = HbaManager::desired_entries(
            &peers,
            REPLICATION_USER,
            &self.config.postgres.dbname,
        );
        if self.hba.ensure(&entries)? {
            self.ctl.reload().await?;
        }
        Ok(())
    }

    /// wait-standby -> catchingup: clone the upstream and start streaming
    async fn init_as_standby(&self, state: &KeeperState) -> Result<()> {
        let upstream = self.primary_address(state).await?;

        let pgdata_usable = self.ctl.pgdata_exists()
            && (self.sentinel.exists() || state.system_identifier != 0);
        if pgdata_usable {
            if let Err(e) = self.check_system_identifier(state).await {
                if self.sentinel.exists() {
                    // Half-finished init: throw the copy away and redo it
                    tracing::warn!("mid-init PGDATA does not match, rebuilding: {}", e);
                    self.basebackup_from(&upstream, state).await?;
                } else {
                    return Err(e);
                }
            }
        } else {
            self.basebackup_from(&upstream, state).await?;
        }

        self.configure_standby(&upstream, state)?;
        self.start_with_fresh_pool().await?;
        self.check_system_identifier(state).await
    }

    /// catchingup -> secondary: verify the copy, prepare peer slots
    async fn confirm_secondary(&self, state: &KeeperState) -> Result<()> {
        self.start_with_fresh_pool().await?;
        if !self.sql.is_in_recovery().await? {
            return Err(Error::TransitionFailed {
                from: Role::Catchingup.to_string(),
                to: Role::Secondary.to_string(),
                reason: "server is not in recovery".to_string(),
            });
        }
        self.check_system_identifier(state).await?;

        // Standby-side slots are created eagerly so a promotion can serve
        // every peer immediately
        let peers = self.peers(state).await?;
        let local_lsn = self.sql.current_wal_lsn().await?;
        for peer in &peers {
            let slot = self.config.slot_name(peer.node_id);
            self.sql.create_slot(&slot).await?;
            let target = peer.reported_lsn.min(local_lsn);
            if !target.is_zero() {
                self.sql.advance_slot(&slot, target).await?;
            }
        }
        let entries = HbaManager::desired_entries(
            &peers,
            REPLICATION_USER,
            &self.config.postgres.dbname,
        );
        if self.hba.ensure(&entries)? {
            self.ctl.reload().await?;
        }
        Ok(())
    }

    /// wait-primary/join-primary -> primary: turn synchronous commit on
    async fn enable_sync_rep(&self, state: &KeeperState) -> Result<()> {
        self.start_with_fresh_pool().await?;
        if self.sql.is_in_recovery().await? {
            return Err(Error::TransitionFailed {
                from: Role::WaitPrimary.to_string(),
                to: Role::Primary.to_string(),
                reason: "server is still in recovery".to_string(),
            });
        }
        let names = self.fetch_sync_standby_names(state).await?;
        self.sql.set_synchronous_standby_names(&names).await?;
        self.sql.set_default_transaction_read_only(false).await?;
        Ok(())
    }

    /// primary -> wait-primary: relax after losing the quorum standbys
    async fn disable_sync_rep(&self) -> Result<()> {
        self.start_with_fresh_pool().await?;
        self.sql.set_synchronous_standby_names("").await?;
        Ok(())
    }

    /// apply-settings: fetch and install the monitor's replication policy
    async fn apply_settings(&self, state: &KeeperState) -> Result<()> {
        let names = self.fetch_sync_standby_names(state).await?;
        self.sql.set_synchronous_standby_names(&names).await?;
        Ok(())
    }

    /// apply-settings -> primary
    async fn confirm_primary(&self) -> Result<()> {
        if self.sql.is_in_recovery().await? {
            return Err(Error::TransitionFailed {
                from: Role::ApplySettings.to_string(),
                to: Role::Primary.to_string(),
                reason: "server is in recovery".to_string(),
            });
        }
        self.sql.set_default_transaction_read_only(false).await?;
        Ok(())
    }

    /// wait-primary -> single: the group is down to one node again
    async fn confirm_single(&self) -> Result<()> {
        self.start_with_fresh_pool().await?;
        self.sql.set_synchronous_standby_names("").await?;
        self.sql.set_default_transaction_read_only(false).await?;
        Ok(())
    }

    /// secondary/report-lsn -> prepare-promotion: hold until the WAL
    /// receiver drained and we replayed everything the group reported
    async fn prepare_promotion(&self, state: &KeeperState) -> Result<()> {
        self.start_with_fresh_pool().await?;
        if !self.sql.is_in_recovery().await? {
            // Already promoted by an earlier run
            return Ok(());
        }

        let drained = wait_until(
            self.config.walreceiver_timeout(),
            Duration::from_millis(200),
            || async { Ok(!self.sql.wal_receiver_active().await?) },
        )
        .await?;
        if !drained {
            return Err(Error::Network(
                "WAL receiver still active after the drain timeout".to_string(),
            ));
        }

        let target = self
            .peers(state)
            .await?
            .iter()
            .filter(|p| p.current_role.is_primary_side() || p.current_role.is_in_failover())
            .map(|p| p.reported_lsn)
            .max()
            .unwrap_or(Lsn::ZERO);
        let caught_up = wait_until(
            self.config.catchup_timeout(),
            Duration::from_millis(200),
            || async { Ok(self.sql.current_wal_lsn().await? >= target) },
        )
        .await?;
        if !caught_up {
            return Err(Error::Network(format!(
                "still behind the group's last known position {target}"
            )));
        }
        Ok(())
    }

    /// prepare-promotion -> stop-replication: gate writes, cut the cord
    async fn stop_replication(&self) -> Result<()> {
        // Read-only first: nothing lands here while we change masters
        let mut settings = self.base_settings();
        settings.insert("default_transaction_read_only".to_string(), "on".to_string());
        self.conf.ensure_included()?;
        self.conf.write_detached_standby_config(settings)?;
        self.restart_with_fresh_pool().await
    }

    /// stop-replication -> wait-primary: promote and open for writes
    async fn promote(&self, state: &KeeperState) -> Result<()> {
        self.start_with_fresh_pool().await?;
        if self.sql.is_in_recovery().await? {
            self.ctl.promote().await?;
            self.sql.invalidate().await;
        }

        // Drop the read-only gate now that we are the one writable node
        self.conf.write(&self.base_settings())?;
        self.sql.set_default_transaction_read_only(false).await?;

        // Sync rep stays off until the monitor sees a quorum candidate
        self.sql.set_synchronous_standby_names("").await?;

        // The deposed primary's slot holds a stale position; drop it and
        // let the reconcile pass recreate it when the node rejoins
        let peers = self.peers(state).await?;
        for peer in &peers {
            let was_primary = peer.current_role.is_primary_side()
                || matches!(
                    peer.current_role,
                    Role::Draining | Role::DemoteTimeout | Role::Demoted
                );
            if was_primary {
                self.sql
                    .drop_slot(&self.config.slot_name(peer.node_id))
                    .await?;
            }
        }

        // Open HBA for the demoted primary that will stream from us
        let entries = HbaManager::desired_entries(
            &peers,
            REPLICATION_USER,
            &self.config.postgres.dbname,
        );
        if self.hba.ensure(&entries)? {
            self.ctl.reload().await?;
        }
        Ok(())
    }

    /// primary -> draining: block new writes ahead of demotion
    async fn drain(&self) -> Result<()> {
        self.sql.set_default_transaction_read_only(true).await?;
        self.sql.checkpoint().await?;
        Ok(())
    }

    /// -> demoted: gate a future start read-only, then stop PostgreSQL
    async fn demote(&self) -> Result<()> {
        let mut settings = self.base_settings();
        settings.insert("default_transaction_read_only".to_string(), "on".to_string());
        self.conf.ensure_included()?;
        self.conf.write(&settings)?;
        self.ctl.stop().await?;
        self.sql.invalidate().await;
        Ok(())
    }

    /// demoted -> catchingup: follow the new primary, rewinding our WAL
    async fn rewind_or_rebuild(&self, state: &KeeperState) -> Result<()> {
        let upstream = self.primary_address(state).await?;
        self.ctl.stop().await?;
        self.sql.invalidate().await;

        let source = format!(
            "host={} port={} user={} dbname={}",
            upstream.host, upstream.port, self.config.postgres.user, self.config.postgres.dbname
        );
        if let Err(e) = self.ctl.rewind(&source).await {
            tracing::warn!("pg_rewind refused, falling back to base backup: {}", e);
            self.basebackup_from(&upstream, state).await?;
        }

        self.configure_standby(&upstream, state)?;
        self.start_with_fresh_pool().await?;

        // Manually advanced slots do not hold xmin; drop them all and
        // recreate from scratch as a standby
        for slot in self.sql.list_slots().await? {
            self.sql.drop_slot(&slot.slot_name).await?;
        }
        Ok(())
    }

    /// secondary -> report-lsn: stop receiving WAL, publish our position
    async fn report_lsn(&self) -> Result<()> {
        self.conf.ensure_included()?;
        self.conf.write_detached_standby_config(self.base_settings())?;
        self.restart_with_fresh_pool().await?;
        let lsn = self.sql.current_wal_lsn().await?;
        tracing::info!("detached from upstream at {}", lsn);
        Ok(())
    }

    /// report-lsn -> fast-forward: replay the most advanced standby's WAL
    async fn fast_forward(&self, state: &KeeperState) -> Result<()> {
        let peers = self.peers(state).await?;
        let upstream = peers
            .iter()
            .filter(|p| p.current_role == Role::ReportLsn)
            .max_by_key(|p| p.reported_lsn)
            .ok_or_else(|| Error::Network("no standby left to fast-forward from".to_string()))?;
        let target = upstream.reported_lsn;

        let address = NodeAddress {
            node_id: upstream.node_id,
            name: upstream.name.clone(),
            host: upstream.host.clone(),
            port: upstream.port,
        };
        self.configure_standby(&address, state)?;
        self.restart_with_fresh_pool().await?;

        let caught_up = wait_until(
            self.config.catchup_timeout(),
            Duration::from_millis(200),
            || async { Ok(self.sql.current_wal_lsn().await? >= target) },
        )
        .await?;
        if !caught_up {
            return Err(Error::Network(format!(
                "fast-forward has not reached {target} yet"
            )));
        }

        // Disconnect again so promotion starts from a quiesced standby
        self.conf.write_detached_standby_config(self.base_settings())?;
        self.restart_with_fresh_pool().await
    }

    /// report-lsn -> join-secondary: follow the newly promoted primary
    async fn join_secondary(&self, state: &KeeperState) -> Result<()> {
        let upstream = self.primary_address(state).await?;
        self.configure_standby(&upstream, state)?;
        self.restart_with_fresh_pool().await
    }

    /// secondary -> maintenance: clean pause
    async fn start_maintenance(&self) -> Result<()> {
        self.ctl.stop().await?;
        self.sql.invalidate().await;
        Ok(())
    }

    /// -> dropped: stop everything and forget the init sentinel
    async fn drop_node(&self) -> Result<()> {
        self.ctl.stop().await?;
        self.sql.invalidate().await;
        self.sentinel.remove()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProcessRole, StewardConfig};

    fn keeper_config(dir: &std::path::Path) -> StewardConfig {
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
        StewardConfig::from_str(&toml).unwrap()
    }

    fn transitions(dir: &std::path::Path) -> KeeperTransitions {
        let config = keeper_config(dir);
        assert_eq!(config.steward.role, ProcessRole::Keeper);
        let ctl = PgCtl::new(None, config.postgres.pgdata.clone(), config.postgres.port);
        let sql = Arc::new(PgExecutor::new_mock());
        let client = Arc::new(MonitorClient::new("127.0.0.1:1".to_string()));
        KeeperTransitions::new(config, ctl, sql, client)
    }

    #[test]
    fn test_replication_conninfo_carries_node_name() {
        let dir = tempfile::tempdir().unwrap();
        let t = transitions(dir.path());
        let conninfo = t.replication_conninfo("db2.internal", 5432);
        assert!(conninfo.contains("user=steward_replicator"));
        assert!(conninfo.contains("application_name=node-a"));
    }

    #[tokio::test]
    async fn test_wait_transition_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let t = transitions(dir.path());
        let state = KeeperState::new(1, 0, Role::WaitStandby);
        t.execute(TransitionKind::Wait, &state).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_only_touches_sql() {
        // The mock executor accepts the read-only gate and checkpoint, so
        // drain succeeds without any PostgreSQL child process
        let dir = tempfile::tempdir().unwrap();
        let t = transitions(dir.path());
        let state = KeeperState::new(1, 0, Role::Draining);
        t.execute(TransitionKind::Drain, &state).await.unwrap();
    }

    #[test]
    fn test_base_settings_follow_ssl_posture() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = keeper_config(dir.path());
        config.ssl.mode = "disable".to_string();
        let ctl = PgCtl::new(None, config.postgres.pgdata.clone(), config.postgres.port);
        let sql = Arc::new(PgExecutor::new_mock());
        let client = Arc::new(MonitorClient::new("127.0.0.1:1".to_string()));
        let t = KeeperTransitions::new(config, ctl, sql, client);
        let settings = t.base_settings();
        assert_eq!(settings.get("ssl").map(String::as_str), Some("off"));
        assert_eq!(settings.get("wal_level").map(String::as_str), Some("replica"));
    }
}
