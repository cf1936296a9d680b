//! Orchestrator
//!
//! Computes goal-state assignments for every group. All decisions for one
//! group run under that group's advisory lock, so two concurrent heartbeats
//! from the same group serialize while different groups proceed in
//! parallel. The store remains the single writer for all role fields.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::fsm::Role;
use crate::monitor::store::{FormationRecord, MonitorStore, NodeRecord};
use crate::pg::Lsn;
use crate::protocol::{Health, NodeAddress, NodeSummary, PeerNode};

/// A standby within this many bytes of the primary counts as caught up
const CATCHUP_THRESHOLD_BYTES: u64 = 16 * 1024 * 1024;

/// Timing knobs the orchestrator works with
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Primary silence before a failover begins
    pub failover_timeout: chrono::Duration,
    /// Wait for an old primary to acknowledge demotion
    pub demote_timeout: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            failover_timeout: chrono::Duration::seconds(20),
            demote_timeout: chrono::Duration::seconds(30),
        }
    }
}

/// Per-group transient failover bookkeeping (rebuilt from node state after
/// a monitor restart; the timing fallback uses last_seen_at ages)
#[derive(Debug, Clone, Copy)]
struct FailoverProgress {
    started: Instant,
}

/// The monitor's assignment engine
pub struct Orchestrator {
    store: Arc<MonitorStore>,
    config: OrchestratorConfig,
    /// Advisory lock per (formation, group)
    group_locks: Mutex<HashMap<(String, i32), Arc<Mutex<()>>>>,
    /// In-flight failovers
    failovers: std::sync::Mutex<HashMap<(String, i32), FailoverProgress>>,
    /// Last synchronous_standby_names handed to each group's primary
    distributed_sync_names: std::sync::Mutex<HashMap<(String, i32), String>>,
}

impl Orchestrator {
    /// Create a new orchestrator over the given store
    pub fn new(store: Arc<MonitorStore>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            config,
            group_locks: Mutex::new(HashMap::new()),
            failovers: std::sync::Mutex::new(HashMap::new()),
            distributed_sync_names: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Access to the backing store
    pub fn store(&self) -> &Arc<MonitorStore> {
        &self.store
    }

    async fn group_lock(&self, formation: &str, group: i32) -> Arc<Mutex<()>> {
        let mut locks = self.group_locks.lock().await;
        locks
            .entry((formation.to_string(), group))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ========== RPC operations ==========

    /// Register a new node and place it in a group
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        formation_name: &str,
        group: Option<i32>,
        name: &str,
        host: &str,
        port: u16,
        dbname: &str,
        candidate_priority: i32,
        replication_quorum: bool,
    ) -> Result<(i64, i32, Role)> {
        if !(0..=100).contains(&candidate_priority) {
            return Err(Error::InvalidSetting(format!(
                "candidate priority {candidate_priority} outside [0, 100]"
            )));
        }

        let formation = self.store.ensure_formation(formation_name, dbname).await?;
        let group_id = group.unwrap_or(0);

        let lock = self.group_lock(formation_name, group_id).await;
        let _guard = lock.lock().await;

        let nodes = self.store.group_nodes(formation_name, group_id).await?;
        let occupied = !nodes.is_empty();

        let assigned = if occupied {
            if !formation.has_secondary {
                return Err(Error::GroupFull {
                    formation: formation_name.to_string(),
                    group: group_id,
                });
            }
            Role::WaitStandby
        } else {
            Role::Single
        };

        let node_id = self
            .store
            .create_node(
                formation_name,
                group_id,
                name,
                host,
                port,
                candidate_priority,
                replication_quorum,
                assigned,
            )
            .await?;

        if occupied {
            // Move the incumbent so it opens access for the newcomer
            if let Some(primary) = nodes.iter().find(|n| n.assigned_role.is_primary_side()) {
                match primary.current_role {
                    Role::Single => {
                        self.store
                            .set_assigned_role(primary.node_id, Role::WaitPrimary)
                            .await?;
                    }
                    Role::Primary => {
                        self.store
                            .set_assigned_role(primary.node_id, Role::JoinPrimary)
                            .await?;
                    }
                    _ => {}
                }
            }
        }

        tracing::info!(
            "registered node {} ({}) in {}/{} as {}",
            node_id,
            name,
            formation_name,
            group_id,
            assigned
        );
        Ok((node_id, group_id, assigned))
    }

    /// Process one heartbeat and return the caller's goal role
    pub async fn node_active(
        &self,
        node_id: i64,
        group_id: i32,
        current_role: Role,
        pg_is_running: bool,
        current_lsn: Lsn,
        sync_state: &str,
    ) -> Result<Role> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        if node.group_id != group_id {
            return Err(Error::StaleGroup {
                node_id,
                group: node.group_id,
            });
        }

        self.store
            .update_reported_state(node_id, current_role, pg_is_running, current_lsn, sync_state)
            .await?;

        // A node that confirmed the drop is forgotten entirely
        if current_role == Role::Dropped {
            let formation = node.formation.clone();
            self.store.delete_node(node_id).await?;
            self.orchestrate(&formation, group_id).await?;
            return Ok(Role::Dropped);
        }

        self.orchestrate(&node.formation, group_id).await?;

        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        Ok(node.assigned_role)
    }

    /// Resolve the current primary of a group, if any
    pub async fn get_primary(&self, formation: &str, group: i32) -> Result<Option<NodeAddress>> {
        let nodes = self.store.group_nodes(formation, group).await?;
        Ok(nodes
            .iter()
            .find(|n| n.current_role.is_primary_side())
            .map(|n| NodeAddress {
                node_id: n.node_id,
                name: n.name.clone(),
                host: n.host.clone(),
                port: n.port,
            }))
    }

    /// Everyone in the caller's group but the caller
    pub async fn get_other_nodes(
        &self,
        node_id: i64,
        role_filter: Option<Role>,
    ) -> Result<Vec<PeerNode>> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        let nodes = self.store.group_nodes(&node.formation, node.group_id).await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.node_id != node_id)
            .filter(|n| role_filter.map_or(true, |role| n.current_role == role))
            .map(|n| PeerNode {
                node_id: n.node_id,
                name: n.name,
                host: n.host,
                port: n.port,
                current_role: n.current_role,
                health: n.health,
                reported_lsn: n.reported_lsn,
            })
            .collect())
    }

    /// Replication settings a keeper should apply right now
    pub async fn get_settings(&self, node_id: i64) -> Result<(i32, String)> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        let formation = self
            .store
            .get_formation(&node.formation)
            .await?
            .ok_or_else(|| Error::Monitor(format!("formation {} not found", node.formation)))?;
        let nodes = self.store.group_nodes(&node.formation, node.group_id).await?;
        let names = self
            .compute_sync_standby_names(&formation, &nodes)
            .unwrap_or_default();
        Ok((formation.number_sync_standbys, names))
    }

    /// Change number-sync-standbys for a formation. Rejected when the
    /// formation does not hold enough quorum standbys to ever satisfy it.
    pub async fn set_group_settings(&self, formation: &str, number_sync_standbys: i32) -> Result<()> {
        if number_sync_standbys < 0 {
            return Err(Error::InvalidSetting(
                "number-sync-standbys must be >= 0".into(),
            ));
        }
        let nodes = self.store.all_nodes(Some(formation)).await?;
        if nodes.is_empty() {
            return Err(Error::Monitor(format!("formation {formation} not found")));
        }

        let mut per_group: HashMap<i32, i32> = HashMap::new();
        for node in &nodes {
            if node.replication_quorum && !node.current_role.is_primary_side() {
                *per_group.entry(node.group_id).or_insert(0) += 1;
            }
        }
        let min_quorum = per_group.values().copied().min().unwrap_or(0);
        if number_sync_standbys > min_quorum {
            return Err(Error::InvalidSetting(format!(
                "number-sync-standbys {number_sync_standbys} exceeds the {min_quorum} quorum standbys available"
            )));
        }

        self.store
            .set_number_sync_standbys(formation, number_sync_standbys)
            .await?;

        let mut groups: Vec<i32> = nodes.iter().map(|n| n.group_id).collect();
        groups.sort_unstable();
        groups.dedup();
        for group in groups {
            self.orchestrate(formation, group).await?;
        }
        Ok(())
    }

    /// Change per-node election settings
    pub async fn set_node_settings(
        &self,
        node_id: i64,
        candidate_priority: Option<i32>,
        replication_quorum: Option<bool>,
    ) -> Result<()> {
        if let Some(priority) = candidate_priority {
            if !(0..=100).contains(&priority) {
                return Err(Error::InvalidSetting(format!(
                    "candidate priority {priority} outside [0, 100]"
                )));
            }
        }
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        self.store
            .set_node_settings(node_id, candidate_priority, replication_quorum)
            .await?;
        self.orchestrate(&node.formation, node.group_id).await
    }

    /// Remove a node from its group
    pub async fn remove_node(&self, node_id: i64) -> Result<()> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;

        self.store.set_assigned_role(node_id, Role::Dropped).await?;

        // An unreachable keeper will never confirm; forget it right away
        let fresh = node.is_fresh(self.config.failover_timeout, Utc::now());
        if !fresh {
            self.store.delete_node(node_id).await?;
        }

        tracing::info!("node {} assigned dropped (fresh: {})", node_id, fresh);
        self.orchestrate(&node.formation, node.group_id).await
    }

    /// Pause a standby for maintenance
    pub async fn start_maintenance(&self, node_id: i64) -> Result<()> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        if !node.current_role.is_standby_side() {
            return Err(Error::InvalidSetting(format!(
                "node {} is {}, only standbys can enter maintenance",
                node_id, node.current_role
            )));
        }
        self.store.set_assigned_role(node_id, Role::Maintenance).await?;
        self.orchestrate(&node.formation, node.group_id).await
    }

    /// Resume a standby after maintenance
    pub async fn stop_maintenance(&self, node_id: i64) -> Result<()> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(Error::NodeNotFound(node_id))?;
        if node.assigned_role != Role::Maintenance {
            return Err(Error::InvalidSetting(format!(
                "node {node_id} is not in maintenance"
            )));
        }
        self.store.set_assigned_role(node_id, Role::Catchingup).await?;
        self.orchestrate(&node.formation, node.group_id).await
    }

    /// Operator-initiated switchover of a healthy group
    pub async fn perform_failover(&self, formation: &str, group: i32) -> Result<()> {
        let lock = self.group_lock(formation, group).await;
        let _guard = lock.lock().await;

        let nodes = self.store.group_nodes(formation, group).await?;
        let now = Utc::now();

        let primary = nodes
            .iter()
            .find(|n| n.current_role.is_primary_side() && n.assigned_role.is_primary_side())
            .ok_or_else(|| Error::Monitor(format!("group {formation}/{group} has no primary")))?;

        let has_candidate = nodes.iter().any(|n| {
            n.node_id != primary.node_id
                && n.is_failover_candidate()
                && n.current_role.is_electable()
                && n.is_fresh(self.config.failover_timeout, now)
        });
        if !has_candidate {
            return Err(Error::InvalidSetting(format!(
                "group {formation}/{group} has no failover candidate"
            )));
        }

        self.store
            .set_assigned_role(primary.node_id, Role::Draining)
            .await?;
        for node in &nodes {
            if node.node_id != primary.node_id && node.current_role.is_electable() {
                self.store.set_assigned_role(node.node_id, Role::ReportLsn).await?;
            }
        }
        self.failovers.lock().unwrap().insert(
            (formation.to_string(), group),
            FailoverProgress {
                started: Instant::now(),
            },
        );
        tracing::info!("switchover started for {}/{}", formation, group);
        Ok(())
    }

    /// Formation-wide (or global) state listing
    pub async fn current_state(&self, formation: Option<&str>) -> Result<Vec<NodeSummary>> {
        let nodes = self.store.all_nodes(formation).await?;
        Ok(nodes
            .into_iter()
            .map(|n| NodeSummary {
                formation: n.formation,
                group_id: n.group_id,
                node_id: n.node_id,
                name: n.name,
                host: n.host,
                port: n.port,
                current_role: n.current_role,
                assigned_role: n.assigned_role,
                reported_lsn: n.reported_lsn,
                health: n.health,
                candidate_priority: n.candidate_priority,
                replication_quorum: n.replication_quorum,
            })
            .collect())
    }

    // ========== Goal-state computation ==========

    /// Recompute assignments for one group under its advisory lock
    pub async fn orchestrate(&self, formation_name: &str, group: i32) -> Result<()> {
        let lock = self.group_lock(formation_name, group).await;
        let _guard = lock.lock().await;
        self.orchestrate_locked(formation_name, group).await
    }

    async fn orchestrate_locked(&self, formation_name: &str, group: i32) -> Result<()> {
        let Some(formation) = self.store.get_formation(formation_name).await? else {
            return Ok(());
        };
        let nodes = self.store.group_nodes(formation_name, group).await?;
        if nodes.is_empty() {
            self.failovers
                .lock()
                .unwrap()
                .remove(&(formation_name.to_string(), group));
            return Ok(());
        }

        self.advance_demotions(formation_name, &nodes).await?;

        let in_failover = nodes.iter().any(|n| {
            matches!(
                n.assigned_role,
                Role::ReportLsn | Role::FastForward | Role::PreparePromotion | Role::StopReplication
            )
        });

        if in_failover {
            self.advance_failover(formation_name, group, &nodes).await
        } else {
            self.steady_state(&formation, group, &nodes).await
        }
    }

    /// Drive old primaries through demotion and back into the group
    async fn advance_demotions(&self, formation: &str, nodes: &[NodeRecord]) -> Result<()> {
        let now = Utc::now();
        let new_primary_ready = nodes.iter().any(|n| {
            matches!(
                n.current_role,
                Role::WaitPrimary | Role::Primary | Role::JoinPrimary | Role::Single
            )
        });

        for node in nodes {
            match node.assigned_role {
                Role::DemoteTimeout => {
                    // The moment the old primary is reachable again it is
                    // told to demote; it never resumes as primary
                    if node.is_fresh(self.config.failover_timeout, now) {
                        self.store.set_assigned_role(node.node_id, Role::Demoted).await?;
                    }
                }
                Role::Draining => {
                    if node.current_role == Role::Draining {
                        self.store.set_assigned_role(node.node_id, Role::Demoted).await?;
                    }
                }
                Role::Demoted => {
                    // Rejoin only once the new primary can serve a rewind source
                    if node.current_role == Role::Demoted && new_primary_ready {
                        self.store
                            .set_assigned_role(node.node_id, Role::Catchingup)
                            .await?;
                        tracing::info!(
                            "old primary {} ({}) rejoins {} through rewind",
                            node.node_id,
                            node.name,
                            formation
                        );
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Progress an in-flight failover: election, fast-forward, promotion
    async fn advance_failover(
        &self,
        formation: &str,
        group: i32,
        nodes: &[NodeRecord],
    ) -> Result<()> {
        let now = Utc::now();
        let key = (formation.to_string(), group);

        let winner = nodes.iter().find(|n| {
            matches!(
                n.assigned_role,
                Role::FastForward | Role::PreparePromotion | Role::StopReplication
            )
        });

        if let Some(winner) = winner {
            match winner.assigned_role {
                Role::FastForward => {
                    let target = nodes
                        .iter()
                        .filter(|n| n.assigned_role == Role::ReportLsn)
                        .map(|n| n.reported_lsn)
                        .max()
                        .unwrap_or(Lsn::ZERO);
                    if winner.current_role == Role::FastForward && winner.reported_lsn >= target {
                        self.store
                            .set_assigned_role(winner.node_id, Role::PreparePromotion)
                            .await?;
                        self.assign_losers(winner.node_id, nodes).await?;
                    }
                }
                Role::PreparePromotion => {
                    if winner.current_role == Role::PreparePromotion {
                        self.store
                            .set_assigned_role(winner.node_id, Role::StopReplication)
                            .await?;
                    }
                    self.assign_losers(winner.node_id, nodes).await?;
                }
                Role::StopReplication => {
                    if winner.current_role == Role::StopReplication
                        && self.old_primary_is_gone(&key, nodes, now)
                    {
                        self.store
                            .set_assigned_role(winner.node_id, Role::WaitPrimary)
                            .await?;
                        self.failovers.lock().unwrap().remove(&key);
                        tracing::info!(
                            "failover of {}/{}: node {} ({}) promoted",
                            formation,
                            group,
                            winner.node_id,
                            winner.name
                        );
                    }
                }
                _ => unreachable!(),
            }
            return Ok(());
        }

        // Election phase: wait for every fresh standby to publish its LSN
        let reporting: Vec<&NodeRecord> = nodes
            .iter()
            .filter(|n| n.assigned_role == Role::ReportLsn)
            .collect();
        let fresh: Vec<&NodeRecord> = reporting
            .iter()
            .copied()
            .filter(|n| n.is_fresh(self.config.failover_timeout, now))
            .collect();
        if fresh.is_empty() || fresh.iter().any(|n| n.current_role != Role::ReportLsn) {
            return Ok(());
        }

        let candidates: Vec<&NodeRecord> = fresh
            .iter()
            .copied()
            .filter(|n| n.is_failover_candidate())
            .collect();
        if candidates.is_empty() {
            return self.refuse_failover(formation, group, nodes, &fresh, now).await;
        }

        // Highest priority tier first, most advanced WAL within the tier,
        // lowest node id as the final tie-break
        let max_lsn_all = fresh.iter().map(|n| n.reported_lsn).max().unwrap_or(Lsn::ZERO);
        let max_priority = candidates
            .iter()
            .map(|n| n.candidate_priority)
            .max()
            .unwrap_or(0);
        let tier: Vec<&NodeRecord> = candidates
            .iter()
            .copied()
            .filter(|n| n.candidate_priority == max_priority)
            .collect();
        let max_lsn_tier = tier.iter().map(|n| n.reported_lsn).max().unwrap_or(Lsn::ZERO);
        let winner = tier
            .iter()
            .filter(|n| n.reported_lsn == max_lsn_tier)
            .min_by_key(|n| n.node_id)
            .copied()
            .expect("tier is non-empty");

        if winner.reported_lsn < max_lsn_all {
            tracing::info!(
                "election in {}/{}: winner {} at {} must fast-forward to {}",
                formation,
                group,
                winner.name,
                winner.reported_lsn,
                max_lsn_all
            );
            self.store.set_assigned_role(winner.node_id, Role::FastForward).await?;
        } else {
            tracing::info!(
                "election in {}/{}: winner {} holds the most recent WAL at {}",
                formation,
                group,
                winner.name,
                winner.reported_lsn
            );
            self.store
                .set_assigned_role(winner.node_id, Role::PreparePromotion)
                .await?;
            self.assign_losers(winner.node_id, nodes).await?;
        }
        Ok(())
    }

    /// Election losers re-point replication at the new primary
    async fn assign_losers(&self, winner_id: i64, nodes: &[NodeRecord]) -> Result<()> {
        for node in nodes {
            if node.node_id != winner_id && node.assigned_role == Role::ReportLsn {
                self.store
                    .set_assigned_role(node.node_id, Role::JoinSecondary)
                    .await?;
            }
        }
        Ok(())
    }

    /// No candidate may be promoted: never elect priority-zero or
    /// non-quorum nodes. If the old primary is back, abort the failover.
    async fn refuse_failover(
        &self,
        formation: &str,
        group: i32,
        nodes: &[NodeRecord],
        reporting: &[&NodeRecord],
        now: chrono::DateTime<Utc>,
    ) -> Result<()> {
        tracing::error!(
            "failover of {}/{} refused: no candidate with priority > 0 and replication quorum",
            formation,
            group
        );
        let old_primary = nodes.iter().find(|n| {
            matches!(n.assigned_role, Role::DemoteTimeout | Role::Draining)
                && n.current_role.is_primary_side()
                && n.is_fresh(self.config.failover_timeout, now)
        });
        if let Some(primary) = old_primary {
            self.store.set_assigned_role(primary.node_id, Role::Primary).await?;
            for node in reporting {
                self.store.set_assigned_role(node.node_id, Role::Secondary).await?;
            }
            self.failovers
                .lock()
                .unwrap()
                .remove(&(formation.to_string(), group));
            tracing::info!("failover of {}/{} aborted, primary is back", formation, group);
        }
        Ok(())
    }

    /// Whether the deposed primary can no longer accept writes: it reported
    /// the demotion, or the demote timeout expired without any sign of it
    fn old_primary_is_gone(
        &self,
        key: &(String, i32),
        nodes: &[NodeRecord],
        now: chrono::DateTime<Utc>,
    ) -> bool {
        let Some(old) = nodes.iter().find(|n| {
            matches!(
                n.assigned_role,
                Role::DemoteTimeout | Role::Demoted | Role::Draining
            )
        }) else {
            // Dropped or deleted: nothing left to wait for
            return true;
        };

        if matches!(
            old.current_role,
            Role::Draining | Role::DemoteTimeout | Role::Demoted
        ) {
            return true;
        }

        if let Some(progress) = self.failovers.lock().unwrap().get(key) {
            if progress.started.elapsed()
                >= self.config.demote_timeout.to_std().unwrap_or_default()
            {
                return true;
            }
        } else {
            // Monitor restarted mid-failover: fall back to heartbeat age
            let cutoff = self.config.failover_timeout + self.config.demote_timeout;
            if !old.is_fresh(cutoff, now) {
                return true;
            }
        }
        false
    }

    /// Steady-state rules: joins, catch-up, sync-rep policy, detection
    async fn steady_state(
        &self,
        formation: &FormationRecord,
        group: i32,
        nodes: &[NodeRecord],
    ) -> Result<()> {
        let now = Utc::now();
        let key = (formation.name.clone(), group);

        let primary = nodes.iter().find(|n| {
            n.assigned_role.is_primary_side() || n.assigned_role == Role::Draining
        });
        let standbys: Vec<&NodeRecord> = nodes
            .iter()
            .filter(|n| {
                primary.map_or(true, |p| p.node_id != n.node_id)
                    && !matches!(
                        n.assigned_role,
                        Role::DemoteTimeout | Role::Demoted | Role::Dropped
                    )
            })
            .collect();

        let Some(primary) = primary else {
            return Ok(());
        };

        // Unplanned failover detection. A primary that never heart-beat at
        // all is still initializing, not dead.
        if primary.assigned_role != Role::Draining
            && primary.last_seen_at.is_some()
            && !primary.is_fresh(self.config.failover_timeout, now)
        {
            let promotable = standbys.iter().any(|s| {
                s.is_failover_candidate()
                    && s.is_fresh(self.config.failover_timeout, now)
                    && s.reported_lsn >= primary.reported_lsn
            });
            if promotable {
                tracing::warn!(
                    "primary {} ({}) of {}/{} is unresponsive, starting failover",
                    primary.node_id,
                    primary.name,
                    formation.name,
                    group
                );
                self.store
                    .set_assigned_role(primary.node_id, Role::DemoteTimeout)
                    .await?;
                for standby in &standbys {
                    if standby.current_role.is_electable()
                        && standby.assigned_role != Role::Maintenance
                    {
                        self.store
                            .set_assigned_role(standby.node_id, Role::ReportLsn)
                            .await?;
                    }
                }
                self.failovers.lock().unwrap().insert(
                    key,
                    FailoverProgress {
                        started: Instant::now(),
                    },
                );
                return Ok(());
            }
            // No promotable standby: wait for the primary, never lose data
            return Ok(());
        }

        // A single that gained company opens up for replication
        if primary.assigned_role == Role::Single && !standbys.is_empty() && formation.has_secondary {
            self.store
                .set_assigned_role(primary.node_id, Role::WaitPrimary)
                .await?;
            return Ok(());
        }

        // Authorize waiting standbys once the primary opened access
        if matches!(primary.current_role, Role::WaitPrimary | Role::JoinPrimary) {
            for standby in &standbys {
                if standby.assigned_role == Role::WaitStandby {
                    self.store
                        .set_assigned_role(standby.node_id, Role::Catchingup)
                        .await?;
                }
            }
        }

        // An established primary accepts a newly registered standby
        if primary.current_role == Role::Primary
            && primary.assigned_role == Role::Primary
            && standbys.iter().any(|s| s.assigned_role == Role::WaitStandby)
        {
            self.store
                .set_assigned_role(primary.node_id, Role::JoinPrimary)
                .await?;
        }

        // Catch-up completion
        for standby in &standbys {
            if standby.assigned_role == Role::Catchingup
                && standby.current_role == Role::Catchingup
                && standby.pg_is_running
                && !standby.reported_lsn.is_zero()
                && standby.reported_lsn.0 + CATCHUP_THRESHOLD_BYTES >= primary.reported_lsn.0
            {
                self.store
                    .set_assigned_role(standby.node_id, Role::Secondary)
                    .await?;
            }
            if standby.assigned_role == Role::JoinSecondary
                && standby.current_role == Role::JoinSecondary
            {
                self.store
                    .set_assigned_role(standby.node_id, Role::Secondary)
                    .await?;
            }
        }

        let secondaries: Vec<&&NodeRecord> = standbys
            .iter()
            .filter(|s| {
                s.current_role == Role::Secondary && s.is_fresh(self.config.failover_timeout, now)
            })
            .collect();
        let quorum_count = secondaries.iter().filter(|s| s.replication_quorum).count();
        let k = formation.number_sync_standbys;

        // Enable synchronous replication once enough standbys caught up.
        // A join-primary holds its role until every joiner settled.
        let joiners_pending = standbys
            .iter()
            .any(|s| matches!(s.assigned_role, Role::WaitStandby | Role::Catchingup));
        if matches!(primary.current_role, Role::WaitPrimary | Role::JoinPrimary)
            && primary.assigned_role == primary.current_role
            && !secondaries.is_empty()
            && !joiners_pending
            && (k == 0 || quorum_count >= k as usize)
        {
            self.store.set_assigned_role(primary.node_id, Role::Primary).await?;
            return Ok(());
        }

        // Loss of standbys
        if primary.current_role == Role::Primary && primary.assigned_role == Role::Primary {
            if standbys.is_empty() {
                // Group shrank on purpose; drop replication expectations
                self.store
                    .set_assigned_role(primary.node_id, Role::WaitPrimary)
                    .await?;
                self.distributed_sync_names.lock().unwrap().remove(&key);
                return Ok(());
            }
            if k == 0 && secondaries.is_empty() {
                // Async formation: relax rather than block writes
                self.store
                    .set_assigned_role(primary.node_id, Role::WaitPrimary)
                    .await?;
                self.distributed_sync_names.lock().unwrap().remove(&key);
                return Ok(());
            }
            // k > 0 with missing standbys: keep sync rep, writes block
        }

        // The last standby left a wait-primary behind
        if primary.assigned_role == Role::WaitPrimary
            && primary.current_role == Role::WaitPrimary
            && standbys.is_empty()
            && !nodes
                .iter()
                .any(|n| matches!(n.assigned_role, Role::DemoteTimeout | Role::Demoted))
        {
            self.store.set_assigned_role(primary.node_id, Role::Single).await?;
            return Ok(());
        }

        // Distribute the sync-rep setting when it changed
        if primary.current_role == Role::Primary && primary.assigned_role == Role::Primary {
            if let Some(names) = self.compute_sync_standby_names(formation, nodes) {
                let stale = {
                    let distributed = self.distributed_sync_names.lock().unwrap();
                    distributed.get(&key) != Some(&names)
                };
                if stale {
                    tracing::info!(
                        "group {}/{}: synchronous_standby_names is now {:?}",
                        formation.name,
                        group,
                        names
                    );
                    self.store
                        .set_assigned_role(primary.node_id, Role::ApplySettings)
                        .await?;
                    self.distributed_sync_names.lock().unwrap().insert(key, names);
                    return Ok(());
                }
            }
        }

        // Settle apply-settings once the quorum covers the primary's WAL
        if primary.assigned_role == Role::ApplySettings
            && primary.current_role == Role::ApplySettings
        {
            let covered = k == 0
                || secondaries.iter().any(|s| {
                    s.replication_quorum
                        && s.reported_lsn.0 + CATCHUP_THRESHOLD_BYTES >= primary.reported_lsn.0
                });
            if covered {
                self.store.set_assigned_role(primary.node_id, Role::Primary).await?;
            }
        }

        Ok(())
    }

    /// The `ANY k (name, ...)` string for a group, `None` when writing any
    /// value now would permit unreplicated commits against the policy
    pub fn compute_sync_standby_names(
        &self,
        formation: &FormationRecord,
        nodes: &[NodeRecord],
    ) -> Option<String> {
        let now = Utc::now();
        let mut names: Vec<&str> = nodes
            .iter()
            .filter(|n| {
                n.replication_quorum
                    && !n.current_role.is_primary_side()
                    && n.current_role.is_standby_side()
                    && n.assigned_role != Role::Maintenance
                    && n.health != Health::Bad
                    && n.is_fresh(self.config.failover_timeout, now)
            })
            .map(|n| n.name.as_str())
            .collect();
        names.sort_unstable();

        let k = formation.number_sync_standbys;
        if names.is_empty() {
            // Empty means unreplicated commits: only allowed when the
            // formation asked for zero sync standbys
            return if k == 0 { Some(String::new()) } else { None };
        }
        if k == 0 {
            return Some(String::new());
        }
        Some(format!("ANY {} ({})", k, names.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> Orchestrator {
        let store = Arc::new(MonitorStore::in_memory().unwrap());
        Orchestrator::new(
            store,
            OrchestratorConfig {
                failover_timeout: chrono::Duration::seconds(20),
                demote_timeout: chrono::Duration::milliseconds(50),
            },
        )
    }

    /// Heartbeat helper: report a state, get the new assignment back
    async fn beat(
        orch: &Orchestrator,
        node_id: i64,
        role: Role,
        lsn: u64,
        sync_state: &str,
    ) -> Role {
        orch.node_active(node_id, 0, role, true, Lsn(lsn), sync_state)
            .await
            .unwrap()
    }

    async fn register(orch: &Orchestrator, name: &str, host: &str) -> (i64, i32, Role) {
        orch.register("default", None, name, host, 5432, "app", 50, true)
            .await
            .unwrap()
    }

    /// Walk a fresh two-node group to its steady state: a=primary,
    /// b=secondary. Returns (a, b).
    async fn settle_two_nodes(orch: &Orchestrator) -> (i64, i64) {
        let (a, _, role_a) = register(orch, "node-a", "10.0.0.1").await;
        assert_eq!(role_a, Role::Single);
        assert_eq!(beat(orch, a, Role::Init, 0, "").await, Role::Single);
        assert_eq!(beat(orch, a, Role::Single, 0x1000, "").await, Role::Single);

        let (b, _, role_b) = register(orch, "node-b", "10.0.0.2").await;
        assert_eq!(role_b, Role::WaitStandby);

        // Incumbent moves to wait-primary, opens access
        assert_eq!(beat(orch, a, Role::Single, 0x1000, "").await, Role::WaitPrimary);
        assert_eq!(beat(orch, b, Role::Init, 0, "").await, Role::WaitStandby);
        // Once the primary reports wait-primary the standby may catch up
        assert_eq!(beat(orch, a, Role::WaitPrimary, 0x1000, "").await, Role::WaitPrimary);
        assert_eq!(beat(orch, b, Role::WaitStandby, 0, "").await, Role::Catchingup);
        assert_eq!(beat(orch, b, Role::Catchingup, 0x1000, "").await, Role::Secondary);
        // Standby caught up: enable sync rep on the primary
        assert_eq!(beat(orch, b, Role::Secondary, 0x1000, "sync").await, Role::Secondary);
        assert_eq!(beat(orch, a, Role::WaitPrimary, 0x1000, "").await, Role::Primary);
        // Settings distribution follows
        assert_eq!(beat(orch, a, Role::Primary, 0x1000, "").await, Role::ApplySettings);
        assert_eq!(beat(orch, a, Role::ApplySettings, 0x1000, "").await, Role::Primary);
        (a, b)
    }

    #[tokio::test]
    async fn test_cold_start_two_node_group() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        let nodes = orch.store().group_nodes("default", 0).await.unwrap();
        let node_a = nodes.iter().find(|n| n.node_id == a).unwrap();
        let node_b = nodes.iter().find(|n| n.node_id == b).unwrap();
        assert_eq!(node_a.assigned_role, Role::Primary);
        assert_eq!(node_b.assigned_role, Role::Secondary);

        let formation = orch.store().get_formation("default").await.unwrap().unwrap();
        let names = orch.compute_sync_standby_names(&formation, &nodes).unwrap();
        assert_eq!(names, "ANY 1 (node-b)");
    }

    #[tokio::test]
    async fn test_at_most_one_writable_role_throughout() {
        let orch = orchestrator();
        let (_a, _b) = settle_two_nodes(&orch).await;

        let nodes = orch.store().group_nodes("default", 0).await.unwrap();
        let writable = nodes
            .iter()
            .filter(|n| n.current_role.is_writable() || n.assigned_role.is_writable())
            .count();
        assert!(writable <= 1);
    }

    #[tokio::test]
    async fn test_second_node_refused_without_secondary() {
        let orch = orchestrator();
        let (_a, _, _) = register(&orch, "node-a", "10.0.0.1").await;

        orch.store().set_has_secondary("default", false).await.unwrap();
        let err = orch
            .register("default", None, "node-b", "10.0.0.2", 5432, "app", 50, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GroupFull { .. }));

        orch.store().set_has_secondary("default", true).await.unwrap();
        let result = orch
            .register("default", None, "node-b", "10.0.0.2", 5432, "app", 50, true)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_register_name_collision() {
        let orch = orchestrator();
        let _ = register(&orch, "node-a", "10.0.0.1").await;
        let err = orch
            .register("default", None, "node-a", "10.0.0.9", 5432, "app", 50, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NameCollision(_)));
    }

    #[tokio::test]
    async fn test_switchover_elects_and_promotes() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        orch.perform_failover("default", 0).await.unwrap();

        // Primary drains and demotes
        assert_eq!(beat(&orch, a, Role::Primary, 0x1000, "").await, Role::Draining);
        assert_eq!(beat(&orch, a, Role::Draining, 0x1000, "").await, Role::Demoted);

        // Standby reports its LSN, wins, walks the promotion chain
        assert_eq!(beat(&orch, b, Role::Secondary, 0x1000, "").await, Role::ReportLsn);
        assert_eq!(beat(&orch, b, Role::ReportLsn, 0x1000, "").await, Role::PreparePromotion);
        assert_eq!(
            beat(&orch, b, Role::PreparePromotion, 0x1000, "").await,
            Role::StopReplication
        );
        assert_eq!(beat(&orch, b, Role::StopReplication, 0x1000, "").await, Role::WaitPrimary);

        // The demoted primary rejoins through rewind
        assert_eq!(beat(&orch, b, Role::WaitPrimary, 0x1000, "").await, Role::WaitPrimary);
        assert_eq!(beat(&orch, a, Role::Demoted, 0x1000, "").await, Role::Catchingup);
        assert_eq!(beat(&orch, a, Role::Catchingup, 0x1000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, a, Role::Secondary, 0x1000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, b, Role::WaitPrimary, 0x1000, "").await, Role::Primary);
    }

    #[tokio::test]
    async fn test_three_node_failover_with_uneven_lsns() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        // Third node joins: primary accepts it
        let (c, _, role_c) = register(&orch, "node-c", "10.0.0.3").await;
        assert_eq!(role_c, Role::WaitStandby);
        assert_eq!(beat(&orch, a, Role::Primary, 0x2000, "").await, Role::JoinPrimary);
        assert_eq!(beat(&orch, a, Role::JoinPrimary, 0x2000, "").await, Role::JoinPrimary);
        assert_eq!(beat(&orch, c, Role::Init, 0, "").await, Role::Catchingup);
        assert_eq!(beat(&orch, c, Role::Catchingup, 0x2000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, c, Role::Secondary, 0x2000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, b, Role::Secondary, 0x2000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, a, Role::JoinPrimary, 0x2000, "").await, Role::Primary);
        // Settle the sync-names distribution round
        assert_eq!(beat(&orch, a, Role::Primary, 0x2000, "").await, Role::ApplySettings);
        assert_eq!(beat(&orch, a, Role::ApplySettings, 0x2000, "").await, Role::Primary);

        // Prefer b over c for promotion
        orch.set_node_settings(b, Some(90), None).await.unwrap();
        orch.set_node_settings(c, Some(50), None).await.unwrap();

        orch.perform_failover("default", 0).await.unwrap();
        assert_eq!(beat(&orch, a, Role::Primary, 0x3000, "").await, Role::Draining);
        assert_eq!(beat(&orch, a, Role::Draining, 0x3000, "").await, Role::Demoted);

        // b reports 0/3000, c reports 0/3100: b wins on priority but must
        // fast-forward from c first
        assert_eq!(beat(&orch, b, Role::Secondary, 0x3000, "").await, Role::ReportLsn);
        assert_eq!(beat(&orch, c, Role::Secondary, 0x3100, "").await, Role::ReportLsn);
        assert_eq!(beat(&orch, c, Role::ReportLsn, 0x3100, "").await, Role::ReportLsn);
        assert_eq!(beat(&orch, b, Role::ReportLsn, 0x3000, "").await, Role::FastForward);

        // Not caught up yet: stays in fast-forward
        assert_eq!(beat(&orch, b, Role::FastForward, 0x3050, "").await, Role::FastForward);
        // Caught up to 0/3100: promotion chain begins, c re-points
        assert_eq!(beat(&orch, b, Role::FastForward, 0x3100, "").await, Role::PreparePromotion);
        assert_eq!(beat(&orch, c, Role::ReportLsn, 0x3100, "").await, Role::JoinSecondary);
        assert_eq!(
            beat(&orch, b, Role::PreparePromotion, 0x3100, "").await,
            Role::StopReplication
        );
        assert_eq!(beat(&orch, b, Role::StopReplication, 0x3100, "").await, Role::WaitPrimary);
        assert_eq!(beat(&orch, c, Role::JoinSecondary, 0x3100, "").await, Role::Secondary);
    }

    #[tokio::test]
    async fn test_dead_primary_triggers_failover() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        // The primary goes silent past the failover timeout
        orch.store()
            .set_last_seen(a, Utc::now() - chrono::Duration::seconds(30))
            .await
            .unwrap();
        orch.orchestrate("default", 0).await.unwrap();

        let node_a = orch.store().get_node(a).await.unwrap().unwrap();
        assert_eq!(node_a.assigned_role, Role::DemoteTimeout);
        let node_b = orch.store().get_node(b).await.unwrap().unwrap();
        assert_eq!(node_b.assigned_role, Role::ReportLsn);

        // The standby publishes its LSN and wins
        assert_eq!(beat(&orch, b, Role::ReportLsn, 0x1000, "").await, Role::PreparePromotion);
        assert_eq!(
            beat(&orch, b, Role::PreparePromotion, 0x1000, "").await,
            Role::StopReplication
        );
        // Demote timeout (50ms in tests) expires without the primary
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(beat(&orch, b, Role::StopReplication, 0x1000, "").await, Role::WaitPrimary);

        // The old primary resurfaces still believing it is primary: it is
        // told to demote, not to resume
        assert_eq!(beat(&orch, a, Role::Primary, 0x1000, "").await, Role::Demoted);
        // Once the new primary reports in, the demoted node rejoins
        assert_eq!(beat(&orch, b, Role::WaitPrimary, 0x1000, "").await, Role::WaitPrimary);
        assert_eq!(beat(&orch, a, Role::Demoted, 0x1000, "").await, Role::Catchingup);
    }

    #[tokio::test]
    async fn test_no_failover_when_standby_is_behind() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        // Primary last reported 0x2000, standby only has 0x1000
        assert_eq!(beat(&orch, a, Role::Primary, 0x2000, "").await, Role::Primary);
        orch.store()
            .set_last_seen(a, Utc::now() - chrono::Duration::seconds(30))
            .await
            .unwrap();
        orch.orchestrate("default", 0).await.unwrap();

        // No standby holds the primary's WAL: the monitor waits
        let node_a = orch.store().get_node(a).await.unwrap().unwrap();
        assert_eq!(node_a.assigned_role, Role::Primary);
        let node_b = orch.store().get_node(b).await.unwrap().unwrap();
        assert_eq!(node_b.assigned_role, Role::Secondary);
    }

    #[tokio::test]
    async fn test_priority_zero_is_never_elected() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;
        orch.set_node_settings(b, Some(0), None).await.unwrap();

        // No candidate: switchover is refused outright
        let err = orch.perform_failover("default", 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSetting(_)));

        let node_a = orch.store().get_node(a).await.unwrap().unwrap();
        assert_eq!(node_a.assigned_role, Role::Primary);
        let node_b = orch.store().get_node(b).await.unwrap().unwrap();
        assert!(node_b.assigned_role != Role::PreparePromotion);
    }

    #[tokio::test]
    async fn test_policy_change_distributes_apply_settings() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        let (c, _, _) = register(&orch, "node-c", "10.0.0.3").await;
        assert_eq!(beat(&orch, a, Role::Primary, 0x2000, "").await, Role::JoinPrimary);
        assert_eq!(beat(&orch, a, Role::JoinPrimary, 0x2000, "").await, Role::JoinPrimary);
        assert_eq!(beat(&orch, c, Role::Init, 0, "").await, Role::Catchingup);
        assert_eq!(beat(&orch, c, Role::Catchingup, 0x2000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, c, Role::Secondary, 0x2000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, b, Role::Secondary, 0x2000, "").await, Role::Secondary);
        assert_eq!(beat(&orch, a, Role::JoinPrimary, 0x2000, "").await, Role::Primary);
        assert_eq!(beat(&orch, a, Role::Primary, 0x2000, "").await, Role::ApplySettings);
        assert_eq!(beat(&orch, a, Role::ApplySettings, 0x2000, "").await, Role::Primary);

        orch.set_group_settings("default", 2).await.unwrap();
        let (k, names) = orch.get_settings(a).await.unwrap();
        assert_eq!(k, 2);
        assert_eq!(names, "ANY 2 (node-b, node-c)");

        // Next heartbeat puts the primary through apply-settings
        assert_eq!(beat(&orch, a, Role::Primary, 0x2000, "").await, Role::ApplySettings);
        assert_eq!(beat(&orch, a, Role::ApplySettings, 0x2000, "").await, Role::Primary);
    }

    #[tokio::test]
    async fn test_group_settings_bound_check() {
        let orch = orchestrator();
        let (_a, _b) = settle_two_nodes(&orch).await;
        // Two nodes total: only one possible quorum standby
        let err = orch.set_group_settings("default", 2).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSetting(_)));
    }

    #[tokio::test]
    async fn test_drop_node_updates_group() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        orch.remove_node(b).await.unwrap();
        // The keeper of b sees dropped, confirms, and is forgotten
        assert_eq!(beat(&orch, b, Role::Secondary, 0x1000, "").await, Role::Dropped);
        assert_eq!(beat(&orch, b, Role::Dropped, 0x1000, "").await, Role::Dropped);
        assert!(orch.store().get_node(b).await.unwrap().is_none());

        // Primary relaxes now that the group holds just one node
        assert_eq!(beat(&orch, a, Role::Primary, 0x1000, "").await, Role::WaitPrimary);
        assert_eq!(beat(&orch, a, Role::WaitPrimary, 0x1000, "").await, Role::Single);
    }

    #[tokio::test]
    async fn test_maintenance_cycle() {
        let orch = orchestrator();
        let (_a, b) = settle_two_nodes(&orch).await;

        orch.start_maintenance(b).await.unwrap();
        assert_eq!(beat(&orch, b, Role::Secondary, 0x1000, "").await, Role::Maintenance);
        assert_eq!(beat(&orch, b, Role::Maintenance, 0x1000, "").await, Role::Maintenance);

        orch.stop_maintenance(b).await.unwrap();
        assert_eq!(beat(&orch, b, Role::Maintenance, 0x1000, "").await, Role::Catchingup);
        assert_eq!(beat(&orch, b, Role::Catchingup, 0x1000, "").await, Role::Secondary);
    }

    #[tokio::test]
    async fn test_maintenance_refused_for_primary() {
        let orch = orchestrator();
        let (a, _b) = settle_two_nodes(&orch).await;
        assert!(orch.start_maintenance(a).await.is_err());
    }

    #[tokio::test]
    async fn test_get_primary_and_other_nodes() {
        let orch = orchestrator();
        let (a, b) = settle_two_nodes(&orch).await;

        let primary = orch.get_primary("default", 0).await.unwrap().unwrap();
        assert_eq!(primary.node_id, a);

        let peers = orch.get_other_nodes(a, None).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].node_id, b);

        let secondaries = orch.get_other_nodes(a, Some(Role::Secondary)).await.unwrap();
        assert_eq!(secondaries.len(), 1);
    }

    #[tokio::test]
    async fn test_sync_names_empty_for_async_formation() {
        let orch = orchestrator();
        let (_a, _b) = settle_two_nodes(&orch).await;
        orch.set_group_settings("default", 0).await.unwrap();

        let formation = orch.store().get_formation("default").await.unwrap().unwrap();
        let nodes = orch.store().group_nodes("default", 0).await.unwrap();
        assert_eq!(
            orch.compute_sync_standby_names(&formation, &nodes),
            Some(String::new())
        );
    }

    #[tokio::test]
    async fn test_sync_names_refused_without_quorum_standby() {
        let orch = orchestrator();
        let (_a, b) = settle_two_nodes(&orch).await;

        // The only standby opts out of the quorum: with k=1 the monitor must
        // not produce a setting that allows unreplicated commits
        orch.store().set_node_settings(b, None, Some(false)).await.unwrap();
        let formation = orch.store().get_formation("default").await.unwrap().unwrap();
        let nodes = orch.store().group_nodes("default", 0).await.unwrap();
        assert_eq!(orch.compute_sync_standby_names(&formation, &nodes), None);
    }
}
