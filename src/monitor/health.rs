//! Health Scanner
//!
//! Periodic liveness pass over all registered nodes. Marks a node's health
//! bad once it missed enough heartbeats and its last contact is older than
//! the failover timeout, then re-runs goal-state computation for the
//! affected groups so failover detection does not have to wait for another
//! keeper heartbeat.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;

use crate::error::Result;
use crate::monitor::orchestrator::Orchestrator;
use crate::protocol::Health;

/// Scanner configuration
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Pass interval
    pub interval: Duration,
    /// Missed heartbeats tolerated before health flips to bad
    pub max_retries: u32,
    /// Primary silence that arms failover
    pub failover_timeout: chrono::Duration,
}

/// Periodic health scanner
pub struct HealthScanner {
    orchestrator: Arc<Orchestrator>,
    config: HealthConfig,
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl HealthScanner {
    /// Create a new scanner
    pub fn new(orchestrator: Arc<Orchestrator>, config: HealthConfig) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            orchestrator,
            config,
            shutdown: shutdown_tx,
        }
    }

    /// Run until stopped
    pub async fn start(&self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        tracing::error!("health scan failed: {}", e);
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop the scanner
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// One pass: update health marks, then orchestrate touched groups
    pub async fn scan_once(&self) -> Result<()> {
        let store = self.orchestrator.store();
        let nodes = store.all_nodes(None).await?;
        let now = Utc::now();

        // A node is unhealthy once it missed max_retries scan intervals
        // and has been silent past the failover timeout
        let missed_window = chrono::Duration::from_std(
            self.config.interval * (self.config.max_retries + 1),
        )
        .unwrap_or(self.config.failover_timeout);

        let mut touched: Vec<(String, i32)> = Vec::new();
        for node in &nodes {
            let stale =
                !node.is_fresh(missed_window, now) && !node.is_fresh(self.config.failover_timeout, now);
            let new_health = if stale { Health::Bad } else { Health::Good };
            if node.health != new_health && node.last_seen_at.is_some() {
                tracing::info!(
                    "node {} ({}) health {} -> {}",
                    node.node_id,
                    node.name,
                    node.health,
                    new_health
                );
                store.set_health(node.node_id, new_health).await?;
                touched.push((node.formation.clone(), node.group_id));
            }
        }

        touched.sort();
        touched.dedup();

        // Unhealthy groups need goal-state recomputation right away; the
        // others converge on their own heartbeats
        let passes = touched
            .iter()
            .map(|(formation, group)| self.orchestrator.orchestrate(formation, *group));
        for result in join_all(passes).await {
            if let Err(e) = result {
                tracing::error!("orchestration pass failed: {}", e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Role;
    use crate::monitor::orchestrator::OrchestratorConfig;
    use crate::monitor::store::MonitorStore;
    use crate::pg::Lsn;

    #[tokio::test]
    async fn test_scan_marks_silent_nodes_bad() {
        let store = Arc::new(MonitorStore::in_memory().unwrap());
        let orch = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            OrchestratorConfig::default(),
        ));
        store.ensure_formation("default", "app").await.unwrap();
        let a = store
            .create_node("default", 0, "node-a", "10.0.0.1", 5432, 50, true, Role::Single)
            .await
            .unwrap();
        store
            .update_reported_state(a, Role::Single, true, Lsn(0x1000), "")
            .await
            .unwrap();
        store
            .set_last_seen(a, Utc::now() - chrono::Duration::seconds(120))
            .await
            .unwrap();

        let scanner = HealthScanner::new(
            orch,
            HealthConfig {
                interval: Duration::from_secs(5),
                max_retries: 2,
                failover_timeout: chrono::Duration::seconds(20),
            },
        );
        scanner.scan_once().await.unwrap();

        let node = store.get_node(a).await.unwrap().unwrap();
        assert_eq!(node.health, Health::Bad);
    }

    #[tokio::test]
    async fn test_scan_leaves_fresh_nodes_good() {
        let store = Arc::new(MonitorStore::in_memory().unwrap());
        let orch = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            OrchestratorConfig::default(),
        ));
        store.ensure_formation("default", "app").await.unwrap();
        let a = store
            .create_node("default", 0, "node-a", "10.0.0.1", 5432, 50, true, Role::Single)
            .await
            .unwrap();
        store
            .update_reported_state(a, Role::Single, true, Lsn(0x1000), "")
            .await
            .unwrap();

        let scanner = HealthScanner::new(
            orch,
            HealthConfig {
                interval: Duration::from_secs(5),
                max_retries: 2,
                failover_timeout: chrono::Duration::seconds(20),
            },
        );
        scanner.scan_once().await.unwrap();

        let node = store.get_node(a).await.unwrap().unwrap();
        assert_eq!(node.health, Health::Good);
    }
}
