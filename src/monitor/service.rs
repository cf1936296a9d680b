//! Monitor Service
//!
//! Maps protocol messages onto orchestrator calls. One request in, exactly
//! one response out; monitor-side failures come back as protocol errors so
//! keepers can classify them without string matching.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::Error;
use crate::monitor::orchestrator::Orchestrator;
use crate::net::server::RequestHandler;
use crate::protocol::{ErrorCode, Message};

/// Protocol front-end over the orchestrator
pub struct MonitorService {
    orchestrator: Arc<Orchestrator>,
}

impl MonitorService {
    /// Create a new service
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Build the request handler closure for the protocol server
    pub fn into_handler(self: Arc<Self>) -> RequestHandler {
        Arc::new(move |peer, message| {
            let service = Arc::clone(&self);
            let fut: BoxFuture<'static, Message> =
                Box::pin(async move { service.handle(peer, message).await });
            fut
        })
    }

    /// Handle one request
    pub async fn handle(&self, peer: String, message: Message) -> Message {
        let name = message.type_name();
        match self.dispatch(message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("{} from {} failed: {}", name, peer, e);
                Message::Error {
                    code: error_code(&e),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn dispatch(&self, message: Message) -> crate::Result<Message> {
        match message {
            Message::Register {
                formation,
                group,
                name,
                host,
                port,
                dbname,
                candidate_priority,
                replication_quorum,
                system_identifier,
                desired_role,
            } => {
                if let Some(role) = desired_role {
                    tracing::debug!("node {} registers while in {}", name, role);
                }
                let (node_id, group_id, assigned_role) = self
                    .orchestrator
                    .register(
                        &formation,
                        group,
                        &name,
                        &host,
                        port,
                        &dbname,
                        candidate_priority,
                        replication_quorum,
                    )
                    .await?;
                if let Some(ident) = system_identifier {
                    self.orchestrator
                        .store()
                        .set_system_identifier(node_id, ident)
                        .await?;
                }
                Ok(Message::Registered {
                    node_id,
                    group_id,
                    assigned_role,
                })
            }

            Message::NodeActive {
                node_id,
                group_id,
                current_role,
                pg_is_running,
                current_lsn,
                sync_state,
            } => {
                let assigned_role = self
                    .orchestrator
                    .node_active(
                        node_id,
                        group_id,
                        current_role,
                        pg_is_running,
                        current_lsn,
                        &sync_state,
                    )
                    .await?;
                Ok(Message::Assignment {
                    node_id,
                    group_id,
                    assigned_role,
                })
            }

            Message::SetSystemIdentifier {
                node_id,
                system_identifier,
            } => {
                self.orchestrator
                    .store()
                    .set_system_identifier(node_id, system_identifier)
                    .await?;
                Ok(Message::Ack)
            }

            Message::GetPrimary { formation, group } => {
                let node = self.orchestrator.get_primary(&formation, group).await?;
                Ok(Message::PrimaryNode { node })
            }

            Message::GetOtherNodes {
                node_id,
                role_filter,
            } => {
                let nodes = self.orchestrator.get_other_nodes(node_id, role_filter).await?;
                Ok(Message::OtherNodes { nodes })
            }

            Message::GetSettings { node_id } => {
                let (number_sync_standbys, synchronous_standby_names) =
                    self.orchestrator.get_settings(node_id).await?;
                Ok(Message::Settings {
                    number_sync_standbys,
                    synchronous_standby_names,
                })
            }

            Message::SetGroupSettings {
                formation,
                number_sync_standbys,
            } => {
                self.orchestrator
                    .set_group_settings(&formation, number_sync_standbys)
                    .await?;
                Ok(Message::Ack)
            }

            Message::SetNodeSettings {
                node_id,
                candidate_priority,
                replication_quorum,
            } => {
                self.orchestrator
                    .set_node_settings(node_id, candidate_priority, replication_quorum)
                    .await?;
                Ok(Message::Ack)
            }

            Message::RemoveNode { node_id } => {
                self.orchestrator.remove_node(node_id).await?;
                Ok(Message::Ack)
            }

            Message::StartMaintenance { node_id } => {
                self.orchestrator.start_maintenance(node_id).await?;
                Ok(Message::Ack)
            }

            Message::StopMaintenance { node_id } => {
                self.orchestrator.stop_maintenance(node_id).await?;
                Ok(Message::Ack)
            }

            Message::PerformFailover { formation, group } => {
                self.orchestrator.perform_failover(&formation, group).await?;
                Ok(Message::Ack)
            }

            Message::CurrentState { formation } => {
                let nodes = self.orchestrator.current_state(formation.as_deref()).await?;
                Ok(Message::State { nodes })
            }

            other => Err(Error::Protocol(format!(
                "unexpected request: {}",
                other.type_name()
            ))),
        }
    }
}

/// Classify a monitor-side error for the wire
fn error_code(e: &Error) -> ErrorCode {
    match e {
        Error::NodeNotFound(_) => ErrorCode::UnknownNode,
        Error::NameCollision(_) => ErrorCode::NameCollision,
        Error::GroupFull { .. } => ErrorCode::GroupFull,
        Error::InvalidSetting(_) => ErrorCode::InvalidSetting,
        Error::IllegalTransition { .. } | Error::UnknownRole(_) => ErrorCode::FsmViolation,
        Error::SystemIdentifierMismatch { .. } => ErrorCode::FsmViolation,
        Error::StaleGroup { .. } => ErrorCode::StaleGroup,
        _ => ErrorCode::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Role;
    use crate::monitor::orchestrator::OrchestratorConfig;
    use crate::monitor::store::MonitorStore;
    use crate::pg::Lsn;

    fn service() -> Arc<MonitorService> {
        let store = Arc::new(MonitorStore::in_memory().unwrap());
        let orch = Arc::new(Orchestrator::new(store, OrchestratorConfig::default()));
        Arc::new(MonitorService::new(orch))
    }

    fn register_msg(name: &str, host: &str) -> Message {
        Message::Register {
            formation: "default".into(),
            group: None,
            name: name.into(),
            host: host.into(),
            port: 5432,
            dbname: "app".into(),
            candidate_priority: 50,
            replication_quorum: true,
            system_identifier: None,
            desired_role: Some(Role::Init),
        }
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let service = service();

        let response = service
            .handle("test".into(), register_msg("node-a", "10.0.0.1"))
            .await;
        let Message::Registered {
            node_id,
            group_id,
            assigned_role,
        } = response
        else {
            panic!("expected Registered, got {}", response.type_name());
        };
        assert_eq!(group_id, 0);
        assert_eq!(assigned_role, Role::Single);

        let response = service
            .handle(
                "test".into(),
                Message::NodeActive {
                    node_id,
                    group_id,
                    current_role: Role::Init,
                    pg_is_running: false,
                    current_lsn: Lsn::ZERO,
                    sync_state: String::new(),
                },
            )
            .await;
        let Message::Assignment { assigned_role, .. } = response else {
            panic!("expected Assignment, got {}", response.type_name());
        };
        assert_eq!(assigned_role, Role::Single);
    }

    #[tokio::test]
    async fn test_unknown_node_error_code() {
        let service = service();
        let response = service
            .handle(
                "test".into(),
                Message::NodeActive {
                    node_id: 404,
                    group_id: 0,
                    current_role: Role::Single,
                    pg_is_running: true,
                    current_lsn: Lsn::ZERO,
                    sync_state: String::new(),
                },
            )
            .await;
        let Message::Error { code, .. } = response else {
            panic!("expected Error, got {}", response.type_name());
        };
        assert_eq!(code, ErrorCode::UnknownNode);
    }

    #[tokio::test]
    async fn test_repeated_heartbeat_is_idempotent() {
        let service = service();
        let Message::Registered { node_id, .. } = service
            .handle("test".into(), register_msg("node-a", "10.0.0.1"))
            .await
        else {
            panic!("registration failed");
        };

        let heartbeat = Message::NodeActive {
            node_id,
            group_id: 0,
            current_role: Role::Single,
            pg_is_running: true,
            current_lsn: Lsn(0x1000),
            sync_state: String::new(),
        };
        let first = service.handle("test".into(), heartbeat.clone()).await;
        let second = service.handle("test".into(), heartbeat).await;
        match (first, second) {
            (
                Message::Assignment { assigned_role: a, .. },
                Message::Assignment { assigned_role: b, .. },
            ) => assert_eq!(a, b),
            _ => panic!("expected two assignments"),
        }
    }
}
