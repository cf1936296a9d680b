//! Node Roles
//!
//! The closed set of states a node can be in, used for both the role a
//! keeper reports (`current`) and the goal the monitor assigns (`assigned`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Role of a node within its group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Freshly registered, nothing decided yet
    Init,
    /// Sole node of its group, writable, no replication
    Single,
    /// Promoted (or promotable) primary still waiting for a standby
    WaitPrimary,
    /// Writable primary with synchronous replication in place
    Primary,
    /// Primary accepting a new standby (HBA opened, slot created)
    JoinPrimary,
    /// Registered standby waiting for the primary to authorize it
    WaitStandby,
    /// Standby rebuilding or replaying to catch up with its upstream
    Catchingup,
    /// Healthy hot standby
    Secondary,
    /// Failover winner verifying it holds all reachable WAL
    PreparePromotion,
    /// Failover winner cut off from the old primary, about to promote
    StopReplication,
    /// Unreachable primary being demoted without its acknowledgment
    DemoteTimeout,
    /// Former primary, PostgreSQL stopped, not yet rejoined
    Demoted,
    /// Primary draining connections ahead of a planned demotion
    Draining,
    /// Operator-requested pause, excluded from elections
    Maintenance,
    /// Standby publishing its last received LSN for an election
    ReportLsn,
    /// Election winner replaying WAL from a more advanced standby
    FastForward,
    /// Node rewriting its replication settings on monitor demand
    ApplySettings,
    /// Election loser re-pointing replication at the new primary
    JoinSecondary,
    /// Terminal state, node removed from its group
    Dropped,
}

impl Role {
    /// Roles in which a node accepts writes (or is about to)
    pub fn is_writable(&self) -> bool {
        matches!(self, Role::Single | Role::WaitPrimary | Role::Primary)
    }

    /// Roles that hold the primary position in a group
    pub fn is_primary_side(&self) -> bool {
        matches!(
            self,
            Role::Single
                | Role::WaitPrimary
                | Role::Primary
                | Role::JoinPrimary
                | Role::ApplySettings
        )
    }

    /// Roles in which the node runs as a hot standby
    pub fn is_standby_side(&self) -> bool {
        matches!(
            self,
            Role::WaitStandby
                | Role::Catchingup
                | Role::Secondary
                | Role::ReportLsn
                | Role::FastForward
                | Role::JoinSecondary
        )
    }

    /// Roles a failover election may consider as candidates
    pub fn is_electable(&self) -> bool {
        matches!(self, Role::Secondary | Role::ReportLsn | Role::Catchingup)
    }

    /// Roles that take part in an in-flight failover
    pub fn is_in_failover(&self) -> bool {
        matches!(
            self,
            Role::ReportLsn
                | Role::FastForward
                | Role::PreparePromotion
                | Role::StopReplication
                | Role::DemoteTimeout
                | Role::Draining
        )
    }

    /// All roles, in declaration order
    pub fn all() -> &'static [Role] {
        &[
            Role::Init,
            Role::Single,
            Role::WaitPrimary,
            Role::Primary,
            Role::JoinPrimary,
            Role::WaitStandby,
            Role::Catchingup,
            Role::Secondary,
            Role::PreparePromotion,
            Role::StopReplication,
            Role::DemoteTimeout,
            Role::Demoted,
            Role::Draining,
            Role::Maintenance,
            Role::ReportLsn,
            Role::FastForward,
            Role::ApplySettings,
            Role::JoinSecondary,
            Role::Dropped,
        ]
    }

    /// Canonical text form, as exchanged with the monitor
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Init => "init",
            Role::Single => "single",
            Role::WaitPrimary => "wait-primary",
            Role::Primary => "primary",
            Role::JoinPrimary => "join-primary",
            Role::WaitStandby => "wait-standby",
            Role::Catchingup => "catchingup",
            Role::Secondary => "secondary",
            Role::PreparePromotion => "prepare-promotion",
            Role::StopReplication => "stop-replication",
            Role::DemoteTimeout => "demote-timeout",
            Role::Demoted => "demoted",
            Role::Draining => "draining",
            Role::Maintenance => "maintenance",
            Role::ReportLsn => "report-lsn",
            Role::FastForward => "fast-forward",
            Role::ApplySettings => "apply-settings",
            Role::JoinSecondary => "join-secondary",
            Role::Dropped => "dropped",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::all()
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| Error::UnknownRole(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_roles() {
        for role in Role::all() {
            let parsed: Role = role.as_str().parse().unwrap();
            assert_eq!(parsed, *role);
        }
    }

    #[test]
    fn test_unknown_role_is_protocol_error() {
        let err = "galaxy-brain".parse::<Role>().unwrap_err();
        assert!(matches!(err, Error::UnknownRole(_)));
    }

    #[test]
    fn test_writable_set() {
        let writable: Vec<_> = Role::all().iter().filter(|r| r.is_writable()).collect();
        assert_eq!(
            writable,
            vec![&Role::Single, &Role::WaitPrimary, &Role::Primary]
        );
    }
}
