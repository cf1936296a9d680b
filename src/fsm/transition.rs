//! Transition Table
//!
//! The legal `(current, assigned)` pairs and the keeper procedure each one
//! maps to. The table is plain data: the monitor consults it to validate
//! assignments and the keeper dispatches on the [`TransitionKind`] it finds
//! here, so the legal set is enumerable and testable in one place.

use super::role::Role;

/// Keeper-side procedure executed for a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransitionKind {
    /// Nothing to do locally, wait for the monitor to advance the group
    Wait,
    /// initdb, create control objects, start as a writable single node
    InitAsSingle,
    /// Open HBA and create the slot for the standby expected to join
    OpenForStandby,
    /// Base-backup (or reuse PGDATA) and start as a standby of the upstream
    InitAsStandby,
    /// Verify timeline and system identifier, create peer slots, settle
    ConfirmSecondary,
    /// Accept one more standby on a running primary
    JoinPrimary,
    /// Turn synchronous replication on now that a standby caught up
    EnableSyncRep,
    /// Relax synchronous replication after losing quorum standbys
    DisableSyncRep,
    /// Fetch and apply the monitor's replication settings
    ApplySettings,
    /// Settle back into primary once settings are in effect
    ConfirmPrimary,
    /// Settle back into single after the last standby left
    ConfirmSingle,
    /// Wait for the WAL receiver to drain before promotion
    PreparePromotion,
    /// Disconnect from the old primary and gate writes read-only
    StopReplication,
    /// Promote, clear the read-only gate, drop the deposed primary's slot
    Promote,
    /// Block new writes ahead of a planned demotion
    Drain,
    /// Set the read-only gate and stop PostgreSQL
    Demote,
    /// pg_rewind against the new primary, base-backup on refusal
    RewindOrRebuild,
    /// Detach from the upstream and publish the local LSN
    ReportLsn,
    /// Replay WAL from the most advanced standby up to the election target
    FastForward,
    /// Re-point replication at the newly promoted primary
    JoinSecondary,
    /// Stop PostgreSQL for an operator-requested pause
    StartMaintenance,
    /// Stop PostgreSQL, remove local bookkeeping, exit cleanly
    DropNode,
}

/// One legal arc of the state machine
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub from: Role,
    pub to: Role,
    pub kind: TransitionKind,
}

const fn rule(from: Role, to: Role, kind: TransitionKind) -> TransitionRule {
    TransitionRule { from, to, kind }
}

/// Every legal transition except `* -> dropped`, which is always legal
pub static TRANSITION_TABLE: &[TransitionRule] = &[
    rule(Role::Init, Role::Single, TransitionKind::InitAsSingle),
    rule(Role::Init, Role::WaitStandby, TransitionKind::Wait),
    rule(Role::WaitStandby, Role::Catchingup, TransitionKind::InitAsStandby),
    rule(Role::Catchingup, Role::Secondary, TransitionKind::ConfirmSecondary),
    rule(Role::Secondary, Role::Catchingup, TransitionKind::InitAsStandby),
    rule(Role::Secondary, Role::PreparePromotion, TransitionKind::PreparePromotion),
    rule(Role::Secondary, Role::ReportLsn, TransitionKind::ReportLsn),
    rule(Role::Secondary, Role::Maintenance, TransitionKind::StartMaintenance),
    rule(Role::Maintenance, Role::Catchingup, TransitionKind::InitAsStandby),
    rule(Role::ReportLsn, Role::PreparePromotion, TransitionKind::PreparePromotion),
    rule(Role::ReportLsn, Role::FastForward, TransitionKind::FastForward),
    rule(Role::ReportLsn, Role::JoinSecondary, TransitionKind::JoinSecondary),
    rule(Role::ReportLsn, Role::Secondary, TransitionKind::ConfirmSecondary),
    rule(Role::FastForward, Role::PreparePromotion, TransitionKind::PreparePromotion),
    rule(Role::JoinSecondary, Role::Secondary, TransitionKind::ConfirmSecondary),
    rule(Role::PreparePromotion, Role::StopReplication, TransitionKind::StopReplication),
    rule(Role::StopReplication, Role::WaitPrimary, TransitionKind::Promote),
    rule(Role::Single, Role::WaitPrimary, TransitionKind::OpenForStandby),
    rule(Role::WaitPrimary, Role::Primary, TransitionKind::EnableSyncRep),
    rule(Role::WaitPrimary, Role::JoinPrimary, TransitionKind::JoinPrimary),
    rule(Role::WaitPrimary, Role::Single, TransitionKind::ConfirmSingle),
    rule(Role::WaitPrimary, Role::Draining, TransitionKind::Drain),
    rule(Role::Primary, Role::JoinPrimary, TransitionKind::JoinPrimary),
    rule(Role::Primary, Role::WaitPrimary, TransitionKind::DisableSyncRep),
    rule(Role::Primary, Role::ApplySettings, TransitionKind::ApplySettings),
    rule(Role::Primary, Role::Draining, TransitionKind::Drain),
    rule(Role::Primary, Role::Demoted, TransitionKind::Demote),
    rule(Role::Primary, Role::DemoteTimeout, TransitionKind::Demote),
    rule(Role::JoinPrimary, Role::Primary, TransitionKind::EnableSyncRep),
    rule(Role::JoinPrimary, Role::WaitPrimary, TransitionKind::DisableSyncRep),
    rule(Role::ApplySettings, Role::Primary, TransitionKind::ConfirmPrimary),
    rule(Role::Draining, Role::Demoted, TransitionKind::Demote),
    rule(Role::DemoteTimeout, Role::Demoted, TransitionKind::Demote),
    rule(Role::Demoted, Role::Catchingup, TransitionKind::RewindOrRebuild),
];

/// Find the procedure for a `(current, assigned)` pair, if the pair is legal
pub fn lookup(from: Role, to: Role) -> Option<TransitionKind> {
    if to == Role::Dropped {
        // Operator drop is honored from any state
        return Some(TransitionKind::DropNode);
    }
    TRANSITION_TABLE
        .iter()
        .find(|r| r.from == from && r.to == to)
        .map(|r| r.kind)
}

/// All goal roles legally assignable from a given current role
pub fn legal_transitions_from(from: Role) -> Vec<Role> {
    let mut targets: Vec<Role> = TRANSITION_TABLE
        .iter()
        .filter(|r| r.from == from)
        .map(|r| r.to)
        .collect();
    targets.push(Role::Dropped);
    targets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failover_path_is_legal() {
        // The path a winning standby walks during failover
        let path = [
            (Role::Secondary, Role::ReportLsn),
            (Role::ReportLsn, Role::PreparePromotion),
            (Role::PreparePromotion, Role::StopReplication),
            (Role::StopReplication, Role::WaitPrimary),
            (Role::WaitPrimary, Role::Primary),
        ];
        for (from, to) in path {
            assert!(lookup(from, to).is_some(), "{from} -> {to} must be legal");
        }
    }

    #[test]
    fn test_fast_forward_path_is_legal() {
        assert_eq!(
            lookup(Role::ReportLsn, Role::FastForward),
            Some(TransitionKind::FastForward)
        );
        assert_eq!(
            lookup(Role::FastForward, Role::PreparePromotion),
            Some(TransitionKind::PreparePromotion)
        );
    }

    #[test]
    fn test_demoted_primary_rejoins_through_rewind() {
        assert_eq!(lookup(Role::Primary, Role::Demoted), Some(TransitionKind::Demote));
        assert_eq!(
            lookup(Role::Demoted, Role::Catchingup),
            Some(TransitionKind::RewindOrRebuild)
        );
        assert_eq!(
            lookup(Role::Catchingup, Role::Secondary),
            Some(TransitionKind::ConfirmSecondary)
        );
    }

    #[test]
    fn test_illegal_jumps_are_rejected() {
        assert!(lookup(Role::Secondary, Role::Primary).is_none());
        assert!(lookup(Role::Init, Role::Primary).is_none());
        assert!(lookup(Role::Demoted, Role::WaitPrimary).is_none());
        assert!(lookup(Role::Maintenance, Role::PreparePromotion).is_none());
    }

    #[test]
    fn test_drop_is_legal_from_every_role() {
        for role in Role::all() {
            assert_eq!(lookup(*role, Role::Dropped), Some(TransitionKind::DropNode));
        }
    }

    #[test]
    fn test_no_duplicate_arcs() {
        for (i, a) in TRANSITION_TABLE.iter().enumerate() {
            for b in &TRANSITION_TABLE[i + 1..] {
                assert!(
                    !(a.from == b.from && a.to == b.to),
                    "duplicate arc {} -> {}",
                    a.from,
                    a.to
                );
            }
        }
    }
}
