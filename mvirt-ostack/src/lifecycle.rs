//! Lifecycle state machine.
//!
//! ```text
//! CREATION_SCHEDULED -> CREATING -> OK
//! OK -> UPDATING -> OK
//! OK | ERRED -> DELETION_SCHEDULED -> DELETING -> DELETED
//! any active state -> ERRED
//! ERRED -> OK                       (operator recovery only)
//! ```
//!
//! The table below is consulted by the store inside the same transaction
//! that performs the compare-and-set update, so it is the only place a
//! record's state can change.

use crate::model::ResourceState;
use crate::model::ResourceState::*;

/// Named transitions driven by executors, the reconciler and operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BeginCreate,
    CreateSucceeded,
    BeginUpdate,
    UpdateSucceeded,
    ScheduleDeletion,
    BeginDelete,
    DeleteSucceeded,
    Fail,
    Recover,
    /// Update withdrawn before it was dispatched.
    AbandonUpdate,
}

impl Transition {
    pub fn target(&self) -> ResourceState {
        match self {
            Transition::BeginCreate => Creating,
            Transition::CreateSucceeded => Ok,
            Transition::BeginUpdate => Updating,
            Transition::UpdateSucceeded => Ok,
            Transition::ScheduleDeletion => DeletionScheduled,
            Transition::BeginDelete => Deleting,
            Transition::DeleteSucceeded => Deleted,
            Transition::Fail => Erred,
            Transition::Recover => Ok,
            Transition::AbandonUpdate => Ok,
        }
    }

    pub fn sources(&self) -> &'static [ResourceState] {
        match self {
            Transition::BeginCreate => &[CreationScheduled],
            Transition::CreateSucceeded => &[Creating],
            Transition::BeginUpdate => &[Ok],
            Transition::UpdateSucceeded | Transition::AbandonUpdate => &[Updating],
            Transition::ScheduleDeletion => &[Ok, Erred],
            Transition::BeginDelete => &[DeletionScheduled],
            Transition::DeleteSucceeded => &[Deleting],
            Transition::Fail => &[
                CreationScheduled,
                Creating,
                Ok,
                Updating,
                DeletionScheduled,
                Deleting,
            ],
            Transition::Recover => &[Erred],
        }
    }

    pub fn allows(&self, from: ResourceState) -> bool {
        self.sources().contains(&from)
    }
}

const TRANSITIONS: [Transition; 10] = [
    Transition::BeginCreate,
    Transition::CreateSucceeded,
    Transition::BeginUpdate,
    Transition::UpdateSucceeded,
    Transition::ScheduleDeletion,
    Transition::BeginDelete,
    Transition::DeleteSucceeded,
    Transition::Fail,
    Transition::Recover,
    Transition::AbandonUpdate,
];

/// Whether `from -> to` is a documented edge.
pub fn is_legal(from: ResourceState, to: ResourceState) -> bool {
    TRANSITIONS
        .iter()
        .any(|t| t.target() == to && t.allows(from))
}

/// Whether a record in `state` may carry a backend id.
///
/// A scheduled create never has one, OK and UPDATING always do.
pub fn backend_id_consistent(state: ResourceState, has_backend_id: bool) -> bool {
    match state {
        CreationScheduled => !has_backend_id,
        Ok | Updating => has_backend_id,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn legal_pairs() -> HashSet<(ResourceState, ResourceState)> {
        let mut pairs = HashSet::new();
        pairs.insert((CreationScheduled, Creating));
        pairs.insert((Creating, Ok));
        pairs.insert((Ok, Updating));
        pairs.insert((Updating, Ok));
        pairs.insert((Ok, DeletionScheduled));
        pairs.insert((Erred, DeletionScheduled));
        pairs.insert((DeletionScheduled, Deleting));
        pairs.insert((Deleting, Deleted));
        for from in [
            CreationScheduled,
            Creating,
            Ok,
            Updating,
            DeletionScheduled,
            Deleting,
        ] {
            pairs.insert((from, Erred));
        }
        pairs.insert((Erred, Ok));
        pairs
    }

    #[test]
    fn test_guard_matrix() {
        let legal = legal_pairs();
        for from in ResourceState::ALL {
            for to in ResourceState::ALL {
                assert_eq!(
                    is_legal(from, to),
                    legal.contains(&(from, to)),
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_full_lifecycle_sequence() {
        let sequence = [
            CreationScheduled,
            Creating,
            Ok,
            Updating,
            Ok,
            DeletionScheduled,
            Deleting,
            Deleted,
        ];
        for pair in sequence.windows(2) {
            assert!(is_legal(pair[0], pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_erred_can_be_deleted_but_not_updated() {
        assert!(is_legal(Erred, DeletionScheduled));
        assert!(!is_legal(Erred, Updating));
        assert!(!is_legal(Erred, Deleting));
        assert!(!is_legal(Erred, Erred));
    }

    #[test]
    fn test_deleted_is_terminal() {
        for to in ResourceState::ALL {
            assert!(!is_legal(Deleted, to));
        }
    }

    #[test]
    fn test_backend_id_consistency() {
        assert!(!backend_id_consistent(CreationScheduled, true));
        assert!(backend_id_consistent(CreationScheduled, false));
        assert!(backend_id_consistent(Creating, false));
        assert!(backend_id_consistent(Creating, true));
        assert!(!backend_id_consistent(Ok, false));
        assert!(!backend_id_consistent(Updating, false));
        assert!(backend_id_consistent(Deleting, false));
        assert!(backend_id_consistent(Erred, false));
    }
}
