//! Invariants every reachable store state satisfies.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use sadb_core::{FrameType, Gvcid, SaId, SaState, SecurityAssociation};

/// A broken invariant, with the records involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two SAs operational on one channel.
    SharedChannel {
        /// Partition.
        frame_type: FrameType,
        /// Channel.
        gvcid: Gvcid,
        /// Operational SAs found on it.
        operational: Vec<SaId>,
    },
    /// Key references on an SA whose state forbids them.
    StrayKeys {
        /// Partition.
        frame_type: FrameType,
        /// Offending SA.
        id: SaId,
        /// Its state.
        state: SaState,
    },
    /// Identifier stored twice in one partition.
    DuplicateId {
        /// Partition.
        frame_type: FrameType,
        /// Repeated identifier.
        id: SaId,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedChannel { frame_type, gvcid, operational } => {
                write!(f, "{frame_type} channel {gvcid} has operational SAs {operational:?}")
            },
            Self::StrayKeys { frame_type, id, state } => {
                write!(f, "{frame_type} SA {id} holds key references while {state}")
            },
            Self::DuplicateId { frame_type, id } => write!(f, "{frame_type} SA {id} stored twice"),
        }
    }
}

/// Check every invariant over a full store snapshot.
pub fn check_invariants(records: &[SecurityAssociation]) -> Result<(), InvariantViolation> {
    let mut ids = HashSet::new();
    let mut channels: HashMap<(FrameType, Gvcid), Vec<SaId>> = HashMap::new();

    for sa in records {
        if !ids.insert((sa.frame_type, sa.id)) {
            return Err(InvariantViolation::DuplicateId { frame_type: sa.frame_type, id: sa.id });
        }

        let keyed = sa.ekid.is_some() || sa.akid.is_some();
        if keyed && matches!(sa.state, SaState::Unkeyed | SaState::Expired) {
            return Err(InvariantViolation::StrayKeys {
                frame_type: sa.frame_type,
                id: sa.id,
                state: sa.state,
            });
        }

        if sa.is_operational() {
            channels.entry((sa.frame_type, sa.gvcid())).or_default().push(sa.id);
        }
    }

    match channels.into_iter().find(|(_, operational)| operational.len() > 1) {
        Some(((frame_type, gvcid), operational)) => {
            Err(InvariantViolation::SharedChannel { frame_type, gvcid, operational })
        },
        None => Ok(()),
    }
}
