//! One operational SA per channel.
//!
//! Before an SA is started, every other operational SA on the same
//! `(scid, tfvn, vcid, mapid)` tuple in the partition is a rival. Without
//! `force` a rival blocks the start. With `force` the rivals are stopped in
//! the same transaction that starts the target, so no reader ever observes two
//! operational SAs on one channel, nor a channel left empty by a failed start.

use tracing::warn;

use crate::{
    error::{ConflictError, SadbError},
    lifecycle::{Lifecycle, Transition},
    sa::{SaState, SecurityAssociation},
    store::{Predicate, Session},
};

/// Operational SAs sharing `target`'s channel, excluding `target` itself.
pub fn rivals<S: Session>(
    session: &S,
    target: &SecurityAssociation,
) -> Result<Vec<SecurityAssociation>, SadbError> {
    let predicate = Predicate::Channel(target.gvcid())
        .and(Predicate::Spi(target.id.spi).negate())
        .and(Predicate::State(SaState::Operational));

    session
        .query(target.frame_type, &predicate)
        .map_err(|e| SadbError::backend_on("start", target.frame_type, target.id, e))
}

/// Clear `target`'s channel so it may become operational.
///
/// Returns the SAs that were stopped to make room. Those are merged into the
/// session but not committed; the caller commits them together with the start.
///
/// # Errors
/// - `ConflictError::Operational` when a rival exists and `force` is false.
///   Nothing is written in that case.
/// - `SadbError::Backend` on store failure
pub fn clear_channel<S: Session>(
    session: &mut S,
    lifecycle: &Lifecycle,
    target: &SecurityAssociation,
    force: bool,
) -> Result<Vec<SecurityAssociation>, SadbError> {
    let rivals = rivals(session, target)?;

    if !force {
        if let Some(blocking) = rivals.first() {
            return Err(ConflictError::Operational {
                frame_type: target.frame_type,
                requested: target.id,
                blocking: blocking.id,
                gvcid: target.gvcid(),
            }
            .into());
        }
        return Ok(Vec::new());
    }

    let mut stopped = Vec::with_capacity(rivals.len());
    for mut rival in rivals {
        lifecycle.apply(&mut rival, Transition::Stop)?;
        session
            .merge(&rival)
            .map_err(|e| SadbError::backend_on("start", rival.frame_type, rival.id, e))?;
        warn!(
            frame_type = %target.frame_type,
            stopped = %rival.id,
            started = %target.id,
            gvcid = %target.gvcid(),
            "forced start stopped operational SA"
        );
        stopped.push(rival);
    }
    Ok(stopped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::MemoryStore,
        sa::{FrameType, SaId},
        store::Store,
    };

    fn sa(spi: u16, vcid: u8, state: SaState) -> SecurityAssociation {
        let mut sa = SecurityAssociation::unkeyed(FrameType::Tc, SaId::new(spi, 5), 1, vcid, 0);
        sa.state = state;
        sa
    }

    fn seeded(records: &[SecurityAssociation]) -> MemoryStore {
        let store = MemoryStore::new();
        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();
        for record in records {
            session.persist(record).unwrap();
        }
        session.commit().unwrap();
        store
    }

    #[test]
    fn rivals_ignore_other_channels_states_and_self() {
        let store = seeded(&[
            sa(1, 2, SaState::Operational),
            sa(2, 2, SaState::Keyed),
            sa(3, 3, SaState::Operational),
        ]);
        let session = store.open().unwrap();

        let target = sa(2, 2, SaState::Keyed);
        let found: Vec<_> = rivals(&session, &target).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(found, vec![SaId::new(1, 5)]);

        let holder = sa(1, 2, SaState::Operational);
        assert!(rivals(&session, &holder).unwrap().is_empty());
    }

    #[test]
    fn unforced_start_is_blocked_and_writes_nothing() {
        let store = seeded(&[sa(1, 2, SaState::Operational), sa(2, 2, SaState::Keyed)]);
        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();

        let err =
            clear_channel(&mut session, &Lifecycle::default(), &sa(2, 2, SaState::Keyed), false)
                .unwrap_err();
        let SadbError::Conflict(ConflictError::Operational { blocking, .. }) = err else {
            unreachable!("expected an operational conflict, got {err:?}");
        };
        assert_eq!(blocking, SaId::new(1, 5));

        let holder = session.find_by_id(FrameType::Tc, SaId::new(1, 5)).unwrap().unwrap();
        assert_eq!(holder.state, SaState::Operational);
    }

    #[test]
    fn forced_start_stops_every_rival() {
        // Two operational SAs on one channel cannot arise through the engine,
        // but a forced start must still clean up a store seeded that way.
        let store = seeded(&[
            sa(1, 2, SaState::Operational),
            sa(2, 2, SaState::Operational),
            sa(3, 2, SaState::Keyed),
        ]);
        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();

        let stopped =
            clear_channel(&mut session, &Lifecycle::default(), &sa(3, 2, SaState::Keyed), true)
                .unwrap();
        assert_eq!(stopped.len(), 2);
        assert!(stopped.iter().all(|s| s.state == SaState::Keyed));
        session.commit().unwrap();

        let operational =
            session.query(FrameType::Tc, &Predicate::State(SaState::Operational)).unwrap();
        assert!(operational.is_empty());
    }
}
