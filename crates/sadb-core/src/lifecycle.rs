//! SA lifecycle state machine.
//!
//! Pure transition logic: no store access, no logging. The engine loads a
//! record, applies a [`Transition`] here, and persists the result. Keeping the
//! rules in one place means the store-backed engine, the exclusivity enforcer
//! and the reference model in the harness all agree on what a transition does.
//!
//! # State Machine
//!
//! ```text
//!              rekey            start
//! ┌─────────┐ ──────> ┌───────┐ ──────> ┌─────────────┐
//! │ UNKEYED │         │ KEYED │         │ OPERATIONAL │
//! └─────────┘         └───────┘ <────── └─────────────┘
//!      │                  │       stop         │
//!      │ expire           │ expire             │ expire
//!      ↓                  ↓                    ↓
//!                    ┌─────────┐
//!                    │ EXPIRED │ ── rekey ──> KEYED
//!                    └─────────┘
//! ```
//!
//! Rekeying is accepted from every state. Under the default
//! [`RekeyPolicy::DemoteToKeyed`] it leaves the SA `KEYED` even when it was
//! operational, taking it off the channel.
//!
//! Start is accepted from every state except `OPERATIONAL`. Whether another SA
//! already holds the channel is not a property of one record; the exclusivity
//! enforcer checks it before the engine applies `Start`.

use crate::{
    error::StateError,
    sa::{KeyBinding, SaState, SecurityAssociation},
};

/// A lifecycle step applied to one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Bind new encryption key material.
    RekeyEncryption(KeyBinding),
    /// Bind new authentication key material.
    RekeyAuthentication(KeyBinding),
    /// Make the SA operational.
    Start,
    /// Take the SA off its channel, keeping its keys.
    Stop,
    /// Retire the SA and clear its key references.
    Expire,
}

impl Transition {
    /// Short operation name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RekeyEncryption(_) => "rekey for encryption",
            Self::RekeyAuthentication(_) => "rekey for authentication",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Expire => "expire",
        }
    }
}

/// What rekeying does to an operational SA.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RekeyPolicy {
    /// Rekeying always leaves the SA `KEYED`.
    #[default]
    DemoteToKeyed,
    /// An operational SA stays operational with its new keys.
    KeepOperational,
}

/// Transition rules, parameterised by the rekey policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lifecycle {
    rekey_policy: RekeyPolicy,
}

impl Lifecycle {
    /// Rules using `rekey_policy`.
    pub const fn new(rekey_policy: RekeyPolicy) -> Self {
        Self { rekey_policy }
    }

    /// Active rekey policy.
    pub const fn rekey_policy(&self) -> RekeyPolicy {
        self.rekey_policy
    }

    /// State `sa` would reach through `transition`.
    ///
    /// # Errors
    /// - `AlreadyOperational` when starting an operational SA
    /// - `NotOperational` when stopping an SA that is not operational
    pub fn next_state(
        &self,
        sa: &SecurityAssociation,
        transition: &Transition,
    ) -> Result<SaState, StateError> {
        match (sa.state, transition) {
            (
                SaState::Operational,
                Transition::RekeyEncryption(_) | Transition::RekeyAuthentication(_),
            ) if self.rekey_policy == RekeyPolicy::KeepOperational => Ok(SaState::Operational),
            (_, Transition::RekeyEncryption(_) | Transition::RekeyAuthentication(_)) => {
                Ok(SaState::Keyed)
            },
            (SaState::Operational, Transition::Start) => Err(StateError::AlreadyOperational {
                frame_type: sa.frame_type,
                id: sa.id,
            }),
            (_, Transition::Start) => Ok(SaState::Operational),
            (SaState::Operational, Transition::Stop) => Ok(SaState::Keyed),
            (state, Transition::Stop) => {
                Err(StateError::NotOperational { frame_type: sa.frame_type, id: sa.id, state })
            },
            (_, Transition::Expire) => Ok(SaState::Expired),
        }
    }

    /// Apply `transition` to `sa` in place.
    ///
    /// On error `sa` is left untouched.
    pub fn apply(
        &self,
        sa: &mut SecurityAssociation,
        transition: Transition,
    ) -> Result<(), StateError> {
        let next = self.next_state(sa, &transition)?;
        match transition {
            Transition::RekeyEncryption(binding) => sa.bind_encryption(binding),
            Transition::RekeyAuthentication(binding) => sa.bind_authentication(binding),
            Transition::Expire => {
                sa.ekid = None;
                sa.akid = None;
            },
            Transition::Start | Transition::Stop => {},
        }
        sa.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sa::{FrameType, SaId};

    fn unkeyed() -> SecurityAssociation {
        SecurityAssociation::unkeyed(FrameType::Tc, SaId::new(1, 5), 1, 2, 0)
    }

    fn enc_key() -> KeyBinding {
        KeyBinding::new("kmc/test/key130", vec![0x01], 256)
    }

    fn auth_key() -> KeyBinding {
        KeyBinding::new("kmc/test/hmac0", vec![0x0a], 128)
    }

    #[test]
    fn full_lifecycle() {
        let lifecycle = Lifecycle::default();
        let mut sa = unkeyed();

        lifecycle.apply(&mut sa, Transition::RekeyEncryption(enc_key())).unwrap();
        assert_eq!(sa.state, SaState::Keyed);
        assert_eq!(sa.ekid.as_deref(), Some("kmc/test/key130"));
        assert_eq!(sa.ecs_len, Some(256));

        lifecycle.apply(&mut sa, Transition::RekeyAuthentication(auth_key())).unwrap();
        assert_eq!(sa.akid.as_deref(), Some("kmc/test/hmac0"));

        lifecycle.apply(&mut sa, Transition::Start).unwrap();
        assert_eq!(sa.state, SaState::Operational);

        lifecycle.apply(&mut sa, Transition::Stop).unwrap();
        assert_eq!(sa.state, SaState::Keyed);

        lifecycle.apply(&mut sa, Transition::Expire).unwrap();
        assert_eq!(sa.state, SaState::Expired);
        assert_eq!(sa.ekid, None);
        assert_eq!(sa.akid, None);
        // Cipher suites are not key material and survive expiry.
        assert_eq!(sa.ecs, Some(vec![0x01]));
    }

    #[test]
    fn start_twice_is_rejected_without_change() {
        let lifecycle = Lifecycle::default();
        let mut sa = unkeyed();
        lifecycle.apply(&mut sa, Transition::Start).unwrap();

        let before = sa.clone();
        let result = lifecycle.apply(&mut sa, Transition::Start);
        assert!(matches!(result, Err(StateError::AlreadyOperational { .. })));
        assert_eq!(sa, before);
    }

    #[test]
    fn stop_requires_operational() {
        let lifecycle = Lifecycle::default();
        for state in [SaState::Unkeyed, SaState::Keyed, SaState::Expired] {
            let mut sa = unkeyed();
            sa.state = state;
            let result = lifecycle.apply(&mut sa, Transition::Stop);
            assert_eq!(
                result,
                Err(StateError::NotOperational {
                    frame_type: FrameType::Tc,
                    id: SaId::new(1, 5),
                    state
                })
            );
            assert_eq!(sa.state, state);
        }
    }

    #[test]
    fn expire_from_any_state_clears_keys() {
        let lifecycle = Lifecycle::default();
        for state in [SaState::Unkeyed, SaState::Keyed, SaState::Operational, SaState::Expired] {
            let mut sa = unkeyed();
            sa.bind_encryption(enc_key());
            sa.bind_authentication(auth_key());
            sa.state = state;

            lifecycle.apply(&mut sa, Transition::Expire).unwrap();
            assert_eq!(sa.state, SaState::Expired);
            assert!(sa.ekid.is_none() && sa.akid.is_none());
        }
    }

    #[test]
    fn rekey_demotes_operational_by_default() {
        let mut sa = unkeyed();
        sa.state = SaState::Operational;

        Lifecycle::default().apply(&mut sa, Transition::RekeyEncryption(enc_key())).unwrap();
        assert_eq!(sa.state, SaState::Keyed);
    }

    #[test]
    fn keep_operational_policy() {
        let lifecycle = Lifecycle::new(RekeyPolicy::KeepOperational);
        let mut sa = unkeyed();
        sa.state = SaState::Operational;

        lifecycle.apply(&mut sa, Transition::RekeyAuthentication(auth_key())).unwrap();
        assert_eq!(sa.state, SaState::Operational);

        // The policy only matters for operational SAs.
        let mut expired = unkeyed();
        expired.state = SaState::Expired;
        lifecycle.apply(&mut expired, Transition::RekeyEncryption(enc_key())).unwrap();
        assert_eq!(expired.state, SaState::Keyed);
    }
}
