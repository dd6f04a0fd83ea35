//! Transactional store contract consumed by the engine.
//!
//! A [`Store`] is the process-wide persistence provider. It hands out
//! [`Session`]s: owned, move-only units of work with an explicit
//! `begin_transaction` / `commit` / `rollback`. A session that is dropped with
//! a transaction still open rolls it back, so every exit path releases it.
//!
//! Implementations must serialize write transactions (at least per partition):
//! the engine's read-then-write sequences (SPI allocation, exclusivity checks)
//! rely on no other writer committing between their read and their write.

use std::error::Error;

use thiserror::Error;

use crate::sa::{FrameType, Gvcid, SaId, SaState, SecurityAssociation};

/// Failure reported by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The provider is closed or its connection was lost.
    #[error("store is not connected")]
    NotConnected,

    /// A mutation or commit was attempted outside a transaction.
    #[error("no active transaction")]
    NoTransaction,

    /// `begin_transaction` was called twice on one session.
    #[error("a transaction is already active on this session")]
    TransactionActive,

    /// Insert of a key that already exists.
    #[error("record {id} already exists in {table}")]
    DuplicateKey {
        /// Partition name.
        table: &'static str,
        /// Conflicting key.
        id: SaId,
    },

    /// A lock guarding shared store state was poisoned by a panicking holder.
    #[error("store lock poisoned")]
    Poisoned,

    /// Provider-specific failure.
    #[error("{context}: {source}")]
    Backend {
        /// What the store was doing.
        context: &'static str,
        /// Whether retrying may succeed.
        transient: bool,
        /// Provider error.
        #[source]
        source: Box<dyn Error + Send + Sync>,
    },
}

impl StoreError {
    /// Wrap a permanent provider error.
    pub fn backend(context: &'static str, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Backend { context, transient: false, source: source.into() }
    }

    /// Wrap a provider error that may clear up on retry.
    pub fn transient(
        context: &'static str,
        source: impl Into<Box<dyn Error + Send + Sync>>,
    ) -> Self {
        Self::Backend { context, transient: true, source: source.into() }
    }

    /// Whether retrying the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotConnected | Self::Poisoned => true,
            Self::Backend { transient, .. } => *transient,
            Self::NoTransaction | Self::TransactionActive | Self::DuplicateKey { .. } => false,
        }
    }
}

/// Filter over the records of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Every record.
    All,
    /// Records with this SPI.
    Spi(u16),
    /// Records of this spacecraft.
    Scid(u16),
    /// Records on exactly this channel tuple.
    Channel(Gvcid),
    /// Records in this state.
    State(SaState),
    /// Records not matching the inner predicate.
    Not(Box<Predicate>),
    /// Records matching every inner predicate.
    And(Vec<Predicate>),
}

impl Predicate {
    /// Whether `sa` satisfies the predicate.
    pub fn matches(&self, sa: &SecurityAssociation) -> bool {
        match self {
            Self::All => true,
            Self::Spi(spi) => sa.id.spi == *spi,
            Self::Scid(scid) => sa.id.scid == *scid,
            Self::Channel(gvcid) => sa.gvcid() == *gvcid,
            Self::State(state) => sa.state == *state,
            Self::Not(inner) => !inner.matches(sa),
            Self::And(all) => all.iter().all(|p| p.matches(sa)),
        }
    }

    /// Conjunction with `other`.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            },
            first => Self::And(vec![first, other]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }
}

/// Persistence provider shared by every caller of the engine.
pub trait Store: Send + Sync {
    /// Unit-of-work handle produced by [`Store::open`].
    type Session: Session;

    /// Open a new session. Sessions are never shared between callers.
    fn open(&self) -> Result<Self::Session, StoreError>;

    /// Cheap liveness probe.
    fn health_check(&self) -> Result<(), StoreError>;

    /// (Re)establish the provider. Succeeds without effect when already
    /// connected.
    fn connect(&self) -> Result<(), StoreError>;

    /// Tear the provider down. Later operations fail with
    /// [`StoreError::NotConnected`] until [`Store::connect`] runs.
    fn close(&self) -> Result<(), StoreError>;
}

/// A scoped unit of work over a [`Store`].
///
/// Reads outside a transaction observe committed data. Reads inside a
/// transaction also observe the transaction's own writes. Mutations require an
/// active transaction.
pub trait Session {
    /// Start a transaction. Blocks while another writer holds the store.
    fn begin_transaction(&mut self) -> Result<(), StoreError>;

    /// Whether a transaction is open on this session.
    fn in_transaction(&self) -> bool;

    /// Make the transaction's writes visible and end it.
    ///
    /// Some providers keep the transaction open when commit fails; the caller
    /// rolls back while [`Session::in_transaction`] still reports one.
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard the transaction's writes and end it.
    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Look up one record.
    fn find_by_id(
        &self,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<Option<SecurityAssociation>, StoreError>;

    /// Every record of the partition matching `predicate`, ordered by
    /// `(scid, spi)`.
    fn query(
        &self,
        frame_type: FrameType,
        predicate: &Predicate,
    ) -> Result<Vec<SecurityAssociation>, StoreError>;

    /// Largest SPI in use for `scid`, if any.
    fn max_spi(&self, frame_type: FrameType, scid: u16) -> Result<Option<u16>, StoreError> {
        let records = self.query(frame_type, &Predicate::Scid(scid))?;
        Ok(records.iter().map(|sa| sa.id.spi).max())
    }

    /// Insert a new record. Fails with [`StoreError::DuplicateKey`] if the key
    /// exists.
    fn persist(&mut self, sa: &SecurityAssociation) -> Result<(), StoreError>;

    /// Insert or overwrite a record.
    fn merge(&mut self, sa: &SecurityAssociation) -> Result<(), StoreError>;

    /// Delete a record. Returns whether it existed.
    fn remove(&mut self, frame_type: FrameType, id: SaId) -> Result<bool, StoreError>;

    /// Release the session, rolling back any open transaction.
    fn close(self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(spi: u16, vcid: u8, state: SaState) -> SecurityAssociation {
        let mut sa = SecurityAssociation::unkeyed(FrameType::Tc, SaId::new(spi, 5), 1, vcid, 0);
        sa.state = state;
        sa
    }

    #[test]
    fn channel_predicate_excluding_self() {
        let target = sa(1, 2, SaState::Keyed);
        let rival = sa(2, 2, SaState::Operational);
        let elsewhere = sa(3, 3, SaState::Operational);

        let predicate = Predicate::Channel(target.gvcid()).and(Predicate::Spi(1).negate());

        assert!(!predicate.matches(&target));
        assert!(predicate.matches(&rival));
        assert!(!predicate.matches(&elsewhere));
    }

    #[test]
    fn and_flattens() {
        let p = Predicate::Scid(5).and(Predicate::State(SaState::Keyed)).and(Predicate::Spi(1));
        assert!(matches!(&p, Predicate::And(all) if all.len() == 3));
        assert!(p.matches(&sa(1, 0, SaState::Keyed)));
        assert!(!p.matches(&sa(1, 0, SaState::Expired)));
    }

    #[test]
    fn transient_classification() {
        assert!(StoreError::NotConnected.is_transient());
        assert!(StoreError::transient("commit", std::io::Error::other("reset")).is_transient());
        assert!(!StoreError::backend("decode", "corrupt record").is_transient());
        assert!(
            !StoreError::DuplicateKey { table: "SecAssn", id: SaId::new(1, 5) }.is_transient()
        );
    }
}
