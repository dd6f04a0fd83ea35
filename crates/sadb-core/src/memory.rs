//! In-memory [`Store`] implementation.
//!
//! Committed data lives in one set of tables shared by every clone of the
//! store. A transaction takes the writer gate, works on a private copy of the
//! tables, and swaps that copy in on commit. Only one transaction is open at a
//! time, so every write transaction is serializable.
//!
//! Used by tests and by embedders that do not need durability.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc, Condvar, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::{
    sa::{FrameType, SaId, SecurityAssociation},
    store::{Predicate, Session, Store, StoreError},
};

type Partition = BTreeMap<SaId, SecurityAssociation>;

/// One partition per frame type.
#[derive(Debug, Clone, Default)]
struct Tables {
    tc: Partition,
    tm: Partition,
    aos: Partition,
}

impl Tables {
    fn partition(&self, frame_type: FrameType) -> &Partition {
        match frame_type {
            FrameType::Tc => &self.tc,
            FrameType::Tm => &self.tm,
            FrameType::Aos => &self.aos,
        }
    }

    fn partition_mut(&mut self, frame_type: FrameType) -> &mut Partition {
        match frame_type {
            FrameType::Tc => &mut self.tc,
            FrameType::Tm => &mut self.tm,
            FrameType::Aos => &mut self.aos,
        }
    }

    fn query(&self, frame_type: FrameType, predicate: &Predicate) -> Vec<SecurityAssociation> {
        // BTreeMap order on SaId is (spi, scid); the contract promises (scid, spi).
        let mut rows: Vec<_> = self
            .partition(frame_type)
            .values()
            .filter(|sa| predicate.matches(sa))
            .cloned()
            .collect();
        rows.sort_by_key(|sa| (sa.id.scid, sa.id.spi));
        rows
    }
}

/// Exclusive right to write, held across calls by one session.
#[derive(Debug, Default)]
struct WriterGate {
    held: Mutex<bool>,
    released: Condvar,
}

impl WriterGate {
    fn acquire(&self) -> Result<(), StoreError> {
        let mut held = self.held.lock().map_err(|_| StoreError::Poisoned)?;
        while *held {
            held = self.released.wait(held).map_err(|_| StoreError::Poisoned)?;
        }
        *held = true;
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut held) = self.held.lock() {
            *held = false;
        }
        self.released.notify_one();
    }
}

#[derive(Debug)]
struct Shared {
    tables: Mutex<Tables>,
    writer: WriterGate,
    connected: AtomicBool,
    connects: AtomicU64,
    failing_commits: AtomicU32,
}

/// In-memory store. Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty, connected store.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                writer: WriterGate::default(),
                connected: AtomicBool::new(true),
                connects: AtomicU64::new(0),
                failing_commits: AtomicU32::new(0),
            }),
        }
    }

    /// Make the next `count` commits fail with a transient error.
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    /// How many times [`Store::connect`] has been called.
    pub fn connect_count(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of committed records across all partitions.
    pub fn len(&self) -> Result<usize, StoreError> {
        let tables = self.shared.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(FrameType::ALL.iter().map(|ft| tables.partition(*ft).len()).sum())
    }

    /// Whether no records are committed.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    type Session = MemorySession;

    fn open(&self) -> Result<MemorySession, StoreError> {
        self.health_check()?;
        Ok(MemorySession { shared: Arc::clone(&self.shared), staged: None })
    }

    fn health_check(&self) -> Result<(), StoreError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn connect(&self) -> Result<(), StoreError> {
        // Every call counts, including ones on a connected store.
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Session over a [`MemoryStore`].
#[derive(Debug)]
pub struct MemorySession {
    shared: Arc<Shared>,
    /// Private copy of the tables while a transaction is open.
    staged: Option<Tables>,
}

impl MemorySession {
    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotConnected)
        }
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
        self.ensure_connected()?;
        if let Some(staged) = &self.staged {
            return Ok(f(staged));
        }
        let tables = self.shared.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&tables))
    }

    fn staged_mut(&mut self) -> Result<&mut Tables, StoreError> {
        self.ensure_connected()?;
        self.staged.as_mut().ok_or(StoreError::NoTransaction)
    }
}

impl Session for MemorySession {
    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.staged.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.ensure_connected()?;
        self.shared.writer.acquire()?;

        let snapshot = match self.shared.tables.lock() {
            Ok(tables) => tables.clone(),
            Err(_) => {
                self.shared.writer.release();
                return Err(StoreError::Poisoned);
            },
        };
        self.staged = Some(snapshot);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.staged.is_some()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let staged = self.staged.take().ok_or(StoreError::NoTransaction)?;

        let injected = self
            .shared
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || !self.shared.connected.load(Ordering::SeqCst) {
            self.staged = Some(staged);
            return Err(if injected {
                StoreError::transient("commit", io::Error::other("injected commit failure"))
            } else {
                StoreError::NotConnected
            });
        }

        match self.shared.tables.lock() {
            Ok(mut tables) => *tables = staged,
            Err(_) => {
                self.staged = Some(staged);
                return Err(StoreError::Poisoned);
            },
        }
        self.shared.writer.release();
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.staged.take().ok_or(StoreError::NoTransaction)?;
        self.shared.writer.release();
        Ok(())
    }

    fn find_by_id(
        &self,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<Option<SecurityAssociation>, StoreError> {
        self.read(|tables| tables.partition(frame_type).get(&id).cloned())
    }

    fn query(
        &self,
        frame_type: FrameType,
        predicate: &Predicate,
    ) -> Result<Vec<SecurityAssociation>, StoreError> {
        self.read(|tables| tables.query(frame_type, predicate))
    }

    fn persist(&mut self, sa: &SecurityAssociation) -> Result<(), StoreError> {
        let partition = self.staged_mut()?.partition_mut(sa.frame_type);
        if partition.contains_key(&sa.id) {
            return Err(StoreError::DuplicateKey { table: sa.frame_type.table_name(), id: sa.id });
        }
        partition.insert(sa.id, sa.clone());
        Ok(())
    }

    fn merge(&mut self, sa: &SecurityAssociation) -> Result<(), StoreError> {
        self.staged_mut()?.partition_mut(sa.frame_type).insert(sa.id, sa.clone());
        Ok(())
    }

    fn remove(&mut self, frame_type: FrameType, id: SaId) -> Result<bool, StoreError> {
        Ok(self.staged_mut()?.partition_mut(frame_type).remove(&id).is_some())
    }

    fn close(self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if self.staged.take().is_some() {
            debug!("discarding uncommitted memory transaction");
            self.shared.writer.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sa::SaState;

    fn record(spi: u16, scid: u16) -> SecurityAssociation {
        SecurityAssociation::unkeyed(FrameType::Tc, SaId::new(spi, scid), 0, 1, 0)
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut writer = store.open().unwrap();
        let reader = store.open().unwrap();

        writer.begin_transaction().unwrap();
        writer.persist(&record(1, 5)).unwrap();

        assert!(writer.find_by_id(FrameType::Tc, SaId::new(1, 5)).unwrap().is_some());
        assert!(reader.find_by_id(FrameType::Tc, SaId::new(1, 5)).unwrap().is_none());

        writer.commit().unwrap();
        assert!(reader.find_by_id(FrameType::Tc, SaId::new(1, 5)).unwrap().is_some());
    }

    #[test]
    fn rollback_and_drop_discard_writes() {
        let store = MemoryStore::new();

        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();
        session.persist(&record(1, 5)).unwrap();
        session.rollback().unwrap();

        {
            let mut abandoned = store.open().unwrap();
            abandoned.begin_transaction().unwrap();
            abandoned.persist(&record(2, 5)).unwrap();
        }

        assert!(store.is_empty().unwrap());

        // The gate was released both times.
        let mut next = store.open().unwrap();
        next.begin_transaction().unwrap();
        next.commit().unwrap();
    }

    #[test]
    fn mutations_require_a_transaction() {
        let store = MemoryStore::new();
        let mut session = store.open().unwrap();
        assert!(matches!(session.persist(&record(1, 5)), Err(StoreError::NoTransaction)));
        assert!(matches!(session.commit(), Err(StoreError::NoTransaction)));
        assert!(matches!(session.rollback(), Err(StoreError::NoTransaction)));
    }

    #[test]
    fn persist_rejects_duplicates_per_partition() {
        let store = MemoryStore::new();
        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();

        session.persist(&record(1, 5)).unwrap();
        assert!(matches!(
            session.persist(&record(1, 5)),
            Err(StoreError::DuplicateKey { table: "SecAssn", .. })
        ));

        let mut telemetry = record(1, 5);
        telemetry.frame_type = FrameType::Tm;
        session.persist(&telemetry).unwrap();
        session.commit().unwrap();

        assert_eq!(store.len().unwrap(), 2);
    }

    #[test]
    fn query_orders_by_scid_then_spi() {
        let store = MemoryStore::new();
        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();
        for (spi, scid) in [(3, 1), (1, 2), (2, 1), (9, 0)] {
            session.persist(&record(spi, scid)).unwrap();
        }
        session.commit().unwrap();

        let ids: Vec<_> =
            session.query(FrameType::Tc, &Predicate::All).unwrap().iter().map(|sa| sa.id).collect();
        assert_eq!(ids, vec![SaId::new(9, 0), SaId::new(2, 1), SaId::new(3, 1), SaId::new(1, 2)]);
        assert_eq!(session.max_spi(FrameType::Tc, 1).unwrap(), Some(3));
        assert_eq!(session.max_spi(FrameType::Tc, 7).unwrap(), None);
    }

    #[test]
    fn injected_commit_failure_keeps_transaction_open() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);

        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();
        let mut sa = record(1, 5);
        sa.state = SaState::Keyed;
        session.merge(&sa).unwrap();

        let err = session.commit().unwrap_err();
        assert!(err.is_transient());
        assert!(session.in_transaction());

        session.rollback().unwrap();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn closed_store_refuses_sessions_until_reconnected() {
        let store = MemoryStore::new();
        store.close().unwrap();
        assert!(matches!(store.open(), Err(StoreError::NotConnected)));

        store.connect().unwrap();
        assert!(store.open().is_ok());

        // Reconnecting a live store is harmless but still counted.
        store.connect().unwrap();
        assert_eq!(store.connect_count(), 2);
    }
}
