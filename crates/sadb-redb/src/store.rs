//! [`Store`] and [`Session`] over a redb database.

use std::{
    path::PathBuf,
    sync::{Arc, RwLock},
};

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use sadb_core::{FrameType, Predicate, SaId, SecurityAssociation, Session, Store, StoreError};
use tracing::{debug, info};

use crate::{
    codec::{decode, encode},
    error::db,
};

/// Row key: `(scid, spi)`.
type Key = (u16, u16);

fn table(frame_type: FrameType) -> TableDefinition<'static, Key, &'static [u8]> {
    TableDefinition::new(frame_type.table_name())
}

fn key(id: SaId) -> Key {
    (id.scid, id.spi)
}

/// Database location and tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedbConfig {
    /// Database file. Created on first connect.
    pub path: PathBuf,
    /// Page cache size in bytes; redb's default when `None`.
    pub cache_size: Option<usize>,
}

impl RedbConfig {
    /// Configuration for a database at `path` with default tuning.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), cache_size: None }
    }
}

/// Durable store backed by one redb file.
///
/// The database handle is opened by [`Store::connect`] and dropped by
/// [`Store::close`]; sessions opened before a close keep their own handle
/// until they are closed.
#[derive(Debug)]
pub struct RedbStore {
    config: RedbConfig,
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbStore {
    /// Open (or create) the database described by `config`.
    pub fn open(config: RedbConfig) -> Result<Self, StoreError> {
        let store = Self { config, db: RwLock::new(None) };
        store.connect()?;
        Ok(store)
    }

    /// Active configuration.
    pub fn config(&self) -> &RedbConfig {
        &self.config
    }

    fn handle(&self) -> Result<Arc<Database>, StoreError> {
        let guard = self.db.read().map_err(|_| StoreError::Poisoned)?;
        guard.clone().ok_or(StoreError::NotConnected)
    }
}

impl Store for RedbStore {
    type Session = RedbSession;

    fn open(&self) -> Result<RedbSession, StoreError> {
        Ok(RedbSession { db: self.handle()?, txn: None })
    }

    fn health_check(&self) -> Result<(), StoreError> {
        self.handle().map(|_| ())
    }

    fn connect(&self) -> Result<(), StoreError> {
        let mut guard = self.db.write().map_err(|_| StoreError::Poisoned)?;
        if guard.is_some() {
            return Ok(());
        }

        let mut builder = Database::builder();
        if let Some(bytes) = self.config.cache_size {
            builder.set_cache_size(bytes);
        }
        let database = builder.create(&self.config.path).map_err(db)?;

        // Every partition exists from the start so read transactions never
        // meet a missing table.
        let txn = database.begin_write().map_err(db)?;
        for frame_type in FrameType::ALL {
            txn.open_table(table(frame_type)).map_err(db)?;
        }
        txn.commit().map_err(db)?;

        info!(path = %self.config.path.display(), "opened SA database");
        *guard = Some(Arc::new(database));
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self.db.write().map_err(|_| StoreError::Poisoned)?;
        if guard.take().is_some() {
            info!(path = %self.config.path.display(), "closed SA database");
        }
        Ok(())
    }
}

/// Session over a [`RedbStore`].
///
/// A transaction is a redb write transaction; dropping the session without
/// committing aborts it.
pub struct RedbSession {
    db: Arc<Database>,
    txn: Option<WriteTransaction>,
}

impl std::fmt::Debug for RedbSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbSession").field("in_transaction", &self.txn.is_some()).finish()
    }
}

impl RedbSession {
    fn txn(&self) -> Result<&WriteTransaction, StoreError> {
        self.txn.as_ref().ok_or(StoreError::NoTransaction)
    }

    /// Run `read` against the partition table, through the open transaction
    /// when there is one so uncommitted writes are visible.
    fn with_table<R>(
        &self,
        frame_type: FrameType,
        read: impl FnOnce(&dyn ReadableRows) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        if let Some(txn) = &self.txn {
            let table = txn.open_table(table(frame_type)).map_err(db)?;
            return read(&table);
        }
        let txn = self.db.begin_read().map_err(db)?;
        let table = txn.open_table(table(frame_type)).map_err(db)?;
        read(&table)
    }
}

/// The reads a session performs, over either a read-only or a writable table.
trait ReadableRows {
    fn get_row(&self, key: Key) -> Result<Option<SecurityAssociation>, StoreError>;
    fn scan(&self, predicate: &Predicate) -> Result<Vec<SecurityAssociation>, StoreError>;
    fn last_spi(&self, scid: u16) -> Result<Option<u16>, StoreError>;
}

impl<T: ReadableTable<Key, &'static [u8]>> ReadableRows for T {
    fn get_row(&self, key: Key) -> Result<Option<SecurityAssociation>, StoreError> {
        match self.get(key).map_err(db)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    fn scan(&self, predicate: &Predicate) -> Result<Vec<SecurityAssociation>, StoreError> {
        let mut rows = Vec::new();
        for entry in self.iter().map_err(db)? {
            let (_, value) = entry.map_err(db)?;
            let sa = decode(value.value())?;
            if predicate.matches(&sa) {
                rows.push(sa);
            }
        }
        Ok(rows)
    }

    fn last_spi(&self, scid: u16) -> Result<Option<u16>, StoreError> {
        match self.range((scid, 0)..=(scid, u16::MAX)).map_err(db)?.next_back() {
            Some(entry) => {
                let (key, _) = entry.map_err(db)?;
                Ok(Some(key.value().1))
            },
            None => Ok(None),
        }
    }
}

impl Session for RedbSession {
    fn begin_transaction(&mut self) -> Result<(), StoreError> {
        if self.txn.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.txn = Some(self.db.begin_write().map_err(db)?);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let txn = self.txn.take().ok_or(StoreError::NoTransaction)?;
        // redb consumes the transaction on commit, so a failed commit cannot
        // stay open; it has already been rolled back by redb.
        txn.commit().map_err(db)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        let txn = self.txn.take().ok_or(StoreError::NoTransaction)?;
        txn.abort().map_err(db)
    }

    fn find_by_id(
        &self,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<Option<SecurityAssociation>, StoreError> {
        self.with_table(frame_type, |rows| rows.get_row(key(id)))
    }

    fn query(
        &self,
        frame_type: FrameType,
        predicate: &Predicate,
    ) -> Result<Vec<SecurityAssociation>, StoreError> {
        self.with_table(frame_type, |rows| rows.scan(predicate))
    }

    fn max_spi(&self, frame_type: FrameType, scid: u16) -> Result<Option<u16>, StoreError> {
        self.with_table(frame_type, |rows| rows.last_spi(scid))
    }

    fn persist(&mut self, sa: &SecurityAssociation) -> Result<(), StoreError> {
        let bytes = encode(sa)?;
        let mut table = self.txn()?.open_table(table(sa.frame_type)).map_err(db)?;
        if table.get(key(sa.id)).map_err(db)?.is_some() {
            return Err(StoreError::DuplicateKey { table: sa.frame_type.table_name(), id: sa.id });
        }
        table.insert(key(sa.id), bytes.as_slice()).map_err(db)?;
        Ok(())
    }

    fn merge(&mut self, sa: &SecurityAssociation) -> Result<(), StoreError> {
        let bytes = encode(sa)?;
        let mut table = self.txn()?.open_table(table(sa.frame_type)).map_err(db)?;
        table.insert(key(sa.id), bytes.as_slice()).map_err(db)?;
        Ok(())
    }

    fn remove(&mut self, frame_type: FrameType, id: SaId) -> Result<bool, StoreError> {
        let mut table = self.txn()?.open_table(table(frame_type)).map_err(db)?;
        let removed = table.remove(key(id)).map_err(db)?;
        Ok(removed.is_some())
    }

    fn close(mut self) -> Result<(), StoreError> {
        if let Some(txn) = self.txn.take() {
            debug!("aborting uncommitted redb transaction on close");
            txn.abort().map_err(db)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sadb_core::SaState;

    use super::*;

    fn store() -> (tempfile::TempDir, RedbStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(RedbConfig::new(dir.path().join("sadb.redb"))).unwrap();
        (dir, store)
    }

    fn record(spi: u16, scid: u16) -> SecurityAssociation {
        SecurityAssociation::unkeyed(FrameType::Tc, SaId::new(spi, scid), 0, 1, 0)
    }

    #[test]
    fn max_spi_is_scoped_to_the_spacecraft() {
        let (_dir, store) = store();
        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();
        for (spi, scid) in [(9, 4), (2, 5), (u16::MAX, 6), (4, 5)] {
            session.persist(&record(spi, scid)).unwrap();
        }

        // Uncommitted rows are visible to their own transaction.
        assert_eq!(session.max_spi(FrameType::Tc, 5).unwrap(), Some(4));
        session.commit().unwrap();

        assert_eq!(session.max_spi(FrameType::Tc, 4).unwrap(), Some(9));
        assert_eq!(session.max_spi(FrameType::Tc, 6).unwrap(), Some(u16::MAX));
        assert_eq!(session.max_spi(FrameType::Tc, 7).unwrap(), None);
        assert_eq!(session.max_spi(FrameType::Tm, 5).unwrap(), None);
    }

    #[test]
    fn persist_rejects_existing_keys() {
        let (_dir, store) = store();
        let mut session = store.open().unwrap();
        session.begin_transaction().unwrap();
        session.persist(&record(1, 5)).unwrap();

        let mut replaced = record(1, 5);
        replaced.state = SaState::Expired;
        assert!(matches!(session.persist(&replaced), Err(StoreError::DuplicateKey { .. })));

        session.merge(&replaced).unwrap();
        assert_eq!(
            session.find_by_id(FrameType::Tc, SaId::new(1, 5)).unwrap().map(|sa| sa.state),
            Some(SaState::Expired)
        );
    }

    #[test]
    fn closed_store_refuses_sessions() {
        let (_dir, store) = store();
        store.close().unwrap();
        assert!(matches!(store.open(), Err(StoreError::NotConnected)));
        assert!(store.health_check().is_err());

        store.connect().unwrap();
        store.health_check().unwrap();
    }
}
