//! Lifecycle engine: the public operation set over a [`Store`].
//!
//! Every owned operation runs as one transaction: the engine checks the store
//! is ready, opens a session, begins, runs the operation, and commits. Any
//! error rolls the transaction back before the session is closed and the
//! error is returned, so a failed call never leaves a partial write behind.
//!
//! The `_in` forms run inside a caller-supplied session instead. The caller
//! owns that transaction: the engine neither commits nor rolls it back, which
//! lets several operations share one atomic unit of work.
//!
//! ```text
//! caller ──> ensure_ready ──> open ──> begin ──> op_in ──┬─ Ok ──> commit ──> close
//!                                                        └─ Err ─> rollback ─> close
//! ```

use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::{
    error::{ConflictError, SadbError, StateError},
    exclusivity,
    lifecycle::{Lifecycle, RekeyPolicy, Transition},
    sa::{FrameType, Gvcid, KeyBinding, NewSecurityAssociation, SaId, SaState, SecurityAssociation},
    spi,
    store::{Predicate, Session, Store, StoreError},
};

/// Engine configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Re-establish an unhealthy store before an operation instead of failing
    pub reconnect: bool,
    /// What rekeying does to an operational SA
    pub rekey_policy: RekeyPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self { reconnect: true, rekey_policy: RekeyPolicy::DemoteToKeyed }
    }
}

/// SA lifecycle engine.
///
/// Safe to share between threads. Each call opens its own session, so
/// concurrent callers never share a unit of work; the store's writer
/// serialization orders their transactions.
#[derive(Debug)]
pub struct SaEngine<S: Store> {
    store: S,
    config: EngineConfig,
    lifecycle: Lifecycle,
    /// Held while the store is being re-established.
    reinit: Mutex<()>,
}

impl<S: Store> SaEngine<S> {
    /// Engine over `store` with the default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Engine over `store` with `config`.
    pub fn with_config(store: S, config: EngineConfig) -> Self {
        Self {
            store,
            config,
            lifecycle: Lifecycle::new(config.rekey_policy),
            reinit: Mutex::new(()),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Active configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Open a session for use with the `_in` operations.
    ///
    /// The caller begins, commits and closes it. While its transaction is
    /// open, stores with a single writer (such as [`crate::MemoryStore`])
    /// block every other transaction, including the engine's owned
    /// operations. Calling an owned operation from the thread holding the
    /// transaction therefore never returns; use the `_in` forms instead.
    pub fn open_session(&self) -> Result<S::Session, SadbError> {
        self.ensure_ready("open session")?;
        self.store.open().map_err(backend("open session"))
    }

    /// Whether the store is usable, re-establishing it if configured to.
    pub fn status(&self) -> bool {
        match self.ensure_ready("status") {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "store not ready");
                false
            },
        }
    }

    /// Tear the store down. A later operation re-establishes it when
    /// [`EngineConfig::reconnect`] is set.
    pub fn close(&self) -> Result<(), SadbError> {
        self.store.close().map_err(backend("close"))?;
        info!("store closed");
        Ok(())
    }

    /// Create an SA, allocating its SPI when the request has none.
    ///
    /// # Errors
    /// - `Validation` for malformed requests, before the store is touched
    /// - `Conflict::Duplicate` if `(spi, scid)` is taken
    /// - `Conflict::SpiExhausted` if no SPI is left for the spacecraft
    pub fn create_sa(
        &self,
        request: NewSecurityAssociation,
    ) -> Result<SecurityAssociation, SadbError> {
        let scid = request.validate()?.scid;
        let frame_type = request.frame_type;
        let id = request.spi.map(|spi| SaId::new(spi, scid));
        let sa = self.transact("create", frame_type, id, |session| {
            self.create_sa_in(session, request)
        })?;
        info!(
            frame_type = %sa.frame_type,
            id = %sa.id,
            gvcid = %sa.gvcid(),
            state = %sa.state,
            "created SA"
        );
        Ok(sa)
    }

    /// [`Self::create_sa`] inside the caller's transaction.
    pub fn create_sa_in<T: Session>(
        &self,
        session: &mut T,
        request: NewSecurityAssociation,
    ) -> Result<SecurityAssociation, SadbError> {
        let gvcid = request.validate()?;
        self.ensure_ready("create")?;
        require_transaction(session, "create")?;
        let frame_type = request.frame_type;

        let spi = match request.spi {
            Some(spi) => {
                let id = SaId::new(spi, gvcid.scid);
                if find(session, frame_type, id, "create")?.is_some() {
                    return Err(ConflictError::Duplicate { frame_type, id }.into());
                }
                spi
            },
            None => spi::next_available_spi(session, frame_type, gvcid.scid)?,
        };

        let sa = request.into_record(gvcid, spi);
        session.persist(&sa).map_err(|e| match e {
            StoreError::DuplicateKey { id, .. } => {
                ConflictError::Duplicate { frame_type, id }.into()
            },
            other => SadbError::backend_on("create", frame_type, sa.id, other),
        })?;
        Ok(sa)
    }

    /// Bind new encryption key material.
    pub fn rekey_enc(
        &self,
        frame_type: FrameType,
        id: SaId,
        binding: KeyBinding,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition(frame_type, id, Transition::RekeyEncryption(binding))
    }

    /// [`Self::rekey_enc`] inside the caller's transaction.
    pub fn rekey_enc_in<T: Session>(
        &self,
        session: &mut T,
        frame_type: FrameType,
        id: SaId,
        binding: KeyBinding,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition_in(session, frame_type, id, Transition::RekeyEncryption(binding))
    }

    /// Bind new authentication key material.
    pub fn rekey_auth(
        &self,
        frame_type: FrameType,
        id: SaId,
        binding: KeyBinding,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition(frame_type, id, Transition::RekeyAuthentication(binding))
    }

    /// [`Self::rekey_auth`] inside the caller's transaction.
    pub fn rekey_auth_in<T: Session>(
        &self,
        session: &mut T,
        frame_type: FrameType,
        id: SaId,
        binding: KeyBinding,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition_in(session, frame_type, id, Transition::RekeyAuthentication(binding))
    }

    /// Make an SA the operational SA of its channel.
    ///
    /// With `force`, any other operational SA on the channel is stopped in the
    /// same transaction.
    ///
    /// # Errors
    /// - `NotFound` if the SA does not exist
    /// - `State::AlreadyOperational` if it is already operational
    /// - `Conflict::Operational` if another SA holds the channel and `force`
    ///   is false
    pub fn start_sa(
        &self,
        frame_type: FrameType,
        id: SaId,
        force: bool,
    ) -> Result<SecurityAssociation, SadbError> {
        let sa = self.transact("start", frame_type, Some(id), |session| {
            self.start_sa_in(session, frame_type, id, force)
        })?;
        info!(frame_type = %frame_type, id = %id, gvcid = %sa.gvcid(), force, "started SA");
        Ok(sa)
    }

    /// [`Self::start_sa`] inside the caller's transaction.
    pub fn start_sa_in<T: Session>(
        &self,
        session: &mut T,
        frame_type: FrameType,
        id: SaId,
        force: bool,
    ) -> Result<SecurityAssociation, SadbError> {
        self.ensure_ready("start")?;
        require_transaction(session, "start")?;
        let mut sa = load(session, frame_type, id, "start")?;

        // An SA that already holds the channel is a state error, not a conflict.
        self.lifecycle.next_state(&sa, &Transition::Start)?;
        exclusivity::clear_channel(session, &self.lifecycle, &sa, force)?;

        self.lifecycle.apply(&mut sa, Transition::Start)?;
        session.merge(&sa).map_err(backend_on("start", frame_type, id))?;
        Ok(sa)
    }

    /// Take an operational SA off its channel.
    pub fn stop_sa(
        &self,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition(frame_type, id, Transition::Stop)
    }

    /// [`Self::stop_sa`] inside the caller's transaction.
    pub fn stop_sa_in<T: Session>(
        &self,
        session: &mut T,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition_in(session, frame_type, id, Transition::Stop)
    }

    /// Retire an SA and clear its key references.
    pub fn expire_sa(
        &self,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition(frame_type, id, Transition::Expire)
    }

    /// [`Self::expire_sa`] inside the caller's transaction.
    pub fn expire_sa_in<T: Session>(
        &self,
        session: &mut T,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        self.transition_in(session, frame_type, id, Transition::Expire)
    }

    /// Remove an SA in any state. Returns the removed record.
    pub fn delete_sa(
        &self,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        let sa = self.transact("delete", frame_type, Some(id), |session| {
            self.delete_sa_in(session, frame_type, id)
        })?;
        info!(frame_type = %frame_type, id = %id, state = %sa.state, "deleted SA");
        Ok(sa)
    }

    /// [`Self::delete_sa`] inside the caller's transaction.
    pub fn delete_sa_in<T: Session>(
        &self,
        session: &mut T,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        self.ensure_ready("delete")?;
        require_transaction(session, "delete")?;
        let sa = load(session, frame_type, id, "delete")?;
        if !session.remove(frame_type, id).map_err(backend_on("delete", frame_type, id))? {
            return Err(SadbError::NotFound { frame_type, id, operation: "delete" });
        }
        Ok(sa)
    }

    /// Overwrite the stored fields of an existing SA.
    ///
    /// The identifier and the state cannot change through update. An
    /// operational SA moved to another channel must not collide with that
    /// channel's operational SA.
    ///
    /// # Errors
    /// - `Validation` for a malformed record
    /// - `NotFound` if no SA has the record's identifier
    /// - `State::UpdateChangesState` if the record's state differs
    /// - `Conflict::Operational` if the move would put two operational SAs on
    ///   one channel
    pub fn update_sa(&self, record: SecurityAssociation) -> Result<SecurityAssociation, SadbError> {
        record.validate()?;
        let (frame_type, id) = (record.frame_type, record.id);
        let sa = self.transact("update", frame_type, Some(id), |session| {
            self.update_sa_in(session, record)
        })?;
        info!(frame_type = %sa.frame_type, id = %sa.id, gvcid = %sa.gvcid(), "updated SA");
        Ok(sa)
    }

    /// [`Self::update_sa`] inside the caller's transaction.
    pub fn update_sa_in<T: Session>(
        &self,
        session: &mut T,
        record: SecurityAssociation,
    ) -> Result<SecurityAssociation, SadbError> {
        record.validate()?;
        self.ensure_ready("update")?;
        require_transaction(session, "update")?;
        let stored = load(session, record.frame_type, record.id, "update")?;

        if stored.state != record.state {
            return Err(StateError::UpdateChangesState {
                frame_type: record.frame_type,
                id: record.id,
                from: stored.state,
                to: record.state,
            }
            .into());
        }
        if record.is_operational() && stored.gvcid() != record.gvcid() {
            exclusivity::clear_channel(session, &self.lifecycle, &record, false)?;
        }

        session.merge(&record).map_err(backend_on("update", record.frame_type, record.id))?;
        Ok(record)
    }

    /// Look up one SA.
    pub fn get_sa(
        &self,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        self.read("get", |session| load(session, frame_type, id, "get"))
            .map_err(|e| e.for_sa(frame_type, Some(id)))
    }

    /// [`Self::get_sa`] through the caller's session, seeing its uncommitted
    /// writes.
    pub fn get_sa_in<T: Session>(
        &self,
        session: &T,
        frame_type: FrameType,
        id: SaId,
    ) -> Result<SecurityAssociation, SadbError> {
        self.ensure_ready("get")?;
        load(session, frame_type, id, "get")
    }

    /// Every SA of a partition, ordered by `(scid, spi)`.
    pub fn get_sas(&self, frame_type: FrameType) -> Result<Vec<SecurityAssociation>, SadbError> {
        self.find_sas(frame_type, &Predicate::All)
    }

    /// SAs of a partition matching `predicate`, ordered by `(scid, spi)`.
    pub fn find_sas(
        &self,
        frame_type: FrameType,
        predicate: &Predicate,
    ) -> Result<Vec<SecurityAssociation>, SadbError> {
        self.read("query", |session| {
            session
                .query(frame_type, predicate)
                .map_err(|e| SadbError::backend("query", e).for_sa(frame_type, None))
        })
    }

    /// Every operational SA of a partition.
    pub fn active_sas(&self, frame_type: FrameType) -> Result<Vec<SecurityAssociation>, SadbError> {
        self.find_sas(frame_type, &Predicate::State(SaState::Operational))
    }

    /// The SA currently protecting `gvcid`, if any.
    pub fn operational_sa(
        &self,
        frame_type: FrameType,
        gvcid: Gvcid,
    ) -> Result<Option<SecurityAssociation>, SadbError> {
        let predicate = Predicate::Channel(gvcid).and(Predicate::State(SaState::Operational));
        Ok(self.find_sas(frame_type, &predicate)?.into_iter().next())
    }

    fn transition(
        &self,
        frame_type: FrameType,
        id: SaId,
        transition: Transition,
    ) -> Result<SecurityAssociation, SadbError> {
        let operation = transition.name();
        let sa = self.transact(operation, frame_type, Some(id), |session| {
            self.transition_in(session, frame_type, id, transition)
        })?;
        info!(frame_type = %frame_type, id = %id, state = %sa.state, "{operation} applied");
        Ok(sa)
    }

    fn transition_in<T: Session>(
        &self,
        session: &mut T,
        frame_type: FrameType,
        id: SaId,
        transition: Transition,
    ) -> Result<SecurityAssociation, SadbError> {
        let operation = transition.name();
        self.ensure_ready(operation)?;
        require_transaction(session, operation)?;
        let mut sa = load(session, frame_type, id, operation)?;
        self.lifecycle.apply(&mut sa, transition)?;
        session.merge(&sa).map_err(backend_on(operation, frame_type, id))?;
        Ok(sa)
    }

    /// Readiness gate run before every operation.
    ///
    /// Concurrent callers finding the store down serialize on `reinit`; the
    /// first reconnects and the rest see a healthy store on their re-check.
    fn ensure_ready(&self, operation: &'static str) -> Result<(), SadbError> {
        let Err(cause) = self.store.health_check() else {
            return Ok(());
        };
        if !self.config.reconnect {
            return Err(SadbError::backend(operation, cause));
        }

        let _guard =
            self.reinit.lock().map_err(|_| SadbError::backend(operation, StoreError::Poisoned))?;
        if self.store.health_check().is_ok() {
            return Ok(());
        }

        warn!(operation, error = %cause, "store unavailable, re-establishing");
        self.store.connect().map_err(backend(operation))
    }

    /// Run `work` as one transaction. Store failures name the SA `work` is
    /// addressing unless a more specific one was already recorded.
    fn transact<R>(
        &self,
        operation: &'static str,
        frame_type: FrameType,
        id: Option<SaId>,
        work: impl FnOnce(&mut S::Session) -> Result<R, SadbError>,
    ) -> Result<R, SadbError> {
        self.run_transaction(operation, work).map_err(|e| e.for_sa(frame_type, id))
    }

    fn run_transaction<R>(
        &self,
        operation: &'static str,
        work: impl FnOnce(&mut S::Session) -> Result<R, SadbError>,
    ) -> Result<R, SadbError> {
        self.ensure_ready(operation)?;
        let mut session = self.store.open().map_err(backend(operation))?;

        let result = session.begin_transaction().map_err(backend(operation)).and_then(|()| {
            let value = work(&mut session)?;
            session.commit().map_err(|e| {
                error!(operation, error = %e, "commit failed");
                SadbError::backend(operation, e)
            })?;
            Ok(value)
        });

        if let Err(e) = &result {
            if session.in_transaction() {
                match session.rollback() {
                    Ok(()) => debug!(operation, error = %e, "rolled back"),
                    Err(rb) => warn!(operation, error = %rb, "rollback failed"),
                }
            }
        }
        if let Err(e) = session.close() {
            warn!(operation, error = %e, "failed to close session");
        }
        result
    }

    fn read<R>(
        &self,
        operation: &'static str,
        work: impl FnOnce(&S::Session) -> Result<R, SadbError>,
    ) -> Result<R, SadbError> {
        self.ensure_ready(operation)?;
        let session = self.store.open().map_err(backend(operation))?;
        let result = work(&session);
        if let Err(e) = session.close() {
            warn!(operation, error = %e, "failed to close session");
        }
        result
    }
}

fn backend(operation: &'static str) -> impl FnOnce(StoreError) -> SadbError {
    move |source| SadbError::backend(operation, source)
}

fn backend_on(
    operation: &'static str,
    frame_type: FrameType,
    id: SaId,
) -> impl FnOnce(StoreError) -> SadbError {
    move |source| SadbError::backend_on(operation, frame_type, id, source)
}

fn require_transaction<T: Session>(session: &T, operation: &'static str) -> Result<(), SadbError> {
    if session.in_transaction() {
        Ok(())
    } else {
        Err(SadbError::backend(operation, StoreError::NoTransaction))
    }
}

fn find<T: Session>(
    session: &T,
    frame_type: FrameType,
    id: SaId,
    operation: &'static str,
) -> Result<Option<SecurityAssociation>, SadbError> {
    session.find_by_id(frame_type, id).map_err(backend_on(operation, frame_type, id))
}

fn load<T: Session>(
    session: &T,
    frame_type: FrameType,
    id: SaId,
    operation: &'static str,
) -> Result<SecurityAssociation, SadbError> {
    find(session, frame_type, id, operation)?
        .ok_or(SadbError::NotFound { frame_type, id, operation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn channel() -> Gvcid {
        Gvcid { scid: 5, tfvn: 1, vcid: 2, mapid: 0 }
    }

    fn key() -> KeyBinding {
        KeyBinding::new("kmc/test/key130", vec![0x01], 256)
    }

    #[test]
    fn validation_precedes_readiness() {
        let store = MemoryStore::new();
        let config = EngineConfig { reconnect: false, ..EngineConfig::default() };
        let engine = SaEngine::with_config(store.clone(), config);
        store.close().unwrap();

        let mut request = NewSecurityAssociation::on_channel(FrameType::Tc, channel());
        request.mapid = None;
        assert!(matches!(engine.create_sa(request), Err(SadbError::Validation(_))));

        let valid = NewSecurityAssociation::on_channel(FrameType::Tc, channel());
        assert!(matches!(engine.create_sa(valid), Err(SadbError::Backend { .. })));
    }

    #[test]
    fn closed_store_is_reestablished_once() {
        let store = MemoryStore::new();
        let engine = SaEngine::new(store.clone());

        engine.close().unwrap();
        assert!(engine.status());
        assert!(engine.status());
        assert_eq!(store.connect_count(), 1);
    }

    #[test]
    fn status_reports_down_store_without_reconnect() {
        let store = MemoryStore::new();
        let config = EngineConfig { reconnect: false, ..EngineConfig::default() };
        let engine = SaEngine::with_config(store.clone(), config);
        engine.close().unwrap();

        assert!(!engine.status());
        assert_eq!(store.connect_count(), 0);
    }

    #[test]
    fn in_forms_share_one_transaction() {
        let engine = SaEngine::new(MemoryStore::new());
        let mut session = engine.open_session().unwrap();
        session.begin_transaction().unwrap();

        let sa = engine
            .create_sa_in(
                &mut session,
                NewSecurityAssociation::on_channel(FrameType::Tc, channel()).with_encryption(key()),
            )
            .unwrap();
        engine.start_sa_in(&mut session, FrameType::Tc, sa.id, false).unwrap();
        assert!(engine.get_sa_in(&session, FrameType::Tc, sa.id).unwrap().is_operational());

        // Not visible to other callers until the caller commits.
        assert!(matches!(engine.get_sa(FrameType::Tc, sa.id), Err(SadbError::NotFound { .. })));

        session.commit().unwrap();
        session.close().unwrap();
        assert!(engine.get_sa(FrameType::Tc, sa.id).unwrap().is_operational());
    }

    #[test]
    fn in_forms_require_an_active_transaction() {
        let engine = SaEngine::new(MemoryStore::new());
        let mut session = engine.open_session().unwrap();

        let err = engine.stop_sa_in(&mut session, FrameType::Tc, SaId::new(1, 5)).unwrap_err();
        assert!(matches!(err, SadbError::Backend { source: StoreError::NoTransaction, .. }));
    }
}
