//! The real engine behind the model's interface.

use sadb_core::{FrameType, NewSecurityAssociation, SaEngine, SadbError, SecurityAssociation, Store};
use tracing::debug;

use crate::operation::{Operation, OperationError, OperationResult, channel, key_binding};

/// A [`SaEngine`] driven by [`Operation`]s.
#[derive(Debug)]
pub struct EngineWorld<S: Store> {
    engine: SaEngine<S>,
}

impl<S: Store> EngineWorld<S> {
    /// Wrap `engine`.
    pub fn new(engine: SaEngine<S>) -> Self {
        Self { engine }
    }

    /// The wrapped engine.
    pub fn engine(&self) -> &SaEngine<S> {
        &self.engine
    }

    /// Apply one operation.
    pub fn apply(&self, op: &Operation) -> OperationResult {
        debug!(?op, "applying operation");
        let result = match op {
            Operation::Create { partition, spi, scid, vcid, keyed } => {
                let mut request =
                    NewSecurityAssociation::on_channel(partition.frame_type(), channel(*scid, *vcid));
                request.spi = *spi;
                if *keyed {
                    request = request.with_encryption(key_binding("key", 0));
                }
                self.engine.create_sa(request)
            },
            Operation::RekeyEnc { target, key } => {
                self.engine.rekey_enc(target.frame_type(), target.id(), key_binding("key", *key))
            },
            Operation::RekeyAuth { target, key } => {
                self.engine.rekey_auth(target.frame_type(), target.id(), key_binding("hmac", *key))
            },
            Operation::Start { target, force } => {
                self.engine.start_sa(target.frame_type(), target.id(), *force)
            },
            Operation::Stop { target } => self.engine.stop_sa(target.frame_type(), target.id()),
            Operation::Expire { target } => self.engine.expire_sa(target.frame_type(), target.id()),
            Operation::Delete { target } => self.engine.delete_sa(target.frame_type(), target.id()),
            Operation::Get { target } => self.engine.get_sa(target.frame_type(), target.id()),
            Operation::Move { target, vcid } => {
                self.engine.get_sa(target.frame_type(), target.id()).and_then(|mut sa| {
                    sa.vcid = *vcid;
                    self.engine.update_sa(sa)
                })
            },
        };

        match result {
            Ok(sa) => OperationResult::Ok(sa),
            Err(e) => OperationResult::Error(OperationError::from(&e)),
        }
    }

    /// Every stored record, ordered by partition, then `(scid, spi)`.
    pub fn snapshot(&self) -> Result<Vec<SecurityAssociation>, SadbError> {
        let mut records = Vec::new();
        for frame_type in FrameType::ALL {
            records.extend(self.engine.get_sas(frame_type)?);
        }
        Ok(records)
    }
}
