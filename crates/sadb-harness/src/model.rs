//! Reference model of the SA store.
//!
//! Written to be obviously correct rather than efficient: every lookup is a
//! map access or a linear scan.

use std::collections::BTreeMap;

use sadb_core::{Gvcid, SaId, SaState, SecurityAssociation};

use crate::operation::{
    Operation, OperationError, OperationResult, Partition, SaRef, channel, key_binding,
};

/// `(partition, scid, spi)`: iteration order matches the engine's listing
/// order.
type ModelKey = (Partition, u16, u16);

fn model_key(target: SaRef) -> ModelKey {
    (target.partition, target.scid, target.spi)
}

/// Largest VCID each partition accepts in the model domain.
fn max_vcid(partition: Partition) -> u8 {
    match partition {
        Partition::Tm => 7,
        Partition::Tc | Partition::Aos => 63,
    }
}

/// In-memory reference implementation.
#[derive(Debug, Clone, Default)]
pub struct ModelWorld {
    records: BTreeMap<ModelKey, SecurityAssociation>,
}

impl ModelWorld {
    /// Empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one operation.
    pub fn apply(&mut self, op: &Operation) -> OperationResult {
        let result = match op {
            Operation::Create { partition, spi, scid, vcid, keyed } => {
                self.create(*partition, *spi, *scid, *vcid, *keyed)
            },
            Operation::RekeyEnc { target, key } => self.update(*target, |sa| {
                let binding = key_binding("key", *key);
                sa.ekid = Some(binding.key_ref);
                sa.ecs = Some(binding.cipher_suite);
                sa.ecs_len = Some(binding.cipher_suite_len);
                sa.state = SaState::Keyed;
                Ok(())
            }),
            Operation::RekeyAuth { target, key } => self.update(*target, |sa| {
                let binding = key_binding("hmac", *key);
                sa.akid = Some(binding.key_ref);
                sa.acs = Some(binding.cipher_suite);
                sa.acs_len = Some(binding.cipher_suite_len);
                sa.state = SaState::Keyed;
                Ok(())
            }),
            Operation::Start { target, force } => self.start(*target, *force),
            Operation::Stop { target } => self.update(*target, |sa| {
                if sa.state != SaState::Operational {
                    return Err(OperationError::NotOperational);
                }
                sa.state = SaState::Keyed;
                Ok(())
            }),
            Operation::Expire { target } => self.update(*target, |sa| {
                sa.ekid = None;
                sa.akid = None;
                sa.state = SaState::Expired;
                Ok(())
            }),
            Operation::Delete { target } => {
                self.records.remove(&model_key(*target)).ok_or(OperationError::NotFound)
            },
            Operation::Get { target } => {
                self.records.get(&model_key(*target)).cloned().ok_or(OperationError::NotFound)
            },
            Operation::Move { target, vcid } => self.relocate(*target, *vcid),
        };

        match result {
            Ok(sa) => OperationResult::Ok(sa),
            Err(e) => OperationResult::Error(e),
        }
    }

    /// Every record, ordered by partition, then `(scid, spi)`.
    pub fn snapshot(&self) -> Vec<SecurityAssociation> {
        self.records.values().cloned().collect()
    }

    /// Operational SA on `gvcid` in `partition`, if any.
    pub fn operational(&self, partition: Partition, gvcid: Gvcid) -> Option<&SecurityAssociation> {
        self.holders(partition, gvcid, None).next()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the model holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn holders(
        &self,
        partition: Partition,
        gvcid: Gvcid,
        except: Option<SaId>,
    ) -> impl Iterator<Item = &SecurityAssociation> {
        self.records.iter().filter_map(move |((p, _, _), sa)| {
            let holds = *p == partition
                && sa.state == SaState::Operational
                && sa.gvcid() == gvcid
                && Some(sa.id) != except;
            holds.then_some(sa)
        })
    }

    fn create(
        &mut self,
        partition: Partition,
        spi: Option<u16>,
        scid: u16,
        vcid: u8,
        keyed: bool,
    ) -> Result<SecurityAssociation, OperationError> {
        if spi == Some(0) || vcid > max_vcid(partition) {
            return Err(OperationError::Invalid);
        }

        let spi = match spi {
            Some(spi) => {
                if self.records.contains_key(&(partition, scid, spi)) {
                    return Err(OperationError::Duplicate);
                }
                spi
            },
            None => {
                let max = self
                    .records
                    .keys()
                    .filter(|(p, s, _)| *p == partition && *s == scid)
                    .map(|(_, _, spi)| *spi)
                    .max();
                match max {
                    None => 1,
                    Some(u16::MAX) => return Err(OperationError::SpiExhausted),
                    Some(max) => max + 1,
                }
            },
        };

        let gvcid = channel(scid, vcid);
        let mut sa = SecurityAssociation::unkeyed(
            partition.frame_type(),
            SaId::new(spi, scid),
            gvcid.tfvn,
            gvcid.vcid,
            gvcid.mapid,
        );
        if keyed {
            sa.bind_encryption(key_binding("key", 0));
            sa.state = SaState::Keyed;
        }
        self.records.insert((partition, scid, spi), sa.clone());
        Ok(sa)
    }

    fn start(&mut self, target: SaRef, force: bool) -> Result<SecurityAssociation, OperationError> {
        let sa = self.records.get(&model_key(target)).ok_or(OperationError::NotFound)?;
        if sa.state == SaState::Operational {
            return Err(OperationError::AlreadyOperational);
        }

        let rivals: Vec<_> = self
            .holders(target.partition, sa.gvcid(), Some(sa.id))
            .map(|rival| (rival.id.scid, rival.id.spi))
            .collect();
        if !rivals.is_empty() && !force {
            return Err(OperationError::ChannelHeld);
        }
        for (scid, spi) in rivals {
            if let Some(rival) = self.records.get_mut(&(target.partition, scid, spi)) {
                rival.state = SaState::Keyed;
            }
        }

        self.update(target, |sa| {
            sa.state = SaState::Operational;
            Ok(())
        })
    }

    fn relocate(&mut self, target: SaRef, vcid: u8) -> Result<SecurityAssociation, OperationError> {
        let sa = self.records.get(&model_key(target)).ok_or(OperationError::NotFound)?;
        if vcid > max_vcid(target.partition) {
            return Err(OperationError::Invalid);
        }

        let destination = Gvcid { vcid, ..sa.gvcid() };
        if sa.state == SaState::Operational
            && destination != sa.gvcid()
            && self.holders(target.partition, destination, Some(sa.id)).next().is_some()
        {
            return Err(OperationError::ChannelHeld);
        }

        self.update(target, |sa| {
            sa.vcid = vcid;
            Ok(())
        })
    }

    /// Apply `change` to a copy of the record and store it if `change`
    /// succeeds.
    fn update(
        &mut self,
        target: SaRef,
        change: impl FnOnce(&mut SecurityAssociation) -> Result<(), OperationError>,
    ) -> Result<SecurityAssociation, OperationError> {
        let stored = self.records.get_mut(&model_key(target)).ok_or(OperationError::NotFound)?;
        let mut sa = stored.clone();
        change(&mut sa)?;
        *stored = sa.clone();
        Ok(sa)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(spi: u16) -> SaRef {
        SaRef { partition: Partition::Tc, spi, scid: 1 }
    }

    fn create(model: &mut ModelWorld, vcid: u8) -> SecurityAssociation {
        let op =
            Operation::Create { partition: Partition::Tc, spi: None, scid: 1, vcid, keyed: true };
        match model.apply(&op) {
            OperationResult::Ok(sa) => sa,
            OperationResult::Error(e) => unreachable!("create failed: {e:?}"),
        }
    }

    #[test]
    fn forced_start_swaps_holder() {
        let mut model = ModelWorld::new();
        create(&mut model, 0);
        create(&mut model, 0);

        assert!(model.apply(&Operation::Start { target: target(1), force: false }).is_ok());
        assert_eq!(
            model.apply(&Operation::Start { target: target(2), force: false }),
            OperationResult::Error(OperationError::ChannelHeld)
        );
        assert!(model.apply(&Operation::Start { target: target(2), force: true }).is_ok());

        let holder = model.operational(Partition::Tc, channel(1, 0)).map(|sa| sa.id);
        assert_eq!(holder, Some(SaId::new(2, 1)));
    }

    #[test]
    fn move_onto_held_channel_is_refused() {
        let mut model = ModelWorld::new();
        create(&mut model, 0);
        create(&mut model, 1);
        model.apply(&Operation::Start { target: target(1), force: false });
        model.apply(&Operation::Start { target: target(2), force: false });

        assert_eq!(
            model.apply(&Operation::Move { target: target(2), vcid: 0 }),
            OperationResult::Error(OperationError::ChannelHeld)
        );
        // A non-operational SA may share the channel.
        model.apply(&Operation::Stop { target: target(2) });
        assert!(model.apply(&Operation::Move { target: target(2), vcid: 0 }).is_ok());
    }
}
