//! Operation vocabulary shared by the model and the engine.
//!
//! Identifiers are drawn from a deliberately small domain so random
//! sequences collide often: a handful of SPIs, three spacecraft, and a few
//! virtual channels, one of which is out of range for telemetry.

use arbitrary::Arbitrary;
use sadb_core::{ErrorKind, FrameType, Gvcid, KeyBinding, SaId, SadbError};

/// Frame type, in a form `arbitrary` can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Arbitrary)]
pub enum Partition {
    /// Telecommand.
    Tc,
    /// Telemetry.
    Tm,
    /// Advanced Orbiting Systems.
    Aos,
}

impl Partition {
    /// Every partition.
    pub const ALL: [Self; 3] = [Self::Tc, Self::Tm, Self::Aos];

    /// Corresponding engine frame type.
    pub fn frame_type(self) -> FrameType {
        match self {
            Self::Tc => FrameType::Tc,
            Self::Tm => FrameType::Tm,
            Self::Aos => FrameType::Aos,
        }
    }
}

/// An SA addressed by partition and identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
pub struct SaRef {
    /// Partition.
    pub partition: Partition,
    /// Security Parameter Index.
    pub spi: u16,
    /// Spacecraft identifier.
    pub scid: u16,
}

impl SaRef {
    /// Engine identifier.
    pub fn id(self) -> SaId {
        SaId::new(self.spi, self.scid)
    }

    /// Engine frame type.
    pub fn frame_type(self) -> FrameType {
        self.partition.frame_type()
    }

    fn normalized(self) -> Self {
        Self { partition: self.partition, spi: self.spi % 6, scid: self.scid % 3 }
    }
}

/// Channel used for a spacecraft and virtual channel in the model domain.
pub fn channel(scid: u16, vcid: u8) -> Gvcid {
    Gvcid { scid, tfvn: 0, vcid, mapid: 0 }
}

/// Deterministic key material for key number `key`.
pub fn key_binding(kind: &str, key: u8) -> KeyBinding {
    KeyBinding::new(format!("kmc/model/{kind}{key}"), vec![key], 256)
}

/// Operation applied to both worlds.
#[derive(Debug, Clone, PartialEq, Eq, Arbitrary)]
pub enum Operation {
    /// Create an SA, keyed with encryption key 0 when `keyed`.
    Create {
        /// Partition.
        partition: Partition,
        /// Requested SPI; allocated when `None`.
        spi: Option<u16>,
        /// Spacecraft.
        scid: u16,
        /// Virtual channel.
        vcid: u8,
        /// Bind initial encryption key material.
        keyed: bool,
    },
    /// Bind encryption key number `key`.
    RekeyEnc {
        /// Target SA.
        target: SaRef,
        /// Key number.
        key: u8,
    },
    /// Bind authentication key number `key`.
    RekeyAuth {
        /// Target SA.
        target: SaRef,
        /// Key number.
        key: u8,
    },
    /// Start an SA.
    Start {
        /// Target SA.
        target: SaRef,
        /// Stop the channel's operational SA first.
        force: bool,
    },
    /// Stop an SA.
    Stop {
        /// Target SA.
        target: SaRef,
    },
    /// Expire an SA.
    Expire {
        /// Target SA.
        target: SaRef,
    },
    /// Delete an SA.
    Delete {
        /// Target SA.
        target: SaRef,
    },
    /// Read an SA.
    Get {
        /// Target SA.
        target: SaRef,
    },
    /// Move an SA to another virtual channel through update.
    Move {
        /// Target SA.
        target: SaRef,
        /// New virtual channel.
        vcid: u8,
    },
}

impl Operation {
    /// Fold arbitrary field values into the model domain.
    #[must_use]
    pub fn normalized(self) -> Self {
        fn vcid(raw: u8) -> u8 {
            // 8 is valid for TC and AOS but not for TM.
            match raw % 4 {
                3 => 8,
                n => n,
            }
        }

        match self {
            Self::Create { partition, spi, scid, vcid: v, keyed } => Self::Create {
                partition,
                spi: spi.map(|s| s % 6),
                scid: scid % 3,
                vcid: vcid(v),
                keyed,
            },
            Self::RekeyEnc { target, key } => Self::RekeyEnc { target: target.normalized(), key },
            Self::RekeyAuth { target, key } => Self::RekeyAuth { target: target.normalized(), key },
            Self::Start { target, force } => Self::Start { target: target.normalized(), force },
            Self::Stop { target } => Self::Stop { target: target.normalized() },
            Self::Expire { target } => Self::Expire { target: target.normalized() },
            Self::Delete { target } => Self::Delete { target: target.normalized() },
            Self::Get { target } => Self::Get { target: target.normalized() },
            Self::Move { target, vcid: v } => Self::Move { target: target.normalized(), vcid: vcid(v) },
        }
    }

    /// Whether the operation can change stored state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get { .. })
    }
}

/// Outcome of one operation. Successful operations yield the affected record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    /// The record after the operation (before it, for delete).
    Ok(sadb_core::SecurityAssociation),
    /// The operation failed.
    Error(OperationError),
}

impl OperationResult {
    /// Whether the operation succeeded.
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Whether the operation failed.
    pub fn is_err(&self) -> bool {
        !self.is_ok()
    }
}

/// Failure classes both worlds can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationError {
    /// Malformed input.
    Invalid,
    /// No such SA.
    NotFound,
    /// `(spi, scid)` already taken.
    Duplicate,
    /// Another SA is operational on the channel.
    ChannelHeld,
    /// Start on an operational SA.
    AlreadyOperational,
    /// Stop on a non-operational SA.
    NotOperational,
    /// Update tried to change the state.
    StateChange,
    /// No SPI left for the spacecraft.
    SpiExhausted,
    /// Store failure.
    Backend {
        /// Whether a retry may succeed.
        retryable: bool,
    },
}

/// How a caller should treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorProperties {
    /// Error class as the engine reports it.
    pub kind: ErrorKind,
    /// The request itself is wrong; no store state makes it succeed.
    pub is_fatal: bool,
    /// Retrying the same request unchanged may succeed.
    pub is_retryable: bool,
}

impl OperationError {
    /// Classification of this error.
    pub fn properties(&self) -> ErrorProperties {
        let kind = match self {
            Self::Invalid => ErrorKind::Validation,
            Self::NotFound => ErrorKind::NotFound,
            Self::Duplicate | Self::ChannelHeld | Self::SpiExhausted => ErrorKind::Conflict,
            Self::AlreadyOperational | Self::NotOperational | Self::StateChange => ErrorKind::State,
            Self::Backend { .. } => ErrorKind::Backend,
        };
        ErrorProperties {
            kind,
            is_fatal: matches!(self, Self::Invalid | Self::StateChange),
            is_retryable: matches!(self, Self::Backend { retryable: true }),
        }
    }
}

impl From<&SadbError> for OperationError {
    fn from(err: &SadbError) -> Self {
        use sadb_core::{ConflictError, StateError};

        match err {
            SadbError::Validation(_) => Self::Invalid,
            SadbError::NotFound { .. } => Self::NotFound,
            SadbError::Conflict(ConflictError::Duplicate { .. }) => Self::Duplicate,
            SadbError::Conflict(ConflictError::Operational { .. }) => Self::ChannelHeld,
            SadbError::Conflict(ConflictError::SpiExhausted { .. }) => Self::SpiExhausted,
            SadbError::State(StateError::AlreadyOperational { .. }) => Self::AlreadyOperational,
            SadbError::State(StateError::NotOperational { .. }) => Self::NotOperational,
            SadbError::State(StateError::UpdateChangesState { .. }) => Self::StateChange,
            SadbError::Backend { .. } => Self::Backend { retryable: err.is_retryable() },
        }
    }
}
