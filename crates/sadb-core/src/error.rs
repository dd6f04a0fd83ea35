//! Error types for the SA lifecycle engine.
//!
//! Domain failures (validation, not-found, conflict, state) are separate
//! variants from store failures so callers can tell a business-rule violation,
//! which will fail again on retry, from a transient backend problem.

use thiserror::Error;

use crate::{
    sa::{FrameType, Gvcid, SaId, SaState},
    store::StoreError,
};

/// Malformed input, rejected before the store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A required channel field was not supplied.
    #[error("missing required field {field}")]
    MissingField {
        /// Field name.
        field: &'static str,
    },

    /// A field exceeds the range its frame type allows.
    #[error("{field} {value} exceeds the {frame_type} maximum of {max}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Supplied value.
        value: u32,
        /// Largest allowed value.
        max: u32,
        /// Frame type whose limits apply.
        frame_type: FrameType,
    },

    /// SPI 0 is reserved.
    #[error("SPI 0 is reserved")]
    ReservedSpi,

    /// Key references present on a record whose state forbids them.
    #[error("SA {id} carries key references while {state}")]
    KeysInState {
        /// Offending record.
        id: SaId,
        /// Its state.
        state: SaState,
    },
}

/// The requested change collides with existing records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictError {
    /// `(spi, scid)` already taken in the partition.
    #[error("an SA with the SPI/SCID combination {id} already exists in {frame_type}")]
    Duplicate {
        /// Partition.
        frame_type: FrameType,
        /// Existing identifier.
        id: SaId,
    },

    /// Another SA is already operational on the channel.
    #[error("SA {blocking} is already operational for GVCID {gvcid}, cannot start {requested}")]
    Operational {
        /// Partition.
        frame_type: FrameType,
        /// SA the caller asked to start.
        requested: SaId,
        /// SA currently operational on the channel.
        blocking: SaId,
        /// The shared channel.
        gvcid: Gvcid,
    },

    /// Every SPI for the spacecraft is in use.
    #[error("no SPI left to allocate for SCID {scid} in {frame_type}")]
    SpiExhausted {
        /// Partition.
        frame_type: FrameType,
        /// Spacecraft identifier.
        scid: u16,
    },
}

/// The operation is not valid for the SA's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Start on an operational SA.
    #[error("SA {id} ({frame_type}) is already operational")]
    AlreadyOperational {
        /// Partition.
        frame_type: FrameType,
        /// Target SA.
        id: SaId,
    },

    /// Stop on an SA that is not operational.
    #[error("SA {id} ({frame_type}) is {state}, not operational, cannot stop")]
    NotOperational {
        /// Partition.
        frame_type: FrameType,
        /// Target SA.
        id: SaId,
        /// Its current state.
        state: SaState,
    },

    /// Update attempted a state change that only lifecycle operations may make.
    #[error("SA {id} ({frame_type}) cannot move from {from} to {to} through update")]
    UpdateChangesState {
        /// Partition.
        frame_type: FrameType,
        /// Target SA.
        id: SaId,
        /// Stored state.
        from: SaState,
        /// State carried by the update.
        to: SaState,
    },
}

/// Error returned by every engine operation.
#[derive(Debug, Error)]
pub enum SadbError {
    /// Malformed input.
    #[error("invalid security association: {0}")]
    Validation(#[from] ValidationError),

    /// No record for the identifier.
    #[error("SA {id} ({frame_type}) does not exist, cannot {operation}")]
    NotFound {
        /// Partition searched.
        frame_type: FrameType,
        /// Missing identifier.
        id: SaId,
        /// Operation that needed the record.
        operation: &'static str,
    },

    /// Duplicate identifier or operational conflict.
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Operation invalid for the current state.
    #[error(transparent)]
    State(#[from] StateError),

    /// The store failed. The original cause is kept as the error source.
    #[error("store failure during {operation}{}: {source}", target(.frame_type, .id))]
    Backend {
        /// Operation that was running.
        operation: &'static str,
        /// Partition the operation addressed, when it addressed one.
        frame_type: Option<FrameType>,
        /// SA the operation was working on, when known.
        id: Option<SaId>,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
}

/// Fieldless discriminant of [`SadbError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`SadbError::Validation`].
    Validation,
    /// See [`SadbError::NotFound`].
    NotFound,
    /// See [`SadbError::Conflict`].
    Conflict,
    /// See [`SadbError::State`].
    State,
    /// See [`SadbError::Backend`].
    Backend,
}

impl SadbError {
    /// Wrap a store failure raised while running `operation`.
    pub fn backend(operation: &'static str, source: StoreError) -> Self {
        Self::Backend { operation, frame_type: None, id: None, source }
    }

    /// Wrap a store failure raised while `operation` worked on SA `id`.
    pub fn backend_on(
        operation: &'static str,
        frame_type: FrameType,
        id: SaId,
        source: StoreError,
    ) -> Self {
        Self::Backend { operation, frame_type: Some(frame_type), id: Some(id), source }
    }

    /// Name the SA a store failure concerns, keeping any target already set.
    ///
    /// Errors other than `Backend` already carry their identifiers and are
    /// returned unchanged.
    #[must_use]
    pub fn for_sa(mut self, partition: FrameType, sa: Option<SaId>) -> Self {
        if let Self::Backend { frame_type, id, .. } = &mut self {
            if frame_type.is_none() {
                *frame_type = Some(partition);
            }
            if id.is_none() {
                *id = sa;
            }
        }
        self
    }

    /// Which class of failure this is.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::State(_) => ErrorKind::State,
            Self::Backend { .. } => ErrorKind::Backend,
        }
    }

    /// Whether retrying the same call may succeed.
    ///
    /// Only transient store failures qualify. Business-rule violations fail the
    /// same way until the stored state changes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backend { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}

/// ` on SA 2/5 (TC)`, ` in TC`, or nothing when the target is unknown.
#[allow(clippy::ref_option)]
fn target(frame_type: &Option<FrameType>, id: &Option<SaId>) -> String {
    match (frame_type, id) {
        (Some(frame_type), Some(id)) => format!(" on SA {id} ({frame_type})"),
        (None, Some(id)) => format!(" on SA {id}"),
        (Some(frame_type), None) => format!(" in {frame_type}"),
        (None, None) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn messages_name_the_offending_identifiers() {
        let err = SadbError::from(ConflictError::Operational {
            frame_type: FrameType::Tc,
            requested: SaId::new(2, 5),
            blocking: SaId::new(1, 5),
            gvcid: Gvcid { scid: 5, tfvn: 1, vcid: 2, mapid: 0 },
        });
        assert_eq!(
            err.to_string(),
            "SA 1/5 is already operational for GVCID (scid 5, tfvn 1, vcid 2, mapid 0), \
             cannot start 2/5"
        );

        let err = SadbError::backend("stop", StoreError::NotConnected)
            .for_sa(FrameType::Aos, Some(SaId::new(3, 44)));
        assert_eq!(
            err.to_string(),
            "store failure during stop on SA 3/44 (AOS): store is not connected"
        );

        // A more specific target set closer to the failure is kept.
        let rival = SaId::new(1, 5);
        let err = SadbError::backend_on("start", FrameType::Tc, rival, StoreError::Poisoned)
            .for_sa(FrameType::Tc, Some(SaId::new(2, 5)));
        assert!(matches!(err, SadbError::Backend { id: Some(id), .. } if id == rival));

        let err = SadbError::NotFound {
            frame_type: FrameType::Tm,
            id: SaId::new(9, 44),
            operation: "stop",
        };
        assert_eq!(err.to_string(), "SA 9/44 (TM) does not exist, cannot stop");
    }

    #[test]
    fn only_transient_backend_failures_are_retryable() {
        let transient = SadbError::backend("start", StoreError::NotConnected);
        assert_eq!(transient.kind(), ErrorKind::Backend);
        assert!(transient.is_retryable());
        assert!(transient.source().is_some());

        let permanent = SadbError::backend("create", StoreError::NoTransaction);
        assert!(!permanent.is_retryable());
        assert_eq!(permanent.to_string(), "store failure during create: no active transaction");

        let state = SadbError::from(StateError::AlreadyOperational {
            frame_type: FrameType::Tc,
            id: SaId::new(1, 5),
        });
        assert_eq!(state.kind(), ErrorKind::State);
        assert!(!state.is_retryable());
    }
}
