//! Model-based testing harness for the SA lifecycle engine.
//!
//! [`ModelWorld`] is an executable reference model: a map of records and the
//! lifecycle rules written out directly, with no store, no transactions and
//! no shared code with the engine's state machine. [`EngineWorld`] drives a
//! real [`SaEngine`](sadb_core::SaEngine) with the same [`Operation`]s. Tests
//! and fuzz targets apply one operation sequence to both and compare results.

#![forbid(unsafe_code)]

pub mod engine_world;
pub mod invariants;
pub mod model;
pub mod operation;

pub use engine_world::EngineWorld;
pub use invariants::{InvariantViolation, check_invariants};
pub use model::ModelWorld;
pub use operation::{
    ErrorProperties, Operation, OperationError, OperationResult, Partition, SaRef, channel,
    key_binding,
};
