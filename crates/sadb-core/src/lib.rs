//! Security Association lifecycle and key-state engine
//!
//! Manages the lifecycle of Security Associations (SAs) protecting space link
//! channels: creation with SPI allocation, rekeying, activation, deactivation,
//! expiry and deletion, over a pluggable transactional store.
//!
//! # Architecture
//!
//! Transition rules live in a pure state machine ([`lifecycle`]) with no
//! knowledge of storage. The engine ([`engine`]) composes it with the SPI
//! allocator and the exclusivity enforcer under one store transaction per
//! call, so every operation either commits completely or leaves the store
//! unchanged.
//!
//! Storage is abstracted behind [`Store`] and [`Session`]. The in-memory
//! store shipped here serves tests and embedders without durability needs;
//! durable adapters live in their own crates.
//!
//! # Invariants
//!
//! - `(spi, scid)` identifies at most one SA per frame type
//! - At most one SA per channel tuple is `OPERATIONAL`
//! - Key references are only present while an SA is `KEYED` or `OPERATIONAL`
//!
//! # Components
//!
//! - [`sa`]: Identifiers, channel tuples and the SA record
//! - [`lifecycle`]: Transition rules
//! - [`store`]: Store and session contract
//! - [`memory`]: In-memory store
//! - [`spi`]: SPI allocation
//! - [`exclusivity`]: One operational SA per channel
//! - [`engine`]: Public operation set
//! - [`error`]: Error types

pub mod engine;
pub mod error;
pub mod exclusivity;
pub mod lifecycle;
pub mod memory;
pub mod sa;
pub mod spi;
pub mod store;

pub use engine::{EngineConfig, SaEngine};
pub use error::{ConflictError, ErrorKind, SadbError, StateError, ValidationError};
pub use lifecycle::{Lifecycle, RekeyPolicy, Transition};
pub use memory::{MemorySession, MemoryStore};
pub use sa::{
    FrameType, Gvcid, KeyBinding, NewSecurityAssociation, SaId, SaState, SecurityAssociation,
};
pub use store::{Predicate, Session, Store, StoreError};
