//! # meq-engine — Milestone Escrow Orchestration
//!
//! The async command surface tying the workspace together:
//!
//! - **Engine** ([`engine`]): Per-invoice locking, the two-phase
//!   begin/vault/apply settlement protocol, dispute escalation to
//!   quorum votes, and the proposal expiry sweeper.
//!
//! - **Events** ([`events`]): Exactly-once announcement of committed
//!   state changes through a pluggable [`EventSink`].
//!
//! - **Error** ([`error`]): One error surface with stable machine
//!   codes.
//!
//! The engine owns no I/O beyond the injected [`EscrowVault`] and
//! [`EventSink`]; persistence, transport, and authentication belong to
//! the embedding application.
//!
//! [`EscrowVault`]: meq_escrow::EscrowVault

pub mod engine;
pub mod error;
pub mod events;

pub use engine::{EscrowEngine, ResolutionPath, SweeperHandle};
pub use error::EngineError;
pub use events::{ChannelSink, EngineEvent, EventEnvelope, EventSink, MemorySink, NullSink};
