//! # meq-quorum — Quorum Approval Engine
//!
//! Generic N-of-M weighted voting over a pending action:
//!
//! - **Error** ([`error`]): Structured error hierarchy for the voting
//!   subsystem.
//!
//! - **Proposal** ([`proposal`]): Proposal lifecycle with an immutable
//!   signer set, one immutable vote per signer, synchronous tally on
//!   every vote, and deadline-driven expiry.
//!
//! The engine is deliberately ignorant of what it is approving: the
//! action payload is an opaque JSON value owned by whichever subsystem
//! created the proposal. Dispute overrides and treasury-style payment
//! proposals both ride on this crate unchanged.

pub mod error;
pub mod proposal;

// Re-export primary types for ergonomic imports.
pub use error::QuorumError;
pub use proposal::{
    Proposal, ProposalStatus, Signer, SignerSet, StatusRecord, VoteChoice,
};
