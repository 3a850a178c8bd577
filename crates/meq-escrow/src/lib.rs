//! # meq-escrow
//!
//! Custody state machines: the invoice and milestone lifecycle, dispute
//! arbitration with resumable settlement plans, release progress
//! tracking, and the [`EscrowVault`] seam to the settlement rail.
//!
//! This crate is purely synchronous state. The async orchestration
//! that sequences `begin_* / vault / apply_*` around these machines
//! lives in `meq-engine`.

pub mod dispute;
pub mod error;
pub mod invoice;
pub mod tracker;
pub mod vault;

pub use dispute::{
    Dispute, DisputeOutcome, DisputeScope, DisputeStatus, LegState, SettlementLeg, SettlementPlan,
};
pub use error::EscrowError;
pub use invoice::{
    Invoice, InvoiceState, LogSubject, Milestone, MilestoneSpec, MilestoneState, TransitionRecord,
};
pub use tracker::Progress;
pub use vault::{EscrowVault, InMemoryVault, VaultError};
