//! # meq-core — Foundational Types for the MEQ Engine
//!
//! Leaf crate of the MEQ workspace: validated domain primitives shared by
//! every other crate. It depends on nothing internal.
//!
//! ## Key Design Principles
//!
//! 1. **Newtype wrappers for domain identifiers.** `InvoiceId`, `DisputeId`,
//!    `ProposalId`, `ActorId` — UUID newtypes with distinct namespaces. You
//!    cannot pass a `DisputeId` where an `InvoiceId` is expected, and no
//!    bare strings carry identity.
//!
//! 2. **Integer money.** [`Amount`] is a `u64` of minor units with checked
//!    arithmetic only. Monetary values are never floating point and never
//!    silently wrap.
//!
//! 3. **UTC-only timestamps.** [`Timestamp`] enforces UTC with Z suffix and
//!    seconds precision, so audit entries and deadlines are unambiguous.
//!
//! 4. **Closed role enumeration.** [`Role`] has exactly four variants and is
//!    matched exhaustively at every authorization site.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `meq-*` crates (this is the leaf of the DAG).
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.
//! - All public types derive `Debug`, `Clone`, and implement
//!   `Serialize`/`Deserialize`.

pub mod amount;
pub mod error;
pub mod identity;
pub mod role;
pub mod temporal;

// Re-export primary types for ergonomic imports.
pub use amount::{Amount, AssetCode};
pub use error::CoreError;
pub use identity::{ActorId, DisputeId, InvoiceId, ProposalId};
pub use role::Role;
pub use temporal::Timestamp;
