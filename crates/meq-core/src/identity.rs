//! # Domain Identity Newtypes
//!
//! Newtype wrappers for every identifier in the MEQ engine. Type-level
//! separation between identifier namespaces prevents cross-namespace
//! confusion — an `ActorId` cannot stand in for an `InvoiceId` at any
//! call site.
//!
//! Actor identifiers arrive from an external authentication collaborator;
//! the engine treats them as opaque and already-authenticated.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create an identifier from an existing UUID.
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Access the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for an invoice (the custody record).
    InvoiceId,
    "invoice"
);

uuid_id!(
    /// Unique identifier for a dispute raised against an invoice.
    DisputeId,
    "dispute"
);

uuid_id!(
    /// Unique identifier for a quorum approval proposal.
    ProposalId,
    "proposal"
);

uuid_id!(
    /// Opaque identifier for an authenticated actor (payer, payee,
    /// arbitrator, or signer).
    ActorId,
    "actor"
);
