//! # Actor Roles
//!
//! The closed set of roles an actor can hold with respect to an invoice
//! or proposal. Authorization sites match on this enum exhaustively, so
//! adding a role forces every check to be revisited at compile time.

use serde::{Deserialize, Serialize};

/// The role of an actor with respect to a custody record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The party funding the invoice.
    Payer,
    /// The party entitled to released funds.
    Payee,
    /// A designated third party empowered to resolve disputes.
    Arbitrator,
    /// A member of the invoice's declared quorum signer set.
    Signer,
}

impl Role {
    /// The canonical string name of this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Payer => "PAYER",
            Self::Payee => "PAYEE",
            Self::Arbitrator => "ARBITRATOR",
            Self::Signer => "SIGNER",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
