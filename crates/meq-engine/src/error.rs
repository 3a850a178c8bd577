//! # Engine Error Surface
//!
//! One error type for the whole command surface, wrapping the escrow
//! and quorum taxonomies. Each variant maps to a stable machine code
//! via [`EngineError::code`], so callers embedding the engine can
//! branch without string-matching display text.

use thiserror::Error;

use meq_core::{InvoiceId, ProposalId};
use meq_escrow::EscrowError;
use meq_quorum::QuorumError;

/// Errors surfaced by engine commands and queries.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A custody state machine rejected the command.
    #[error(transparent)]
    Escrow(#[from] EscrowError),

    /// The voting subsystem rejected the command.
    #[error(transparent)]
    Quorum(#[from] QuorumError),

    /// No invoice with the given identifier is registered.
    #[error("unknown invoice {0}")]
    UnknownInvoice(InvoiceId),

    /// No proposal with the given identifier is registered.
    #[error("unknown proposal {0}")]
    UnknownProposal(ProposalId),

    /// The invoice's audit log failed verification; all mutation is
    /// refused until operators intervene.
    #[error("invoice {0} is halted pending audit recovery")]
    InvoiceHalted(InvoiceId),

    /// The caller lacks the role the command requires.
    #[error("actor {actor} is not authorized: requires {required}")]
    Unauthorized {
        /// The actor that issued the command.
        actor: String,
        /// The role(s) that would have been required.
        required: String,
    },
}

impl EngineError {
    /// A stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Escrow(inner) => match inner {
                EscrowError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
                EscrowError::UnauthorizedActor { .. } => "UNAUTHORIZED_ACTOR",
                EscrowError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
                EscrowError::InvalidMilestoneSchedule { .. } => "INVALID_MILESTONE_SCHEDULE",
                EscrowError::DuplicateDispute { .. } => "DUPLICATE_DISPUTE",
                EscrowError::UnknownMilestone { .. } => "UNKNOWN_MILESTONE",
                EscrowError::UnknownDispute { .. } => "UNKNOWN_DISPUTE",
                EscrowError::SettlementInFlight { .. } => "SETTLEMENT_IN_FLIGHT",
                EscrowError::VaultTransferFailed { .. } => "VAULT_TRANSFER_FAILED",
                EscrowError::AuditLogCorrupted { .. } => "AUDIT_LOG_CORRUPTED",
            },
            Self::Quorum(inner) => match inner {
                QuorumError::UnknownSigner { .. } => "UNKNOWN_SIGNER",
                QuorumError::AlreadyVoted { .. } => "ALREADY_VOTED",
                QuorumError::ProposalClosed { .. } => "PROPOSAL_CLOSED",
                QuorumError::DeadlineExpired { .. } => "DEADLINE_EXPIRED",
                QuorumError::InvalidSignerSet { .. } => "INVALID_SIGNER_SET",
                QuorumError::CancellationRejected { .. } => "CANCELLATION_REJECTED",
                QuorumError::UnauthorizedActor { .. } => "UNAUTHORIZED_ACTOR",
            },
            Self::UnknownInvoice(_) => "UNKNOWN_INVOICE",
            Self::UnknownProposal(_) => "UNKNOWN_PROPOSAL",
            Self::InvoiceHalted(_) => "INVOICE_HALTED",
            Self::Unauthorized { .. } => "UNAUTHORIZED_ACTOR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = EngineError::Unauthorized {
            actor: "actor:x".to_string(),
            required: "payer".to_string(),
        };
        assert_eq!(err.code(), "UNAUTHORIZED_ACTOR");

        let err = EngineError::from(EscrowError::DuplicateDispute {
            scope: "milestone 1".to_string(),
        });
        assert_eq!(err.code(), "DUPLICATE_DISPUTE");

        let err = EngineError::from(QuorumError::ProposalClosed {
            status: "PASSED".to_string(),
        });
        assert_eq!(err.code(), "PROPOSAL_CLOSED");
    }
}
