//! # Escrow Error Types
//!
//! The failure taxonomy for custody operations. Every variant names the
//! state, role, or numeric invariant that was violated — enough for a
//! caller to explain "why" without seeing internal storage.

use thiserror::Error;

use meq_core::Amount;

use crate::vault::VaultError;

/// Errors from the invoice, milestone, and dispute state machines.
#[derive(Error, Debug)]
pub enum EscrowError {
    /// The command is not valid from the invoice's current state.
    /// Always recoverable: the caller can choose a valid command.
    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        /// Current state name.
        from: String,
        /// Attempted target state or operation.
        to: String,
        /// Why the transition was rejected.
        reason: String,
    },

    /// The caller lacks the role required for this command.
    #[error("actor {actor} is not authorized: requires {required}")]
    UnauthorizedActor {
        /// The actor that issued the command.
        actor: String,
        /// The role(s) that would have been required.
        required: String,
    },

    /// A numeric invariant was violated at input.
    #[error("amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch {
        /// The amount the invariant requires.
        expected: Amount,
        /// The amount that was supplied.
        actual: Amount,
    },

    /// The milestone schedule is not fundable.
    #[error("invalid milestone schedule: {reason}")]
    InvalidMilestoneSchedule {
        /// The schedule rule that was violated.
        reason: String,
    },

    /// An open dispute already targets the same scope.
    #[error("an open dispute already targets {scope}")]
    DuplicateDispute {
        /// The contested scope.
        scope: String,
    },

    /// No milestone with the given sequence index exists.
    #[error("unknown milestone {seq}")]
    UnknownMilestone {
        /// The sequence index that was requested.
        seq: u32,
    },

    /// No dispute with the given identifier exists on this invoice.
    #[error("unknown dispute {dispute}")]
    UnknownDispute {
        /// The dispute identifier that was requested.
        dispute: String,
    },

    /// A settlement instruction for this target is already in flight.
    #[error("settlement already in flight: {detail}")]
    SettlementInFlight {
        /// What is being settled.
        detail: String,
    },

    /// The external settlement rail rejected a fund movement. Invoice
    /// state is left unchanged, never partially advanced.
    #[error("vault transfer failed: {reason}")]
    VaultTransferFailed {
        /// The rail's rejection reason.
        reason: String,
    },

    /// The append-only audit log failed its chain-consistency check.
    /// Fatal for the affected invoice: all further mutation is halted
    /// pending manual recovery.
    #[error("audit log corrupted for {invoice_id} at entry {index}")]
    AuditLogCorrupted {
        /// The affected invoice.
        invoice_id: String,
        /// Index of the first inconsistent entry.
        index: usize,
    },
}

impl From<VaultError> for EscrowError {
    fn from(err: VaultError) -> Self {
        EscrowError::VaultTransferFailed {
            reason: err.to_string(),
        }
    }
}
