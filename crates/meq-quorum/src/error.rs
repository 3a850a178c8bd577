//! # Quorum Error Types
//!
//! Every failure names the signer, status, or invariant that was
//! violated, so a caller can explain the rejection without inspecting
//! internal state.

use thiserror::Error;

/// Errors from the quorum approval engine.
#[derive(Error, Debug)]
pub enum QuorumError {
    /// The voter is not a member of the proposal's signer set.
    #[error("unknown signer {signer}")]
    UnknownSigner {
        /// The actor that attempted to vote.
        signer: String,
    },

    /// The signer has already cast a vote; votes are immutable.
    #[error("signer {signer} has already voted")]
    AlreadyVoted {
        /// The actor that attempted to vote again.
        signer: String,
    },

    /// The proposal is no longer accepting votes.
    #[error("proposal is closed with status {status}")]
    ProposalClosed {
        /// The proposal's terminal status.
        status: String,
    },

    /// The proposal's deadline has passed.
    #[error("proposal deadline {deadline} has passed")]
    DeadlineExpired {
        /// The deadline that elapsed.
        deadline: String,
    },

    /// The signer set or threshold is not a valid quorum configuration.
    #[error("invalid signer set: {reason}")]
    InvalidSignerSet {
        /// The configuration rule that was violated.
        reason: String,
    },

    /// Cancellation is not available for this proposal.
    #[error("cancellation rejected: {reason}")]
    CancellationRejected {
        /// Why cancellation was refused.
        reason: String,
    },

    /// The caller lacks the required standing for this operation.
    #[error("actor {actor} is not authorized: requires {required}")]
    UnauthorizedActor {
        /// The actor that issued the command.
        actor: String,
        /// The standing that would have been required.
        required: String,
    },
}
