//! # Proposal Lifecycle
//!
//! Weighted N-of-M approval of a pending action through the state
//! machine: `Voting → Passed | Rejected | Expired | Cancelled`.
//!
//! ## Design Choice: Synchronous Tally
//!
//! The tally is recomputed inside [`Proposal::vote`], in the same call
//! that records the decisive vote. There is no separate "count the
//! votes" step, so two observers can never disagree about whether
//! quorum was reached: the status transition and the vote that caused
//! it are one atomic mutation of the proposal.
//!
//! ## Decision Rules
//!
//! - `Passed` the instant cumulative For-weight reaches the threshold.
//! - `Rejected` the instant the threshold becomes unreachable: the
//!   For-weight plus every not-yet-cast weight is below the threshold.
//!   Abstentions spend a signer's weight without contributing to either
//!   side, so an abstention can reject a proposal.
//! - `Expired` once the deadline elapses, via the idempotent
//!   [`Proposal::expire`] or lazily by a late-arriving vote.
//! - `Cancelled` by the proposer, only while no vote has been cast.
//!   Once voting has begun the only way out is a decision or expiry.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use meq_core::{ActorId, ProposalId, Timestamp};

use crate::error::QuorumError;

// ── Signers ────────────────────────────────────────────────────────────

/// A voting member of a proposal's signer set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    /// The signer's actor identifier.
    pub id: ActorId,
    /// The signer's voting weight. Zero-weight signers may vote but
    /// cannot move the tally (structural observers).
    pub weight: u64,
}

/// An immutable signer set with a passing threshold.
///
/// Validated at construction: the set is non-empty, signer identifiers
/// are distinct, and `0 < threshold ≤ total weight` so that every
/// proposal built on the set can actually pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerSet {
    signers: Vec<Signer>,
    threshold: u64,
}

impl SignerSet {
    /// Create a validated signer set.
    ///
    /// # Errors
    ///
    /// Returns [`QuorumError::InvalidSignerSet`] if the set is empty,
    /// contains duplicate identifiers, the threshold is zero, or the
    /// threshold exceeds the total weight.
    pub fn new(signers: Vec<Signer>, threshold: u64) -> Result<Self, QuorumError> {
        if signers.is_empty() {
            return Err(QuorumError::InvalidSignerSet {
                reason: "signer set is empty".to_string(),
            });
        }
        for (i, signer) in signers.iter().enumerate() {
            if signers[..i].iter().any(|s| s.id == signer.id) {
                return Err(QuorumError::InvalidSignerSet {
                    reason: format!("duplicate signer {}", signer.id),
                });
            }
        }
        if threshold == 0 {
            return Err(QuorumError::InvalidSignerSet {
                reason: "threshold must be positive".to_string(),
            });
        }
        let total: u64 = signers.iter().map(|s| s.weight).sum();
        if threshold > total {
            return Err(QuorumError::InvalidSignerSet {
                reason: format!("threshold {threshold} exceeds total weight {total}"),
            });
        }
        Ok(Self { signers, threshold })
    }

    /// The weight of the given signer, if a member of the set.
    pub fn weight_of(&self, id: &ActorId) -> Option<u64> {
        self.signers.iter().find(|s| s.id == *id).map(|s| s.weight)
    }

    /// Whether the given actor is a member of the set.
    pub fn contains(&self, id: &ActorId) -> bool {
        self.weight_of(id).is_some()
    }

    /// The weight required to pass.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// The combined weight of all signers.
    pub fn total_weight(&self) -> u64 {
        self.signers.iter().map(|s| s.weight).sum()
    }

    /// The signers in declaration order.
    pub fn signers(&self) -> &[Signer] {
        &self.signers
    }
}

// ── Votes ──────────────────────────────────────────────────────────────

/// A signer's vote on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteChoice {
    /// Approve the action.
    For,
    /// Oppose the action.
    Against,
    /// Spend the signer's weight without taking a side.
    Abstain,
}

impl VoteChoice {
    /// The canonical string name of this choice.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::For => "FOR",
            Self::Against => "AGAINST",
            Self::Abstain => "ABSTAIN",
        }
    }
}

impl std::fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Proposal Status ────────────────────────────────────────────────────

/// The lifecycle status of a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Votes are being collected.
    Voting,
    /// Cumulative For-weight reached the threshold. Terminal.
    Passed,
    /// The threshold became unreachable. Terminal.
    Rejected,
    /// The deadline elapsed before a decision. Terminal.
    Expired,
    /// Withdrawn by the proposer before any vote was cast. Terminal.
    Cancelled,
}

impl ProposalStatus {
    /// The canonical string name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Voting => "VOTING",
            Self::Passed => "PASSED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Voting)
    }
}

impl std::fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Status Transition Record ───────────────────────────────────────────

/// A record of a single status transition, for the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Status before the transition.
    pub from_status: ProposalStatus,
    /// Status after the transition.
    pub to_status: ProposalStatus,
    /// The actor whose command caused the transition, if any.
    pub actor: Option<ActorId>,
    /// When the transition occurred.
    pub timestamp: Timestamp,
}

// ── The Proposal ───────────────────────────────────────────────────────

/// A pending action awaiting multi-party authorization.
///
/// The action payload is opaque to this crate; the proposal's owner
/// interprets it once the proposal passes. Signer set, threshold, and
/// deadline are fixed at creation. Votes are immutable once cast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    /// Unique proposal identifier.
    pub id: ProposalId,
    /// The actor that raised the proposal.
    pub proposer: ActorId,
    /// Opaque action payload, interpreted by the proposal's owner.
    pub action: serde_json::Value,
    /// The eligible signers and passing threshold.
    pub signer_set: SignerSet,
    /// Votes cast so far. At most one per signer.
    pub votes: HashMap<ActorId, VoteChoice>,
    /// Current lifecycle status.
    pub status: ProposalStatus,
    /// Hard deadline for reaching a decision.
    pub deadline: Timestamp,
    /// When the proposal was created.
    pub created_at: Timestamp,
    /// When the proposal reached a terminal status, if it has.
    pub decided_at: Option<Timestamp>,
    /// Ordered log of all status transitions.
    pub transition_log: Vec<StatusRecord>,
}

impl Proposal {
    /// Open a new proposal in `Voting` status.
    ///
    /// # Errors
    ///
    /// Returns [`QuorumError::DeadlineExpired`] if the deadline is not in
    /// the future of `now`.
    pub fn open(
        proposer: ActorId,
        action: serde_json::Value,
        signer_set: SignerSet,
        deadline: Timestamp,
        now: Timestamp,
    ) -> Result<Self, QuorumError> {
        if deadline <= now {
            return Err(QuorumError::DeadlineExpired {
                deadline: deadline.to_string(),
            });
        }
        Ok(Self {
            id: ProposalId::new(),
            proposer,
            action,
            signer_set,
            votes: HashMap::new(),
            status: ProposalStatus::Voting,
            deadline,
            created_at: now,
            decided_at: None,
            transition_log: Vec::new(),
        })
    }

    /// Cast a vote and recompute the tally.
    ///
    /// Returns the proposal's status after the vote, which is `Passed`
    /// or `Rejected` if this vote was decisive.
    ///
    /// # Errors
    ///
    /// - [`QuorumError::ProposalClosed`] if the proposal already reached
    ///   a terminal status.
    /// - [`QuorumError::DeadlineExpired`] if `now` is past the deadline;
    ///   the proposal is marked `Expired` as a side effect.
    /// - [`QuorumError::UnknownSigner`] if the voter is not in the set.
    /// - [`QuorumError::AlreadyVoted`] if the voter already voted.
    pub fn vote(
        &mut self,
        signer: ActorId,
        choice: VoteChoice,
        now: Timestamp,
    ) -> Result<ProposalStatus, QuorumError> {
        if self.status.is_terminal() {
            return Err(QuorumError::ProposalClosed {
                status: self.status.to_string(),
            });
        }
        if now > self.deadline {
            self.transition(ProposalStatus::Expired, Some(signer), now);
            return Err(QuorumError::DeadlineExpired {
                deadline: self.deadline.to_string(),
            });
        }
        if !self.signer_set.contains(&signer) {
            return Err(QuorumError::UnknownSigner {
                signer: signer.to_string(),
            });
        }
        if self.votes.contains_key(&signer) {
            return Err(QuorumError::AlreadyVoted {
                signer: signer.to_string(),
            });
        }
        self.votes.insert(signer, choice);

        let threshold = self.signer_set.threshold();
        if self.for_weight() >= threshold {
            self.transition(ProposalStatus::Passed, Some(signer), now);
        } else if self.for_weight() + self.unvoted_weight() < threshold {
            self.transition(ProposalStatus::Rejected, Some(signer), now);
        }
        Ok(self.status)
    }

    /// Expire the proposal if its deadline has passed.
    ///
    /// Idempotent: callable by any actor or a scheduler, has no effect
    /// on an already-decided proposal or before the deadline. Returns
    /// the status after the call.
    pub fn expire(&mut self, now: Timestamp) -> ProposalStatus {
        if self.status == ProposalStatus::Voting && now > self.deadline {
            self.transition(ProposalStatus::Expired, None, now);
        }
        self.status
    }

    /// Cancel the proposal before any vote has been cast.
    ///
    /// Only the proposer may cancel, and only while the vote map is
    /// empty: signers actively evaluating an action must not have it
    /// withdrawn underneath them.
    ///
    /// # Errors
    ///
    /// - [`QuorumError::UnauthorizedActor`] if `by` is not the proposer.
    /// - [`QuorumError::ProposalClosed`] if already terminal.
    /// - [`QuorumError::CancellationRejected`] if voting has begun.
    pub fn cancel(&mut self, by: ActorId, now: Timestamp) -> Result<(), QuorumError> {
        if by != self.proposer {
            return Err(QuorumError::UnauthorizedActor {
                actor: by.to_string(),
                required: "proposer".to_string(),
            });
        }
        if self.status.is_terminal() {
            return Err(QuorumError::ProposalClosed {
                status: self.status.to_string(),
            });
        }
        if !self.votes.is_empty() {
            return Err(QuorumError::CancellationRejected {
                reason: format!("{} vote(s) already cast", self.votes.len()),
            });
        }
        self.transition(ProposalStatus::Cancelled, Some(by), now);
        Ok(())
    }

    /// Cumulative weight voted `For`.
    pub fn for_weight(&self) -> u64 {
        self.weight_where(VoteChoice::For)
    }

    /// Cumulative weight voted `Against`.
    pub fn against_weight(&self) -> u64 {
        self.weight_where(VoteChoice::Against)
    }

    /// Cumulative weight that abstained.
    pub fn abstain_weight(&self) -> u64 {
        self.weight_where(VoteChoice::Abstain)
    }

    /// Combined weight of signers that have not yet voted.
    pub fn unvoted_weight(&self) -> u64 {
        self.signer_set
            .signers()
            .iter()
            .filter(|s| !self.votes.contains_key(&s.id))
            .map(|s| s.weight)
            .sum()
    }

    /// The vote cast by the given signer, if any.
    pub fn vote_of(&self, signer: &ActorId) -> Option<VoteChoice> {
        self.votes.get(signer).copied()
    }

    fn weight_where(&self, choice: VoteChoice) -> u64 {
        self.votes
            .iter()
            .filter(|(_, c)| **c == choice)
            .filter_map(|(id, _)| self.signer_set.weight_of(id))
            .sum()
    }

    fn transition(&mut self, to: ProposalStatus, actor: Option<ActorId>, now: Timestamp) {
        self.transition_log.push(StatusRecord {
            from_status: self.status,
            to_status: to,
            actor,
            timestamp: now,
        });
        self.status = to;
        if to.is_terminal() {
            self.decided_at = Some(now);
        }
    }
}
