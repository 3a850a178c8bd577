//! # Disputes
//!
//! A dispute contests either a single milestone or the whole invoice.
//! While open it blocks release of its target; it leaves the `Open`
//! status only through a resolution whose settlement has been confirmed
//! by the vault, leg by leg.
//!
//! ## Settlement Plan
//!
//! A resolution outcome can require up to two fund movements (a `Split`
//! pays the payee and refunds the payer). The vault confirms each
//! instruction independently, so the dispute carries a
//! [`SettlementPlan`] tracking each leg through
//! `Pending → InFlight → Confirmed`. A leg is marked `InFlight` under
//! the invoice lock before its vault instruction is issued, so a
//! concurrent resolver can never hand the same leg to the vault twice.
//! A failure between the two legs of a split returns the rejected leg
//! to `Pending` and can be retried without re-submitting the confirmed
//! leg.

use serde::{Deserialize, Serialize};

use meq_core::{ActorId, Amount, DisputeId, InvoiceId, Timestamp};

// ── Scope ──────────────────────────────────────────────────────────────

/// What a dispute contests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeScope {
    /// The whole invoice: every unreleased milestone is blocked.
    Invoice,
    /// A single milestone, by sequence index.
    Milestone(u32),
}

impl std::fmt::Display for DisputeScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invoice => f.write_str("invoice"),
            Self::Milestone(seq) => write!(f, "milestone {seq}"),
        }
    }
}

// ── Status and Outcome ─────────────────────────────────────────────────

/// The lifecycle status of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisputeStatus {
    /// The dispute blocks release of its target.
    Open,
    /// A resolution has been applied and its settlement confirmed.
    /// Terminal.
    Resolved,
}

impl DisputeStatus {
    /// The canonical string name of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Resolved => "RESOLVED",
        }
    }
}

impl std::fmt::Display for DisputeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a dispute settles the contested amount.
///
/// "Released" in the milestone sense means settled, not necessarily
/// paid to the payee: a `RefundToPayer` outcome still marks the target
/// milestone released, with a zero payee share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeOutcome {
    /// The full contested amount goes to the payee.
    ReleaseToPayee,
    /// The full contested amount returns to the payer.
    RefundToPayer,
    /// The contested amount is divided: `to_payee` to the payee, the
    /// remainder back to the payer.
    Split {
        /// The payee's share of the contested amount.
        to_payee: Amount,
    },
}

impl std::fmt::Display for DisputeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReleaseToPayee => f.write_str("release_to_payee"),
            Self::RefundToPayer => f.write_str("refund_to_payer"),
            Self::Split { to_payee } => write!(f, "split({to_payee} to payee)"),
        }
    }
}

// ── Settlement Plan ────────────────────────────────────────────────────

/// One leg of a settlement plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementLeg {
    /// The movement to the payee.
    Payee,
    /// The movement back to the payer.
    Payer,
}

/// Where one leg stands between decision and vault confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LegState {
    /// Not yet handed to the vault.
    Pending,
    /// Handed to the vault; its outcome is not yet known.
    InFlight,
    /// Confirmed by the vault. Terminal.
    Confirmed,
}

/// The fund movements a resolution requires, with per-leg tracking.
///
/// A zero-amount leg needs no vault instruction and starts `Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPlan {
    /// The outcome this plan realizes.
    pub outcome: DisputeOutcome,
    /// Amount to move to the payee.
    pub to_payee: Amount,
    /// Amount to return to the payer.
    pub to_payer: Amount,
    /// State of the payee movement.
    pub payee_leg: LegState,
    /// State of the payer movement.
    pub payer_leg: LegState,
}

impl SettlementPlan {
    /// Build a plan for the given outcome over the contested amount.
    pub fn for_outcome(outcome: DisputeOutcome, contested: Amount) -> Self {
        let (to_payee, to_payer) = match outcome {
            DisputeOutcome::ReleaseToPayee => (contested, Amount::ZERO),
            DisputeOutcome::RefundToPayer => (Amount::ZERO, contested),
            DisputeOutcome::Split { to_payee } => (
                to_payee,
                contested.checked_sub(to_payee).unwrap_or(Amount::ZERO),
            ),
        };
        let initial = |amount: Amount| {
            if amount.is_zero() {
                LegState::Confirmed
            } else {
                LegState::Pending
            }
        };
        Self {
            outcome,
            to_payee,
            to_payer,
            payee_leg: initial(to_payee),
            payer_leg: initial(to_payer),
        }
    }

    /// The state of the given leg.
    pub fn leg_state(&self, leg: SettlementLeg) -> LegState {
        match leg {
            SettlementLeg::Payee => self.payee_leg,
            SettlementLeg::Payer => self.payer_leg,
        }
    }

    fn leg_state_mut(&mut self, leg: SettlementLeg) -> &mut LegState {
        match leg {
            SettlementLeg::Payee => &mut self.payee_leg,
            SettlementLeg::Payer => &mut self.payer_leg,
        }
    }

    /// Legs not yet handed to the vault, in execution order.
    pub fn pending_legs(&self) -> Vec<(SettlementLeg, Amount)> {
        let mut legs = Vec::new();
        if self.payee_leg == LegState::Pending {
            legs.push((SettlementLeg::Payee, self.to_payee));
        }
        if self.payer_leg == LegState::Pending {
            legs.push((SettlementLeg::Payer, self.to_payer));
        }
        legs
    }

    /// Whether a leg is at the vault right now.
    pub fn has_leg_in_flight(&self) -> bool {
        self.payee_leg == LegState::InFlight || self.payer_leg == LegState::InFlight
    }

    /// Whether every leg has been confirmed.
    pub fn is_complete(&self) -> bool {
        self.payee_leg == LegState::Confirmed && self.payer_leg == LegState::Confirmed
    }

    /// Hand the leg to the vault.
    pub fn begin_leg(&mut self, leg: SettlementLeg) {
        *self.leg_state_mut(leg) = LegState::InFlight;
    }

    /// Record that the vault confirmed the leg.
    pub fn confirm_leg(&mut self, leg: SettlementLeg) {
        *self.leg_state_mut(leg) = LegState::Confirmed;
    }

    /// Return a rejected leg to `Pending` so it can be retried.
    pub fn abort_leg(&mut self, leg: SettlementLeg) {
        *self.leg_state_mut(leg) = LegState::Pending;
    }
}

// ── The Dispute ────────────────────────────────────────────────────────

/// A dispute raised against an invoice or one of its milestones.
///
/// Owned by its invoice: archiving the invoice archives its disputes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispute {
    /// Unique dispute identifier.
    pub id: DisputeId,
    /// The invoice this dispute is bound to.
    pub invoice_id: InvoiceId,
    /// What the dispute contests.
    pub scope: DisputeScope,
    /// The actor that raised the dispute (payer or payee).
    pub raised_by: ActorId,
    /// Free-text reason supplied by the raiser.
    pub reason: String,
    /// Current status.
    pub status: DisputeStatus,
    /// The resolution outcome, once resolved.
    pub outcome: Option<DisputeOutcome>,
    /// The actor whose authority resolved the dispute (arbitrator, or
    /// the proposer of a passed quorum proposal).
    pub resolved_by: Option<ActorId>,
    /// In-flight settlement, present from resolution instruction until
    /// every leg is confirmed.
    pub settlement: Option<SettlementPlan>,
    /// When the dispute was raised.
    pub raised_at: Timestamp,
    /// When the dispute was resolved, if it has been.
    pub resolved_at: Option<Timestamp>,
}

impl Dispute {
    /// Raise a new dispute in `Open` status.
    pub fn raise(
        invoice_id: InvoiceId,
        scope: DisputeScope,
        raised_by: ActorId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: DisputeId::new(),
            invoice_id,
            scope,
            raised_by,
            reason: reason.into(),
            status: DisputeStatus::Open,
            outcome: None,
            resolved_by: None,
            settlement: None,
            raised_at: Timestamp::now(),
            resolved_at: None,
        }
    }

    /// Whether the dispute blocks release of the given milestone.
    pub fn blocks_milestone(&self, seq: u32) -> bool {
        self.status == DisputeStatus::Open
            && match self.scope {
                DisputeScope::Invoice => true,
                DisputeScope::Milestone(target) => target == seq,
            }
    }
}
