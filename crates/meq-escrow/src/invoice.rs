//! # Invoice and Milestone Lifecycle
//!
//! The invoice is the aggregate root: it owns its milestone schedule,
//! its disputes, and an append-only audit log of every state change.
//! All custody decisions are made here, under whatever lock the caller
//! holds; the vault only ever executes movements this module has
//! already authorized.
//!
//! ## Two-Phase Settlement
//!
//! Fund movements confirm asynchronously, so any operation that moves
//! value is split into a `begin_*` step (marks the in-flight state,
//! still under lock), the vault call (no lock held), and an `apply_*`
//! or `abort_*` step (re-acquires the lock, commits or rolls back).
//! The in-flight marker is what prevents a concurrent duplicate
//! movement while the lock is released.
//!
//! ## Audit Chain
//!
//! Every mutation appends a [`TransitionRecord`]. Before mutating, the
//! log is re-verified: each record's `from_state` must equal the
//! previous record's `to_state` for the same subject. A chain break
//! halts the invoice until operators intervene.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use meq_core::{ActorId, Amount, AssetCode, DisputeId, InvoiceId, Role, Timestamp};
use meq_quorum::SignerSet;

use crate::dispute::{
    Dispute, DisputeOutcome, DisputeScope, DisputeStatus, LegState, SettlementLeg, SettlementPlan,
};
use crate::error::EscrowError;

// ── States ─────────────────────────────────────────────────────────────

/// Invoice lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvoiceState {
    /// Schedule is editable; no funds held.
    Draft,
    /// Full amount is in custody; schedule is frozen.
    Funded,
    /// Milestones may be approved, released, and disputed.
    Active,
    /// Every milestone settled. Terminal.
    Completed,
    /// Outstanding funds returned to the payer. Terminal.
    Refunded,
}

impl InvoiceState {
    /// The canonical string name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Funded => "FUNDED",
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Refunded)
    }
}

impl std::fmt::Display for InvoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Milestone lifecycle state.
///
/// `Released` means settled: the milestone's amount has left custody,
/// whether it went to the payee, back to the payer, or was split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MilestoneState {
    /// Deliverable not yet accepted.
    Pending,
    /// Accepted by the payer; eligible for release.
    Approved,
    /// A release instruction is in flight at the vault.
    Releasing,
    /// Target of an open milestone-scoped dispute.
    Disputed,
    /// Settled. Terminal.
    Released,
}

impl MilestoneState {
    /// The canonical string name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Releasing => "RELEASING",
            Self::Disputed => "DISPUTED",
            Self::Released => "RELEASED",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released)
    }
}

impl std::fmt::Display for MilestoneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Audit log ──────────────────────────────────────────────────────────

/// Which state machine a log record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogSubject {
    /// The invoice-level state machine.
    Invoice,
    /// The milestone at the given sequence index.
    Milestone(u32),
}

impl std::fmt::Display for LogSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invoice => f.write_str("invoice"),
            Self::Milestone(seq) => write!(f, "milestone {seq}"),
        }
    }
}

/// One entry in the append-only audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// The state machine this record belongs to.
    pub subject: LogSubject,
    /// The actor whose command caused the transition, if attributable.
    pub actor: Option<ActorId>,
    /// State before the transition.
    pub from_state: String,
    /// State after the transition.
    pub to_state: String,
    /// Operator-facing context for the transition.
    pub note: Option<String>,
    /// When the transition was recorded.
    pub timestamp: Timestamp,
}

// ── Milestones ─────────────────────────────────────────────────────────

/// Caller-supplied milestone definition, used while the invoice is in
/// `Draft`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MilestoneSpec {
    /// What the milestone delivers.
    pub description: String,
    /// The portion of the invoice total attached to this milestone.
    pub amount: Amount,
}

/// A unit of work with a fixed share of the invoice total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    /// Position in the schedule, assigned at creation. Stable once the
    /// invoice leaves `Draft`.
    pub seq: u32,
    /// What the milestone delivers.
    pub description: String,
    /// The amount attached to this milestone.
    pub amount: Amount,
    /// Current state.
    pub state: MilestoneState,
    /// What the payee actually received once settled. Equals `amount`
    /// for an undisputed release; may be less (down to zero) when a
    /// dispute resolution split or refunded the milestone.
    pub payee_amount: Option<Amount>,
    /// When the payer approved the deliverable.
    pub approved_at: Option<Timestamp>,
    /// When the milestone settled.
    pub released_at: Option<Timestamp>,
}

impl Milestone {
    fn from_spec(seq: u32, spec: MilestoneSpec) -> Self {
        Self {
            seq,
            description: spec.description,
            amount: spec.amount,
            state: MilestoneState::Pending,
            payee_amount: None,
            approved_at: None,
            released_at: None,
        }
    }
}

// ── The Invoice ────────────────────────────────────────────────────────

/// An escrowed invoice: parties, milestone schedule, disputes, and the
/// audit log tying them together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Unique invoice identifier.
    pub id: InvoiceId,
    /// The party funding the escrow.
    pub payer: ActorId,
    /// The party delivering the work.
    pub payee: ActorId,
    /// Optional neutral third party with resolution authority.
    pub arbitrator: Option<ActorId>,
    /// Declared signer set for quorum decisions on this invoice, used
    /// when a dispute must be resolved without an arbitrator.
    pub signer_set: Option<SignerSet>,
    /// The asset held in custody.
    pub asset: AssetCode,
    /// The milestone schedule, ordered by `seq`.
    pub milestones: Vec<Milestone>,
    /// All disputes ever raised on this invoice.
    pub disputes: Vec<Dispute>,
    /// Current lifecycle state.
    pub state: InvoiceState,
    /// Whether a custody hold instruction is at the vault.
    pub funding_in_flight: bool,
    /// Whether a whole-invoice refund instruction is at the vault.
    pub refund_in_flight: bool,
    /// Append-only audit log.
    pub transition_log: Vec<TransitionRecord>,
    /// When the invoice was created.
    pub created_at: Timestamp,
}

impl Invoice {
    /// Create an invoice in `Draft` with the given schedule. The
    /// schedule must be non-empty with every amount positive; draft
    /// edits re-validate the same rules.
    pub fn new(
        payer: ActorId,
        payee: ActorId,
        arbitrator: Option<ActorId>,
        signer_set: Option<SignerSet>,
        asset: AssetCode,
        specs: Vec<MilestoneSpec>,
    ) -> Result<Self, EscrowError> {
        if payer == payee {
            return Err(EscrowError::InvalidMilestoneSchedule {
                reason: "payer and payee must be distinct actors".to_string(),
            });
        }
        if specs.is_empty() {
            return Err(EscrowError::InvalidMilestoneSchedule {
                reason: "schedule has no milestones".to_string(),
            });
        }
        for (i, spec) in specs.iter().enumerate() {
            Self::validate_spec_amount(i as u32, spec)?;
        }
        if Amount::checked_sum(specs.iter().map(|s| s.amount)).is_none() {
            return Err(EscrowError::InvalidMilestoneSchedule {
                reason: "milestone amounts overflow".to_string(),
            });
        }
        let milestones = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Milestone::from_spec(i as u32, spec))
            .collect();
        Ok(Self {
            id: InvoiceId::new(),
            payer,
            payee,
            arbitrator,
            signer_set,
            asset,
            milestones,
            disputes: Vec::new(),
            state: InvoiceState::Draft,
            funding_in_flight: false,
            refund_in_flight: false,
            transition_log: Vec::new(),
            created_at: Timestamp::now(),
        })
    }

    fn validate_spec_amount(seq: u32, spec: &MilestoneSpec) -> Result<(), EscrowError> {
        if spec.amount.is_zero() {
            return Err(EscrowError::InvalidMilestoneSchedule {
                reason: format!("milestone {seq} has a zero amount"),
            });
        }
        Ok(())
    }

    // ── Accessors ──────────────────────────────────────────────────────

    /// The role of the given actor on this invoice, if any. Party
    /// roles take precedence over declared signer membership.
    pub fn role_of(&self, actor: ActorId) -> Option<Role> {
        if actor == self.payer {
            Some(Role::Payer)
        } else if actor == self.payee {
            Some(Role::Payee)
        } else if self.arbitrator == Some(actor) {
            Some(Role::Arbitrator)
        } else if self
            .signer_set
            .as_ref()
            .is_some_and(|set| set.contains(&actor))
        {
            Some(Role::Signer)
        } else {
            None
        }
    }

    /// The milestone at the given sequence index.
    pub fn milestone(&self, seq: u32) -> Result<&Milestone, EscrowError> {
        self.milestones
            .iter()
            .find(|m| m.seq == seq)
            .ok_or(EscrowError::UnknownMilestone { seq })
    }

    fn milestone_mut(&mut self, seq: u32) -> Result<&mut Milestone, EscrowError> {
        self.milestones
            .iter_mut()
            .find(|m| m.seq == seq)
            .ok_or(EscrowError::UnknownMilestone { seq })
    }

    /// The dispute with the given identifier.
    pub fn dispute(&self, id: DisputeId) -> Result<&Dispute, EscrowError> {
        self.disputes
            .iter()
            .find(|d| d.id == id)
            .ok_or(EscrowError::UnknownDispute {
                dispute: id.to_string(),
            })
    }

    fn dispute_mut(&mut self, id: DisputeId) -> Result<&mut Dispute, EscrowError> {
        self.disputes
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(EscrowError::UnknownDispute {
                dispute: id.to_string(),
            })
    }

    /// Open disputes, in the order raised.
    pub fn open_disputes(&self) -> impl Iterator<Item = &Dispute> {
        self.disputes
            .iter()
            .filter(|d| d.status == DisputeStatus::Open)
    }

    /// Whether any dispute on this invoice is open.
    pub fn is_disputed(&self) -> bool {
        self.open_disputes().next().is_some()
    }

    /// Whether an open dispute blocks the given milestone.
    pub fn has_open_dispute_covering(&self, seq: u32) -> bool {
        self.open_disputes().any(|d| d.blocks_milestone(seq))
    }

    /// Sum of all milestone amounts.
    pub fn total_amount(&self) -> Result<Amount, EscrowError> {
        Amount::checked_sum(self.milestones.iter().map(|m| m.amount)).ok_or(
            EscrowError::InvalidMilestoneSchedule {
                reason: "milestone amounts overflow".to_string(),
            },
        )
    }

    /// Sum of settled milestone amounts.
    pub fn released_amount(&self) -> Amount {
        Amount::checked_sum(
            self.milestones
                .iter()
                .filter(|m| m.state == MilestoneState::Released)
                .map(|m| m.amount),
        )
        .unwrap_or(Amount::ZERO)
    }

    /// Sum of unsettled milestone amounts.
    pub fn outstanding_amount(&self) -> Amount {
        Amount::checked_sum(
            self.milestones
                .iter()
                .filter(|m| m.state != MilestoneState::Released)
                .map(|m| m.amount),
        )
        .unwrap_or(Amount::ZERO)
    }

    // ── Draft editing ──────────────────────────────────────────────────

    fn require_editable(&self) -> Result<(), EscrowError> {
        self.require_state(&[InvoiceState::Draft], "edit schedule")?;
        if self.funding_in_flight {
            return Err(EscrowError::SettlementInFlight {
                detail: "funding of this invoice is in flight".to_string(),
            });
        }
        Ok(())
    }

    /// Append a milestone to the schedule. `Draft` only.
    pub fn add_milestone(&mut self, spec: MilestoneSpec) -> Result<u32, EscrowError> {
        self.require_editable()?;
        let seq = self.milestones.len() as u32;
        Self::validate_spec_amount(seq, &spec)?;
        self.milestones.push(Milestone::from_spec(seq, spec));
        Ok(seq)
    }

    /// Replace a milestone's description and amount. `Draft` only.
    pub fn update_milestone(&mut self, seq: u32, spec: MilestoneSpec) -> Result<(), EscrowError> {
        self.require_editable()?;
        Self::validate_spec_amount(seq, &spec)?;
        let milestone = self.milestone_mut(seq)?;
        milestone.description = spec.description;
        milestone.amount = spec.amount;
        Ok(())
    }

    /// Remove a milestone and close the gap in the sequence. `Draft`
    /// only.
    pub fn remove_milestone(&mut self, seq: u32) -> Result<(), EscrowError> {
        self.require_editable()?;
        let idx = self
            .milestones
            .iter()
            .position(|m| m.seq == seq)
            .ok_or(EscrowError::UnknownMilestone { seq })?;
        self.milestones.remove(idx);
        for (i, m) in self.milestones.iter_mut().enumerate() {
            m.seq = i as u32;
        }
        Ok(())
    }

    // ── Funding ────────────────────────────────────────────────────────

    /// Check that the schedule is fundable and that `amount` covers it
    /// exactly. Returns the validated total.
    pub fn validate_funding(&self, amount: Amount) -> Result<Amount, EscrowError> {
        self.require_state(&[InvoiceState::Draft], "fund")?;
        if self.milestones.is_empty() {
            return Err(EscrowError::InvalidMilestoneSchedule {
                reason: "schedule has no milestones".to_string(),
            });
        }
        let total = self.total_amount()?;
        if amount != total {
            return Err(EscrowError::AmountMismatch {
                expected: total,
                actual: amount,
            });
        }
        Ok(total)
    }

    /// Start funding the invoice. Validates the schedule against
    /// `amount`, freezes the draft, and returns the total the vault
    /// must take into custody. The caller commits with [`apply_funded`]
    /// or rolls back with [`abort_funding`].
    ///
    /// [`apply_funded`]: Self::apply_funded
    /// [`abort_funding`]: Self::abort_funding
    pub fn begin_funding(&mut self, amount: Amount) -> Result<Amount, EscrowError> {
        self.verify_log()?;
        if self.funding_in_flight {
            return Err(EscrowError::SettlementInFlight {
                detail: "funding of this invoice is already in flight".to_string(),
            });
        }
        let total = self.validate_funding(amount)?;
        self.funding_in_flight = true;
        Ok(total)
    }

    /// Commit funding once the vault has confirmed custody. Moves
    /// `Draft` to `Funded`, then activates immediately; both steps are
    /// logged so the audit trail shows the full path.
    pub fn apply_funded(&mut self, actor: ActorId) -> Result<(), EscrowError> {
        self.verify_log()?;
        self.require_state(&[InvoiceState::Draft], "fund")?;
        if !self.funding_in_flight {
            return Err(EscrowError::InvalidStateTransition {
                from: self.state.to_string(),
                to: InvoiceState::Funded.to_string(),
                reason: "no funding in flight".to_string(),
            });
        }
        self.funding_in_flight = false;
        self.record_invoice_transition(InvoiceState::Funded, Some(actor), Some("custody confirmed"));
        self.record_invoice_transition(InvoiceState::Active, Some(actor), None);
        Ok(())
    }

    /// Roll back a funding attempt the vault rejected. The draft
    /// becomes editable again.
    pub fn abort_funding(&mut self) -> Result<(), EscrowError> {
        if !self.funding_in_flight {
            return Err(EscrowError::InvalidStateTransition {
                from: self.state.to_string(),
                to: InvoiceState::Funded.to_string(),
                reason: "no funding in flight".to_string(),
            });
        }
        self.funding_in_flight = false;
        Ok(())
    }

    // ── Approval and release ───────────────────────────────────────────

    /// Accept a milestone's deliverable, making it eligible for
    /// release.
    pub fn approve_milestone(&mut self, seq: u32, actor: ActorId) -> Result<(), EscrowError> {
        self.verify_log()?;
        self.require_state(&[InvoiceState::Active], "approve milestone")?;
        if self.has_open_dispute_covering(seq) {
            return Err(EscrowError::InvalidStateTransition {
                from: self.milestone(seq)?.state.to_string(),
                to: MilestoneState::Approved.to_string(),
                reason: "an open dispute covers this milestone".to_string(),
            });
        }
        let milestone = self.milestone_mut(seq)?;
        if milestone.state != MilestoneState::Pending {
            return Err(EscrowError::InvalidStateTransition {
                from: milestone.state.to_string(),
                to: MilestoneState::Approved.to_string(),
                reason: "only a pending milestone can be approved".to_string(),
            });
        }
        milestone.approved_at = Some(Timestamp::now());
        self.record_milestone_transition(seq, MilestoneState::Approved, Some(actor), None)?;
        Ok(())
    }

    /// Start releasing an approved milestone. Marks the milestone
    /// `Releasing` and returns the amount the vault must move to the
    /// payee. The caller commits with [`apply_released`] or rolls back
    /// with [`abort_release`].
    ///
    /// [`apply_released`]: Self::apply_released
    /// [`abort_release`]: Self::abort_release
    pub fn begin_release(&mut self, seq: u32, actor: ActorId) -> Result<Amount, EscrowError> {
        self.verify_log()?;
        self.require_state(&[InvoiceState::Active], "release milestone")?;
        if self.refund_in_flight {
            return Err(EscrowError::SettlementInFlight {
                detail: "a refund of this invoice is in flight".to_string(),
            });
        }
        if self.has_open_dispute_covering(seq) {
            return Err(EscrowError::InvalidStateTransition {
                from: self.milestone(seq)?.state.to_string(),
                to: MilestoneState::Releasing.to_string(),
                reason: "an open dispute covers this milestone".to_string(),
            });
        }
        let milestone = self.milestone(seq)?;
        match milestone.state {
            MilestoneState::Approved => {}
            MilestoneState::Releasing => {
                return Err(EscrowError::SettlementInFlight {
                    detail: format!("milestone {seq} is already releasing"),
                })
            }
            other => {
                return Err(EscrowError::InvalidStateTransition {
                    from: other.to_string(),
                    to: MilestoneState::Releasing.to_string(),
                    reason: "only an approved milestone can be released".to_string(),
                })
            }
        }
        let amount = milestone.amount;
        // Conservation bound, re-checked before the vault is
        // instructed even though the fixed schedule already implies it.
        let total = self.total_amount()?;
        let released = self.released_amount();
        if released.checked_add(amount).map_or(true, |sum| sum > total) {
            return Err(EscrowError::AmountMismatch {
                expected: total.checked_sub(released).unwrap_or(Amount::ZERO),
                actual: amount,
            });
        }
        self.record_milestone_transition(seq, MilestoneState::Releasing, Some(actor), None)?;
        Ok(amount)
    }

    /// Commit a release the vault has confirmed. The milestone settles
    /// with its full amount as the payee's share.
    pub fn apply_released(&mut self, seq: u32, actor: ActorId) -> Result<(), EscrowError> {
        self.verify_log()?;
        self.require_milestone_state(seq, MilestoneState::Releasing, "commit release")?;
        {
            let milestone = self.milestone_mut(seq)?;
            milestone.payee_amount = Some(milestone.amount);
            milestone.released_at = Some(Timestamp::now());
        }
        self.record_milestone_transition(seq, MilestoneState::Released, Some(actor), None)?;
        self.maybe_complete(Some(actor));
        Ok(())
    }

    /// Roll back a release the vault rejected. The milestone returns to
    /// `Approved` and can be retried.
    pub fn abort_release(
        &mut self,
        seq: u32,
        actor: ActorId,
        note: &str,
    ) -> Result<(), EscrowError> {
        self.verify_log()?;
        self.require_milestone_state(seq, MilestoneState::Releasing, "abort release")?;
        self.record_milestone_transition(seq, MilestoneState::Approved, Some(actor), Some(note))?;
        Ok(())
    }

    // ── Disputes ───────────────────────────────────────────────────────

    /// Raise a dispute against a milestone or the whole invoice.
    pub fn raise_dispute(
        &mut self,
        scope: DisputeScope,
        raised_by: ActorId,
        reason: impl Into<String>,
    ) -> Result<DisputeId, EscrowError> {
        self.verify_log()?;
        self.require_state(&[InvoiceState::Active], "raise dispute")?;
        if self
            .open_disputes()
            .any(|d| d.scope == scope)
        {
            return Err(EscrowError::DuplicateDispute {
                scope: scope.to_string(),
            });
        }
        match scope {
            DisputeScope::Milestone(seq) => {
                let milestone = self.milestone(seq)?;
                match milestone.state {
                    MilestoneState::Pending | MilestoneState::Approved => {}
                    MilestoneState::Releasing => {
                        return Err(EscrowError::SettlementInFlight {
                            detail: format!("milestone {seq} is releasing"),
                        })
                    }
                    other => {
                        return Err(EscrowError::InvalidStateTransition {
                            from: other.to_string(),
                            to: MilestoneState::Disputed.to_string(),
                            reason: "milestone is not contestable".to_string(),
                        })
                    }
                }
            }
            DisputeScope::Invoice => {
                if self
                    .milestones
                    .iter()
                    .any(|m| m.state == MilestoneState::Releasing)
                {
                    return Err(EscrowError::SettlementInFlight {
                        detail: "a milestone release is in flight".to_string(),
                    });
                }
                if self.refund_in_flight {
                    return Err(EscrowError::SettlementInFlight {
                        detail: "a refund of this invoice is in flight".to_string(),
                    });
                }
            }
        }

        let dispute = Dispute::raise(self.id, scope, raised_by, reason);
        let dispute_id = dispute.id;
        self.disputes.push(dispute);
        if let DisputeScope::Milestone(seq) = scope {
            self.record_milestone_transition(
                seq,
                MilestoneState::Disputed,
                Some(raised_by),
                Some("dispute raised"),
            )?;
        } else {
            self.record_invoice_transition(
                self.state,
                Some(raised_by),
                Some("invoice-wide dispute raised"),
            );
        }
        Ok(dispute_id)
    }

    /// The amount an open dispute contests: the target milestone's
    /// amount, or every unsettled milestone for an invoice-wide
    /// dispute.
    pub fn contested_amount(&self, dispute_id: DisputeId) -> Result<Amount, EscrowError> {
        let dispute = self.dispute(dispute_id)?;
        match dispute.scope {
            DisputeScope::Milestone(seq) => Ok(self.milestone(seq)?.amount),
            DisputeScope::Invoice => Ok(self.outstanding_amount()),
        }
    }

    /// Record the resolution outcome and build (or resume) its
    /// settlement plan. The dispute stays `Open` until every leg of the
    /// plan is confirmed and [`finalize_resolution`] runs.
    ///
    /// A retry after a partial settlement failure must carry the same
    /// outcome; the returned plan skips legs already confirmed.
    ///
    /// [`finalize_resolution`]: Self::finalize_resolution
    pub fn begin_resolution(
        &mut self,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
        resolved_by: ActorId,
    ) -> Result<SettlementPlan, EscrowError> {
        self.verify_log()?;
        let contested = self.contested_amount(dispute_id)?;
        if let DisputeOutcome::Split { to_payee } = outcome {
            if to_payee > contested {
                return Err(EscrowError::AmountMismatch {
                    expected: contested,
                    actual: to_payee,
                });
            }
        }
        let dispute = self.dispute_mut(dispute_id)?;
        if dispute.status != DisputeStatus::Open {
            return Err(EscrowError::InvalidStateTransition {
                from: dispute.status.to_string(),
                to: DisputeStatus::Resolved.to_string(),
                reason: "dispute is already resolved".to_string(),
            });
        }
        if let Some(existing) = dispute.settlement {
            if existing.outcome != outcome {
                return Err(EscrowError::SettlementInFlight {
                    detail: format!(
                        "settlement for outcome {} is partially confirmed",
                        existing.outcome
                    ),
                });
            }
            if existing.has_leg_in_flight() {
                return Err(EscrowError::SettlementInFlight {
                    detail: "a settlement leg is at the vault".to_string(),
                });
            }
            return Ok(existing);
        }
        let plan = SettlementPlan::for_outcome(outcome, contested);
        dispute.outcome = Some(outcome);
        dispute.resolved_by = Some(resolved_by);
        dispute.settlement = Some(plan);
        Ok(plan)
    }

    /// Take the next pending settlement leg and mark it in flight,
    /// returning the movement the vault must execute. `None` once every
    /// leg has been handed over. Fails while another leg is at the
    /// vault, so two resolvers can never issue the same movement.
    pub fn begin_settlement_leg(
        &mut self,
        dispute_id: DisputeId,
    ) -> Result<Option<(SettlementLeg, Amount)>, EscrowError> {
        self.verify_log()?;
        let plan = self.settlement_plan_mut(dispute_id)?;
        if plan.has_leg_in_flight() {
            return Err(EscrowError::SettlementInFlight {
                detail: "a settlement leg is at the vault".to_string(),
            });
        }
        let next = plan.pending_legs().first().copied();
        if let Some((leg, _)) = next {
            plan.begin_leg(leg);
        }
        Ok(next)
    }

    /// Record that the vault confirmed an in-flight settlement leg.
    pub fn confirm_settlement_leg(
        &mut self,
        dispute_id: DisputeId,
        leg: SettlementLeg,
    ) -> Result<(), EscrowError> {
        let plan = self.settlement_plan_mut(dispute_id)?;
        if plan.leg_state(leg) != LegState::InFlight {
            return Err(EscrowError::SettlementInFlight {
                detail: format!("no in-flight {:?} leg to confirm", leg),
            });
        }
        plan.confirm_leg(leg);
        Ok(())
    }

    /// Return a settlement leg the vault rejected to pending, so the
    /// resolution can be retried.
    pub fn abort_settlement_leg(
        &mut self,
        dispute_id: DisputeId,
        leg: SettlementLeg,
    ) -> Result<(), EscrowError> {
        let plan = self.settlement_plan_mut(dispute_id)?;
        if plan.leg_state(leg) != LegState::InFlight {
            return Err(EscrowError::SettlementInFlight {
                detail: format!("no in-flight {:?} leg to abort", leg),
            });
        }
        plan.abort_leg(leg);
        Ok(())
    }

    fn settlement_plan_mut(
        &mut self,
        dispute_id: DisputeId,
    ) -> Result<&mut SettlementPlan, EscrowError> {
        let dispute = self.dispute_mut(dispute_id)?;
        let status = dispute.status;
        dispute
            .settlement
            .as_mut()
            .ok_or(EscrowError::InvalidStateTransition {
                from: status.to_string(),
                to: DisputeStatus::Resolved.to_string(),
                reason: "no settlement plan".to_string(),
            })
    }

    /// Close a dispute whose settlement plan is fully confirmed,
    /// settling the milestones it covered.
    pub fn finalize_resolution(
        &mut self,
        dispute_id: DisputeId,
        actor: ActorId,
    ) -> Result<(), EscrowError> {
        self.verify_log()?;
        let (scope, plan) = {
            let dispute = self.dispute(dispute_id)?;
            let plan = dispute.settlement.ok_or(EscrowError::InvalidStateTransition {
                from: dispute.status.to_string(),
                to: DisputeStatus::Resolved.to_string(),
                reason: "no settlement plan to finalize".to_string(),
            })?;
            (dispute.scope, plan)
        };
        if !plan.is_complete() {
            let unconfirmed = [SettlementLeg::Payee, SettlementLeg::Payer]
                .iter()
                .filter(|&&leg| plan.leg_state(leg) != LegState::Confirmed)
                .count();
            return Err(EscrowError::SettlementInFlight {
                detail: format!("{unconfirmed} legs unconfirmed"),
            });
        }

        let now = Timestamp::now();
        match scope {
            DisputeScope::Milestone(seq) => {
                {
                    let milestone = self.milestone_mut(seq)?;
                    milestone.payee_amount = Some(plan.to_payee);
                    milestone.released_at = Some(now);
                }
                self.record_milestone_transition(
                    seq,
                    MilestoneState::Released,
                    Some(actor),
                    Some("settled by dispute resolution"),
                )?;
            }
            DisputeScope::Invoice => {
                // Allocate the payee's share greedily by sequence, so
                // the settlement of each milestone is deterministic.
                let mut remaining = plan.to_payee;
                let seqs: Vec<u32> = self
                    .milestones
                    .iter()
                    .filter(|m| m.state != MilestoneState::Released)
                    .map(|m| m.seq)
                    .collect();
                for seq in seqs {
                    {
                        let milestone = self.milestone_mut(seq)?;
                        let share = remaining.min(milestone.amount);
                        remaining = remaining.checked_sub(share).unwrap_or(Amount::ZERO);
                        milestone.payee_amount = Some(share);
                        milestone.released_at = Some(now);
                    }
                    self.record_milestone_transition(
                        seq,
                        MilestoneState::Released,
                        Some(actor),
                        Some("settled by dispute resolution"),
                    )?;
                }
            }
        }

        let dispute = self.dispute_mut(dispute_id)?;
        dispute.status = DisputeStatus::Resolved;
        dispute.resolved_at = Some(now);
        self.maybe_complete(Some(actor));
        Ok(())
    }

    // ── Refund ─────────────────────────────────────────────────────────

    /// Start refunding every unsettled milestone to the payer. Returns
    /// the amount the vault must return. Blocked while any dispute is
    /// open or any settlement is in flight.
    pub fn begin_refund(&mut self, _actor: ActorId) -> Result<Amount, EscrowError> {
        self.verify_log()?;
        self.require_state(&[InvoiceState::Funded, InvoiceState::Active], "refund")?;
        if self.refund_in_flight {
            return Err(EscrowError::SettlementInFlight {
                detail: "a refund of this invoice is already in flight".to_string(),
            });
        }
        if self.is_disputed() {
            return Err(EscrowError::InvalidStateTransition {
                from: self.state.to_string(),
                to: InvoiceState::Refunded.to_string(),
                reason: "open disputes must be resolved first".to_string(),
            });
        }
        if self
            .milestones
            .iter()
            .any(|m| m.state == MilestoneState::Releasing)
        {
            return Err(EscrowError::SettlementInFlight {
                detail: "a milestone release is in flight".to_string(),
            });
        }
        self.refund_in_flight = true;
        Ok(self.outstanding_amount())
    }

    /// Commit a refund the vault has confirmed. Unsettled milestones
    /// settle with a zero payee share and the invoice terminates as
    /// `Refunded`.
    pub fn apply_refunded(&mut self, actor: ActorId) -> Result<(), EscrowError> {
        self.verify_log()?;
        if !self.refund_in_flight {
            return Err(EscrowError::InvalidStateTransition {
                from: self.state.to_string(),
                to: InvoiceState::Refunded.to_string(),
                reason: "no refund in flight".to_string(),
            });
        }
        let now = Timestamp::now();
        let seqs: Vec<u32> = self
            .milestones
            .iter()
            .filter(|m| m.state != MilestoneState::Released)
            .map(|m| m.seq)
            .collect();
        for seq in seqs {
            {
                let milestone = self.milestone_mut(seq)?;
                milestone.payee_amount = Some(Amount::ZERO);
                milestone.released_at = Some(now);
            }
            self.record_milestone_transition(
                seq,
                MilestoneState::Released,
                Some(actor),
                Some("refunded to payer"),
            )?;
        }
        self.refund_in_flight = false;
        self.record_invoice_transition(InvoiceState::Refunded, Some(actor), None);
        Ok(())
    }

    /// Roll back a refund the vault rejected.
    pub fn abort_refund(&mut self) -> Result<(), EscrowError> {
        if !self.refund_in_flight {
            return Err(EscrowError::InvalidStateTransition {
                from: self.state.to_string(),
                to: InvoiceState::Refunded.to_string(),
                reason: "no refund in flight".to_string(),
            });
        }
        self.refund_in_flight = false;
        Ok(())
    }

    // ── Completion ─────────────────────────────────────────────────────

    /// Move to `Completed` if every milestone has settled. Idempotent;
    /// a no-op while anything is open or in flight.
    pub fn maybe_complete(&mut self, actor: Option<ActorId>) -> bool {
        let done = self.state == InvoiceState::Active
            && !self.refund_in_flight
            && !self.is_disputed()
            && self
                .milestones
                .iter()
                .all(|m| m.state == MilestoneState::Released);
        if done {
            self.record_invoice_transition(InvoiceState::Completed, actor, None);
        }
        done
    }

    // ── Audit log ──────────────────────────────────────────────────────

    /// Verify the chain consistency of the audit log: for each subject,
    /// every record's `from_state` must equal the previous record's
    /// `to_state`.
    pub fn verify_log(&self) -> Result<(), EscrowError> {
        let mut last: HashMap<LogSubject, &str> = HashMap::new();
        for (index, record) in self.transition_log.iter().enumerate() {
            if let Some(prev_to) = last.get(&record.subject) {
                if record.from_state != *prev_to {
                    return Err(EscrowError::AuditLogCorrupted {
                        invoice_id: self.id.to_string(),
                        index,
                    });
                }
            }
            last.insert(record.subject, record.to_state.as_str());
        }
        Ok(())
    }

    fn require_state(&self, expected: &[InvoiceState], op: &str) -> Result<(), EscrowError> {
        if expected.contains(&self.state) {
            Ok(())
        } else {
            Err(EscrowError::InvalidStateTransition {
                from: self.state.to_string(),
                to: op.to_string(),
                reason: format!(
                    "requires one of [{}]",
                    expected
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            })
        }
    }

    fn require_milestone_state(
        &self,
        seq: u32,
        expected: MilestoneState,
        op: &str,
    ) -> Result<(), EscrowError> {
        let milestone = self.milestone(seq)?;
        if milestone.state == expected {
            Ok(())
        } else {
            Err(EscrowError::InvalidStateTransition {
                from: milestone.state.to_string(),
                to: op.to_string(),
                reason: format!("requires {}", expected),
            })
        }
    }

    fn record_invoice_transition(
        &mut self,
        to: InvoiceState,
        actor: Option<ActorId>,
        note: Option<&str>,
    ) {
        self.transition_log.push(TransitionRecord {
            subject: LogSubject::Invoice,
            actor,
            from_state: self.state.as_str().to_string(),
            to_state: to.as_str().to_string(),
            note: note.map(String::from),
            timestamp: Timestamp::now(),
        });
        self.state = to;
    }

    fn record_milestone_transition(
        &mut self,
        seq: u32,
        to: MilestoneState,
        actor: Option<ActorId>,
        note: Option<&str>,
    ) -> Result<(), EscrowError> {
        let from = self.milestone(seq)?.state;
        self.transition_log.push(TransitionRecord {
            subject: LogSubject::Milestone(seq),
            actor,
            from_state: from.as_str().to_string(),
            to_state: to.as_str().to_string(),
            note: note.map(String::from),
            timestamp: Timestamp::now(),
        });
        self.milestone_mut(seq)?.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn usd() -> AssetCode {
        AssetCode::new("USD").unwrap()
    }

    fn specs(amounts: &[u64]) -> Vec<MilestoneSpec> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, &a)| MilestoneSpec {
                description: format!("phase {i}"),
                amount: Amount::from_minor(a),
            })
            .collect()
    }

    fn draft_invoice(amounts: &[u64]) -> Invoice {
        Invoice::new(
            ActorId::new(),
            ActorId::new(),
            Some(ActorId::new()),
            None,
            usd(),
            specs(amounts),
        )
        .unwrap()
    }

    fn active_invoice(amounts: &[u64]) -> Invoice {
        let mut invoice = draft_invoice(amounts);
        let total = invoice.total_amount().unwrap();
        invoice.begin_funding(total).unwrap();
        invoice.apply_funded(invoice.payer).unwrap();
        invoice
    }

    fn settle_all_legs(invoice: &mut Invoice, dispute_id: DisputeId) {
        while let Some((leg, _)) = invoice.begin_settlement_leg(dispute_id).unwrap() {
            invoice.confirm_settlement_leg(dispute_id, leg).unwrap();
        }
    }

    #[test]
    fn test_new_invoice_is_draft() {
        let invoice = draft_invoice(&[1000, 1000, 1000]);
        assert_eq!(invoice.state, InvoiceState::Draft);
        assert_eq!(invoice.total_amount().unwrap(), Amount::from_minor(3000));
        assert!(invoice.transition_log.is_empty());
    }

    #[test]
    fn test_payer_must_differ_from_payee() {
        let actor = ActorId::new();
        let err = Invoice::new(actor, actor, None, None, usd(), specs(&[100]));
        assert!(err.is_err());
    }

    #[test]
    fn test_creation_rejects_empty_and_zero_schedules() {
        let payer = ActorId::new();
        let payee = ActorId::new();
        assert!(matches!(
            Invoice::new(payer, payee, None, None, usd(), specs(&[])),
            Err(EscrowError::InvalidMilestoneSchedule { .. })
        ));
        assert!(matches!(
            Invoice::new(payer, payee, None, None, usd(), specs(&[1000, 0])),
            Err(EscrowError::InvalidMilestoneSchedule { .. })
        ));
    }

    #[test]
    fn test_draft_edits_reject_zero_amounts() {
        let mut invoice = draft_invoice(&[1000]);
        assert!(matches!(
            invoice.add_milestone(MilestoneSpec {
                description: "free work".to_string(),
                amount: Amount::ZERO,
            }),
            Err(EscrowError::InvalidMilestoneSchedule { .. })
        ));
        assert!(matches!(
            invoice.update_milestone(
                0,
                MilestoneSpec {
                    description: "zeroed".to_string(),
                    amount: Amount::ZERO,
                },
            ),
            Err(EscrowError::InvalidMilestoneSchedule { .. })
        ));
    }

    #[test]
    fn test_draft_editing() {
        let mut invoice = draft_invoice(&[1000]);
        let seq = invoice
            .add_milestone(MilestoneSpec {
                description: "phase 1".to_string(),
                amount: Amount::from_minor(500),
            })
            .unwrap();
        assert_eq!(seq, 1);
        invoice
            .update_milestone(
                1,
                MilestoneSpec {
                    description: "phase 1 revised".to_string(),
                    amount: Amount::from_minor(700),
                },
            )
            .unwrap();
        assert_eq!(invoice.total_amount().unwrap(), Amount::from_minor(1700));
        invoice.remove_milestone(0).unwrap();
        assert_eq!(invoice.milestones.len(), 1);
        // The gap closes: the surviving milestone is renumbered.
        assert_eq!(invoice.milestones[0].seq, 0);
    }

    #[test]
    fn test_editing_rejected_after_funding() {
        let mut invoice = active_invoice(&[1000]);
        let err = invoice
            .add_milestone(MilestoneSpec {
                description: "late addition".to_string(),
                amount: Amount::from_minor(1),
            })
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_funding_requires_exact_amount() {
        let invoice = draft_invoice(&[1000, 2000]);
        let err = invoice.validate_funding(Amount::from_minor(2999)).unwrap_err();
        assert!(matches!(
            err,
            EscrowError::AmountMismatch {
                expected,
                actual,
            } if expected == Amount::from_minor(3000) && actual == Amount::from_minor(2999)
        ));
    }

    #[test]
    fn test_funding_rejects_emptied_schedule() {
        // Removal can empty a draft schedule after creation; funding
        // still refuses it.
        let mut invoice = draft_invoice(&[1000]);
        invoice.remove_milestone(0).unwrap();
        assert!(matches!(
            invoice.validate_funding(Amount::ZERO),
            Err(EscrowError::InvalidMilestoneSchedule { .. })
        ));
    }

    #[test]
    fn test_funding_protocol_is_two_phase() {
        let mut invoice = draft_invoice(&[1000]);
        let payer = invoice.payer;
        let total = invoice.begin_funding(Amount::from_minor(1000)).unwrap();
        assert_eq!(total, Amount::from_minor(1000));
        // While the hold is at the vault the draft is frozen and a
        // second funding attempt is refused.
        assert!(matches!(
            invoice.begin_funding(Amount::from_minor(1000)),
            Err(EscrowError::SettlementInFlight { .. })
        ));
        assert!(matches!(
            invoice.add_milestone(MilestoneSpec {
                description: "late".to_string(),
                amount: Amount::from_minor(1),
            }),
            Err(EscrowError::SettlementInFlight { .. })
        ));
        invoice.apply_funded(payer).unwrap();
        assert_eq!(invoice.state, InvoiceState::Active);
        assert!(!invoice.funding_in_flight);
    }

    #[test]
    fn test_abort_funding_reopens_draft() {
        let mut invoice = draft_invoice(&[1000]);
        invoice.begin_funding(Amount::from_minor(1000)).unwrap();
        invoice.abort_funding().unwrap();
        assert_eq!(invoice.state, InvoiceState::Draft);
        // The draft is editable and fundable again.
        invoice
            .update_milestone(
                0,
                MilestoneSpec {
                    description: "revised".to_string(),
                    amount: Amount::from_minor(1200),
                },
            )
            .unwrap();
        invoice.begin_funding(Amount::from_minor(1200)).unwrap();
    }

    #[test]
    fn test_apply_funded_requires_in_flight_hold() {
        let mut invoice = draft_invoice(&[1000]);
        let payer = invoice.payer;
        let err = invoice.apply_funded(payer).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_apply_funded_logs_both_steps() {
        let invoice = active_invoice(&[1000]);
        assert_eq!(invoice.state, InvoiceState::Active);
        let states: Vec<&str> = invoice
            .transition_log
            .iter()
            .map(|r| r.to_state.as_str())
            .collect();
        assert_eq!(states, vec!["FUNDED", "ACTIVE"]);
    }

    #[test]
    fn test_release_protocol_happy_path() {
        let mut invoice = active_invoice(&[1000, 2000]);
        let payer = invoice.payer;
        invoice.approve_milestone(0, payer).unwrap();
        let amount = invoice.begin_release(0, payer).unwrap();
        assert_eq!(amount, Amount::from_minor(1000));
        assert_eq!(invoice.milestone(0).unwrap().state, MilestoneState::Releasing);
        invoice.apply_released(0, payer).unwrap();
        let m = invoice.milestone(0).unwrap();
        assert_eq!(m.state, MilestoneState::Released);
        assert_eq!(m.payee_amount, Some(Amount::from_minor(1000)));
        assert_eq!(invoice.released_amount(), Amount::from_minor(1000));
        assert_eq!(invoice.state, InvoiceState::Active);
    }

    #[test]
    fn test_release_requires_approval() {
        let mut invoice = active_invoice(&[1000]);
        let payer = invoice.payer;
        let err = invoice.begin_release(0, payer).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_second_release_while_in_flight() {
        let mut invoice = active_invoice(&[1000]);
        let payer = invoice.payer;
        invoice.approve_milestone(0, payer).unwrap();
        invoice.begin_release(0, payer).unwrap();
        let err = invoice.begin_release(0, payer).unwrap_err();
        assert!(matches!(err, EscrowError::SettlementInFlight { .. }));
    }

    #[test]
    fn test_abort_release_returns_to_approved() {
        let mut invoice = active_invoice(&[1000]);
        let payer = invoice.payer;
        invoice.approve_milestone(0, payer).unwrap();
        invoice.begin_release(0, payer).unwrap();
        invoice.abort_release(0, payer, "rail timeout").unwrap();
        assert_eq!(invoice.milestone(0).unwrap().state, MilestoneState::Approved);
        // Retry succeeds.
        invoice.begin_release(0, payer).unwrap();
    }

    #[test]
    fn test_all_released_completes_invoice() {
        let mut invoice = active_invoice(&[1000, 2000]);
        let payer = invoice.payer;
        for seq in 0..2 {
            invoice.approve_milestone(seq, payer).unwrap();
            invoice.begin_release(seq, payer).unwrap();
            invoice.apply_released(seq, payer).unwrap();
        }
        assert_eq!(invoice.state, InvoiceState::Completed);
        assert!(invoice.state.is_terminal());
    }

    #[test]
    fn test_milestone_dispute_blocks_only_target() {
        let mut invoice = active_invoice(&[1000, 2000]);
        let payer = invoice.payer;
        let payee = invoice.payee;
        invoice.approve_milestone(0, payer).unwrap();
        invoice.approve_milestone(1, payer).unwrap();
        invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "underpaid")
            .unwrap();
        assert_eq!(invoice.milestone(0).unwrap().state, MilestoneState::Disputed);
        assert!(invoice.begin_release(0, payer).is_err());
        // The sibling milestone is unaffected.
        assert!(invoice.begin_release(1, payer).is_ok());
    }

    #[test]
    fn test_invoice_dispute_blocks_everything() {
        let mut invoice = active_invoice(&[1000, 2000]);
        let payer = invoice.payer;
        invoice.approve_milestone(0, payer).unwrap();
        invoice
            .raise_dispute(DisputeScope::Invoice, payer, "contract breach")
            .unwrap();
        assert!(invoice.begin_release(0, payer).is_err());
        assert!(invoice.begin_refund(payer).is_err());
    }

    #[test]
    fn test_duplicate_dispute_rejected() {
        let mut invoice = active_invoice(&[1000]);
        let payee = invoice.payee;
        invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "first")
            .unwrap();
        let err = invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "second")
            .unwrap_err();
        assert!(matches!(err, EscrowError::DuplicateDispute { .. }));
    }

    #[test]
    fn test_released_milestone_not_contestable() {
        let mut invoice = active_invoice(&[1000, 2000]);
        let payer = invoice.payer;
        let payee = invoice.payee;
        invoice.approve_milestone(0, payer).unwrap();
        invoice.begin_release(0, payer).unwrap();
        invoice.apply_released(0, payer).unwrap();
        let err = invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "too late")
            .unwrap_err();
        assert!(matches!(err, EscrowError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_milestone_resolution_split() {
        let mut invoice = active_invoice(&[1000, 2000]);
        let payee = invoice.payee;
        let arb = invoice.arbitrator.unwrap();
        let dispute_id = invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "partial delivery")
            .unwrap();
        let plan = invoice
            .begin_resolution(
                dispute_id,
                DisputeOutcome::Split {
                    to_payee: Amount::from_minor(400),
                },
                arb,
            )
            .unwrap();
        assert_eq!(plan.to_payee, Amount::from_minor(400));
        assert_eq!(plan.to_payer, Amount::from_minor(600));
        settle_all_legs(&mut invoice, dispute_id);
        invoice.finalize_resolution(dispute_id, arb).unwrap();
        let m = invoice.milestone(0).unwrap();
        assert_eq!(m.state, MilestoneState::Released);
        assert_eq!(m.payee_amount, Some(Amount::from_minor(400)));
        assert_eq!(
            invoice.dispute(dispute_id).unwrap().status,
            DisputeStatus::Resolved
        );
    }

    #[test]
    fn test_finalize_requires_all_legs() {
        let mut invoice = active_invoice(&[1000]);
        let payee = invoice.payee;
        let arb = invoice.arbitrator.unwrap();
        let dispute_id = invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "partial")
            .unwrap();
        invoice
            .begin_resolution(
                dispute_id,
                DisputeOutcome::Split {
                    to_payee: Amount::from_minor(400),
                },
                arb,
            )
            .unwrap();
        let (leg, _) = invoice.begin_settlement_leg(dispute_id).unwrap().unwrap();
        invoice.confirm_settlement_leg(dispute_id, leg).unwrap();
        let err = invoice.finalize_resolution(dispute_id, arb).unwrap_err();
        assert!(matches!(err, EscrowError::SettlementInFlight { .. }));
        // The dispute is still open and still blocks its target.
        assert!(invoice.has_open_dispute_covering(0));
    }

    #[test]
    fn test_resolution_retry_resumes_plan() {
        let mut invoice = active_invoice(&[1000]);
        let payee = invoice.payee;
        let arb = invoice.arbitrator.unwrap();
        let dispute_id = invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "partial")
            .unwrap();
        let outcome = DisputeOutcome::Split {
            to_payee: Amount::from_minor(400),
        };
        invoice.begin_resolution(dispute_id, outcome, arb).unwrap();
        let (leg, amount) = invoice.begin_settlement_leg(dispute_id).unwrap().unwrap();
        assert_eq!((leg, amount), (SettlementLeg::Payee, Amount::from_minor(400)));
        invoice.confirm_settlement_leg(dispute_id, leg).unwrap();
        // Retry with the same outcome resumes where it left off.
        let resumed = invoice.begin_resolution(dispute_id, outcome, arb).unwrap();
        assert_eq!(
            resumed.pending_legs(),
            vec![(SettlementLeg::Payer, Amount::from_minor(600))]
        );
        // A different outcome cannot replace a partially confirmed plan.
        let err = invoice
            .begin_resolution(dispute_id, DisputeOutcome::ReleaseToPayee, arb)
            .unwrap_err();
        assert!(matches!(err, EscrowError::SettlementInFlight { .. }));
    }

    #[test]
    fn test_second_resolver_blocked_while_leg_at_vault() {
        let mut invoice = active_invoice(&[1000]);
        let payee = invoice.payee;
        let arb = invoice.arbitrator.unwrap();
        let dispute_id = invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "partial")
            .unwrap();
        let outcome = DisputeOutcome::Split {
            to_payee: Amount::from_minor(400),
        };
        invoice.begin_resolution(dispute_id, outcome, arb).unwrap();
        let (leg, _) = invoice.begin_settlement_leg(dispute_id).unwrap().unwrap();
        // With the payee leg at the vault, a concurrent resolver gets
        // refused instead of a second copy of the same movement.
        assert!(matches!(
            invoice.begin_resolution(dispute_id, outcome, arb),
            Err(EscrowError::SettlementInFlight { .. })
        ));
        assert!(matches!(
            invoice.begin_settlement_leg(dispute_id),
            Err(EscrowError::SettlementInFlight { .. })
        ));
        // A vault rejection returns the leg to pending for retry.
        invoice.abort_settlement_leg(dispute_id, leg).unwrap();
        let retried = invoice.begin_settlement_leg(dispute_id).unwrap().unwrap();
        assert_eq!(retried, (SettlementLeg::Payee, Amount::from_minor(400)));
    }

    #[test]
    fn test_invoice_resolution_allocates_by_sequence() {
        let mut invoice = active_invoice(&[1000, 1000, 1000]);
        let payer = invoice.payer;
        let arb = invoice.arbitrator.unwrap();
        let dispute_id = invoice
            .raise_dispute(DisputeScope::Invoice, payer, "breach")
            .unwrap();
        let plan = invoice
            .begin_resolution(
                dispute_id,
                DisputeOutcome::Split {
                    to_payee: Amount::from_minor(1500),
                },
                arb,
            )
            .unwrap();
        assert_eq!(plan.to_payer, Amount::from_minor(1500));
        settle_all_legs(&mut invoice, dispute_id);
        invoice.finalize_resolution(dispute_id, arb).unwrap();
        let shares: Vec<Option<Amount>> = invoice
            .milestones
            .iter()
            .map(|m| m.payee_amount)
            .collect();
        assert_eq!(
            shares,
            vec![
                Some(Amount::from_minor(1000)),
                Some(Amount::from_minor(500)),
                Some(Amount::ZERO),
            ]
        );
        assert_eq!(invoice.state, InvoiceState::Completed);
    }

    #[test]
    fn test_split_cannot_exceed_contested() {
        let mut invoice = active_invoice(&[1000]);
        let payee = invoice.payee;
        let arb = invoice.arbitrator.unwrap();
        let dispute_id = invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "partial")
            .unwrap();
        let err = invoice
            .begin_resolution(
                dispute_id,
                DisputeOutcome::Split {
                    to_payee: Amount::from_minor(1001),
                },
                arb,
            )
            .unwrap_err();
        assert!(matches!(err, EscrowError::AmountMismatch { .. }));
    }

    #[test]
    fn test_refund_protocol() {
        let mut invoice = active_invoice(&[1000, 2000]);
        let payer = invoice.payer;
        invoice.approve_milestone(0, payer).unwrap();
        invoice.begin_release(0, payer).unwrap();
        invoice.apply_released(0, payer).unwrap();
        let outstanding = invoice.begin_refund(payer).unwrap();
        assert_eq!(outstanding, Amount::from_minor(2000));
        invoice.apply_refunded(payer).unwrap();
        assert_eq!(invoice.state, InvoiceState::Refunded);
        assert_eq!(invoice.milestone(1).unwrap().payee_amount, Some(Amount::ZERO));
    }

    #[test]
    fn test_refund_blocked_by_open_dispute() {
        let mut invoice = active_invoice(&[1000]);
        let payer = invoice.payer;
        let payee = invoice.payee;
        invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "contested")
            .unwrap();
        let err = invoice.begin_refund(payer).unwrap_err();
        assert!(matches!(err, EscrowError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_abort_refund_reopens_invoice() {
        let mut invoice = active_invoice(&[1000]);
        let payer = invoice.payer;
        invoice.begin_refund(payer).unwrap();
        assert!(matches!(
            invoice.begin_refund(payer),
            Err(EscrowError::SettlementInFlight { .. })
        ));
        invoice.abort_refund().unwrap();
        assert!(invoice.begin_refund(payer).is_ok());
    }

    #[test]
    fn test_audit_chain_detects_tampering() {
        let mut invoice = active_invoice(&[1000]);
        let payer = invoice.payer;
        invoice.approve_milestone(0, payer).unwrap();
        assert!(invoice.verify_log().is_ok());
        invoice.transition_log[1].from_state = "DRAFT".to_string();
        let err = invoice.verify_log().unwrap_err();
        assert!(matches!(
            err,
            EscrowError::AuditLogCorrupted { index: 1, .. }
        ));
        // All mutation paths are halted.
        assert!(invoice.begin_release(0, payer).is_err());
    }

    #[test]
    fn test_role_of() {
        let invoice = draft_invoice(&[100]);
        assert_eq!(invoice.role_of(invoice.payer), Some(Role::Payer));
        assert_eq!(invoice.role_of(invoice.payee), Some(Role::Payee));
        assert_eq!(
            invoice.role_of(invoice.arbitrator.unwrap()),
            Some(Role::Arbitrator)
        );
        assert_eq!(invoice.role_of(ActorId::new()), None);
    }

    #[test]
    fn test_role_of_declared_signer() {
        use meq_quorum::Signer;

        let payer = ActorId::new();
        let auditor = ActorId::new();
        let set = SignerSet::new(
            vec![
                Signer { id: payer, weight: 2 },
                Signer {
                    id: auditor,
                    weight: 1,
                },
            ],
            2,
        )
        .unwrap();
        let invoice = Invoice::new(
            payer,
            ActorId::new(),
            None,
            Some(set),
            usd(),
            specs(&[100]),
        )
        .unwrap();
        // A party keeps its party role even when listed as a signer.
        assert_eq!(invoice.role_of(payer), Some(Role::Payer));
        assert_eq!(invoice.role_of(auditor), Some(Role::Signer));
    }

    proptest! {
        // Whatever split an invoice-wide resolution awards, the per-
        // milestone payee shares sum to exactly the awarded amount and
        // never exceed any milestone's own amount.
        #[test]
        fn prop_invoice_split_conserves_value(
            amounts in proptest::collection::vec(1u64..=10_000, 1..=5),
            payee_minor in 0u64..=50_000,
        ) {
            let total: u64 = amounts.iter().sum();
            let to_payee = payee_minor.min(total);
            let mut invoice = active_invoice(&amounts);
            let payer = invoice.payer;
            let arb = invoice.arbitrator.unwrap();
            let dispute_id = invoice
                .raise_dispute(DisputeScope::Invoice, payer, "contested")
                .unwrap();
            invoice
                .begin_resolution(
                    dispute_id,
                    DisputeOutcome::Split { to_payee: Amount::from_minor(to_payee) },
                    arb,
                )
                .unwrap();
            while let Some((leg, _)) = invoice.begin_settlement_leg(dispute_id).unwrap() {
                invoice.confirm_settlement_leg(dispute_id, leg).unwrap();
            }
            invoice.finalize_resolution(dispute_id, arb).unwrap();

            let mut allocated = 0u64;
            for m in &invoice.milestones {
                let share = m.payee_amount.unwrap();
                prop_assert!(share <= m.amount);
                allocated += share.minor();
            }
            prop_assert_eq!(allocated, to_payee);
            prop_assert_eq!(invoice.state, InvoiceState::Completed);
        }
    }
}
