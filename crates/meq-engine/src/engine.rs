//! # The Escrow Engine
//!
//! Concurrency-safe command surface over the custody state machines.
//! One `tokio` mutex per invoice serializes its mutations; the engine
//! never holds that lock across a settlement-rail await. Instead every
//! fund movement runs as begin (under lock, marks the in-flight state),
//! vault call (lock released), then apply or abort (re-locked). The
//! in-flight marker is what a concurrent duplicate command trips over
//! while the lock is down.
//!
//! Proposals live beside invoices. When a dispute-resolution proposal
//! passes, the decisive vote triggers settlement; the proposal lock is
//! released before the invoice lock is taken, so the two maps have a
//! single lock order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use meq_core::{ActorId, Amount, AssetCode, DisputeId, InvoiceId, ProposalId, Role, Timestamp};
use meq_escrow::{
    Dispute, DisputeOutcome, DisputeScope, EscrowError, EscrowVault, Invoice, MilestoneSpec,
    MilestoneState, Progress, SettlementLeg,
};
use meq_quorum::{Proposal, ProposalStatus, Signer, SignerSet, VoteChoice};

use crate::error::EngineError;
use crate::events::{EngineEvent, EventEnvelope, EventSink};

// ── Internal entries ───────────────────────────────────────────────────

struct InvoiceEntry {
    invoice: Invoice,
    /// Set when audit verification fails; refuses all further mutation.
    halted: bool,
}

/// What a proposal authorizes once it passes.
enum ProposalOwner {
    /// Passing applies a dispute outcome.
    DisputeResolution {
        invoice_id: InvoiceId,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
    },
    /// Passing means nothing to the engine; the embedding application
    /// interprets the action payload.
    External,
}

struct ProposalEntry {
    proposal: Proposal,
    owner: ProposalOwner,
}

/// How a dispute resolution request was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPath {
    /// The caller had direct authority; the outcome settled.
    Settled,
    /// The outcome was put to a payer/payee vote.
    PendingQuorum(ProposalId),
}

/// Handle to a running proposal-expiry sweeper.
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper.
    pub fn stop(self) {
        self.handle.abort();
    }
}

// ── The engine ─────────────────────────────────────────────────────────

/// The async orchestration layer: invoices, disputes, and proposals
/// behind a single command surface, with every committed change
/// announced through the event sink.
pub struct EscrowEngine<V, S> {
    vault: Arc<V>,
    sink: Arc<S>,
    invoices: DashMap<InvoiceId, Arc<Mutex<InvoiceEntry>>>,
    proposals: DashMap<ProposalId, Arc<Mutex<ProposalEntry>>>,
    event_seq: AtomicU64,
}

impl<V: EscrowVault, S: EventSink> EscrowEngine<V, S> {
    /// Create an engine over the given vault and event sink.
    pub fn new(vault: Arc<V>, sink: Arc<S>) -> Self {
        Self {
            vault,
            sink,
            invoices: DashMap::new(),
            proposals: DashMap::new(),
            event_seq: AtomicU64::new(0),
        }
    }

    // ── Invoice commands ───────────────────────────────────────────────

    /// Register a new invoice in `Draft`. The schedule must be
    /// non-empty with every milestone amount positive. A declared
    /// signer set, if given, is the quorum that decides disputes when
    /// no arbitrator is appointed.
    pub fn create_invoice(
        &self,
        payer: ActorId,
        payee: ActorId,
        arbitrator: Option<ActorId>,
        signer_set: Option<SignerSet>,
        asset: AssetCode,
        milestones: Vec<MilestoneSpec>,
    ) -> Result<InvoiceId, EngineError> {
        let invoice = Invoice::new(payer, payee, arbitrator, signer_set, asset, milestones)?;
        let invoice_id = invoice.id;
        self.invoices.insert(
            invoice_id,
            Arc::new(Mutex::new(InvoiceEntry {
                invoice,
                halted: false,
            })),
        );
        info!(%invoice_id, %payer, %payee, "invoice created");
        self.emit(
            Some(payer),
            EngineEvent::InvoiceCreated {
                invoice_id,
                payer,
                payee,
            },
        );
        Ok(invoice_id)
    }

    /// Append a milestone to a draft invoice's schedule. Payer only.
    pub async fn add_milestone(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        spec: MilestoneSpec,
    ) -> Result<u32, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let mut guard = entry.lock().await;
        Self::check_open(invoice_id, &guard)?;
        Self::authorize(&guard.invoice, actor, &[Role::Payer])?;
        let seq = guard.invoice.add_milestone(spec)?;
        Ok(seq)
    }

    /// Replace a draft milestone's description and amount. Payer only.
    pub async fn update_milestone(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        seq: u32,
        spec: MilestoneSpec,
    ) -> Result<(), EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let mut guard = entry.lock().await;
        Self::check_open(invoice_id, &guard)?;
        Self::authorize(&guard.invoice, actor, &[Role::Payer])?;
        guard.invoice.update_milestone(seq, spec)?;
        Ok(())
    }

    /// Remove a milestone from a draft schedule. Payer only.
    pub async fn remove_milestone(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        seq: u32,
    ) -> Result<(), EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let mut guard = entry.lock().await;
        Self::check_open(invoice_id, &guard)?;
        Self::authorize(&guard.invoice, actor, &[Role::Payer])?;
        guard.invoice.remove_milestone(seq)?;
        Ok(())
    }

    /// Fund the invoice in full, placing `amount` in custody and
    /// activating the milestone schedule. Payer only; `amount` must
    /// equal the schedule total exactly.
    pub async fn fund_invoice(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        amount: Amount,
    ) -> Result<(), EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let total = {
            let mut guard = entry.lock().await;
            Self::check_open(invoice_id, &guard)?;
            Self::authorize(&guard.invoice, actor, &[Role::Payer])?;
            guard
                .invoice
                .begin_funding(amount)
                .map_err(|e| Self::note_corruption(&mut guard, e))?
        };

        match self.vault.hold(invoice_id, total).await {
            Ok(()) => {
                let mut guard = entry.lock().await;
                guard
                    .invoice
                    .apply_funded(actor)
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                info!(%invoice_id, %total, "invoice funded");
                self.emit(
                    Some(actor),
                    EngineEvent::InvoiceFunded {
                        invoice_id,
                        amount: total,
                    },
                );
                Ok(())
            }
            Err(err) => {
                let mut guard = entry.lock().await;
                guard
                    .invoice
                    .abort_funding()
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                warn!(%invoice_id, error = %err, "custody hold rejected by vault");
                Err(EscrowError::from(err).into())
            }
        }
    }

    /// Accept a milestone's deliverable. Payer only.
    pub async fn approve_milestone(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        seq: u32,
    ) -> Result<(), EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let mut guard = entry.lock().await;
        Self::check_open(invoice_id, &guard)?;
        Self::authorize(&guard.invoice, actor, &[Role::Payer])?;
        guard
            .invoice
            .approve_milestone(seq, actor)
            .map_err(|e| Self::note_corruption(&mut guard, e))?;
        self.emit(
            Some(actor),
            EngineEvent::MilestoneApproved { invoice_id, seq },
        );
        Ok(())
    }

    /// Release an approved milestone's funds to the payee. Payer or
    /// arbitrator. A repeat call for an already-settled milestone is a
    /// no-op; a call racing an in-flight release fails with
    /// `SETTLEMENT_IN_FLIGHT`.
    pub async fn release_milestone(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        seq: u32,
    ) -> Result<(), EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let amount = {
            let mut guard = entry.lock().await;
            Self::check_open(invoice_id, &guard)?;
            Self::authorize(&guard.invoice, actor, &[Role::Payer, Role::Arbitrator])?;
            if guard.invoice.milestone(seq)?.state == MilestoneState::Released {
                return Ok(());
            }
            guard
                .invoice
                .begin_release(seq, actor)
                .map_err(|e| Self::note_corruption(&mut guard, e))?
        };

        match self.vault.move_to(invoice_id, Role::Payee, amount).await {
            Ok(()) => {
                let mut guard = entry.lock().await;
                guard
                    .invoice
                    .apply_released(seq, actor)
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                info!(%invoice_id, seq, %amount, "milestone released");
                self.emit(
                    Some(actor),
                    EngineEvent::MilestoneReleased {
                        invoice_id,
                        seq,
                        payee_amount: amount,
                    },
                );
                self.emit_if_completed(&guard.invoice, Some(actor));
                Ok(())
            }
            Err(err) => {
                let mut guard = entry.lock().await;
                guard
                    .invoice
                    .abort_release(seq, actor, &err.to_string())
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                warn!(%invoice_id, seq, error = %err, "release rejected by vault");
                Err(EscrowError::from(err).into())
            }
        }
    }

    /// Raise a dispute against the invoice or one of its milestones.
    /// Payer or payee.
    pub async fn raise_dispute(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        scope: DisputeScope,
        reason: impl Into<String>,
    ) -> Result<DisputeId, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let mut guard = entry.lock().await;
        Self::check_open(invoice_id, &guard)?;
        Self::authorize(&guard.invoice, actor, &[Role::Payer, Role::Payee])?;
        let dispute_id = guard
            .invoice
            .raise_dispute(scope, actor, reason)
            .map_err(|e| Self::note_corruption(&mut guard, e))?;
        info!(%invoice_id, %dispute_id, %scope, "dispute raised");
        self.emit(
            Some(actor),
            EngineEvent::DisputeRaised {
                invoice_id,
                dispute_id,
                scope,
            },
        );
        Ok(dispute_id)
    }

    /// Resolve an open dispute with the given outcome.
    ///
    /// An arbitrator settles directly. On an invoice with no
    /// arbitrator, a payer or payee calling this escalates instead:
    /// the outcome becomes a proposal over the invoice's declared
    /// signer set (or, when none is declared, a payer/payee pair with
    /// one vote each and both required) open until `quorum_deadline`,
    /// and settlement happens when it passes.
    ///
    /// If a previous settlement attempt failed partway, any of the
    /// three parties may call again with the same outcome to resume
    /// the remaining fund movements.
    pub async fn resolve_dispute(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
        quorum_deadline: Timestamp,
    ) -> Result<ResolutionPath, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let authority = {
            let guard = entry.lock().await;
            Self::check_open(invoice_id, &guard)?;
            let role = Self::authorize(
                &guard.invoice,
                actor,
                &[Role::Payer, Role::Payee, Role::Arbitrator],
            )?;
            let dispute = guard.invoice.dispute(dispute_id)?;
            let resuming = dispute.settlement.is_some();
            let payer = guard.invoice.payer;
            let payee = guard.invoice.payee;
            let declared = guard.invoice.signer_set.clone();
            let has_arbitrator = guard.invoice.arbitrator.is_some();
            drop(guard);

            if role == Role::Arbitrator || resuming {
                None
            } else if has_arbitrator {
                return Err(EngineError::Unauthorized {
                    actor: actor.to_string(),
                    required: Role::Arbitrator.to_string(),
                });
            } else {
                Some((payer, payee, declared))
            }
        };

        if let Some((payer, payee, declared)) = authority {
            let signer_set = match declared {
                Some(set) => set,
                None => SignerSet::new(
                    vec![
                        Signer {
                            id: payer,
                            weight: 1,
                        },
                        Signer {
                            id: payee,
                            weight: 1,
                        },
                    ],
                    2,
                )?,
            };
            let proposal_id = self.open_resolution_proposal(
                invoice_id,
                dispute_id,
                outcome,
                actor,
                signer_set,
                quorum_deadline,
            )?;
            return Ok(ResolutionPath::PendingQuorum(proposal_id));
        }

        self.settle_dispute(&entry, invoice_id, dispute_id, outcome, actor)
            .await?;
        Ok(ResolutionPath::Settled)
    }

    /// Refund every unsettled milestone to the payer and terminate the
    /// invoice. Payer or arbitrator; blocked while disputes are open.
    pub async fn refund_invoice(
        &self,
        invoice_id: InvoiceId,
        actor: ActorId,
    ) -> Result<Amount, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let amount = {
            let mut guard = entry.lock().await;
            Self::check_open(invoice_id, &guard)?;
            Self::authorize(&guard.invoice, actor, &[Role::Payer, Role::Arbitrator])?;
            guard
                .invoice
                .begin_refund(actor)
                .map_err(|e| Self::note_corruption(&mut guard, e))?
        };

        match self.vault.move_to(invoice_id, Role::Payer, amount).await {
            Ok(()) => {
                let mut guard = entry.lock().await;
                guard
                    .invoice
                    .apply_refunded(actor)
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                info!(%invoice_id, %amount, "invoice refunded");
                self.emit(
                    Some(actor),
                    EngineEvent::InvoiceRefunded { invoice_id, amount },
                );
                Ok(amount)
            }
            Err(err) => {
                let mut guard = entry.lock().await;
                guard
                    .invoice
                    .abort_refund()
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                warn!(%invoice_id, error = %err, "refund rejected by vault");
                Err(EscrowError::from(err).into())
            }
        }
    }

    // ── Proposal commands ──────────────────────────────────────────────

    /// Open a free-standing proposal whose action the embedding
    /// application interprets.
    pub fn create_proposal(
        &self,
        proposer: ActorId,
        action: serde_json::Value,
        signer_set: SignerSet,
        deadline: Timestamp,
    ) -> Result<ProposalId, EngineError> {
        let proposal = Proposal::open(proposer, action, signer_set, deadline, Timestamp::now())?;
        let proposal_id = proposal.id;
        self.proposals.insert(
            proposal_id,
            Arc::new(Mutex::new(ProposalEntry {
                proposal,
                owner: ProposalOwner::External,
            })),
        );
        info!(%proposal_id, %proposer, "proposal opened");
        Ok(proposal_id)
    }

    /// Cast a vote. If this vote passes a dispute-resolution proposal,
    /// the approved outcome settles before the call returns; a vault
    /// failure at that point leaves the proposal passed and the
    /// settlement resumable through [`resolve_dispute`].
    ///
    /// [`resolve_dispute`]: Self::resolve_dispute
    pub async fn submit_vote(
        &self,
        proposal_id: ProposalId,
        signer: ActorId,
        choice: VoteChoice,
    ) -> Result<ProposalStatus, EngineError> {
        let entry = self.proposal_entry(proposal_id)?;
        let passed_resolution = {
            let mut guard = entry.lock().await;
            let was_voting = guard.proposal.status == ProposalStatus::Voting;
            let status = match guard.proposal.vote(signer, choice, Timestamp::now()) {
                Ok(status) => status,
                Err(err) => {
                    // A late vote expires the proposal as a side
                    // effect; that decision is still announced.
                    if was_voting && guard.proposal.status == ProposalStatus::Expired {
                        self.emit(Some(signer), EngineEvent::ProposalExpired { proposal_id });
                    }
                    return Err(err.into());
                }
            };
            if let Some(event) = Self::proposal_event(proposal_id, status) {
                info!(%proposal_id, %status, "proposal decided");
                self.emit(Some(signer), event);
            }
            match (&guard.owner, status) {
                (
                    ProposalOwner::DisputeResolution {
                        invoice_id,
                        dispute_id,
                        outcome,
                    },
                    ProposalStatus::Passed,
                ) => Some((*invoice_id, *dispute_id, *outcome, guard.proposal.proposer)),
                _ => None,
            }
        };

        if let Some((invoice_id, dispute_id, outcome, proposer)) = passed_resolution {
            let invoice_entry = self.invoice_entry(invoice_id)?;
            self.settle_dispute(&invoice_entry, invoice_id, dispute_id, outcome, proposer)
                .await?;
        }
        Ok(self.get_proposal(proposal_id).await?.status)
    }

    /// Withdraw a proposal before any vote is cast. Proposer only.
    pub async fn cancel_proposal(
        &self,
        proposal_id: ProposalId,
        actor: ActorId,
    ) -> Result<(), EngineError> {
        let entry = self.proposal_entry(proposal_id)?;
        let mut guard = entry.lock().await;
        guard.proposal.cancel(actor, Timestamp::now())?;
        self.emit(Some(actor), EngineEvent::ProposalCancelled { proposal_id });
        Ok(())
    }

    /// Expire one proposal if its deadline has passed. Idempotent and
    /// callable by anyone; returns the status after the call.
    pub async fn expire_proposal(
        &self,
        proposal_id: ProposalId,
        now: Timestamp,
    ) -> Result<ProposalStatus, EngineError> {
        let entry = self.proposal_entry(proposal_id)?;
        let mut guard = entry.lock().await;
        let before = guard.proposal.status;
        let after = guard.proposal.expire(now);
        if before == ProposalStatus::Voting && after == ProposalStatus::Expired {
            self.emit(None, EngineEvent::ProposalExpired { proposal_id });
        }
        Ok(after)
    }

    /// Expire every open proposal whose deadline has passed. Returns
    /// the number expired. Safe to call from a scheduler at any rate.
    pub async fn expire_proposals(&self, now: Timestamp) -> usize {
        let entries: Vec<(ProposalId, Arc<Mutex<ProposalEntry>>)> = self
            .proposals
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut expired = 0;
        for (proposal_id, entry) in entries {
            let mut guard = entry.lock().await;
            let before = guard.proposal.status;
            if guard.proposal.expire(now) == ProposalStatus::Expired
                && before == ProposalStatus::Voting
            {
                expired += 1;
                self.emit(None, EngineEvent::ProposalExpired { proposal_id });
            }
        }
        expired
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// A snapshot of the invoice.
    pub async fn get_invoice(&self, invoice_id: InvoiceId) -> Result<Invoice, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let guard = entry.lock().await;
        Ok(guard.invoice.clone())
    }

    /// The invoice's current settlement progress.
    pub async fn get_progress(&self, invoice_id: InvoiceId) -> Result<Progress, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let guard = entry.lock().await;
        Ok(guard.invoice.progress())
    }

    /// A snapshot of the invoice's milestone schedule.
    pub async fn get_milestones(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Vec<meq_escrow::Milestone>, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let guard = entry.lock().await;
        Ok(guard.invoice.milestones.clone())
    }

    /// A snapshot of one dispute.
    pub async fn get_dispute(
        &self,
        invoice_id: InvoiceId,
        dispute_id: DisputeId,
    ) -> Result<Dispute, EngineError> {
        let entry = self.invoice_entry(invoice_id)?;
        let guard = entry.lock().await;
        Ok(guard.invoice.dispute(dispute_id)?.clone())
    }

    /// A snapshot of one proposal.
    pub async fn get_proposal(&self, proposal_id: ProposalId) -> Result<Proposal, EngineError> {
        let entry = self.proposal_entry(proposal_id)?;
        let guard = entry.lock().await;
        Ok(guard.proposal.clone())
    }

    // ── Internals ──────────────────────────────────────────────────────

    fn invoice_entry(
        &self,
        invoice_id: InvoiceId,
    ) -> Result<Arc<Mutex<InvoiceEntry>>, EngineError> {
        self.invoices
            .get(&invoice_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::UnknownInvoice(invoice_id))
    }

    fn proposal_entry(
        &self,
        proposal_id: ProposalId,
    ) -> Result<Arc<Mutex<ProposalEntry>>, EngineError> {
        self.proposals
            .get(&proposal_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::UnknownProposal(proposal_id))
    }

    fn check_open(invoice_id: InvoiceId, entry: &InvoiceEntry) -> Result<(), EngineError> {
        if entry.halted {
            Err(EngineError::InvoiceHalted(invoice_id))
        } else {
            Ok(())
        }
    }

    fn authorize(invoice: &Invoice, actor: ActorId, allowed: &[Role]) -> Result<Role, EngineError> {
        match invoice.role_of(actor) {
            Some(role) if allowed.contains(&role) => Ok(role),
            _ => Err(EngineError::Unauthorized {
                actor: actor.to_string(),
                required: allowed
                    .iter()
                    .map(Role::as_str)
                    .collect::<Vec<_>>()
                    .join(" or "),
            }),
        }
    }

    fn note_corruption(entry: &mut InvoiceEntry, err: EscrowError) -> EngineError {
        if matches!(err, EscrowError::AuditLogCorrupted { .. }) {
            warn!(error = %err, "audit verification failed; invoice halted");
            entry.halted = true;
        }
        err.into()
    }

    fn proposal_event(proposal_id: ProposalId, status: ProposalStatus) -> Option<EngineEvent> {
        match status {
            ProposalStatus::Passed => Some(EngineEvent::ProposalPassed { proposal_id }),
            ProposalStatus::Rejected => Some(EngineEvent::ProposalRejected { proposal_id }),
            ProposalStatus::Expired => Some(EngineEvent::ProposalExpired { proposal_id }),
            ProposalStatus::Cancelled => Some(EngineEvent::ProposalCancelled { proposal_id }),
            ProposalStatus::Voting => None,
        }
    }

    fn emit(&self, actor: Option<ActorId>, event: EngineEvent) {
        let seq = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.emit(EventEnvelope {
            seq,
            at: Timestamp::now(),
            actor,
            event,
        });
    }

    fn emit_if_completed(&self, invoice: &Invoice, actor: Option<ActorId>) {
        if invoice.state == meq_escrow::InvoiceState::Completed {
            info!(invoice_id = %invoice.id, "invoice completed");
            self.emit(actor, EngineEvent::InvoiceCompleted {
                invoice_id: invoice.id,
            });
        }
    }

    fn open_resolution_proposal(
        &self,
        invoice_id: InvoiceId,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
        proposer: ActorId,
        signer_set: SignerSet,
        deadline: Timestamp,
    ) -> Result<ProposalId, EngineError> {
        let action = json!({
            "kind": "dispute_resolution",
            "invoice_id": invoice_id.to_string(),
            "dispute_id": dispute_id.to_string(),
            "outcome": outcome,
        });
        let proposal = Proposal::open(proposer, action, signer_set, deadline, Timestamp::now())?;
        let proposal_id = proposal.id;
        self.proposals.insert(
            proposal_id,
            Arc::new(Mutex::new(ProposalEntry {
                proposal,
                owner: ProposalOwner::DisputeResolution {
                    invoice_id,
                    dispute_id,
                    outcome,
                },
            })),
        );
        info!(%invoice_id, %dispute_id, %proposal_id, "dispute resolution escalated to quorum");
        Ok(proposal_id)
    }

    /// Execute a resolution's settlement plan leg by leg. The plan is
    /// persisted on the dispute before any vault call, and each leg is
    /// marked in flight under the invoice lock before its instruction
    /// is issued, so a concurrent resolver is refused instead of
    /// duplicating a movement and a failure partway leaves a resumable
    /// record rather than a lost one.
    async fn settle_dispute(
        &self,
        entry: &Arc<Mutex<InvoiceEntry>>,
        invoice_id: InvoiceId,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
        by: ActorId,
    ) -> Result<(), EngineError> {
        loop {
            let next_leg = {
                let mut guard = entry.lock().await;
                Self::check_open(invoice_id, &guard)?;
                guard
                    .invoice
                    .begin_resolution(dispute_id, outcome, by)
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                guard
                    .invoice
                    .begin_settlement_leg(dispute_id)
                    .map_err(|e| Self::note_corruption(&mut guard, e))?
            };
            let Some((leg, amount)) = next_leg else { break };
            let recipient = match leg {
                SettlementLeg::Payee => Role::Payee,
                SettlementLeg::Payer => Role::Payer,
            };
            if let Err(err) = self.vault.move_to(invoice_id, recipient, amount).await {
                let mut guard = entry.lock().await;
                guard
                    .invoice
                    .abort_settlement_leg(dispute_id, leg)
                    .map_err(|e| Self::note_corruption(&mut guard, e))?;
                warn!(%invoice_id, %dispute_id, %recipient, error = %err,
                    "settlement leg rejected by vault");
                return Err(EscrowError::from(err).into());
            }
            let mut guard = entry.lock().await;
            guard
                .invoice
                .confirm_settlement_leg(dispute_id, leg)
                .map_err(|e| Self::note_corruption(&mut guard, e))?;
        }

        let mut guard = entry.lock().await;
        guard
            .invoice
            .finalize_resolution(dispute_id, by)
            .map_err(|e| Self::note_corruption(&mut guard, e))?;
        info!(%invoice_id, %dispute_id, %outcome, "dispute resolved");
        self.emit(
            Some(by),
            EngineEvent::DisputeResolved {
                invoice_id,
                dispute_id,
                outcome,
            },
        );
        self.emit_if_completed(&guard.invoice, Some(by));
        Ok(())
    }
}

impl<V, S> EscrowEngine<V, S>
where
    V: EscrowVault + 'static,
    S: EventSink + 'static,
{
    /// Spawn a background task expiring overdue proposals every
    /// `period`. Stop it with the returned handle.
    pub fn spawn_expiry_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let expired = engine.expire_proposals(Timestamp::now()).await;
                if expired > 0 {
                    info!(expired, "expired overdue proposals");
                }
            }
        });
        SweeperHandle { handle }
    }
}
