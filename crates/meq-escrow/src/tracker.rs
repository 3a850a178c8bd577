//! # Release Progress
//!
//! Read-side summary of how far an invoice has settled. Computed on
//! demand from the milestone schedule; nothing here mutates.

use serde::{Deserialize, Serialize};

use meq_core::Amount;

use crate::invoice::{Invoice, InvoiceState, MilestoneState};

/// A snapshot of an invoice's settlement progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Amount placed in custody. Zero while the invoice is `Draft`.
    pub funded: Amount,
    /// Amount settled so far.
    pub released: Amount,
    /// Amount still in custody.
    pub outstanding: Amount,
    /// `released / funded`, in `[0.0, 1.0]`. Zero for an unfunded
    /// invoice.
    pub ratio: f64,
    /// The lowest-sequence milestone that could be released right now:
    /// approved, unblocked by disputes, with no settlement in flight.
    pub next_releasable: Option<u32>,
}

impl Invoice {
    /// Compute the current settlement progress.
    pub fn progress(&self) -> Progress {
        let funded = if self.state == InvoiceState::Draft {
            Amount::ZERO
        } else {
            self.total_amount().unwrap_or(Amount::ZERO)
        };
        let released = self.released_amount();
        let outstanding = funded.checked_sub(released).unwrap_or(Amount::ZERO);
        let ratio = if funded.is_zero() {
            0.0
        } else {
            released.minor() as f64 / funded.minor() as f64
        };
        Progress {
            funded,
            released,
            outstanding,
            ratio,
            next_releasable: self.next_releasable(),
        }
    }

    /// The lowest-sequence milestone eligible for release, if any.
    pub fn next_releasable(&self) -> Option<u32> {
        if self.state != InvoiceState::Active || self.refund_in_flight {
            return None;
        }
        self.milestones
            .iter()
            .filter(|m| m.state == MilestoneState::Approved)
            .filter(|m| !self.has_open_dispute_covering(m.seq))
            .map(|m| m.seq)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispute::DisputeScope;
    use crate::invoice::MilestoneSpec;
    use meq_core::{ActorId, AssetCode};

    fn active_invoice(amounts: &[u64]) -> Invoice {
        let specs = amounts
            .iter()
            .enumerate()
            .map(|(i, &a)| MilestoneSpec {
                description: format!("phase {i}"),
                amount: Amount::from_minor(a),
            })
            .collect();
        let mut invoice = Invoice::new(
            ActorId::new(),
            ActorId::new(),
            Some(ActorId::new()),
            None,
            AssetCode::new("USD").unwrap(),
            specs,
        )
        .unwrap();
        let total = invoice.total_amount().unwrap();
        invoice.begin_funding(total).unwrap();
        invoice.apply_funded(invoice.payer).unwrap();
        invoice
    }

    #[test]
    fn test_progress_tracks_releases() {
        let mut invoice = active_invoice(&[1000, 2000, 1000]);
        let payer = invoice.payer;
        invoice.approve_milestone(1, payer).unwrap();
        invoice.begin_release(1, payer).unwrap();
        invoice.apply_released(1, payer).unwrap();

        let p = invoice.progress();
        assert_eq!(p.funded, Amount::from_minor(4000));
        assert_eq!(p.released, Amount::from_minor(2000));
        assert_eq!(p.outstanding, Amount::from_minor(2000));
        assert!((p.ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_next_releasable_is_lowest_approved() {
        let mut invoice = active_invoice(&[1000, 1000, 1000]);
        let payer = invoice.payer;
        assert_eq!(invoice.next_releasable(), None);
        invoice.approve_milestone(2, payer).unwrap();
        invoice.approve_milestone(1, payer).unwrap();
        assert_eq!(invoice.next_releasable(), Some(1));
    }

    #[test]
    fn test_next_releasable_skips_disputed() {
        let mut invoice = active_invoice(&[1000, 1000]);
        let payer = invoice.payer;
        let payee = invoice.payee;
        invoice.approve_milestone(0, payer).unwrap();
        invoice.approve_milestone(1, payer).unwrap();
        invoice
            .raise_dispute(DisputeScope::Milestone(0), payee, "contested")
            .unwrap();
        assert_eq!(invoice.next_releasable(), Some(1));
    }

    #[test]
    fn test_draft_progress_is_zero() {
        let invoice = {
            let mut i = active_invoice(&[1000]);
            i.state = crate::invoice::InvoiceState::Draft;
            i
        };
        let p = invoice.progress();
        assert_eq!(p.funded, Amount::ZERO);
        assert_eq!(p.ratio, 0.0);
        assert_eq!(p.next_releasable, None);
    }
}
