//! # Engine Events
//!
//! Every committed state change is announced exactly once through an
//! [`EventSink`]. Envelopes carry an engine-wide monotonic sequence
//! number assigned while the originating invoice's lock is held, so
//! consumers observe a single invoice's events in commit order.
//!
//! Sinks must not block: the engine emits from inside its critical
//! sections. The bundled sinks either buffer in memory or hand off to
//! an unbounded channel.

use serde::Serialize;
use tokio::sync::mpsc;

use meq_core::{ActorId, Amount, DisputeId, InvoiceId, ProposalId, Timestamp};
use meq_escrow::{DisputeOutcome, DisputeScope};

/// A committed state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EngineEvent {
    /// An invoice was registered in `Draft`.
    InvoiceCreated {
        invoice_id: InvoiceId,
        payer: ActorId,
        payee: ActorId,
    },
    /// Custody was established and the invoice activated.
    InvoiceFunded {
        invoice_id: InvoiceId,
        amount: Amount,
    },
    /// A milestone's deliverable was accepted.
    MilestoneApproved { invoice_id: InvoiceId, seq: u32 },
    /// A milestone settled. `payee_amount` is what actually reached
    /// the payee, which a dispute resolution may have reduced.
    MilestoneReleased {
        invoice_id: InvoiceId,
        seq: u32,
        payee_amount: Amount,
    },
    /// A dispute was opened against an invoice or milestone.
    DisputeRaised {
        invoice_id: InvoiceId,
        dispute_id: DisputeId,
        scope: DisputeScope,
    },
    /// A dispute closed with a fully settled outcome.
    DisputeResolved {
        invoice_id: InvoiceId,
        dispute_id: DisputeId,
        outcome: DisputeOutcome,
    },
    /// Every milestone settled; the invoice is terminal.
    InvoiceCompleted { invoice_id: InvoiceId },
    /// Outstanding funds were returned; the invoice is terminal.
    InvoiceRefunded {
        invoice_id: InvoiceId,
        amount: Amount,
    },
    /// A proposal reached its threshold.
    ProposalPassed { proposal_id: ProposalId },
    /// A proposal's threshold became unreachable.
    ProposalRejected { proposal_id: ProposalId },
    /// A proposal's deadline elapsed before a decision.
    ProposalExpired { proposal_id: ProposalId },
    /// A proposal was withdrawn by its proposer before any vote.
    ProposalCancelled { proposal_id: ProposalId },
}

/// An event with its engine-assigned ordering metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    /// Engine-wide monotonic sequence number.
    pub seq: u64,
    /// When the engine committed the change.
    pub at: Timestamp,
    /// The actor whose command caused the change, if attributable.
    pub actor: Option<ActorId>,
    /// The change itself.
    pub event: EngineEvent,
}

/// Consumer seam for engine events.
pub trait EventSink: Send + Sync {
    /// Accept one envelope. Must not block.
    fn emit(&self, envelope: EventEnvelope);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _envelope: EventEnvelope) {}
}

/// Buffers events in memory, for tests and introspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: parking_lot::Mutex<Vec<EventEnvelope>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of everything emitted so far, in sequence order.
    pub fn snapshot(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, envelope: EventEnvelope) {
        self.events.lock().push(envelope);
    }
}

/// Forwards events into an unbounded tokio channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelSink {
    /// Create a sink and the receiver draining it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, envelope: EventEnvelope) {
        // A dropped receiver means nobody is listening; losing the
        // event is the contract then.
        let _ = self.tx.send(envelope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(seq: u64) -> EventEnvelope {
        EventEnvelope {
            seq,
            at: Timestamp::now(),
            actor: None,
            event: EngineEvent::InvoiceCompleted {
                invoice_id: InvoiceId::new(),
            },
        }
    }

    #[test]
    fn test_memory_sink_preserves_order() {
        let sink = MemorySink::new();
        sink.emit(envelope(1));
        sink.emit(envelope(2));
        let seen: Vec<u64> = sink.snapshot().iter().map(|e| e.seq).collect();
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(envelope(7));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.seq, 7);
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(envelope(1));
    }
}
