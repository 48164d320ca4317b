//! Domain events published after committed state changes.
//!
//! Delivery is fire-and-forget: a sink must not block or fail the operation
//! that produced the event. Subscribers may see an event more than once
//! (a retried item republishes), never before its change is committed.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::models::{DeduplicationAction, ResolutionAction, Severity};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    CanonicalCreated {
        canonical_id: String,
        chunk_id: String,
    },
    VariantMerged {
        canonical_id: String,
        variant_chunk_id: String,
        similarity: f64,
    },
    VariantPromoted {
        canonical_id: String,
        new_canonical_chunk_id: String,
        demoted_chunk_id: String,
        reason: String,
    },
    VariantDetached {
        canonical_id: String,
        chunk_id: String,
    },
    ChunkSuperseded {
        canonical_id: String,
        outdated_chunk_id: String,
        replacement_chunk_id: String,
    },
    ContradictionDetected {
        contradiction_id: String,
        chunk_a_id: String,
        chunk_b_id: String,
        severity: Severity,
    },
    ContradictionResolved {
        contradiction_id: String,
        action: ResolutionAction,
        resolved_by: String,
    },
    ReviewQueued {
        review_id: String,
        chunk_id: String,
    },
    ItemProcessed {
        chunk_id: String,
        action: DeduplicationAction,
    },
    BatchCompleted {
        job_id: String,
        state: String,
        processed: u64,
        total: u64,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CanonicalCreated { .. } => "canonical_created",
            Self::VariantMerged { .. } => "variant_merged",
            Self::VariantPromoted { .. } => "variant_promoted",
            Self::VariantDetached { .. } => "variant_detached",
            Self::ChunkSuperseded { .. } => "chunk_superseded",
            Self::ContradictionDetected { .. } => "contradiction_detected",
            Self::ContradictionResolved { .. } => "contradiction_resolved",
            Self::ReviewQueued { .. } => "review_queued",
            Self::ItemProcessed { .. } => "item_processed",
            Self::BatchCompleted { .. } => "batch_completed",
        }
    }
}

/// Receiver of domain events.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn publish(&self, _event: DomainEvent) {}
}

/// Logs events at `info` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: DomainEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_default();
        info!(event = event.name(), %payload, "domain event");
    }
}

/// Fans events out to in-process subscribers over a broadcast channel.
///
/// Slow subscribers lag and lose the oldest events; publishing with no
/// subscribers is not an error.
pub struct ChannelEventSink {
    sender: broadcast::Sender<DomainEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for ChannelEventSink {
    fn publish(&self, event: DomainEvent) {
        let _ = self.sender.send(event);
    }
}
