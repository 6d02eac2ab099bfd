//! Structured coordinator events
//!
//! Every state change is reported to an [`EventSink`]. Nothing in the
//! coordinator reads events back, so a sink may drop them freely.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use hivemind_common::ModelType;

use crate::round::RejectReason;
use crate::urgent::UrgencyKind;

/// State change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HiveMindEvent {
    WorkerRegistered {
        worker_id: String,
        region: String,
    },
    TrustUpdated {
        worker_id: String,
        trust_score: f64,
    },
    ExperienceBuffered {
        experience_id: String,
        worker_id: String,
        model_type: ModelType,
    },
    /// Group below the sample floor, kept for the next flush
    BatchDeferred {
        worker_id: String,
        model_type: ModelType,
        samples: usize,
    },
    ExperiencesEvicted {
        count: usize,
    },
    UpdateGenerated {
        update_id: String,
        worker_id: String,
        model_type: ModelType,
        privacy_cost: f64,
    },
    UpdateAccepted {
        update_id: String,
        round_id: String,
    },
    /// Held for the next round of the model
    UpdateQueued {
        update_id: String,
        model_type: ModelType,
    },
    /// A newer update from the same worker replaced a queued one
    UpdateSuperseded {
        update_id: String,
        superseded_id: String,
        worker_id: String,
        model_type: ModelType,
    },
    UpdateRejected {
        update_id: String,
        worker_id: String,
        reason: RejectReason,
    },
    RoundStarted {
        round_id: String,
        model_type: ModelType,
        target_participants: usize,
    },
    RoundAggregating {
        round_id: String,
        participants: usize,
    },
    RoundCompleted {
        round_id: String,
        model_type: ModelType,
        new_version: u64,
        consensus_score: f64,
    },
    RoundFailed {
        round_id: String,
        model_type: ModelType,
        reason: String,
    },
    ModelUpdated {
        model_type: ModelType,
        version: u64,
        convergence_delta: f64,
    },
    WorkerSynced {
        worker_id: String,
        model_type: ModelType,
        version: u64,
    },
    DistributionFailed {
        worker_id: String,
        model_type: ModelType,
        error: String,
    },
    UrgentBroadcast {
        update_id: String,
        worker_id: String,
        kind: UrgencyKind,
    },
    UrgentDropped {
        worker_id: String,
        model_type: ModelType,
        kind: UrgencyKind,
        reason: String,
    },
    PrivacyBudgetExceeded {
        model_type: ModelType,
        used: f64,
        ceiling: f64,
    },
}

/// Receives coordinator events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: HiveMindEvent);
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: HiveMindEvent) {}
}

/// Forwards events to an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<HiveMindEvent>,
}

impl ChannelEventSink {
    /// Creates a sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HiveMindEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: HiveMindEvent) {
        // A dropped receiver only means nobody is listening
        let _ = self.tx.send(event);
    }
}
