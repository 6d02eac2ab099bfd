//! Federated round lifecycle and update validation
//!
//! ```text
//! recruiting ──▶ training ──▶ aggregating ──▶ distributing ──▶ completed
//!                   │              │
//!                   └──────────────┴──────────▶ failed
//! ```
//!
//! A round is keyed by model type, not by version: updates computed against
//! an older version remain eligible for the current round.

use serde::{Deserialize, Serialize};
use std::fmt;

use hivemind_common::ModelType;

use crate::error::FlError;
use crate::signer::Signer;
use crate::{AggregatedUpdate, ModelUpdate};

/// FL round status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    /// Just created
    Recruiting,
    /// Accepting updates
    Training,
    /// Folding updates into the model
    Aggregating,
    /// Pushing the new version to stale workers
    Distributing,
    /// Finished with a new model version
    Completed,
    /// Finished without changing the model
    Failed,
}

impl RoundStatus {
    /// Completed and failed rounds never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, RoundStatus::Completed | RoundStatus::Failed)
    }

    fn can_transition_to(self, next: RoundStatus) -> bool {
        use RoundStatus::*;
        matches!(
            (self, next),
            (Recruiting, Training)
                | (Training, Aggregating)
                | (Training, Failed)
                | (Aggregating, Distributing)
                | (Aggregating, Failed)
                | (Distributing, Completed)
        )
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStatus::Recruiting => "recruiting",
            RoundStatus::Training => "training",
            RoundStatus::Aggregating => "aggregating",
            RoundStatus::Distributing => "distributing",
            RoundStatus::Completed => "completed",
            RoundStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why an update was not accepted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Signature does not match the update contents
    InvalidSignature,
    /// Reported norm exceeds the tolerated bound
    NormOutOfBounds { norm: f64, limit: f64 },
    /// Contributing worker is not trusted enough
    LowTrust { trust: f64, minimum: f64 },
    /// Contributing worker is not registered
    UnknownWorker,
    /// Model's privacy budget cannot absorb the update
    PrivacyBudgetExhausted { used: f64, cost: f64, ceiling: f64 },
}

impl RejectReason {
    /// Short machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InvalidSignature => "invalid_signature",
            RejectReason::NormOutOfBounds { .. } => "norm_out_of_bounds",
            RejectReason::LowTrust { .. } => "low_trust",
            RejectReason::UnknownWorker => "unknown_worker",
            RejectReason::PrivacyBudgetExhausted { .. } => "privacy_budget_exhausted",
        }
    }
}

/// Checks signature, norm bound and trust of an update.
///
/// `trust` is `None` for unregistered workers.
pub fn validate_update(
    update: &ModelUpdate,
    signer: &dyn Signer,
    norm_limit: f64,
    trust: Option<f64>,
    min_trust: f64,
) -> Result<(), RejectReason> {
    if !signer.verify(&update.update_id, &update.gradients, &update.signature) {
        return Err(RejectReason::InvalidSignature);
    }
    if !(update.gradient_norm <= norm_limit) {
        return Err(RejectReason::NormOutOfBounds {
            norm: update.gradient_norm,
            limit: norm_limit,
        });
    }
    match trust {
        None => Err(RejectReason::UnknownWorker),
        Some(trust) if trust < min_trust => Err(RejectReason::LowTrust {
            trust,
            minimum: min_trust,
        }),
        Some(_) => Ok(()),
    }
}

/// One active learning cycle for one model type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedRound {
    pub round_id: String,
    pub sequence: u64,
    pub model_type: ModelType,
    pub started_at_ms: u64,
    pub deadline_ms: u64,
    pub target_participants: usize,
    pub status: RoundStatus,
    pub accuracy_before: f64,
    /// Updates accepted and not yet aggregated
    pub pending: Vec<ModelUpdate>,
    /// Distinct contributors accepted so far
    pub participants: Vec<String>,
}

impl FederatedRound {
    /// Creates a round and moves it straight into training
    pub fn start(
        model_type: ModelType,
        sequence: u64,
        target_participants: usize,
        accuracy_before: f64,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Self {
        let mut round = Self {
            round_id: format!("{model_type}-r{sequence:06}"),
            sequence,
            model_type,
            started_at_ms: now_ms,
            deadline_ms: now_ms.saturating_add(timeout_ms),
            target_participants,
            status: RoundStatus::Recruiting,
            accuracy_before,
            pending: Vec::new(),
            participants: Vec::new(),
        };
        let started = round.transition(RoundStatus::Training);
        debug_assert!(started.is_ok());
        round
    }

    /// Moves to `next` if the lifecycle allows it
    pub fn transition(&mut self, next: RoundStatus) -> Result<(), FlError> {
        if !self.status.can_transition_to(next) {
            return Err(FlError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether `worker_id` already contributed to this round
    pub fn has_contribution_from(&self, worker_id: &str) -> bool {
        self.participants.iter().any(|p| p == worker_id)
    }

    /// Adds an update while training.
    ///
    /// Gives the update back if the round is not training or the worker
    /// already contributed; the caller queues it for the next round.
    pub fn accept(&mut self, update: ModelUpdate) -> Result<usize, ModelUpdate> {
        if self.status != RoundStatus::Training || self.has_contribution_from(&update.worker_id) {
            return Err(update);
        }
        self.participants.push(update.worker_id.clone());
        self.pending.push(update);
        Ok(self.pending.len())
    }

    /// Whether enough updates arrived to aggregate early
    pub fn is_ready(&self) -> bool {
        self.pending.len() >= self.target_participants
    }

    /// Terminal record of this round
    pub fn finish(
        &self,
        finished_at_ms: u64,
        outcome: RoundOutcome,
    ) -> RoundRecord {
        RoundRecord {
            round_id: self.round_id.clone(),
            sequence: self.sequence,
            model_type: self.model_type.clone(),
            started_at_ms: self.started_at_ms,
            finished_at_ms,
            target_participants: self.target_participants,
            actual_participants: self.participants.len(),
            status: self.status,
            accuracy_before: self.accuracy_before,
            accuracy_after: outcome.accuracy_after,
            convergence_delta: outcome.convergence_delta,
            aggregated: outcome.aggregated,
            failure_reason: outcome.failure_reason,
        }
    }
}

/// Results attached to a round when it terminates
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    pub accuracy_after: Option<f64>,
    pub convergence_delta: Option<f64>,
    pub aggregated: Option<AggregatedUpdate>,
    pub failure_reason: Option<String>,
}

impl RoundOutcome {
    /// Outcome of a failed round
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Immutable history entry of a finished round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub round_id: String,
    pub sequence: u64,
    pub model_type: ModelType,
    pub started_at_ms: u64,
    pub finished_at_ms: u64,
    pub target_participants: usize,
    pub actual_participants: usize,
    pub status: RoundStatus,
    pub accuracy_before: f64,
    pub accuracy_after: Option<f64>,
    pub convergence_delta: Option<f64>,
    pub aggregated: Option<AggregatedUpdate>,
    pub failure_reason: Option<String>,
}
