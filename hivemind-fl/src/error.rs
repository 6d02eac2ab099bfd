//! Error types for coordinator operations
//!
//! Only caller errors surface here. Rejected updates, undersized batches and
//! unknown workers are expected steady-state outcomes and are reported
//! through return values and events instead.

use thiserror::Error;

use hivemind_common::ModelType;

use crate::round::RoundStatus;

/// Errors returned by the federated learning core
#[derive(Debug, Error)]
pub enum FlError {
    /// Model type is not part of the configured taxonomy
    #[error("Unknown model type: {0}")]
    UnknownModelType(ModelType),

    /// A non-terminal round already exists for the model
    #[error("Round {round_id} already active for {model_type}")]
    RoundInProgress {
        model_type: ModelType,
        round_id: String,
    },

    /// Illegal round state change
    #[error("Invalid round transition {from:?} -> {to:?}")]
    InvalidTransition { from: RoundStatus, to: RoundStatus },

    /// Aggregation could not produce a model
    #[error("Aggregation failed: {reason}")]
    AggregationFailed { reason: String },

    /// Restored state does not match the configured taxonomy
    #[error("State mismatch: {reason}")]
    StateMismatch { reason: String },

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] hivemind_common::Error),
}
