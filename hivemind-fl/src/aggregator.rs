//! Trust-weighted federated averaging
//!
//! Each update is weighted by its share of the round's samples times the
//! contributing worker's trust score. The aggregate is the weighted mean of
//! the update gradients and is applied to the model with an SGD step.

use tracing::debug;

use crate::error::FlError;
use crate::model_store::{AppliedRound, ModelStore};
use crate::{AggregatedUpdate, ModelUpdate};

/// Weighted mean of the update gradients.
///
/// `contributions` pairs each update with its worker's trust score. Shorter
/// gradients contribute zero to trailing dimensions. Returns `None` when the
/// weights sum to zero.
pub fn trust_weighted_average(contributions: &[(&ModelUpdate, f64)], dim: usize) -> Option<Vec<f64>> {
    let weights = contribution_weights(contributions)?;
    let total_weight: f64 = weights.iter().sum();

    let mut aggregate = vec![0.0; dim];
    for ((update, _), weight) in contributions.iter().zip(&weights) {
        for (acc, g) in aggregate.iter_mut().zip(&update.gradients) {
            *acc += weight * g;
        }
    }
    for value in &mut aggregate {
        *value /= total_weight;
    }
    Some(aggregate)
}

fn contribution_weights(contributions: &[(&ModelUpdate, f64)]) -> Option<Vec<f64>> {
    let total_samples: usize = contributions.iter().map(|(u, _)| u.sample_count).sum();
    if total_samples == 0 {
        return None;
    }
    let weights: Vec<f64> = contributions
        .iter()
        .map(|(u, trust)| u.sample_count as f64 / total_samples as f64 * trust.max(0.0))
        .collect();
    let total: f64 = weights.iter().sum();
    if total > 0.0 && total.is_finite() {
        Some(weights)
    } else {
        None
    }
}

/// Cosine similarity of two vectors, 0 if either has zero length
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Mean pairwise cosine similarity, 1.0 for fewer than two vectors
pub fn consensus_score(gradients: &[&[f64]]) -> f64 {
    if gradients.len() < 2 {
        return 1.0;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..gradients.len() {
        for j in (i + 1)..gradients.len() {
            total += cosine_similarity(gradients[i], gradients[j]);
            pairs += 1;
        }
    }
    total / pairs as f64
}

/// Everything produced by one aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationOutcome {
    pub aggregated: AggregatedUpdate,
    /// Worker ID to `(cos(update, aggregate) + 1) / 2`
    pub alignments: Vec<(String, f64)>,
    /// L2 norm of the parameter change
    pub convergence_delta: f64,
    pub accuracy_before: f64,
    pub accuracy_after: f64,
}

/// Folds round updates into a model
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    learning_rate: f64,
}

impl Aggregator {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Aggregates `contributions` and applies the result to `store`.
    ///
    /// The store is left untouched on error.
    pub fn aggregate(
        &self,
        store: &mut ModelStore,
        round_id: &str,
        contributions: &[(&ModelUpdate, f64)],
        now_ms: u64,
    ) -> Result<AggregationOutcome, FlError> {
        if contributions.is_empty() {
            return Err(FlError::AggregationFailed {
                reason: "no updates to aggregate".into(),
            });
        }

        let dim = store.current().parameter_count();
        let weights = contribution_weights(contributions).ok_or_else(|| FlError::AggregationFailed {
            reason: "contribution weights sum to zero".into(),
        })?;
        let aggregate = trust_weighted_average(contributions, dim).ok_or_else(|| {
            FlError::AggregationFailed {
                reason: "contribution weights sum to zero".into(),
            }
        })?;
        if aggregate.iter().any(|v| !v.is_finite()) {
            return Err(FlError::AggregationFailed {
                reason: "aggregate gradient is not finite".into(),
            });
        }

        let gradients: Vec<&[f64]> = contributions.iter().map(|(u, _)| u.gradients.as_slice()).collect();
        let consensus = consensus_score(&gradients);

        let total_weight: f64 = weights.iter().sum();
        let accuracy_after = contributions
            .iter()
            .zip(&weights)
            .map(|((u, _), w)| w * u.accuracy_after)
            .sum::<f64>()
            / total_weight;
        let avg_accuracy_gain = contributions.iter().map(|(u, _)| u.accuracy_gain()).sum::<f64>()
            / contributions.len() as f64;
        let total_samples: u64 = contributions.iter().map(|(u, _)| u.sample_count as u64).sum();
        let privacy_spent: f64 = contributions.iter().map(|(u, _)| u.privacy_cost).sum();

        let alignments = contributions
            .iter()
            .map(|(u, _)| {
                let cos = cosine_similarity(&u.gradients, &aggregate);
                (u.worker_id.clone(), (cos + 1.0) / 2.0)
            })
            .collect();

        let accuracy_before = store.current().accuracy;
        let convergence_delta = store.apply(
            &aggregate,
            self.learning_rate,
            AppliedRound {
                samples: total_samples,
                privacy_spent,
                accuracy: accuracy_after,
            },
            now_ms,
        );

        debug!(
            round = round_id,
            version = store.version(),
            contributors = contributions.len(),
            consensus,
            convergence_delta,
            "Aggregate applied"
        );

        Ok(AggregationOutcome {
            aggregated: AggregatedUpdate {
                model_type: store.current().model_type.clone(),
                round_id: round_id.to_string(),
                new_version: store.version(),
                contributors: contributions.iter().map(|(u, _)| u.worker_id.clone()).collect(),
                total_samples,
                avg_accuracy_gain,
                consensus_score: consensus,
                privacy_spent,
            },
            alignments,
            convergence_delta,
            accuracy_before,
            accuracy_after: store.current().accuracy,
        })
    }
}
