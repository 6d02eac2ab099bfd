//! Differential privacy engine
//!
//! Turns a batch of same-worker, same-model experiences into a
//! [`ModelUpdate`] under the Gaussian mechanism:
//!
//! 1. approximate a local gradient from the batch
//! 2. clip it to `max_gradient_norm` (bounds the sensitivity)
//! 3. add `N(0, sigma)` noise per dimension,
//!    `sigma = noise_multiplier * max_gradient_norm / sqrt(batch)`
//! 4. charge `epsilon = sqrt(2 ln(1.25 / delta)) / (noise_multiplier * batch)`
//! 5. optionally keep only the top-k entries (after noise, never before)
//! 6. sign the result
//!
//! Batches below the sample floor never produce an update.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use hivemind_common::{ModelType, PrivacyConfig};

use crate::experience::Experience;
use crate::signer::Signer;
use crate::{lock, ModelUpdate};

/// Model state an update is computed against
#[derive(Debug, Clone, PartialEq)]
pub struct TargetModel {
    pub model_type: ModelType,
    pub version: u64,
    pub parameter_count: usize,
    pub accuracy: f64,
}

/// Running epsilon totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivacyAccountant {
    /// Spent across all models
    pub total: f64,
    /// Spent per model type
    pub per_model: BTreeMap<ModelType, f64>,
}

impl PrivacyAccountant {
    /// Charges `epsilon` to a model
    pub fn charge(&mut self, model_type: &ModelType, epsilon: f64) {
        self.total += epsilon;
        *self.per_model.entry(model_type.clone()).or_default() += epsilon;
    }

    /// Epsilon charged to one model
    pub fn spent(&self, model_type: &ModelType) -> f64 {
        self.per_model.get(model_type).copied().unwrap_or(0.0)
    }
}

/// Produces clipped, noised and signed updates
pub struct PrivacyEngine {
    config: PrivacyConfig,
    min_samples: usize,
    signer: Arc<dyn Signer>,
    rng: Mutex<StdRng>,
    accountant: Mutex<PrivacyAccountant>,
    next_update: AtomicU64,
}

impl std::fmt::Debug for PrivacyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivacyEngine")
            .field("config", &self.config)
            .field("min_samples", &self.min_samples)
            .finish_non_exhaustive()
    }
}

impl PrivacyEngine {
    /// Creates an engine. A seed makes the noise reproducible.
    pub fn new(
        config: PrivacyConfig,
        min_samples: usize,
        signer: Arc<dyn Signer>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            min_samples,
            signer,
            rng: Mutex::new(rng),
            accountant: Mutex::new(PrivacyAccountant::default()),
            next_update: AtomicU64::new(1),
        }
    }

    /// Minimum batch size that yields an update
    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    /// Per-dimension noise standard deviation for a batch size
    pub fn noise_sigma(&self, batch_size: usize) -> f64 {
        self.config.noise_multiplier * self.config.max_gradient_norm
            / (batch_size.max(1) as f64).sqrt()
    }

    /// Privatises a batch.
    ///
    /// Returns `None` when the batch is below the sample floor.
    pub fn privatize(
        &self,
        target: &TargetModel,
        worker_id: &str,
        region: &str,
        experiences: &[Experience],
        now_ms: u64,
    ) -> Option<ModelUpdate> {
        let batch_size = experiences.len();
        if batch_size < self.min_samples || batch_size == 0 {
            debug!(
                worker = worker_id,
                model = %target.model_type,
                batch_size,
                floor = self.min_samples,
                "Batch below sample floor, no update produced"
            );
            return None;
        }

        let mut gradients = local_gradient(experiences, target.parameter_count);
        let gradient_norm = clip_gradient(&mut gradients, self.config.max_gradient_norm);

        let sigma = self.noise_sigma(batch_size);
        let mut noise_energy = 0.0;
        {
            let mut rng = lock(&self.rng);
            for g in gradients.iter_mut() {
                let noise = gaussian_noise(&mut *rng, sigma);
                noise_energy += noise * noise;
                *g += noise;
            }
        }
        let noise_added = if gradients.is_empty() {
            0.0
        } else {
            (noise_energy / gradients.len() as f64).sqrt()
        };

        if self.config.compression_enabled {
            sparsify_top_k(&mut gradients, self.config.compression_ratio);
        }

        let privacy_cost = epsilon_cost(batch_size, self.config.delta, self.config.noise_multiplier);
        lock(&self.accountant).charge(&target.model_type, privacy_cost);

        let sequence = self.next_update.fetch_add(1, Ordering::Relaxed);
        let update_id = format!("upd-{}-{worker_id}-{sequence:08}", target.model_type);
        let signature = self.signer.sign(&update_id, &gradients);

        let accuracy_after =
            experiences.iter().map(|e| e.success.clamp(0.0, 1.0)).sum::<f64>() / batch_size as f64;

        Some(ModelUpdate {
            update_id,
            worker_id: worker_id.to_string(),
            region: region.to_string(),
            model_type: target.model_type.clone(),
            base_version: target.version,
            gradients,
            gradient_norm,
            clipping_bound: self.config.max_gradient_norm,
            noise_added,
            privacy_cost,
            accuracy_before: target.accuracy,
            accuracy_after,
            sample_count: batch_size,
            created_at_ms: now_ms,
            signature,
        })
    }

    /// Snapshot of the epsilon totals
    pub fn accountant(&self) -> PrivacyAccountant {
        lock(&self.accountant).clone()
    }

    /// Epsilon spent across all models
    pub fn privacy_spent(&self) -> f64 {
        lock(&self.accountant).total
    }

    /// Replaces the running totals with previously exported ones
    pub fn restore_accountant(&self, accountant: PrivacyAccountant) {
        *lock(&self.accountant) = accountant;
    }
}

/// Approximates a gradient from a batch.
///
/// Entry `i` accumulates `features[i] * (success - 0.5) / batch` for every
/// experience; features beyond `dim` are ignored and short feature vectors
/// leave trailing entries at zero.
pub fn local_gradient(experiences: &[Experience], dim: usize) -> Vec<f64> {
    let mut gradient = vec![0.0; dim];
    if experiences.is_empty() {
        return gradient;
    }

    let batch = experiences.len() as f64;
    for exp in experiences {
        let signal = (exp.success - 0.5) / batch;
        for (g, f) in gradient.iter_mut().zip(&exp.features) {
            *g += f * signal;
        }
    }
    gradient
}

/// L2 norm of a vector
pub fn l2_norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Rescales `values` so its L2 norm does not exceed `bound`.
///
/// Returns the norm after clipping.
pub fn clip_gradient(values: &mut [f64], bound: f64) -> f64 {
    let norm = l2_norm(values);
    if norm > bound && norm > 0.0 {
        let scale = bound / norm;
        for v in values.iter_mut() {
            *v *= scale;
        }
        bound
    } else {
        norm
    }
}

/// Draws from `N(0, sigma)` with the Box-Muller transform
pub fn gaussian_noise<R: Rng + ?Sized>(rng: &mut R, sigma: f64) -> f64 {
    // u1 in (0, 1] keeps ln(u1) finite
    let u1: f64 = 1.0 - rng.gen::<f64>();
    let u2: f64 = rng.gen::<f64>();
    sigma * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Epsilon charged for one Gaussian-mechanism release of a batch
pub fn epsilon_cost(batch_size: usize, delta: f64, noise_multiplier: f64) -> f64 {
    (1.0 / batch_size.max(1) as f64) * (2.0 * (1.25 / delta).ln()).sqrt() / noise_multiplier
}

/// Zeroes all but the `ratio * len` largest-magnitude entries.
///
/// At least one entry is kept. Returns the number kept.
pub fn sparsify_top_k(values: &mut [f64], ratio: f64) -> usize {
    if values.is_empty() {
        return 0;
    }
    let keep = ((ratio * values.len() as f64).floor() as usize).clamp(1, values.len());

    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| {
        values[b]
            .abs()
            .partial_cmp(&values[a].abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    for &i in &order[keep..] {
        values[i] = 0.0;
    }
    keep
}
