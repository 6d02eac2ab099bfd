//! Model Versioning
//!
//! Holds the current parameters of one model type together with its
//! cumulative training and privacy statistics, plus an archive of recent
//! snapshots so that participants can be served an exact version. The store
//! is only mutated by the aggregator's apply step.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use hivemind_common::{ModelArchitecture, ModelType};

use crate::error::FlError;
use crate::privacy::TargetModel;

/// Parameters of one named layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerParams {
    pub name: String,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

impl LayerParams {
    fn len(&self) -> usize {
        self.weights.len() + self.biases.len()
    }
}

/// Current state of a shared model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalModel {
    pub model_type: ModelType,
    /// Starts at 1, grows by exactly 1 per completed aggregation
    pub version: u64,
    pub layers: Vec<LayerParams>,
    pub samples_processed: u64,
    pub rounds_completed: u64,
    pub privacy_budget_used: f64,
    pub max_privacy_budget: f64,
    /// Global accuracy estimate in [0, 1]
    pub accuracy: f64,
    pub updated_at_ms: u64,
}

impl GlobalModel {
    /// Creates version 1 of a model with small random weights and zero biases
    pub fn initialize<R: Rng + ?Sized>(
        model_type: ModelType,
        architecture: &ModelArchitecture,
        max_privacy_budget: f64,
        rng: &mut R,
        now_ms: u64,
    ) -> Self {
        let layers = architecture
            .layers
            .iter()
            .map(|spec| LayerParams {
                name: spec.name.clone(),
                weights: (0..spec.weights).map(|_| rng.gen_range(-0.05..0.05)).collect(),
                biases: vec![0.0; spec.biases],
            })
            .collect();

        Self {
            model_type,
            version: 1,
            layers,
            samples_processed: 0,
            rounds_completed: 0,
            privacy_budget_used: 0.0,
            max_privacy_budget,
            accuracy: 0.0,
            updated_at_ms: now_ms,
        }
    }

    /// Number of parameters across all layers
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(LayerParams::len).sum()
    }

    /// Privacy budget left before the ceiling (never negative)
    pub fn budget_remaining(&self) -> f64 {
        (self.max_privacy_budget - self.privacy_budget_used).max(0.0)
    }

    /// View used by the privacy engine
    pub fn target(&self) -> TargetModel {
        TargetModel {
            model_type: self.model_type.clone(),
            version: self.version,
            parameter_count: self.parameter_count(),
            accuracy: self.accuracy,
        }
    }

    /// Layer parameters keyed by layer name
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            model_type: self.model_type.clone(),
            version: self.version,
            weights: self
                .layers
                .iter()
                .map(|l| (l.name.clone(), l.weights.clone()))
                .collect(),
            biases: self
                .layers
                .iter()
                .map(|l| (l.name.clone(), l.biases.clone()))
                .collect(),
        }
    }

    /// Subtracts `learning_rate * gradient` layer by layer.
    ///
    /// Within each layer the gradient covers the weights, then the biases.
    /// Missing trailing gradient entries count as zero. Returns the L2 norm
    /// of the parameter change.
    fn step(&mut self, gradient: &[f64], learning_rate: f64) -> f64 {
        let mut offset = 0;
        let mut change = 0.0;
        for layer in &mut self.layers {
            for param in layer.weights.iter_mut().chain(layer.biases.iter_mut()) {
                let delta = learning_rate * gradient.get(offset).copied().unwrap_or(0.0);
                *param -= delta;
                change += delta * delta;
                offset += 1;
            }
        }
        change.sqrt()
    }
}

/// Serialisable parameter set handed to workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub model_type: ModelType,
    pub version: u64,
    /// Layer name to weights
    pub weights: BTreeMap<String, Vec<f64>>,
    /// Layer name to biases
    pub biases: BTreeMap<String, Vec<f64>>,
}

impl ModelSnapshot {
    /// JSON encoding sent over the transport
    pub fn to_bytes(&self) -> Result<Vec<u8>, FlError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a snapshot produced by [`ModelSnapshot::to_bytes`]
    pub fn from_bytes(data: &[u8]) -> Result<Self, FlError> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Statistics folded into the model by one aggregation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedRound {
    pub samples: u64,
    pub privacy_spent: f64,
    pub accuracy: f64,
}

/// Current model of one type plus its recent versions
#[derive(Debug, Clone)]
pub struct ModelStore {
    model: GlobalModel,
    archive: VecDeque<ModelSnapshot>,
    max_versions: usize,
}

impl ModelStore {
    /// Creates a store around an initial model
    pub fn new(model: GlobalModel, max_versions: usize) -> Self {
        let mut store = Self {
            model,
            archive: VecDeque::new(),
            max_versions: max_versions.max(1),
        };
        store.archive_current();
        store
    }

    /// Current model
    pub fn current(&self) -> &GlobalModel {
        &self.model
    }

    /// Current version number
    pub fn version(&self) -> u64 {
        self.model.version
    }

    /// Applies an aggregate gradient and bumps the version by one.
    ///
    /// Returns the L2 norm of the parameter change.
    pub fn apply(
        &mut self,
        gradient: &[f64],
        learning_rate: f64,
        round: AppliedRound,
        now_ms: u64,
    ) -> f64 {
        let change = self.model.step(gradient, learning_rate);
        self.model.version += 1;
        self.model.samples_processed += round.samples;
        self.model.rounds_completed += 1;
        self.model.privacy_budget_used += round.privacy_spent.max(0.0);
        self.model.accuracy = round.accuracy.clamp(0.0, 1.0);
        self.model.updated_at_ms = now_ms;
        self.archive_current();
        change
    }

    /// Snapshot of an archived version
    pub fn get(&self, version: u64) -> Option<&ModelSnapshot> {
        self.archive.iter().find(|s| s.version == version)
    }

    /// Archived versions, oldest first
    pub fn list_versions(&self) -> Vec<u64> {
        self.archive.iter().map(|s| s.version).collect()
    }

    /// Serialises the current snapshot
    pub fn export(&self) -> Result<Vec<u8>, FlError> {
        self.model.snapshot().to_bytes()
    }

    fn archive_current(&mut self) {
        self.archive.push_back(self.model.snapshot());
        while self.archive.len() > self.max_versions {
            self.archive.pop_front();
        }
    }
}
