//! Local experience buffering
//!
//! Workers report raw observations which stay in the buffer until the sync
//! timer groups them into per-model, per-worker batches large enough to be
//! privatised. Undersized groups wait for later flushes; the buffer keeps at
//! most `retention` entries after each flush.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

use hivemind_common::{HiveMindConfig, ModelType};

/// One local observation. Its meaning is opaque to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    /// Reporting worker
    pub worker_id: String,
    /// Target classification label, routed to a model type
    pub target_label: String,
    /// Fixed-length feature vector
    pub features: Vec<f64>,
    /// Success indicator in [0, 1]
    pub success: f64,
    /// Detection indicator in [0, 1]
    pub detection: f64,
    /// Difficulty indicator in [0, 1]
    pub difficulty: f64,
    /// Observed latency
    pub latency_ms: Option<u64>,
    /// Retries before the outcome
    pub retries: u32,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
}

impl Experience {
    /// Creates an experience with neutral indicators
    pub fn new(
        worker_id: impl Into<String>,
        target_label: impl Into<String>,
        features: Vec<f64>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            target_label: target_label.into(),
            features,
            success: 0.0,
            detection: 0.0,
            difficulty: 0.0,
            latency_ms: None,
            retries: 0,
            metadata: BTreeMap::new(),
        }
    }

    /// Sets the three outcome indicators
    pub fn with_outcome(mut self, success: f64, detection: f64, difficulty: f64) -> Self {
        self.success = success;
        self.detection = detection;
        self.difficulty = difficulty;
        self
    }

    /// Sets latency and retry metadata
    pub fn with_timing(mut self, latency_ms: u64, retries: u32) -> Self {
        self.latency_ms = Some(latency_ms);
        self.retries = retries;
        self
    }

    /// Whether the observation reports a success
    pub fn is_success(&self) -> bool {
        self.success >= 0.5
    }
}

/// Experience held by the buffer
#[derive(Debug, Clone)]
struct BufferedExperience {
    model_type: ModelType,
    experience: Experience,
}

/// Same-worker, same-model experiences ready for the privacy engine
#[derive(Debug, Clone)]
pub struct ExperienceBatch {
    pub model_type: ModelType,
    pub worker_id: String,
    pub experiences: Vec<Experience>,
}

/// Result of a flush pass
#[derive(Debug, Default)]
pub struct FlushResult {
    /// Groups that met the sample floor
    pub batches: Vec<ExperienceBatch>,
    /// Groups below the floor as `(model, worker, size)`, before eviction
    pub deferred_groups: Vec<(ModelType, String, usize)>,
    /// Experiences left in the buffer for a later flush
    pub deferred: usize,
    /// Experiences dropped by the retention cap
    pub evicted: usize,
}

/// Total mapping from experience labels to model types
#[derive(Debug, Clone)]
pub struct LabelRouter {
    routes: BTreeMap<String, ModelType>,
    default_model: ModelType,
}

impl LabelRouter {
    /// Creates a router from explicit routes and a fallback
    pub fn new(routes: BTreeMap<String, ModelType>, default_model: ModelType) -> Self {
        Self {
            routes,
            default_model,
        }
    }

    /// Creates the router described by a configuration
    pub fn from_config(config: &HiveMindConfig) -> Self {
        Self::new(config.label_routes.clone(), config.default_model.clone())
    }

    /// Model type for a label; unrouted labels go to the default model
    pub fn route(&self, label: &str) -> &ModelType {
        self.routes.get(label).unwrap_or(&self.default_model)
    }
}

/// FIFO buffer of unconsumed experiences
#[derive(Debug)]
pub struct ExperienceBuffer {
    entries: VecDeque<BufferedExperience>,
    retention: usize,
    next_id: u64,
}

impl ExperienceBuffer {
    /// Creates a buffer keeping at most `retention` entries after a flush
    pub fn new(retention: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            retention,
            next_id: 1,
        }
    }

    /// Appends an experience routed to `model_type` and returns its ID
    pub fn record(&mut self, model_type: ModelType, experience: Experience) -> String {
        let id = format!("exp-{:010}", self.next_id);
        self.next_id += 1;
        self.entries.push_back(BufferedExperience {
            model_type,
            experience,
        });
        id
    }

    /// Takes every group of at least `min_samples` experiences.
    ///
    /// Smaller groups stay buffered in arrival order. The oldest entries are
    /// then evicted until at most `retention` remain.
    pub fn flush(&mut self, min_samples: usize) -> FlushResult {
        let mut counts: HashMap<(ModelType, String), usize> = HashMap::new();
        for entry in &self.entries {
            *counts
                .entry((entry.model_type.clone(), entry.experience.worker_id.clone()))
                .or_default() += 1;
        }

        let mut groups: BTreeMap<(ModelType, String), Vec<Experience>> = BTreeMap::new();
        let mut kept = VecDeque::new();
        for entry in self.entries.drain(..) {
            let key = (entry.model_type.clone(), entry.experience.worker_id.clone());
            if counts.get(&key).copied().unwrap_or(0) >= min_samples {
                groups.entry(key).or_default().push(entry.experience);
            } else {
                kept.push_back(entry);
            }
        }

        let mut deferred_groups: Vec<(ModelType, String, usize)> = counts
            .into_iter()
            .filter(|(_, n)| *n < min_samples)
            .map(|((model_type, worker_id), n)| (model_type, worker_id, n))
            .collect();
        deferred_groups.sort();

        let evicted = kept.len().saturating_sub(self.retention);
        kept.drain(..evicted);
        self.entries = kept;

        FlushResult {
            batches: groups
                .into_iter()
                .map(|((model_type, worker_id), experiences)| ExperienceBatch {
                    model_type,
                    worker_id,
                    experiences,
                })
                .collect(),
            deferred_groups,
            deferred: self.entries.len(),
            evicted,
        }
    }

    /// Number of buffered experiences
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
