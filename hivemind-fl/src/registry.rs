//! Worker registry and trust scoring
//!
//! Tracks every participating worker, the model version it currently holds
//! per model type, its rolling performance metrics and a trust score that
//! moves by exponential moving average.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use hivemind_common::{ModelType, TrustConfig};

/// Rolling performance rates reported by a worker, each in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Fraction of successful operations
    pub success_rate: f64,
    /// Fraction of operations that were detected
    pub detection_rate: f64,
    /// Fraction of defences bypassed
    pub bypass_rate: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            success_rate: 0.5,
            detection_rate: 0.5,
            bypass_rate: 0.5,
        }
    }
}

impl PerformanceMetrics {
    /// Composite performance score in [0, 1]
    pub fn performance(&self) -> f64 {
        0.4 * self.success_rate + 0.3 * (1.0 - self.detection_rate) + 0.3 * self.bypass_rate
    }
}

/// Partial metrics report; absent fields keep their previous value
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub success_rate: Option<f64>,
    pub detection_rate: Option<f64>,
    pub bypass_rate: Option<f64>,
}

impl MetricsReport {
    /// Report carrying all three rates
    pub fn full(success_rate: f64, detection_rate: f64, bypass_rate: f64) -> Self {
        Self {
            success_rate: Some(success_rate),
            detection_rate: Some(detection_rate),
            bypass_rate: Some(bypass_rate),
        }
    }
}

/// Registry entry for one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerState {
    /// Caller-supplied worker ID
    pub id: String,
    /// Region label
    pub region: String,
    /// Model version held by the worker, per model type
    pub model_versions: BTreeMap<ModelType, u64>,
    /// Latest performance metrics
    pub metrics: PerformanceMetrics,
    /// Trust score in [0, 1]
    pub trust_score: f64,
    /// Most recent trust values, oldest first
    pub reputation_history: VecDeque<f64>,
    /// Model snapshots delivered to this worker
    pub updates_received: u64,
    /// Time of the last successful delivery
    pub last_sync_at_ms: Option<u64>,
    /// Aggregation rounds this worker contributed to
    pub rounds_participated: u64,
    /// Registration time
    pub registered_at_ms: u64,
}

impl WorkerState {
    /// Version of `model_type` held by the worker (0 if never synced)
    pub fn model_version(&self, model_type: &ModelType) -> u64 {
        self.model_versions.get(model_type).copied().unwrap_or(0)
    }
}

/// Registry of participating workers
#[derive(Debug)]
pub struct WorkerRegistry {
    workers: HashMap<String, WorkerState>,
    trust: TrustConfig,
}

impl WorkerRegistry {
    /// Creates an empty registry
    pub fn new(trust: TrustConfig) -> Self {
        Self {
            workers: HashMap::new(),
            trust,
        }
    }

    /// Registers a worker, replacing any previous entry with the same ID
    pub fn register(
        &mut self,
        id: impl Into<String>,
        region: impl Into<String>,
        model_versions: BTreeMap<ModelType, u64>,
        now_ms: u64,
    ) -> WorkerState {
        let id = id.into();
        let state = WorkerState {
            id: id.clone(),
            region: region.into(),
            model_versions,
            metrics: PerformanceMetrics::default(),
            trust_score: self.trust.initial_trust,
            reputation_history: VecDeque::with_capacity(self.trust.history_len),
            updates_received: 0,
            last_sync_at_ms: None,
            rounds_participated: 0,
            registered_at_ms: now_ms,
        };
        if self.workers.insert(id.clone(), state.clone()).is_some() {
            debug!(worker = %id, "Worker re-registered, previous state reset");
        }
        state
    }

    /// Inserts a fully formed entry (used when restoring state)
    pub fn insert(&mut self, state: WorkerState) {
        self.workers.insert(state.id.clone(), state);
    }

    /// Applies a metrics report and returns the new trust score.
    ///
    /// Unknown workers are ignored and yield `None`.
    pub fn update_metrics(&mut self, id: &str, report: MetricsReport) -> Option<f64> {
        let trust = self.trust.clone();
        let worker = self.workers.get_mut(id)?;

        if let Some(rate) = report.success_rate {
            worker.metrics.success_rate = rate.clamp(0.0, 1.0);
        }
        if let Some(rate) = report.detection_rate {
            worker.metrics.detection_rate = rate.clamp(0.0, 1.0);
        }
        if let Some(rate) = report.bypass_rate {
            worker.metrics.bypass_rate = rate.clamp(0.0, 1.0);
        }

        let performance = worker.metrics.performance();
        Some(blend_trust(worker, performance, &trust))
    }

    /// Folds a round outcome into a contributor's trust.
    ///
    /// `alignment` is in [0, 1], 1 meaning the contribution pointed the same
    /// way as the round's aggregate.
    pub fn record_round_feedback(&mut self, id: &str, alignment: f64) -> Option<f64> {
        let trust = self.trust.clone();
        let worker = self.workers.get_mut(id)?;
        worker.rounds_participated += 1;
        Some(blend_trust(worker, alignment.clamp(0.0, 1.0), &trust))
    }

    /// Returns a worker entry
    pub fn get(&self, id: &str) -> Option<&WorkerState> {
        self.workers.get(id)
    }

    /// Returns a worker's trust score
    pub fn trust_score(&self, id: &str) -> Option<f64> {
        self.workers.get(id).map(|w| w.trust_score)
    }

    /// IDs of workers holding an older version of `model_type`, sorted
    pub fn stale_workers(&self, model_type: &ModelType, current_version: u64) -> Vec<String> {
        let mut stale: Vec<String> = self
            .workers
            .values()
            .filter(|w| w.model_version(model_type) < current_version)
            .map(|w| w.id.clone())
            .collect();
        stale.sort();
        stale
    }

    /// Records a successful model delivery
    pub fn mark_synced(&mut self, id: &str, model_type: &ModelType, version: u64, now_ms: u64) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.model_versions.insert(model_type.clone(), version);
            worker.updates_received += 1;
            worker.last_sync_at_ms = Some(now_ms);
        }
    }

    /// Iterates over all workers in no particular order
    pub fn workers(&self) -> impl Iterator<Item = &WorkerState> {
        self.workers.values()
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no workers are registered
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

fn blend_trust(worker: &mut WorkerState, performance: f64, trust: &TrustConfig) -> f64 {
    worker.trust_score = (worker.trust_score * trust.retention
        + performance * (1.0 - trust.retention))
        .clamp(0.0, 1.0);

    if worker.reputation_history.len() >= trust.history_len {
        worker.reputation_history.pop_front();
    }
    worker.reputation_history.push_back(worker.trust_score);
    worker.trust_score
}
