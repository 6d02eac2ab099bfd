//! Exportable coordinator state
//!
//! Storage is left to the host. The coordinator exports and restores a
//! single JSON document holding the durable record of every model and
//! worker, the append-only round history and any round still in flight.
//! In-flight rounds are never resumed: a restored coordinator records them
//! as failed. Floats are written with round-trip precision so restored
//! gradients still match their signatures.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tracing::{info, warn};

use hivemind_common::{ModelArchitecture, ModelType};

use crate::coordinator::{HiveMind, ModelLane};
use crate::error::FlError;
use crate::events::HiveMindEvent;
use crate::model_store::{GlobalModel, LayerParams, ModelStore};
use crate::privacy::PrivacyAccountant;
use crate::registry::{PerformanceMetrics, WorkerState};
use crate::round::{validate_update, FederatedRound, RoundRecord};
use crate::{lock, read, write, ModelUpdate};

/// Durable record of one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_type: ModelType,
    pub version: u64,
    pub weights: BTreeMap<String, Vec<f64>>,
    pub biases: BTreeMap<String, Vec<f64>>,
    pub samples_processed: u64,
    pub rounds_completed: u64,
    pub privacy_budget_used: f64,
    pub accuracy: f64,
    pub updated_at_ms: u64,
}

impl ModelRecord {
    pub fn from_model(model: &GlobalModel) -> Self {
        let snapshot = model.snapshot();
        Self {
            model_type: model.model_type.clone(),
            version: model.version,
            weights: snapshot.weights,
            biases: snapshot.biases,
            samples_processed: model.samples_processed,
            rounds_completed: model.rounds_completed,
            privacy_budget_used: model.privacy_budget_used,
            accuracy: model.accuracy,
            updated_at_ms: model.updated_at_ms,
        }
    }

    /// Rebuilds the model, checking every layer against `architecture`
    pub fn into_model(
        mut self,
        architecture: &ModelArchitecture,
        max_privacy_budget: f64,
    ) -> Result<GlobalModel, FlError> {
        if self.version == 0 {
            return Err(mismatch(format!("{} has version 0", self.model_type)));
        }

        let mut layers = Vec::with_capacity(architecture.layers.len());
        for spec in &architecture.layers {
            let weights = self.weights.remove(&spec.name).unwrap_or_default();
            let biases = self.biases.remove(&spec.name).unwrap_or_default();
            if weights.len() != spec.weights || biases.len() != spec.biases {
                return Err(mismatch(format!(
                    "{} layer {} has {}+{} parameters, expected {}+{}",
                    self.model_type,
                    spec.name,
                    weights.len(),
                    biases.len(),
                    spec.weights,
                    spec.biases
                )));
            }
            layers.push(LayerParams {
                name: spec.name.clone(),
                weights,
                biases,
            });
        }
        if let Some(extra) = self.weights.keys().chain(self.biases.keys()).next() {
            return Err(mismatch(format!("{} has unknown layer {extra}", self.model_type)));
        }

        Ok(GlobalModel {
            model_type: self.model_type,
            version: self.version,
            layers,
            samples_processed: self.samples_processed,
            rounds_completed: self.rounds_completed,
            privacy_budget_used: self.privacy_budget_used,
            max_privacy_budget,
            accuracy: self.accuracy,
            updated_at_ms: self.updated_at_ms,
        })
    }
}

/// Durable record of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: String,
    pub region: String,
    pub model_versions: BTreeMap<ModelType, u64>,
    pub trust_score: f64,
    pub reputation_history: VecDeque<f64>,
    pub metrics: PerformanceMetrics,
    pub updates_received: u64,
    pub rounds_participated: u64,
    pub last_sync_at_ms: Option<u64>,
    pub registered_at_ms: u64,
}

impl From<&WorkerState> for WorkerRecord {
    fn from(state: &WorkerState) -> Self {
        Self {
            id: state.id.clone(),
            region: state.region.clone(),
            model_versions: state.model_versions.clone(),
            trust_score: state.trust_score,
            reputation_history: state.reputation_history.clone(),
            metrics: state.metrics,
            updates_received: state.updates_received,
            rounds_participated: state.rounds_participated,
            last_sync_at_ms: state.last_sync_at_ms,
            registered_at_ms: state.registered_at_ms,
        }
    }
}

impl From<WorkerRecord> for WorkerState {
    fn from(record: WorkerRecord) -> Self {
        Self {
            id: record.id,
            region: record.region,
            model_versions: record.model_versions,
            metrics: record.metrics,
            trust_score: record.trust_score.clamp(0.0, 1.0),
            reputation_history: record.reputation_history,
            updates_received: record.updates_received,
            last_sync_at_ms: record.last_sync_at_ms,
            rounds_participated: record.rounds_participated,
            registered_at_ms: record.registered_at_ms,
        }
    }
}

/// Complete exported coordinator state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HiveMindState {
    pub exported_at_ms: u64,
    pub models: Vec<ModelRecord>,
    pub workers: Vec<WorkerRecord>,
    /// Finished rounds, oldest first per model
    pub history: Vec<RoundRecord>,
    /// Rounds that had not finished at export time
    pub in_flight: Vec<FederatedRound>,
    /// Updates waiting for the next round
    pub queued: Vec<ModelUpdate>,
    /// Next round sequence number per model
    pub next_sequence: BTreeMap<ModelType, u64>,
    pub privacy: PrivacyAccountant,
}

impl HiveMindState {
    pub fn to_json(&self) -> Result<String, FlError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, FlError> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Coordinator export and restore
// ============================================================================

impl HiveMind {
    /// Durable snapshot of models, workers, rounds and queued updates
    pub fn export_state(&self) -> HiveMindState {
        let mut state = HiveMindState {
            exported_at_ms: self.now(),
            privacy: self.privacy.accountant(),
            ..Default::default()
        };
        for (model_type, lane) in &self.lanes {
            let lane = lock(lane);
            state.models.push(ModelRecord::from_model(lane.store.current()));
            state.history.extend(lane.history.iter().cloned());
            state.in_flight.extend(lane.active.iter().cloned());
            state.queued.extend(lane.queued.iter().map(|(_, u)| u.clone()));
            state.next_sequence.insert(model_type.clone(), lane.next_sequence);
        }

        let registry = read(&self.registry);
        let mut workers: Vec<WorkerRecord> = registry.workers().map(WorkerRecord::from).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        state.workers = workers;
        state
    }

    /// Loads exported state into a freshly built coordinator.
    ///
    /// In-flight rounds are recorded as failed. Queued updates are
    /// validated again against the restored workers before they rejoin the
    /// queue.
    pub(crate) fn restore(&self, state: HiveMindState) -> Result<(), FlError> {
        let now = self.now();
        for record in state.models {
            let architecture = self
                .config
                .architecture(&record.model_type)
                .ok_or_else(|| unconfigured(&record.model_type))?;
            let model = record.into_model(architecture, self.config.privacy.max_privacy_budget)?;
            let mut lane = lock(self.lane_for_restore(&model.model_type)?);
            lane.store = ModelStore::new(model, self.config.max_versions);
        }

        for record in state.history {
            let mut lane = lock(self.lane_for_restore(&record.model_type)?);
            lane.next_sequence = lane.next_sequence.max(record.sequence + 1);
            lane.record(record);
        }

        for round in state.in_flight {
            let mut lane = lock(self.lane_for_restore(&round.model_type)?);
            lane.next_sequence = lane.next_sequence.max(round.sequence + 1);
            if !round.pending.is_empty() {
                warn!(
                    round = %round.round_id,
                    dropped = round.pending.len(),
                    "Updates of interrupted round discarded"
                );
            }
            self.fail_round(&mut lane, round, "interrupted", now);
        }

        for (model_type, next) in state.next_sequence {
            let mut lane = lock(self.lane_for_restore(&model_type)?);
            lane.next_sequence = lane.next_sequence.max(next);
        }

        {
            let mut registry = write(&self.registry);
            for record in state.workers {
                registry.insert(record.into());
            }
        }
        self.privacy.restore_accountant(state.privacy);

        for update in state.queued {
            let mut lane = lock(self.lane_for_restore(&update.model_type)?);
            let trust = read(&self.registry).trust_score(&update.worker_id);
            let verdict = validate_update(
                &update,
                self.signer.as_ref(),
                self.config.norm_limit(),
                trust,
                self.config.trust.min_trust,
            );
            match verdict {
                Ok(()) => self.queue_update(&mut lane, update, now),
                Err(reason) => {
                    warn!(
                        update = %update.update_id,
                        worker = %update.worker_id,
                        reason = reason.code(),
                        "Restored update rejected"
                    );
                    self.events.emit(HiveMindEvent::UpdateRejected {
                        update_id: update.update_id,
                        worker_id: update.worker_id,
                        reason,
                    });
                }
            }
        }

        info!(
            workers = self.worker_count(),
            exported_at_ms = state.exported_at_ms,
            "HiveMind state restored"
        );
        Ok(())
    }

    fn lane_for_restore(&self, model_type: &ModelType) -> Result<&Mutex<ModelLane>, FlError> {
        self.lanes.get(model_type).ok_or_else(|| unconfigured(model_type))
    }
}

fn unconfigured(model_type: &ModelType) -> FlError {
    mismatch(format!("model {model_type} is not configured"))
}

fn mismatch(reason: String) -> FlError {
    FlError::StateMismatch { reason }
}
