//! HiveMind coordinator
//!
//! Owns every registry, buffer and model of one federation and exposes the
//! operations workers and hosts call. State is split so that unrelated work
//! never contends:
//!
//! - one `Mutex<ModelLane>` per model type serialises
//!   submit -> threshold check -> aggregate -> clear for that model only
//! - the worker registry sits behind an `RwLock`
//! - the experience buffer sits behind its own `Mutex`
//!
//! Locks are always taken in the order lane, registry, timers. The buffer
//! lock is never held together with any other.

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use hivemind_common::{BudgetPolicy, Clock, HiveMindConfig, ModelType, SystemClock};

use crate::aggregator::Aggregator;
use crate::distributor::{Distributor, LoggingTransport, Transport};
use crate::error::FlError;
use crate::events::{EventSink, HiveMindEvent, NullEventSink};
use crate::experience::{Experience, ExperienceBuffer, LabelRouter};
use crate::metrics::{AccuracyTrend, ConvergenceDetector, HiveMindStats, ModelStats};
use crate::model_store::{GlobalModel, ModelSnapshot, ModelStore};
use crate::privacy::{PrivacyAccountant, PrivacyEngine};
use crate::registry::{MetricsReport, WorkerRegistry, WorkerState};
use crate::round::{validate_update, FederatedRound, RejectReason, RoundOutcome, RoundRecord, RoundStatus};
use crate::scheduler::{TimerKind, TimerQueue};
use crate::signer::{Sha256Signer, Signer};
use crate::state::HiveMindState;
use crate::urgent::{self, LoggingBroadcaster, UrgencyKind, UrgentBroadcaster};
use crate::{lock, read, write, ModelUpdate};

/// Result of reporting an experience
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    /// Buffered until the next sync
    Buffered {
        experience_id: String,
        model_type: ModelType,
    },
    /// Privatised on its own and broadcast immediately
    Broadcast { update_id: String, kind: UrgencyKind },
    /// Reporting worker is not registered; nothing was recorded
    UnknownWorker,
}

/// Result of submitting an update
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Added to the model's training round
    Accepted { round_id: String },
    /// Held for the model's next round
    Queued,
    /// Dropped without touching model state
    Rejected(RejectReason),
}

/// Summary of one sync pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub batches: usize,
    pub updates_generated: usize,
    pub accepted: usize,
    pub queued: usize,
    pub rejected: usize,
    /// Experiences left buffered below the sample floor
    pub deferred: usize,
    /// Experiences dropped by the retention cap
    pub evicted: usize,
}

/// Per-model state guarded by one lock
#[derive(Debug)]
pub(crate) struct ModelLane {
    pub(crate) store: ModelStore,
    pub(crate) active: Option<FederatedRound>,
    /// Updates waiting for the next round with their arrival time, at most
    /// one per worker
    pub(crate) queued: VecDeque<(u64, ModelUpdate)>,
    pub(crate) history: Vec<RoundRecord>,
    pub(crate) next_sequence: u64,
    convergence: ConvergenceDetector,
}

impl ModelLane {
    fn new(store: ModelStore) -> Self {
        Self {
            store,
            active: None,
            queued: VecDeque::new(),
            history: Vec::new(),
            next_sequence: 1,
            convergence: ConvergenceDetector::default(),
        }
    }

    /// Epsilon already applied plus epsilon of updates waiting to be applied
    fn committed_budget(&self) -> f64 {
        let pending: f64 = self
            .active
            .iter()
            .flat_map(|r| r.pending.iter())
            .map(|u| u.privacy_cost)
            .sum();
        let queued: f64 = self.queued.iter().map(|(_, u)| u.privacy_cost).sum();
        self.store.current().privacy_budget_used + pending + queued
    }

    pub(crate) fn record(&mut self, record: RoundRecord) {
        if let (RoundStatus::Completed, Some(accuracy)) = (record.status, record.accuracy_after) {
            self.convergence.record(accuracy);
        }
        self.history.push(record);
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`HiveMind`] with optional collaborators
pub struct HiveMindBuilder {
    config: HiveMindConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    broadcaster: Arc<dyn UrgentBroadcaster>,
    events: Arc<dyn EventSink>,
    signer: Arc<dyn Signer>,
    state: Option<HiveMindState>,
}

impl HiveMindBuilder {
    pub fn new(config: HiveMindConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            transport: Arc::new(LoggingTransport),
            broadcaster: Arc::new(LoggingBroadcaster),
            events: Arc::new(NullEventSink),
            signer: Arc::new(Sha256Signer),
            state: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn broadcaster(mut self, broadcaster: Arc<dyn UrgentBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    /// Restores previously exported state on build
    pub fn restore(mut self, state: HiveMindState) -> Self {
        self.state = Some(state);
        self
    }

    /// Validates the configuration and creates the coordinator.
    ///
    /// Models start at version 1 unless state is restored. The periodic
    /// timers are armed relative to the clock's current time.
    pub fn build(self) -> Result<HiveMind, FlError> {
        let config = self.config;
        config.validate()?;

        let now = self.clock.now_ms();
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let lanes = config
            .models
            .iter()
            .map(|m| {
                let model = GlobalModel::initialize(
                    m.model_type.clone(),
                    &m.architecture,
                    config.privacy.max_privacy_budget,
                    &mut rng,
                    now,
                );
                let lane = ModelLane::new(ModelStore::new(model, config.max_versions));
                (m.model_type.clone(), Mutex::new(lane))
            })
            .collect();

        if config.min_samples_per_round > 1 {
            warn!(
                min_samples = config.min_samples_per_round,
                "Sample floor above 1, urgent experiences will fall back to the buffer"
            );
        }

        let privacy = PrivacyEngine::new(
            config.privacy.clone(),
            config.min_samples_per_round,
            self.signer.clone(),
            config.seed.map(|s| s.wrapping_add(1)),
        );

        let mut timers = TimerQueue::new();
        timers.schedule(now + config.sync_interval_ms, TimerKind::Sync);
        timers.schedule(now + config.aggregation_check_interval_ms(), TimerKind::AggregationCheck);

        let hive = HiveMind {
            router: LabelRouter::from_config(&config),
            registry: RwLock::new(WorkerRegistry::new(config.trust.clone())),
            buffer: Mutex::new(ExperienceBuffer::new(config.experience_retention)),
            lanes,
            privacy,
            aggregator: Aggregator::new(config.learning_rate),
            distributor: Distributor::new(self.transport),
            broadcaster: self.broadcaster,
            events: self.events,
            signer: self.signer,
            clock: self.clock,
            timers: Mutex::new(timers),
            running: AtomicBool::new(true),
            urgent_broadcasts: AtomicU64::new(0),
            config,
        };

        if let Some(state) = self.state {
            hive.restore(state)?;
        }

        info!(
            models = hive.lanes.len(),
            sync_interval_ms = hive.config.sync_interval_ms,
            round_timeout_ms = hive.config.round_timeout_ms,
            "HiveMind coordinator created"
        );
        Ok(hive)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Federated learning coordinator
pub struct HiveMind {
    pub(crate) config: HiveMindConfig,
    clock: Arc<dyn Clock>,
    router: LabelRouter,
    pub(crate) registry: RwLock<WorkerRegistry>,
    buffer: Mutex<ExperienceBuffer>,
    pub(crate) lanes: BTreeMap<ModelType, Mutex<ModelLane>>,
    pub(crate) privacy: PrivacyEngine,
    aggregator: Aggregator,
    distributor: Distributor,
    broadcaster: Arc<dyn UrgentBroadcaster>,
    pub(crate) events: Arc<dyn EventSink>,
    pub(crate) signer: Arc<dyn Signer>,
    timers: Mutex<TimerQueue>,
    running: AtomicBool,
    urgent_broadcasts: AtomicU64,
}

impl std::fmt::Debug for HiveMind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HiveMind")
            .field("models", &self.lanes.keys().collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl HiveMind {
    /// Coordinator with default collaborators and the system clock
    pub fn new(config: HiveMindConfig) -> Result<Self, FlError> {
        HiveMindBuilder::new(config).build()
    }

    pub fn builder(config: HiveMindConfig) -> HiveMindBuilder {
        HiveMindBuilder::new(config)
    }

    pub fn config(&self) -> &HiveMindConfig {
        &self.config
    }

    /// Configured model types, sorted
    pub fn model_types(&self) -> Vec<ModelType> {
        self.lanes.keys().cloned().collect()
    }

    fn lane(&self, model_type: &ModelType) -> Result<&Mutex<ModelLane>, FlError> {
        self.lanes
            .get(model_type)
            .ok_or_else(|| FlError::UnknownModelType(model_type.clone()))
    }

    pub(crate) fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Registers a worker at the current version of every model.
    ///
    /// Registering an existing ID resets its state.
    pub fn register_worker(&self, id: impl Into<String>, region: impl Into<String>) -> WorkerState {
        let versions: BTreeMap<ModelType, u64> = self
            .lanes
            .iter()
            .map(|(model_type, lane)| (model_type.clone(), lock(lane).store.version()))
            .collect();

        let state = write(&self.registry).register(id, region, versions, self.now());
        info!(worker = %state.id, region = %state.region, "Worker registered");
        self.events.emit(HiveMindEvent::WorkerRegistered {
            worker_id: state.id.clone(),
            region: state.region.clone(),
        });
        state
    }

    /// Applies a metrics report and returns the new trust score.
    ///
    /// Unknown workers are ignored.
    pub fn update_worker_metrics(&self, id: &str, report: MetricsReport) -> Option<f64> {
        let trust = write(&self.registry).update_metrics(id, report);
        match trust {
            Some(trust_score) => self.events.emit(HiveMindEvent::TrustUpdated {
                worker_id: id.to_string(),
                trust_score,
            }),
            None => debug!(worker = id, "Metrics for unknown worker ignored"),
        }
        trust
    }

    pub fn worker(&self, id: &str) -> Option<WorkerState> {
        read(&self.registry).get(id).cloned()
    }

    pub fn worker_count(&self) -> usize {
        read(&self.registry).len()
    }

    // ------------------------------------------------------------------
    // Experiences
    // ------------------------------------------------------------------

    /// Records an experience.
    ///
    /// Urgent experiences are privatised and broadcast on the spot when the
    /// sample floor allows a single-experience batch; otherwise they are
    /// buffered like any other. Experiences from unknown workers are
    /// ignored.
    pub fn record_experience(&self, experience: Experience) -> Result<RecordOutcome, FlError> {
        let region = match read(&self.registry).get(&experience.worker_id) {
            Some(worker) => worker.region.clone(),
            None => {
                debug!(worker = %experience.worker_id, "Experience from unknown worker ignored");
                return Ok(RecordOutcome::UnknownWorker);
            }
        };
        let model_type = self.router.route(&experience.target_label).clone();
        let lane = self.lane(&model_type)?;

        if let Some(kind) = urgent::classify(&experience) {
            if let Some(outcome) = self.try_urgent(lane, &model_type, &region, &experience, kind) {
                return Ok(outcome);
            }
        }

        let worker_id = experience.worker_id.clone();
        let experience_id = lock(&self.buffer).record(model_type.clone(), experience);
        self.events.emit(HiveMindEvent::ExperienceBuffered {
            experience_id: experience_id.clone(),
            worker_id,
            model_type: model_type.clone(),
        });
        Ok(RecordOutcome::Buffered {
            experience_id,
            model_type,
        })
    }

    fn try_urgent(
        &self,
        lane: &Mutex<ModelLane>,
        model_type: &ModelType,
        region: &str,
        experience: &Experience,
        kind: UrgencyKind,
    ) -> Option<RecordOutcome> {
        let drop_urgent = |reason: String| {
            debug!(worker = %experience.worker_id, model = %model_type, %kind, %reason, "Urgent update dropped");
            self.events.emit(HiveMindEvent::UrgentDropped {
                worker_id: experience.worker_id.clone(),
                model_type: model_type.clone(),
                kind,
                reason,
            });
        };

        let (target, committed) = {
            let lane = lock(lane);
            (lane.store.current().target(), lane.committed_budget())
        };
        if self.config.privacy.budget_policy == BudgetPolicy::Enforce
            && committed >= self.config.privacy.max_privacy_budget
        {
            drop_urgent(format!("privacy budget exhausted ({committed:.4})"));
            return None;
        }

        let batch = std::slice::from_ref(experience);
        let Some(update) = self
            .privacy
            .privatize(&target, &experience.worker_id, region, batch, self.now())
        else {
            drop_urgent(format!(
                "sample floor {} not met by a single experience",
                self.privacy.min_samples()
            ));
            return None;
        };

        self.broadcaster.broadcast(&update, kind);
        self.urgent_broadcasts.fetch_add(1, Ordering::Relaxed);
        info!(update = %update.update_id, worker = %update.worker_id, %kind, "Urgent update broadcast");
        self.events.emit(HiveMindEvent::UrgentBroadcast {
            update_id: update.update_id.clone(),
            worker_id: update.worker_id.clone(),
            kind,
        });
        Some(RecordOutcome::Broadcast {
            update_id: update.update_id,
            kind,
        })
    }

    pub fn buffered_experiences(&self) -> usize {
        lock(&self.buffer).len()
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Flushes the buffer, privatises every full batch and submits the
    /// resulting updates.
    pub fn sync(&self) -> SyncReport {
        let flush = lock(&self.buffer).flush(self.privacy.min_samples());
        let mut report = SyncReport {
            batches: flush.batches.len(),
            deferred: flush.deferred,
            evicted: flush.evicted,
            ..Default::default()
        };

        for (model_type, worker_id, samples) in flush.deferred_groups {
            debug!(worker = %worker_id, model = %model_type, samples, "Batch below sample floor deferred");
            self.events.emit(HiveMindEvent::BatchDeferred {
                worker_id,
                model_type,
                samples,
            });
        }
        if flush.evicted > 0 {
            warn!(evicted = flush.evicted, "Experience retention cap reached, oldest dropped");
            self.events.emit(HiveMindEvent::ExperiencesEvicted { count: flush.evicted });
        }

        for batch in flush.batches {
            let Some(region) = read(&self.registry).get(&batch.worker_id).map(|w| w.region.clone()) else {
                debug!(worker = %batch.worker_id, "Batch from unregistered worker discarded");
                continue;
            };
            let Ok(lane) = self.lane(&batch.model_type) else {
                continue;
            };
            let target = lock(lane).store.current().target();

            let Some(update) =
                self.privacy
                    .privatize(&target, &batch.worker_id, &region, &batch.experiences, self.now())
            else {
                continue;
            };
            report.updates_generated += 1;
            self.events.emit(HiveMindEvent::UpdateGenerated {
                update_id: update.update_id.clone(),
                worker_id: update.worker_id.clone(),
                model_type: update.model_type.clone(),
                privacy_cost: update.privacy_cost,
            });

            match self.submit_update(update) {
                Ok(SubmitOutcome::Accepted { .. }) => report.accepted += 1,
                Ok(SubmitOutcome::Queued) => report.queued += 1,
                Ok(SubmitOutcome::Rejected(_)) => report.rejected += 1,
                Err(e) => warn!(error = %e, "Generated update could not be submitted"),
            }
        }

        debug!(
            batches = report.batches,
            generated = report.updates_generated,
            accepted = report.accepted,
            queued = report.queued,
            rejected = report.rejected,
            deferred = report.deferred,
            "Sync pass finished"
        );
        report
    }

    // ------------------------------------------------------------------
    // Rounds
    // ------------------------------------------------------------------

    /// Validates an update and adds it to the model's training round.
    ///
    /// Without a training round the update waits for the next one. An
    /// update that completes the round's participant target triggers
    /// aggregation before this call returns.
    pub fn submit_update(&self, update: ModelUpdate) -> Result<SubmitOutcome, FlError> {
        let mut lane = lock(self.lane(&update.model_type)?);
        let now = self.now();

        let trust = read(&self.registry).trust_score(&update.worker_id);
        let mut verdict = validate_update(
            &update,
            self.signer.as_ref(),
            self.config.norm_limit(),
            trust,
            self.config.trust.min_trust,
        );

        let ceiling = self.config.privacy.max_privacy_budget;
        let committed = lane.committed_budget();
        if verdict.is_ok() && committed + update.privacy_cost > ceiling {
            match self.config.privacy.budget_policy {
                BudgetPolicy::Enforce => {
                    verdict = Err(RejectReason::PrivacyBudgetExhausted {
                        used: committed,
                        cost: update.privacy_cost,
                        ceiling,
                    });
                }
                BudgetPolicy::Advisory => {
                    warn!(
                        model = %update.model_type,
                        used = committed + update.privacy_cost,
                        ceiling,
                        "Privacy budget exceeded"
                    );
                    self.events.emit(HiveMindEvent::PrivacyBudgetExceeded {
                        model_type: update.model_type.clone(),
                        used: committed + update.privacy_cost,
                        ceiling,
                    });
                }
            }
        }

        if let Err(reason) = verdict {
            warn!(
                update = %update.update_id,
                worker = %update.worker_id,
                reason = reason.code(),
                "Update rejected"
            );
            self.events.emit(HiveMindEvent::UpdateRejected {
                update_id: update.update_id,
                worker_id: update.worker_id,
                reason: reason.clone(),
            });
            return Ok(SubmitOutcome::Rejected(reason));
        }

        let update = match lane.active.as_mut() {
            Some(round) if round.status == RoundStatus::Training => match round.accept(update) {
                Ok(_) => {
                    let round_id = round.round_id.clone();
                    if let Some(accepted) = round.pending.last() {
                        self.events.emit(HiveMindEvent::UpdateAccepted {
                            update_id: accepted.update_id.clone(),
                            round_id: round_id.clone(),
                        });
                    }
                    if round.is_ready() {
                        self.aggregate_locked(&mut lane, now);
                    }
                    return Ok(SubmitOutcome::Accepted { round_id });
                }
                Err(duplicate) => duplicate,
            },
            _ => update,
        };

        self.queue_update(&mut lane, update, now);
        Ok(SubmitOutcome::Queued)
    }

    /// Holds an update for the model's next round.
    ///
    /// A newer update from the same worker replaces the waiting one and
    /// inherits its arrival time, so the queue never holds more than one
    /// update per worker.
    pub(crate) fn queue_update(&self, lane: &mut ModelLane, update: ModelUpdate, now: u64) {
        let existing = lane
            .queued
            .iter_mut()
            .find(|(_, queued)| queued.worker_id == update.worker_id);
        if let Some((_, queued)) = existing {
            debug!(
                update = %update.update_id,
                superseded = %queued.update_id,
                worker = %update.worker_id,
                "Queued update superseded"
            );
            self.events.emit(HiveMindEvent::UpdateSuperseded {
                update_id: update.update_id.clone(),
                superseded_id: queued.update_id.clone(),
                worker_id: update.worker_id.clone(),
                model_type: update.model_type.clone(),
            });
            *queued = update;
            return;
        }

        debug!(update = %update.update_id, model = %update.model_type, "Update queued for next round");
        self.events.emit(HiveMindEvent::UpdateQueued {
            update_id: update.update_id.clone(),
            model_type: update.model_type.clone(),
        });
        lane.queued.push_back((now, update));
    }

    /// Starts a round for `model_type` and returns its ID.
    ///
    /// Queued updates join the new round immediately, at most one per
    /// worker.
    pub fn start_federated_round(&self, model_type: &ModelType) -> Result<String, FlError> {
        let mut lane = lock(self.lane(model_type)?);
        if let Some(active) = lane.active.as_ref() {
            return Err(FlError::RoundInProgress {
                model_type: model_type.clone(),
                round_id: active.round_id.clone(),
            });
        }
        Ok(self.start_round_locked(&mut lane, self.now()))
    }

    fn start_round_locked(&self, lane: &mut ModelLane, now: u64) -> String {
        let model_type = lane.store.current().model_type.clone();
        let sequence = lane.next_sequence;
        lane.next_sequence += 1;

        let mut round = FederatedRound::start(
            model_type.clone(),
            sequence,
            self.config.min_workers_per_round,
            lane.store.current().accuracy,
            now,
            self.config.round_timeout_ms,
        );
        let round_id = round.round_id.clone();
        info!(round = %round_id, model = %model_type, deadline_ms = round.deadline_ms, "Round started");
        self.events.emit(HiveMindEvent::RoundStarted {
            round_id: round_id.clone(),
            model_type: model_type.clone(),
            target_participants: round.target_participants,
        });
        lock(&self.timers).schedule(
            round.deadline_ms,
            TimerKind::RoundTimeout {
                model_type,
                round_id: round_id.clone(),
            },
        );

        let mut still_queued = VecDeque::new();
        for (queued_at, update) in std::mem::take(&mut lane.queued) {
            let update_id = update.update_id.clone();
            match round.accept(update) {
                Ok(_) => self.events.emit(HiveMindEvent::UpdateAccepted {
                    update_id,
                    round_id: round_id.clone(),
                }),
                Err(duplicate) => still_queued.push_back((queued_at, duplicate)),
            }
        }
        lane.queued = still_queued;

        let ready = round.is_ready();
        lane.active = Some(round);
        if ready {
            self.aggregate_locked(lane, now);
        }
        round_id
    }

    /// Starts rounds for idle models whose queue is worth a round.
    ///
    /// A queue qualifies when its updates come from at least
    /// `min_workers_per_round` distinct workers, or when its oldest update
    /// has waited a full round timeout. Returns the started round IDs.
    pub fn check_aggregation(&self) -> Vec<String> {
        let now = self.now();
        let mut started = Vec::new();
        for lane in self.lanes.values() {
            let mut lane = lock(lane);
            if lane.active.is_some() || lane.queued.is_empty() {
                continue;
            }
            let workers: BTreeSet<&str> = lane.queued.iter().map(|(_, u)| u.worker_id.as_str()).collect();
            let oldest = lane.queued.front().map_or(now, |(at, _)| *at);
            if workers.len() >= self.config.min_workers_per_round
                || now.saturating_sub(oldest) >= self.config.round_timeout_ms
            {
                started.push(self.start_round_locked(&mut lane, now));
            }
        }
        started
    }

    /// Handles a round's hard deadline.
    ///
    /// No-op unless the round is still the model's training round.
    fn on_round_timeout(&self, model_type: &ModelType, round_id: &str) {
        let Ok(lane) = self.lane(model_type) else {
            return;
        };
        let mut lane = lock(lane);
        let now = self.now();
        let is_current = lane
            .active
            .as_ref()
            .is_some_and(|r| r.round_id == round_id && r.status == RoundStatus::Training);
        if !is_current {
            return;
        }

        let has_updates = lane.active.as_ref().is_some_and(|r| !r.pending.is_empty());
        if has_updates {
            debug!(round = round_id, "Round deadline reached, aggregating partial round");
            self.aggregate_locked(&mut lane, now);
        } else {
            let round = lane.active.take();
            if let Some(round) = round {
                self.fail_round(&mut lane, round, "timed out without updates", now);
            }
        }
    }

    pub(crate) fn fail_round(&self, lane: &mut ModelLane, mut round: FederatedRound, reason: &str, now: u64) {
        if !round.status.is_terminal() {
            if let Err(e) = round.transition(RoundStatus::Failed) {
                debug!(round = %round.round_id, error = %e, "Forcing round into failed state");
                round.status = RoundStatus::Failed;
            }
        }
        warn!(round = %round.round_id, model = %round.model_type, reason, "Round failed");
        self.events.emit(HiveMindEvent::RoundFailed {
            round_id: round.round_id.clone(),
            model_type: round.model_type.clone(),
            reason: reason.to_string(),
        });
        lane.record(round.finish(now, RoundOutcome::failed(reason)));
    }

    /// Aggregates the lane's active round, distributes the result and
    /// records the round. Pending updates are cleared whatever the outcome.
    fn aggregate_locked(&self, lane: &mut ModelLane, now: u64) {
        let Some(mut round) = lane.active.take() else {
            return;
        };
        if let Err(e) = round.transition(RoundStatus::Aggregating) {
            let reason = e.to_string();
            self.fail_round(lane, round, &reason, now);
            return;
        }
        self.events.emit(HiveMindEvent::RoundAggregating {
            round_id: round.round_id.clone(),
            participants: round.pending.len(),
        });

        let pending = std::mem::take(&mut round.pending);
        let contributions: Vec<(&ModelUpdate, f64)> = {
            let registry = read(&self.registry);
            pending
                .iter()
                .map(|u| (u, registry.trust_score(&u.worker_id).unwrap_or(0.0)))
                .collect()
        };

        let outcome = match self
            .aggregator
            .aggregate(&mut lane.store, &round.round_id, &contributions, now)
        {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = e.to_string();
                self.fail_round(lane, round, &reason, now);
                return;
            }
        };

        {
            let mut registry = write(&self.registry);
            for (worker_id, alignment) in &outcome.alignments {
                if let Some(trust_score) = registry.record_round_feedback(worker_id, *alignment) {
                    self.events.emit(HiveMindEvent::TrustUpdated {
                        worker_id: worker_id.clone(),
                        trust_score,
                    });
                }
            }
        }

        let model = lane.store.current();
        info!(
            model = %model.model_type,
            version = model.version,
            contributors = outcome.aggregated.contributors.len(),
            consensus = outcome.aggregated.consensus_score,
            accuracy = model.accuracy,
            "Model updated"
        );
        self.events.emit(HiveMindEvent::ModelUpdated {
            model_type: model.model_type.clone(),
            version: model.version,
            convergence_delta: outcome.convergence_delta,
        });
        if model.privacy_budget_used > model.max_privacy_budget {
            warn!(
                model = %model.model_type,
                used = model.privacy_budget_used,
                ceiling = model.max_privacy_budget,
                "Model privacy budget above ceiling"
            );
            self.events.emit(HiveMindEvent::PrivacyBudgetExceeded {
                model_type: model.model_type.clone(),
                used: model.privacy_budget_used,
                ceiling: model.max_privacy_budget,
            });
        }

        if let Err(e) = round.transition(RoundStatus::Distributing) {
            warn!(round = %round.round_id, error = %e, "Unexpected round state after aggregation");
        }
        self.distribute_locked(lane, now);
        if let Err(e) = round.transition(RoundStatus::Completed) {
            warn!(round = %round.round_id, error = %e, "Unexpected round state after distribution");
            round.status = RoundStatus::Completed;
        }

        self.events.emit(HiveMindEvent::RoundCompleted {
            round_id: round.round_id.clone(),
            model_type: round.model_type.clone(),
            new_version: outcome.aggregated.new_version,
            consensus_score: outcome.aggregated.consensus_score,
        });
        let record = round.finish(
            now,
            RoundOutcome {
                accuracy_after: Some(outcome.accuracy_after),
                convergence_delta: Some(outcome.convergence_delta),
                aggregated: Some(outcome.aggregated),
                failure_reason: None,
            },
        );
        lane.record(record);
    }

    fn distribute_locked(&self, lane: &ModelLane, now: u64) {
        let snapshot = lane.store.current().snapshot();
        match self.distributor.distribute(&snapshot, &self.registry, now) {
            Ok(report) => {
                for worker_id in report.delivered {
                    self.events.emit(HiveMindEvent::WorkerSynced {
                        worker_id,
                        model_type: snapshot.model_type.clone(),
                        version: snapshot.version,
                    });
                }
                for (worker_id, error) in report.failed {
                    self.events.emit(HiveMindEvent::DistributionFailed {
                        worker_id,
                        model_type: snapshot.model_type.clone(),
                        error: error.to_string(),
                    });
                }
            }
            Err(e) => warn!(model = %snapshot.model_type, error = %e, "Model distribution skipped"),
        }
    }

    /// Pushes the current version of a model to every stale worker
    pub fn distribute(&self, model_type: &ModelType) -> Result<(), FlError> {
        let lane = lock(self.lane(model_type)?);
        self.distribute_locked(&lane, self.now());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Fires every timer due at the clock's current time, in deadline
    /// order, and re-arms the periodic ones. Returns the number fired.
    pub fn run_due(&self) -> usize {
        if !self.is_running() {
            return 0;
        }
        let now = self.now();
        let mut fired = 0;
        loop {
            let due = lock(&self.timers).pop_due(now);
            let Some((deadline, kind)) = due else {
                break;
            };
            fired += 1;
            match kind {
                TimerKind::Sync => {
                    self.sync();
                    self.rearm(deadline, now, self.config.sync_interval_ms, TimerKind::Sync);
                }
                TimerKind::AggregationCheck => {
                    self.check_aggregation();
                    self.rearm(
                        deadline,
                        now,
                        self.config.aggregation_check_interval_ms(),
                        TimerKind::AggregationCheck,
                    );
                }
                TimerKind::RoundTimeout { model_type, round_id } => {
                    self.on_round_timeout(&model_type, &round_id);
                }
            }
        }
        fired
    }

    // Skips missed periods so a late driver fires each periodic timer once
    fn rearm(&self, deadline: u64, now: u64, interval: u64, kind: TimerKind) {
        if !self.is_running() {
            return;
        }
        let interval = interval.max(1);
        let periods = now.saturating_sub(deadline) / interval + 1;
        lock(&self.timers).schedule(deadline + periods * interval, kind);
    }

    /// Earliest armed timer deadline
    pub fn next_deadline(&self) -> Option<u64> {
        lock(&self.timers).next_deadline()
    }

    /// Stops both periodic timers and every round deadline.
    ///
    /// State is left as-is; in-flight rounds are recorded as failed when
    /// the exported state is restored.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            lock(&self.timers).clear();
            info!("HiveMind coordinator stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Current model state
    pub fn model(&self, model_type: &ModelType) -> Result<GlobalModel, FlError> {
        Ok(lock(self.lane(model_type)?).store.current().clone())
    }

    pub fn model_version(&self, model_type: &ModelType) -> Result<u64, FlError> {
        Ok(lock(self.lane(model_type)?).store.version())
    }

    /// Archived snapshot of one version
    pub fn model_snapshot(&self, model_type: &ModelType, version: u64) -> Result<Option<ModelSnapshot>, FlError> {
        Ok(lock(self.lane(model_type)?).store.get(version).cloned())
    }

    pub fn list_versions(&self, model_type: &ModelType) -> Result<Vec<u64>, FlError> {
        Ok(lock(self.lane(model_type)?).store.list_versions())
    }

    /// Current parameters as JSON
    pub fn export_model(&self, model_type: &ModelType) -> Result<Vec<u8>, FlError> {
        lock(self.lane(model_type)?).store.export()
    }

    /// The model's non-terminal round, if any
    pub fn active_round(&self, model_type: &ModelType) -> Result<Option<FederatedRound>, FlError> {
        Ok(lock(self.lane(model_type)?).active.clone())
    }

    /// Finished rounds of a model, oldest first
    pub fn round_history(&self, model_type: &ModelType) -> Result<Vec<RoundRecord>, FlError> {
        Ok(lock(self.lane(model_type)?).history.clone())
    }

    pub fn queued_updates(&self, model_type: &ModelType) -> Result<usize, FlError> {
        Ok(lock(self.lane(model_type)?).queued.len())
    }

    pub fn privacy_accountant(&self) -> PrivacyAccountant {
        self.privacy.accountant()
    }

    pub fn stats(&self) -> HiveMindStats {
        let models = self
            .lanes
            .values()
            .map(|lane| {
                let lane = lock(lane);
                let model = lane.store.current();
                ModelStats {
                    model_type: model.model_type.clone(),
                    version: model.version,
                    accuracy: model.accuracy,
                    rounds_completed: model.rounds_completed,
                    rounds_failed: lane
                        .history
                        .iter()
                        .filter(|r| r.status == RoundStatus::Failed)
                        .count() as u64,
                    samples_processed: model.samples_processed,
                    privacy_budget_used: model.privacy_budget_used,
                    privacy_budget_remaining: model.budget_remaining(),
                    active_round: lane.active.as_ref().map(|r| r.status),
                    queued_updates: lane.queued.len(),
                    last_convergence_delta: lane.history.iter().rev().find_map(|r| r.convergence_delta),
                    trend: AccuracyTrend::from_history(&lane.history),
                    converged: lane.convergence.has_converged(),
                }
            })
            .collect();

        HiveMindStats {
            models,
            workers: self.worker_count(),
            buffered_experiences: self.buffered_experiences(),
            privacy_spent: self.privacy.privacy_spent(),
            urgent_broadcasts: self.urgent_broadcasts.load(Ordering::Relaxed),
        }
    }
}
