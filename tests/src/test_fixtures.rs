//! Test fixtures and configuration helpers
//!
//! Provides pre-configured coordinators, experience generators and
//! collaborators that record what the coordinator hands them.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

use hivemind_common::{HiveMindConfig, ManualClock, ModelType};
use hivemind_fl::{
    ChannelEventSink, Experience, HiveMind, HiveMindEvent, HiveMindState, ModelSnapshot,
    ModelUpdate, Transport, TransportError, UrgencyKind, UrgentBroadcaster,
};

use crate::test_utils::drain_events;

/// Feature vector length used by generated experiences
pub const FEATURE_DIM: usize = 32;

/// Default configuration with a fixed seed
pub fn test_config() -> HiveMindConfig {
    HiveMindConfig {
        seed: Some(42),
        ..Default::default()
    }
}

/// Configuration whose sample floor lets a single experience through
pub fn urgent_config() -> HiveMindConfig {
    HiveMindConfig {
        min_samples_per_round: 1,
        ..test_config()
    }
}

/// Deterministic experience; `index` varies the features
pub fn experience(worker: &str, label: &str, success: bool, index: usize) -> Experience {
    let features = (0..FEATURE_DIM)
        .map(|i| ((i + index) % 7) as f64 / 7.0 - 0.3)
        .collect();
    let success = if success { 1.0 } else { 0.0 };
    Experience::new(worker, label, features)
        .with_outcome(success, 0.1, 0.5)
        .with_timing(120, 0)
}

/// `n` experiences of which the first `n * success_rate` succeed.
///
/// None of them qualifies for the urgent path.
pub fn experience_batch(worker: &str, label: &str, n: usize, success_rate: f64) -> Vec<Experience> {
    let successes = (n as f64 * success_rate).round() as usize;
    (0..n)
        .map(|i| experience(worker, label, i < successes, i))
        .collect()
}

/// Transport recording deliveries; selected workers always fail
#[derive(Debug, Default)]
pub struct RecordingTransport {
    failing: Mutex<HashSet<String>>,
    deliveries: Mutex<Vec<(String, ModelType, u64)>>,
}

impl RecordingTransport {
    pub fn fail_for(&self, worker_id: &str) {
        self.failing.lock().unwrap().insert(worker_id.to_string());
    }

    pub fn recover(&self, worker_id: &str) {
        self.failing.lock().unwrap().remove(worker_id);
    }

    /// `(worker, model, version)` of every successful delivery
    pub fn deliveries(&self) -> Vec<(String, ModelType, u64)> {
        self.deliveries.lock().unwrap().clone()
    }
}

impl Transport for RecordingTransport {
    fn send_model_snapshot(
        &self,
        worker_id: &str,
        model_type: &ModelType,
        serialized_model: &[u8],
    ) -> Result<(), TransportError> {
        if self.failing.lock().unwrap().contains(worker_id) {
            return Err(TransportError::Unreachable(worker_id.to_string()));
        }
        let snapshot = ModelSnapshot::from_bytes(serialized_model)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        self.deliveries
            .lock()
            .unwrap()
            .push((worker_id.to_string(), model_type.clone(), snapshot.version));
        Ok(())
    }
}

/// Broadcaster recording urgent updates
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    updates: Mutex<Vec<(ModelUpdate, UrgencyKind)>>,
}

impl RecordingBroadcaster {
    pub fn updates(&self) -> Vec<(ModelUpdate, UrgencyKind)> {
        self.updates.lock().unwrap().clone()
    }
}

impl UrgentBroadcaster for RecordingBroadcaster {
    fn broadcast(&self, update: &ModelUpdate, kind: UrgencyKind) {
        self.updates.lock().unwrap().push((update.clone(), kind));
    }
}

/// Coordinator on a manual clock with recording collaborators
pub struct TestHive {
    pub hive: Arc<HiveMind>,
    pub clock: Arc<ManualClock>,
    pub transport: Arc<RecordingTransport>,
    pub broadcaster: Arc<RecordingBroadcaster>,
    pub events: UnboundedReceiver<HiveMindEvent>,
}

impl TestHive {
    pub fn new(config: HiveMindConfig) -> Self {
        Self::build(config, None)
    }

    /// Coordinator restored from exported state
    pub fn restored(config: HiveMindConfig, state: HiveMindState) -> Self {
        Self::build(config, Some(state))
    }

    fn build(config: HiveMindConfig, state: Option<HiveMindState>) -> Self {
        let clock = Arc::new(ManualClock::new(1_000));
        let transport = Arc::new(RecordingTransport::default());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let (sink, events) = ChannelEventSink::new();

        let mut builder = HiveMind::builder(config)
            .clock(clock.clone())
            .transport(transport.clone())
            .broadcaster(broadcaster.clone())
            .events(Arc::new(sink));
        if let Some(state) = state {
            builder = builder.restore(state);
        }
        let hive = builder.build().expect("valid test configuration");

        Self {
            hive: Arc::new(hive),
            clock,
            transport,
            broadcaster,
            events,
        }
    }

    /// Registers `n` workers named `worker-00`, `worker-01`, ...
    pub fn register_workers(&self, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                let id = format!("worker-{i:02}");
                self.hive.register_worker(id.clone(), if i % 2 == 0 { "eu" } else { "us" });
                id
            })
            .collect()
    }

    /// Advances virtual time and fires due timers
    pub fn advance(&self, ms: u64) -> usize {
        self.clock.advance(ms);
        self.hive.run_due()
    }

    /// Events emitted since the last call
    pub fn events(&mut self) -> Vec<HiveMindEvent> {
        drain_events(&mut self.events)
    }
}
