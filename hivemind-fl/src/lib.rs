//! Federated Learning Coordinator
//!
//! Lets many independent workers improve a small set of shared models
//! without sending raw observations anywhere:
//! - Differentially private update generation (clipping, Gaussian noise,
//!   privacy budget accounting)
//! - Trust-weighted federated averaging with consensus scoring
//! - Versioned model store and best-effort distribution
//! - Urgent single-observation broadcast path
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              HiveMind                                    │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌─────────────────────┐  │
//! │  │ WorkerRegistry   │   │ ExperienceBuffer │──▶│ PrivacyEngine       │  │
//! │  │  • trust scores  │   │  • label routing │   │  • clip + noise     │  │
//! │  │  • versions      │   │  • sample floor  │   │  • epsilon account  │  │
//! │  └──────────────────┘   └──────────────────┘   └──────────┬──────────┘  │
//! │           ▲                      │ urgent                 │ updates     │
//! │           │                      ▼                        ▼             │
//! │  ┌────────┴─────────┐   ┌──────────────────┐   ┌─────────────────────┐  │
//! │  │ Distributor      │◀──│ Aggregator       │◀──│ Rounds (per model)  │  │
//! │  │  • stale workers │   │  • trust FedAvg  │   │  • validation       │  │
//! │  │  • transport     │   │  • consensus     │   │  • timeout          │  │
//! │  └──────────────────┘   └────────┬─────────┘   └─────────────────────┘  │
//! │                                  ▼                                       │
//! │                         ┌──────────────────┐                             │
//! │                         │ ModelStore       │                             │
//! │                         └──────────────────┘                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use hivemind_common::ModelType;

pub mod aggregator;
pub mod coordinator;
pub mod distributor;
pub mod error;
pub mod events;
pub mod experience;
pub mod metrics;
pub mod model_store;
pub mod privacy;
pub mod registry;
pub mod round;
pub mod scheduler;
pub mod signer;
pub mod state;
pub mod task;
pub mod urgent;

pub use aggregator::{consensus_score, cosine_similarity, trust_weighted_average, Aggregator};
pub use coordinator::{HiveMind, HiveMindBuilder, RecordOutcome, SubmitOutcome, SyncReport};
pub use distributor::{DistributionReport, Distributor, LoggingTransport, Transport, TransportError};
pub use error::FlError;
pub use events::{ChannelEventSink, EventSink, HiveMindEvent, NullEventSink};
pub use experience::{Experience, ExperienceBatch, ExperienceBuffer, LabelRouter};
pub use metrics::{AccuracyTrend, ConvergenceDetector, HiveMindStats, ModelStats};
pub use model_store::{GlobalModel, LayerParams, ModelSnapshot, ModelStore};
pub use privacy::{PrivacyAccountant, PrivacyEngine};
pub use registry::{MetricsReport, PerformanceMetrics, WorkerRegistry, WorkerState};
pub use round::{validate_update, FederatedRound, RejectReason, RoundOutcome, RoundRecord, RoundStatus};
pub use scheduler::{TimerKind, TimerQueue};
pub use signer::{Sha256Signer, Signer};
pub use state::{HiveMindState, ModelRecord, WorkerRecord};
pub use task::{HiveMindCommand, HiveMindHandle, HiveMindTask, Task, TaskMessage};
pub use urgent::{LoggingBroadcaster, UrgencyKind, UrgentBroadcaster};

/// Privacy-protected update submitted into a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelUpdate {
    /// Unique update ID
    pub update_id: String,
    /// Contributing worker
    pub worker_id: String,
    /// Region of the contributing worker
    pub region: String,
    /// Target model
    pub model_type: ModelType,
    /// Model version the update was computed against
    pub base_version: u64,
    /// Clipped and noised gradient, one entry per model parameter
    pub gradients: Vec<f64>,
    /// L2 norm of the clipped signal before noise
    pub gradient_norm: f64,
    /// Clipping bound in force
    pub clipping_bound: f64,
    /// Root-mean-square of the injected noise
    pub noise_added: f64,
    /// Epsilon spent producing this update
    pub privacy_cost: f64,
    /// Model accuracy the worker started from
    pub accuracy_before: f64,
    /// Accuracy observed in the local batch
    pub accuracy_after: f64,
    /// Number of experiences behind the update
    pub sample_count: usize,
    /// Creation time
    pub created_at_ms: u64,
    /// Signature over the update ID and gradient prefix
    pub signature: String,
}

impl ModelUpdate {
    /// Local accuracy improvement claimed by the update
    pub fn accuracy_gain(&self) -> f64 {
        self.accuracy_after - self.accuracy_before
    }
}

/// Outcome of folding a round's updates into a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedUpdate {
    /// Model the aggregate was applied to
    pub model_type: ModelType,
    /// Round that produced it
    pub round_id: String,
    /// Version created by applying it
    pub new_version: u64,
    /// Workers whose updates were included
    pub contributors: Vec<String>,
    /// Samples behind all included updates
    pub total_samples: u64,
    /// Mean claimed accuracy gain
    pub avg_accuracy_gain: f64,
    /// Mean pairwise cosine similarity of the gradients
    pub consensus_score: f64,
    /// Epsilon spent by all included updates
    pub privacy_spent: f64,
}

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Every critical section leaves its data consistent before it can panic, so
// a poisoned lock still guards valid state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
