//! Urgent single-experience path
//!
//! Some observations are worth propagating before the next sync: a success
//! against a hard target, or a failure with a near-certain detection. Such
//! an experience is privatised on its own, under the same floor, clipping,
//! noise and budget rules as a batch, and handed to an
//! [`UrgentBroadcaster`] instead of a round.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::experience::Experience;
use crate::ModelUpdate;

/// Difficulty above which a success is urgent
pub const VALUABLE_DIFFICULTY: f64 = 0.8;

/// Detection above which a failure is urgent
pub const CRITICAL_DETECTION: f64 = 0.9;

/// Why an experience takes the urgent path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyKind {
    /// Success against a difficult target
    ValuableTechnique,
    /// Failure with near-certain detection
    CriticalRisk,
}

impl fmt::Display for UrgencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrgencyKind::ValuableTechnique => f.write_str("valuable-technique"),
            UrgencyKind::CriticalRisk => f.write_str("critical-risk"),
        }
    }
}

/// Returns the urgency of an experience, if any
pub fn classify(experience: &Experience) -> Option<UrgencyKind> {
    if experience.is_success() {
        (experience.difficulty > VALUABLE_DIFFICULTY).then_some(UrgencyKind::ValuableTechnique)
    } else {
        (experience.detection > CRITICAL_DETECTION).then_some(UrgencyKind::CriticalRisk)
    }
}

/// Receives urgent updates, bypassing rounds
pub trait UrgentBroadcaster: Send + Sync {
    fn broadcast(&self, update: &ModelUpdate, kind: UrgencyKind);
}

/// Broadcaster that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingBroadcaster;

impl UrgentBroadcaster for LoggingBroadcaster {
    fn broadcast(&self, update: &ModelUpdate, kind: UrgencyKind) {
        info!(
            update = %update.update_id,
            worker = %update.worker_id,
            model = %update.model_type,
            %kind,
            "Urgent update broadcast"
        );
    }
}
