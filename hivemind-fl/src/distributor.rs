//! Best-effort model distribution
//!
//! After a version bump every worker holding an older version of the model
//! is sent the full parameter set through the host-provided [`Transport`].
//! A failed delivery is logged and leaves the worker stale until the next
//! pass; it never aborts delivery to the remaining workers.

use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use hivemind_common::ModelType;

use crate::error::FlError;
use crate::model_store::ModelSnapshot;
use crate::registry::WorkerRegistry;
use crate::{read, write};

/// Delivery failure reported by a transport
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Worker could not be reached
    #[error("Worker unreachable: {0}")]
    Unreachable(String),
    /// Worker refused the snapshot
    #[error("Snapshot rejected: {0}")]
    Rejected(String),
    /// Transport has been shut down
    #[error("Transport closed")]
    Closed,
}

/// Ships serialized model snapshots to workers
pub trait Transport: Send + Sync {
    fn send_model_snapshot(
        &self,
        worker_id: &str,
        model_type: &ModelType,
        serialized_model: &[u8],
    ) -> Result<(), TransportError>;
}

/// Transport that only logs deliveries
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingTransport;

impl Transport for LoggingTransport {
    fn send_model_snapshot(
        &self,
        worker_id: &str,
        model_type: &ModelType,
        serialized_model: &[u8],
    ) -> Result<(), TransportError> {
        debug!(
            worker = worker_id,
            model = %model_type,
            bytes = serialized_model.len(),
            "Model snapshot delivered"
        );
        Ok(())
    }
}

/// Result of one distribution pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DistributionReport {
    pub model_type: Option<ModelType>,
    pub version: u64,
    /// Workers now holding `version`
    pub delivered: Vec<String>,
    /// Workers left stale, with the transport error
    pub failed: Vec<(String, TransportError)>,
}

/// Pushes new model versions to stale workers
#[derive(Clone)]
pub struct Distributor {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor").finish_non_exhaustive()
    }
}

impl Distributor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Sends `snapshot` to every worker behind its version.
    ///
    /// The registry lock is not held while the transport runs. Only a
    /// snapshot that cannot be serialized fails the pass.
    pub fn distribute(
        &self,
        snapshot: &ModelSnapshot,
        registry: &RwLock<WorkerRegistry>,
        now_ms: u64,
    ) -> Result<DistributionReport, FlError> {
        let stale = read(registry).stale_workers(&snapshot.model_type, snapshot.version);
        let mut report = DistributionReport {
            model_type: Some(snapshot.model_type.clone()),
            version: snapshot.version,
            ..Default::default()
        };
        if stale.is_empty() {
            return Ok(report);
        }

        let payload = snapshot.to_bytes()?;
        for worker_id in stale {
            match self
                .transport
                .send_model_snapshot(&worker_id, &snapshot.model_type, &payload)
            {
                Ok(()) => report.delivered.push(worker_id),
                Err(e) => {
                    warn!(
                        worker = %worker_id,
                        model = %snapshot.model_type,
                        version = snapshot.version,
                        error = %e,
                        "Model distribution failed, worker stays stale"
                    );
                    report.failed.push((worker_id, e));
                }
            }
        }

        let mut registry = write(registry);
        for worker_id in &report.delivered {
            registry.mark_synced(worker_id, &snapshot.model_type, snapshot.version, now_ms);
        }

        debug!(
            model = %snapshot.model_type,
            version = snapshot.version,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Distribution pass finished"
        );
        Ok(report)
    }
}
