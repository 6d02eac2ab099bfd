//! Tokio driver for the coordinator
//!
//! Runs the coordinator's timers against wall-clock (or any injected) time
//! and accepts commands from the host as an actor, following the same
//! message-envelope model as the rest of the task framework.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use hivemind_common::ModelType;

use crate::coordinator::{HiveMind, SyncReport};
use crate::error::FlError;

/// Default capacity of a task's command channel
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Task message envelope wrapping typed messages with control signals.
#[derive(Debug)]
pub enum TaskMessage<T> {
    /// Regular message payload
    Message(T),
    /// Shutdown signal - task should terminate gracefully
    Shutdown,
}

impl<T> TaskMessage<T> {
    pub fn message(msg: T) -> Self {
        TaskMessage::Message(msg)
    }

    pub fn shutdown() -> Self {
        TaskMessage::Shutdown
    }
}

/// Async actor processing messages from its receive channel.
#[async_trait::async_trait]
pub trait Task: Send + 'static {
    /// The message type this task processes.
    type Message: Send;

    /// Runs until a shutdown message arrives or the channel closes.
    async fn run(&mut self, rx: mpsc::Receiver<TaskMessage<Self::Message>>);
}

/// Commands accepted by [`HiveMindTask`]
#[derive(Debug)]
pub enum HiveMindCommand {
    /// Flush the experience buffer now
    SyncNow {
        reply: Option<oneshot::Sender<SyncReport>>,
    },
    /// Run the aggregation check now
    CheckAggregation {
        reply: Option<oneshot::Sender<Vec<String>>>,
    },
    /// Start a round for one model
    StartRound {
        model_type: ModelType,
        reply: Option<oneshot::Sender<Result<String, FlError>>>,
    },
}

/// Drives a shared coordinator from a tokio task
pub struct HiveMindTask {
    hive: Arc<HiveMind>,
    tick: Duration,
}

impl HiveMindTask {
    /// `tick` is how often due timers are checked
    pub fn new(hive: Arc<HiveMind>, tick: Duration) -> Self {
        Self {
            hive,
            tick: tick.max(Duration::from_millis(1)),
        }
    }

    /// Spawns the task and returns its command handle
    pub fn spawn(self) -> (HiveMindHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let mut task = self;
        let join = tokio::spawn(async move { task.run(rx).await });
        (HiveMindHandle { tx }, join)
    }

    fn handle(&self, command: HiveMindCommand) {
        match command {
            HiveMindCommand::SyncNow { reply } => {
                let report = self.hive.sync();
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            HiveMindCommand::CheckAggregation { reply } => {
                let started = self.hive.check_aggregation();
                if let Some(reply) = reply {
                    let _ = reply.send(started);
                }
            }
            HiveMindCommand::StartRound { model_type, reply } => {
                let result = self.hive.start_federated_round(&model_type);
                if let Err(e) = &result {
                    warn!(model = %model_type, error = %e, "Round not started");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Task for HiveMindTask {
    type Message = HiveMindCommand;

    async fn run(&mut self, mut rx: mpsc::Receiver<TaskMessage<Self::Message>>) {
        info!(tick_ms = self.tick.as_millis() as u64, "HiveMind task started");
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let fired = self.hive.run_due();
                    if fired > 0 {
                        debug!(fired, "Timers fired");
                    }
                }
                msg = rx.recv() => match msg {
                    Some(TaskMessage::Message(command)) => self.handle(command),
                    Some(TaskMessage::Shutdown) | None => break,
                },
            }
        }

        self.hive.shutdown();
        info!("HiveMind task stopped");
    }
}

/// Sender side of a running [`HiveMindTask`]
#[derive(Debug, Clone)]
pub struct HiveMindHandle {
    tx: mpsc::Sender<TaskMessage<HiveMindCommand>>,
}

impl HiveMindHandle {
    /// Sends a command without waiting for its result.
    pub async fn send(
        &self,
        command: HiveMindCommand,
    ) -> Result<(), mpsc::error::SendError<TaskMessage<HiveMindCommand>>> {
        self.tx.send(TaskMessage::Message(command)).await
    }

    /// Runs a sync pass and waits for its report.
    ///
    /// Returns `None` if the task has stopped.
    pub async fn sync_now(&self) -> Option<SyncReport> {
        let (reply, rx) = oneshot::channel();
        self.send(HiveMindCommand::SyncNow { reply: Some(reply) }).await.ok()?;
        rx.await.ok()
    }

    /// Runs the aggregation check and waits for the started round IDs.
    pub async fn check_aggregation(&self) -> Option<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(HiveMindCommand::CheckAggregation { reply: Some(reply) })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Starts a round and waits for the result.
    pub async fn start_round(&self, model_type: ModelType) -> Option<Result<String, FlError>> {
        let (reply, rx) = oneshot::channel();
        self.send(HiveMindCommand::StartRound {
            model_type,
            reply: Some(reply),
        })
        .await
        .ok()?;
        rx.await.ok()
    }

    /// Asks the task to stop; both timers stop with it.
    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<TaskMessage<HiveMindCommand>>> {
        self.tx.send(TaskMessage::Shutdown).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
