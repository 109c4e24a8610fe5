//! Consumer-side poll loop on top of [`CommandService`].
//!
//! Claims one command at a time, hands it to the handler registered for its
//! type and reports the outcome back with the attempt token from the claim.
//! Uses nothing but the public service API.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use cmdlease_core::{
    ClaimedCommand, Clock, CommandError, CommandId, CommandResult, ConflictReason, ConsumerId,
    SystemClock,
};

use crate::command_service::CommandService;
use crate::command_store::CommandStore;
use crate::config::ConfigError;

/// What a handler decided about one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    /// Transient failure; the command goes back to `Pending`.
    Retry,
    /// Permanent failure.
    Failed,
}

/// Handler for one command type. An `Err` is treated like [`CommandOutcome::Retry`].
pub type CommandHandler =
    Box<dyn Fn(&ClaimedCommand) -> anyhow::Result<CommandOutcome> + Send + Sync>;

/// Result of one [`CommandWorker::run_once`] that actually claimed something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed(CommandId),
    Retried(CommandId),
    Failed(CommandId),
    /// No handler for the type; released for another consumer.
    Unhandled(CommandId),
    /// The lease was lost while the handler ran (expired and reclaimed).
    LeaseLost(CommandId),
}

impl WorkOutcome {
    pub fn id(&self) -> CommandId {
        match self {
            WorkOutcome::Completed(id)
            | WorkOutcome::Retried(id)
            | WorkOutcome::Failed(id)
            | WorkOutcome::Unhandled(id)
            | WorkOutcome::LeaseLost(id) => *id,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct CommandWorkerConfig {
    /// Thread name and log field
    pub name: String,
    pub consumer_id: ConsumerId,
    /// Only claim commands of this type
    pub type_filter: Option<String>,
    pub lease_duration: Duration,
    /// Idle wait between empty polls
    pub poll_interval: Duration,
}

impl CommandWorkerConfig {
    pub fn new(consumer_id: ConsumerId) -> Self {
        Self {
            name: "command-worker".to_string(),
            consumer_id,
            type_filter: None,
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_consumer(mut self, consumer_id: ConsumerId) -> Self {
        self.consumer_id = consumer_id;
        self
    }

    pub fn with_type_filter(mut self, command_type: impl Into<String>) -> Self {
        self.type_filter = Some(command_type.into());
        self
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reject settings every claim would fail on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "lease_duration",
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub unhandled: u64,
    pub lease_lost: u64,
    pub handler_errors: u64,
    /// Requests the service rejected as invalid (bad lease duration, ...)
    pub input_errors: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct CommandWorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl CommandWorkerHandle {
    /// Request graceful shutdown. The in-flight command (if any) is finished
    /// and reported before the thread exits.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub struct CommandWorker<S> {
    service: Arc<CommandService<S>>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<String, CommandHandler>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S> core::fmt::Debug for CommandWorker<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("CommandWorker")
            .field("handlers", &types)
            .finish_non_exhaustive()
    }
}

impl<S: CommandStore> CommandWorker<S> {
    pub fn new(service: Arc<CommandService<S>>) -> Self {
        Self {
            service,
            clock: Arc::new(SystemClock),
            handlers: HashMap::new(),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a handler for a command type. `"*"` catches every type without
    /// its own handler.
    pub fn register_handler<F>(&mut self, command_type: impl Into<String>, handler: F)
    where
        F: Fn(&ClaimedCommand) -> anyhow::Result<CommandOutcome> + Send + Sync + 'static,
    {
        self.handlers.insert(command_type.into(), Box::new(handler));
    }

    fn handler_for(&self, command_type: &str) -> Option<&CommandHandler> {
        self.handlers
            .get(command_type)
            .or_else(|| self.handlers.get("*"))
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, f: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut *stats);
    }

    fn record_error(&self, err: &CommandError) {
        self.record(|s| match err {
            CommandError::Unavailable(_) => s.store_errors += 1,
            _ => s.input_errors += 1,
        });
    }

    /// Claim, handle and report at most one command.
    ///
    /// `Ok(None)` when there was nothing to claim (or every candidate was
    /// taken by someone else first).
    pub fn run_once(&self, config: &CommandWorkerConfig) -> CommandResult<Option<WorkOutcome>> {
        let claimed = match self.service.claim(
            &config.consumer_id,
            config.type_filter.as_deref(),
            config.lease_duration,
            self.clock.now(),
        ) {
            Ok(claimed) => claimed,
            Err(CommandError::CommandNotFound(_)) => return Ok(None),
            Err(CommandError::LeaseConflict {
                reason: ConflictReason::ClaimRetriesExhausted,
                ..
            }) => {
                debug!(worker = %config.name, "claim contended; backing off");
                return Ok(None);
            }
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };
        self.record(|s| s.claimed += 1);

        let id = claimed.id;
        debug!(
            worker = %config.name,
            command_id = %id,
            command_type = %claimed.command_type,
            attempt = claimed.attempt,
            "claimed command"
        );

        let Some(handler) = self.handler_for(&claimed.command_type) else {
            warn!(worker = %config.name, command_id = %id, command_type = %claimed.command_type, "no handler for command type; releasing");
            return self.report(config, &claimed, |svc, now| {
                svc.release(id, &config.consumer_id, claimed.attempt, now)
                    .map(|_| WorkOutcome::Unhandled(id))
            });
        };

        let outcome = match handler(&claimed) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(worker = %config.name, command_id = %id, error = %err, "command handler failed");
                self.record(|s| s.handler_errors += 1);
                CommandOutcome::Retry
            }
        };

        let consumer = &config.consumer_id;
        let attempt = claimed.attempt;
        self.report(config, &claimed, |svc, now| match outcome {
            CommandOutcome::Completed => svc
                .complete(id, consumer, attempt, now)
                .map(|_| WorkOutcome::Completed(id)),
            CommandOutcome::Retry => svc
                .fail(id, consumer, attempt, false, now)
                .map(|_| WorkOutcome::Retried(id)),
            CommandOutcome::Failed => svc
                .fail(id, consumer, attempt, true, now)
                .map(|_| WorkOutcome::Failed(id)),
        })
    }

    fn report<F>(
        &self,
        config: &CommandWorkerConfig,
        claimed: &ClaimedCommand,
        f: F,
    ) -> CommandResult<Option<WorkOutcome>>
    where
        F: FnOnce(&CommandService<S>, chrono::DateTime<chrono::Utc>) -> CommandResult<WorkOutcome>,
    {
        let outcome = match f(&self.service, self.clock.now()) {
            Ok(outcome) => outcome,
            Err(CommandError::LeaseConflict { reason, actual, .. }) => {
                warn!(
                    worker = %config.name,
                    command_id = %claimed.id,
                    attempt = claimed.attempt,
                    %reason,
                    %actual,
                    "lease lost before result was reported"
                );
                WorkOutcome::LeaseLost(claimed.id)
            }
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        self.record(|s| match outcome {
            WorkOutcome::Completed(_) => s.completed += 1,
            WorkOutcome::Retried(_) => s.retried += 1,
            WorkOutcome::Failed(_) => s.failed += 1,
            WorkOutcome::Unhandled(_) => s.unhandled += 1,
            WorkOutcome::LeaseLost(_) => s.lease_lost += 1,
        });
        Ok(Some(outcome))
    }
}

impl<S: CommandStore + 'static> CommandWorker<S> {
    /// Spawn the worker loop on a named background thread.
    ///
    /// Fails without spawning if `config` could never claim anything: a zero
    /// lease, or one above the service's `max_lease`.
    pub fn spawn(self, config: CommandWorkerConfig) -> Result<CommandWorkerHandle, ConfigError> {
        config.validate()?;
        if let Some(max) = self
            .service
            .config()
            .max_lease
            .filter(|max| config.lease_duration > *max)
        {
            return Err(ConfigError::InvalidValue {
                key: "lease_duration",
                value: format!("{:?}", config.lease_duration),
                reason: format!("exceeds service maximum of {max:?}"),
            });
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = self.stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx))
            .expect("failed to spawn command worker thread");

        Ok(CommandWorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn worker_loop<S: CommandStore>(
    worker: CommandWorker<S>,
    config: CommandWorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
) {
    info!(worker = %config.name, consumer = %config.consumer_id, "command worker started");
    let start_time = Instant::now();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let idle = match worker.run_once(&config) {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(e) => {
                error!(worker = %config.name, error = %e, "command worker poll failed");
                true
            }
        };
        worker.record(|s| s.uptime_secs = start_time.elapsed().as_secs());

        if idle {
            match shutdown_rx.recv_timeout(config.poll_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
            }
        }
    }

    info!(worker = %config.name, "command worker stopped");
}
