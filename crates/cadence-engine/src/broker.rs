//! Job broker — the caller-facing half of the engine.
//!
//! The broker mints job ids, registers a listener per job, posts RUN/SEARCH
//! to the dispatcher and demultiplexes outcomes back to the right future.
//! Demultiplexing runs as a tokio task on the runtime that spawned the broker.
//!
//! Every outcome is checked against the broker's own cancellation registry
//! before a listener is claimed. Listener removal is atomic, so whichever of
//! `cancel()` and the demux task removes the listener first is the only one
//! that settles the job.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use cadence_core::config::{EngineConfig, JobDefaults};
use cadence_core::{
    AnalysisRequest, AnalysisResult, AudioPayload, CancellationRegistry, Command, JobId,
    JobIdMinter, LogLevel, LogRecord, Outcome, RunCommand, SearchCommand, SearchParams,
    SearchResult,
};

use crate::analyzer::Analyzer;
use crate::dispatcher::{DispatchStats, Dispatcher};
use crate::gpu::GpuProvider;
use crate::job::{self, Canceller, Job, JobError, JobOptions, Pending};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker must be spawned from within a tokio runtime")]
    NoRuntime,
    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("dispatcher is no longer running")]
    DispatcherGone,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

// ── Listener table ────────────────────────────────────────────────────────────

pub(crate) enum Listener {
    Analysis(Pending<AnalysisResult>),
    Search(Pending<SearchResult>),
}

impl Listener {
    pub(crate) fn reject(self, error: JobError) {
        match self {
            Self::Analysis(p) => p.reject(error),
            Self::Search(p) => p.reject(error),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Analysis(_) => "RUN",
            Self::Search(_) => "SEARCH",
        }
    }
}

/// State shared between the broker, its cancellers and the demux task.
pub(crate) struct Shared {
    listeners: DashMap<JobId, Listener>,
    pub(crate) cancelled: CancellationRegistry,
    logs: broadcast::Sender<LogRecord>,
    log_level: LogLevel,
}

impl Shared {
    fn new(log_capacity: usize, log_level: LogLevel) -> Self {
        let (logs, _) = broadcast::channel(log_capacity.max(1));
        Self {
            listeners: DashMap::new(),
            cancelled: CancellationRegistry::new(),
            logs,
            log_level,
        }
    }

    pub(crate) fn take_listener(&self, job_id: &JobId) -> Option<Listener> {
        self.listeners.remove(job_id).map(|(_, listener)| listener)
    }

    /// Drop every listener. Their futures resolve to [`JobError::Abandoned`].
    fn abandon_all(&self) {
        let pending = self.listeners.len();
        self.listeners.clear();
        if pending > 0 {
            tracing::debug!(pending, "in-flight jobs abandoned");
        }
    }

    /// Claim the listener an outcome is addressed to, unless the job was
    /// cancelled locally or is unknown.
    fn claim(&self, job_id: &JobId, kind: &'static str) -> Option<Listener> {
        if self.cancelled.is_cancelled(job_id) {
            tracing::trace!(job_id = %job_id, kind, "outcome for cancelled job dropped");
            return None;
        }
        let listener = self.take_listener(job_id);
        if listener.is_none() {
            tracing::trace!(job_id = %job_id, kind, "outcome for unknown job dropped");
        }
        listener
    }

    fn route(&self, outcome: Outcome) {
        match outcome {
            Outcome::Log(record) => self.forward_log(record),
            Outcome::Result {
                job_id,
                worker_total_ms,
                result,
            } => match self.claim(&job_id, "RESULT") {
                Some(Listener::Analysis(pending)) => {
                    tracing::debug!(job_id = %job_id, worker_total_ms, "job resolved");
                    pending.resolve(result, millis(worker_total_ms));
                }
                Some(other) => mismatched(other, &job_id, "RESULT"),
                None => {}
            },
            Outcome::SearchResult { job_id, result } => match self.claim(&job_id, "SEARCH_RESULT") {
                Some(Listener::Search(pending)) => {
                    let elapsed = millis(result.timings.worker_total_ms);
                    tracing::debug!(
                        job_id = %job_id,
                        worker_total_ms = result.timings.worker_total_ms,
                        candidates = result.candidates.len(),
                        "search resolved"
                    );
                    pending.resolve(result, elapsed);
                }
                Some(other) => mismatched(other, &job_id, "SEARCH_RESULT"),
                None => {}
            },
            Outcome::Error {
                job_id,
                message,
                stack,
            } => {
                if let Some(listener) = self.claim(&job_id, "ERROR") {
                    tracing::debug!(job_id = %job_id, error = %message, "job rejected");
                    listener.reject(JobError::Failed { message, stack });
                }
            }
        }
    }

    /// Re-emit a dispatcher LOG through tracing and the debug channel.
    fn forward_log(&self, record: LogRecord) {
        let job_id = record.job_id.as_ref().map(JobId::as_str).unwrap_or("-");
        let text = record.message.as_str();
        match record.level {
            LogLevel::Debug => tracing::debug!(job_id, "dispatcher: {text}"),
            LogLevel::Info => tracing::info!(job_id, "dispatcher: {text}"),
            LogLevel::Warn => tracing::warn!(job_id, "dispatcher: {text}"),
            LogLevel::Error => tracing::error!(job_id, "dispatcher: {text}"),
        }
        if record.level >= self.log_level {
            // no subscribers is fine
            let _ = self.logs.send(record);
        }
    }
}

fn mismatched(listener: Listener, job_id: &JobId, kind: &str) {
    let expected = listener.kind();
    tracing::warn!(job_id = %job_id, kind, expected, "outcome type mismatch");
    listener.reject(JobError::Protocol(format!("{kind} delivered to a {expected} job")));
}

fn millis(ms: f64) -> Duration {
    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or_default()
}

async fn demux(shared: Arc<Shared>, mut outcomes: mpsc::UnboundedReceiver<Outcome>) {
    while let Some(outcome) = outcomes.recv().await {
        shared.route(outcome);
    }
    tracing::debug!("dispatcher outcome channel closed");
    shared.abandon_all();
}

// ── Broker ────────────────────────────────────────────────────────────────────

pub struct Broker {
    shared: Arc<Shared>,
    commands: Option<mpsc::UnboundedSender<Command>>,
    dispatcher: Option<thread::JoinHandle<DispatchStats>>,
    demux: JoinHandle<()>,
    minter: JobIdMinter,
    defaults: JobDefaults,
}

impl Broker {
    /// Start a dispatcher thread for `analyzer` and the demux task that feeds
    /// job futures. Must be called from within a tokio runtime.
    pub fn spawn(
        analyzer: impl Analyzer,
        gpu: impl GpuProvider + 'static,
        config: &EngineConfig,
    ) -> Result<Self, BrokerError> {
        let runtime = Handle::try_current().map_err(|_| BrokerError::NoRuntime)?;

        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let handle = Dispatcher::spawn(analyzer, gpu, outcomes_tx, &config.dispatcher)?;
        let (commands, dispatcher) = handle.into_parts();

        let shared = Arc::new(Shared::new(
            config.broker.log_capacity,
            config.broker.log_level,
        ));
        let demux = runtime.spawn(demux(shared.clone(), outcomes_rx));

        let broker = Self {
            shared,
            commands: Some(commands),
            dispatcher,
            demux,
            minter: JobIdMinter::new(),
            defaults: config.jobs.clone(),
        };
        tracing::info!(
            tag = broker.minter.tag(),
            thread = %config.dispatcher.thread_name,
            "broker started"
        );
        if config.dispatcher.prewarm_gpu {
            broker.init(config.jobs.enable_gpu)?;
        }
        Ok(broker)
    }

    /// Ask the dispatcher to create its GPU context ahead of the first job.
    /// Fire-and-forget: a failed prewarm shows up as a LOG.
    pub fn init(&self, enable_gpu: bool) -> Result<(), BrokerError> {
        self.send(Command::Init { enable_gpu })
    }

    /// Submit an analysis job. The payload's buffer moves to the dispatcher.
    pub fn run(
        &self,
        audio: AudioPayload,
        mut request: AnalysisRequest,
        options: JobOptions,
    ) -> Result<Job<AnalysisResult>, BrokerError> {
        let job_id = self.minter.mint();
        let policy = options.resolve(&self.defaults, request.backend);
        if let Some(backend) = options.backend {
            request.backend = Some(backend);
        }
        tracing::debug!(job_id = %job_id, function = %request.function, frames = audio.frames(), "submitting run");

        let (pending, result, timing) = job::channel();
        let command = Command::Run(RunCommand {
            job_id: job_id.clone(),
            request,
            audio: audio.into_transfer(),
            policy,
        });
        self.submit(&job_id, Listener::Analysis(pending), command)?;
        Ok(Job::new(self.canceller(job_id), result, timing))
    }

    /// Submit a query-by-example search. The payload's buffer moves to the
    /// dispatcher.
    pub fn search(
        &self,
        audio: AudioPayload,
        params: SearchParams,
        options: JobOptions,
    ) -> Result<Job<SearchResult>, BrokerError> {
        params.validate().map_err(BrokerError::InvalidRequest)?;
        let job_id = self.minter.mint();
        let policy = options.resolve(&self.defaults, None);
        tracing::debug!(
            job_id = %job_id,
            t0 = params.query.t0,
            t1 = params.query.t1,
            labels = params.refinement.as_ref().map_or(0, |r| r.labels.len()),
            "submitting search"
        );

        let (pending, result, timing) = job::channel();
        let command = Command::Search(SearchCommand {
            job_id: job_id.clone(),
            audio: audio.into_transfer(),
            params,
            policy,
        });
        self.submit(&job_id, Listener::Search(pending), command)?;
        Ok(Job::new(self.canceller(job_id), result, timing))
    }

    /// Receive dispatcher LOG records at or above the configured level.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<LogRecord> {
        self.shared.logs.subscribe()
    }

    /// Jobs submitted and not yet settled.
    pub fn in_flight(&self) -> usize {
        self.shared.listeners.len()
    }

    /// Stop the broker. In-flight jobs resolve to [`JobError::Abandoned`].
    ///
    /// The current job counts as cancelled: it stops at the analyzer's next
    /// cancellation check and the dispatcher thread exits without running the
    /// rest of its queue. The returned handle can be joined to collect its
    /// counters.
    pub fn destroy(mut self) -> Option<thread::JoinHandle<DispatchStats>> {
        self.shutdown();
        self.dispatcher.take()
    }

    fn canceller(&self, job_id: JobId) -> Canceller {
        let commands = self
            .commands
            .as_ref()
            .map(mpsc::UnboundedSender::downgrade)
            .unwrap_or_else(|| mpsc::unbounded_channel().0.downgrade());
        Canceller::new(job_id, self.shared.clone(), commands)
    }

    fn submit(&self, job_id: &JobId, listener: Listener, command: Command) -> Result<(), BrokerError> {
        let kind = command.kind();
        self.shared.listeners.insert(job_id.clone(), listener);
        if let Err(e) = self.send(command) {
            self.shared.take_listener(job_id);
            return Err(e);
        }
        tracing::trace!(job_id = %job_id, kind, "job posted");
        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), BrokerError> {
        let commands = self.commands.as_ref().ok_or(BrokerError::DispatcherGone)?;
        commands.send(command).map_err(|_| BrokerError::DispatcherGone)
    }

    fn shutdown(&mut self) {
        if self.commands.take().is_none() {
            return;
        }
        self.demux.abort();
        self.shared.abandon_all();
        tracing::info!(tag = self.minter.tag(), "broker stopped");
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
