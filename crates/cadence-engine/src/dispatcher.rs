//! Dispatcher — the background execution thread.
//!
//! One OS thread, one mailbox, one job at a time. Commands are processed in
//! FIFO order. Every outcome is checked against the dispatcher's own
//! cancellation registry immediately before it is emitted, so a job
//! cancelled mid-flight produces a LOG and nothing else.
//!
//! While an analyzer runs, the thread is busy and the mailbox is not being
//! read. The cancellation predicate handed to the analyzer therefore drains
//! the mailbox itself: CANCEL commands are applied on the spot, anything
//! else is parked in a backlog that is served before the channel.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use cadence_core::config::DispatcherConfig;
use cadence_core::{
    CancellationRegistry, CodecError, Command, GpuPolicy, JobId, LogLevel, LogRecord, Outcome,
    RunCommand, SearchCommand, ShapeError,
};

use crate::analyzer::{AnalysisError, Analyzer, JobContext};
use crate::gpu::{GpuContextManager, GpuError, GpuProvider};

/// Counters kept for the lifetime of a dispatcher. Returned when the thread exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub completed: u64,
    pub failed: u64,
    /// Jobs that finished (or were skipped) after being cancelled.
    pub suppressed: u64,
}

/// Handle to a running dispatcher thread.
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    thread: Option<thread::JoinHandle<DispatchStats>>,
}

impl DispatcherHandle {
    pub fn sender(&self) -> &mpsc::UnboundedSender<Command> {
        &self.commands
    }

    /// Close the mailbox and wait for the thread. A job that polls for
    /// cancellation stops early and its outcome is suppressed.
    pub fn join(mut self) -> Option<DispatchStats> {
        let thread = self.thread.take()?;
        drop(self);
        thread.join().ok()
    }

    /// Split into the command sender and the thread handle.
    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Command>,
        Option<thread::JoinHandle<DispatchStats>>,
    ) {
        (self.commands, self.thread)
    }
}

// ── Mailbox ───────────────────────────────────────────────────────────────────

struct Mailbox {
    rx: mpsc::UnboundedReceiver<Command>,
    backlog: VecDeque<Command>,
    /// Every sender is gone: the broker was destroyed mid-job.
    closed: bool,
}

impl Mailbox {
    /// Next command in FIFO order. Blocks; `None` once every sender is gone.
    /// A mailbox that closed during a job drops its backlog.
    fn next(&mut self) -> Option<Command> {
        if self.closed {
            if !self.backlog.is_empty() {
                tracing::debug!(dropped = self.backlog.len(), "broker gone, backlog dropped");
            }
            return None;
        }
        match self.backlog.pop_front() {
            Some(cmd) => Some(cmd),
            None => self.rx.blocking_recv(),
        }
    }

    /// Apply queued CANCELs immediately, park everything else.
    fn absorb_cancels(&mut self, registry: &CancellationRegistry) {
        loop {
            match self.rx.try_recv() {
                Ok(Command::Cancel { job_id }) => {
                    if registry.cancel(&job_id) {
                        tracing::debug!(job_id = %job_id, "cancel observed mid-flight");
                    }
                }
                Ok(other) => self.backlog.push_back(other),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        tracing::debug!("command channel closed mid-flight");
                    }
                    self.closed = true;
                    break;
                }
            }
        }
    }

    /// Cancel `job_id` if the broker is gone. Returns whether it is cancelled.
    fn settle_cancel(&mut self, registry: &CancellationRegistry, job_id: &JobId) -> bool {
        self.absorb_cancels(registry);
        if self.closed {
            registry.cancel(job_id);
        }
        registry.is_cancelled(job_id)
    }
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum JobFailure {
    #[error("invalid audio payload: {0}")]
    Codec(#[from] CodecError),
    #[error("GPU required but unavailable: {0}")]
    Gpu(#[from] GpuError),
    #[error("{0}")]
    Analysis(#[from] AnalysisError),
    #[error("invalid request: {0}")]
    Request(String),
    #[error("analyzer returned a malformed result: {0}")]
    Shape(#[from] ShapeError),
    #[error("analyzer panicked: {0}")]
    Panic(String),
}

impl JobFailure {
    fn stack(&self) -> Option<String> {
        match self {
            Self::Analysis(e) => e.stack().map(str::to_owned),
            _ => None,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher<A: Analyzer> {
    analyzer: A,
    gpu: GpuContextManager,
    mailbox: RefCell<Mailbox>,
    cancelled: CancellationRegistry,
    outcomes: mpsc::UnboundedSender<Outcome>,
    stats: DispatchStats,
}

impl<A: Analyzer> Dispatcher<A> {
    /// Spawn the dispatcher on its own named thread.
    pub fn spawn(
        analyzer: A,
        gpu: impl GpuProvider + 'static,
        outcomes: mpsc::UnboundedSender<Outcome>,
        config: &DispatcherConfig,
    ) -> std::io::Result<DispatcherHandle> {
        let (commands, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            analyzer,
            gpu: GpuContextManager::new(gpu),
            mailbox: RefCell::new(Mailbox {
                rx,
                backlog: VecDeque::new(),
                closed: false,
            }),
            cancelled: CancellationRegistry::new(),
            outcomes,
            stats: DispatchStats::default(),
        };
        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || dispatcher.run())?;
        Ok(DispatcherHandle {
            commands,
            thread: Some(thread),
        })
    }

    fn run(mut self) -> DispatchStats {
        tracing::info!("dispatcher started");
        loop {
            let Some(cmd) = self.mailbox.get_mut().next() else {
                break;
            };
            if self.handle(cmd).is_break() {
                tracing::debug!("outcome channel closed");
                break;
            }
        }
        let gpu = self.gpu.stats();
        tracing::info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            suppressed = self.stats.suppressed,
            gpu_attempts = gpu.attempts,
            gpu_created = gpu.created,
            "dispatcher stopped"
        );
        self.stats
    }

    fn handle(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Init { enable_gpu } => self.handle_init(enable_gpu),
            Command::Cancel { job_id } => {
                if self.cancelled.cancel(&job_id) {
                    tracing::debug!(job_id = %job_id, "job cancelled");
                }
                ControlFlow::Continue(())
            }
            Command::Run(cmd) => self.handle_run(cmd),
            Command::Search(cmd) => self.handle_search(cmd),
        }
    }

    fn handle_init(&mut self, enable_gpu: bool) -> ControlFlow<()> {
        if !enable_gpu {
            return ControlFlow::Continue(());
        }
        match self.gpu.prewarm() {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                tracing::warn!(error = %e, "GPU prewarm failed");
                self.log(LogRecord::new(LogLevel::Warn, format!("GPU prewarm failed: {e}")))
            }
        }
    }

    fn handle_run(&mut self, cmd: RunCommand) -> ControlFlow<()> {
        let RunCommand {
            job_id,
            request,
            audio,
            policy,
        } = cmd;
        if self.cancelled.is_cancelled(&job_id) {
            return self.skip(&job_id);
        }
        tracing::debug!(job_id = %job_id, function = %request.function, "run started");

        let executed = audio.reconstruct().map_err(JobFailure::from).and_then(|audio| {
            self.execute(&job_id, &policy, |analyzer, ctx| {
                analyzer.analyze(ctx, &audio, &request)
            })
        });
        self.finish(&job_id, executed, |result, worker_total_ms| {
            result.validate()?;
            Ok(Outcome::Result {
                job_id: job_id.clone(),
                worker_total_ms,
                result,
            })
        })
    }

    fn handle_search(&mut self, cmd: SearchCommand) -> ControlFlow<()> {
        let SearchCommand {
            job_id,
            audio,
            params,
            policy,
        } = cmd;
        if self.cancelled.is_cancelled(&job_id) {
            return self.skip(&job_id);
        }
        tracing::debug!(job_id = %job_id, t0 = params.query.t0, t1 = params.query.t1, "search started");

        let executed = params
            .validate()
            .map_err(JobFailure::Request)
            .and_then(|()| audio.reconstruct().map_err(JobFailure::from))
            .and_then(|audio| {
                self.execute(&job_id, &policy, |analyzer, ctx| {
                    analyzer.search(ctx, &audio, &params)
                })
            });
        self.finish(&job_id, executed, |mut result, worker_total_ms| {
            result.validate()?;
            result.timings.worker_total_ms = worker_total_ms;
            Ok(Outcome::SearchResult {
                job_id: job_id.clone(),
                result,
            })
        })
    }

    /// Acquire the GPU (if wanted), run the analyzer, time it.
    fn execute<T>(
        &mut self,
        job_id: &JobId,
        policy: &GpuPolicy,
        call: impl FnOnce(&mut A, &JobContext<'_>) -> Result<T, AnalysisError>,
    ) -> Result<(T, f64), JobFailure> {
        let Self {
            analyzer,
            gpu,
            mailbox,
            cancelled,
            ..
        } = self;
        let gpu = gpu.acquire(policy)?;
        let mailbox = &*mailbox;
        let cancelled = &*cancelled;
        let poll = || mailbox.borrow_mut().settle_cancel(cancelled, job_id);
        let ctx = JobContext::new(job_id, gpu, &poll);

        let start = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| call(analyzer, &ctx)));
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(value)) => Ok((value, elapsed_ms)),
            Ok(Err(e)) => Err(JobFailure::Analysis(e)),
            Err(payload) => Err(JobFailure::Panic(panic_message(payload))),
        }
    }

    /// Emit exactly one outcome for the job, unless it was cancelled.
    fn finish<T>(
        &mut self,
        job_id: &JobId,
        executed: Result<(T, f64), JobFailure>,
        build: impl FnOnce(T, f64) -> Result<Outcome, ShapeError>,
    ) -> ControlFlow<()> {
        // pick up a CANCEL that arrived after the analyzer's last check
        if self.mailbox.get_mut().settle_cancel(&self.cancelled, job_id) {
            self.stats.suppressed += 1;
            let elapsed_ms = executed.as_ref().map(|(_, ms)| *ms).ok();
            tracing::info!(job_id = %job_id, "job cancelled, outcome suppressed");
            let mut record = LogRecord::new(LogLevel::Info, "job cancelled; outcome suppressed")
                .for_job(job_id);
            if let Some(ms) = elapsed_ms {
                record = record.with_data(serde_json::json!({ "workerTotalMs": ms }));
            }
            return self.log(record);
        }

        let outcome = executed.and_then(|(value, ms)| build(value, ms).map_err(JobFailure::from));
        match outcome {
            Ok(outcome) => {
                self.stats.completed += 1;
                tracing::info!(job_id = %job_id, kind = outcome.kind(), "job finished");
                self.emit(outcome)
            }
            Err(failure) => self.fail(job_id, failure),
        }
    }

    fn fail(&mut self, job_id: &JobId, failure: JobFailure) -> ControlFlow<()> {
        self.stats.failed += 1;
        tracing::warn!(job_id = %job_id, error = %failure, "job failed");
        self.emit(Outcome::Error {
            job_id: job_id.clone(),
            message: failure.to_string(),
            stack: failure.stack(),
        })
    }

    fn skip(&mut self, job_id: &JobId) -> ControlFlow<()> {
        self.stats.suppressed += 1;
        tracing::debug!(job_id = %job_id, "job cancelled before start, skipped");
        self.log(LogRecord::new(LogLevel::Info, "job cancelled before start; skipped").for_job(job_id))
    }

    fn log(&self, record: LogRecord) -> ControlFlow<()> {
        self.emit(Outcome::Log(record))
    }

    fn emit(&self, outcome: Outcome) -> ControlFlow<()> {
        match self.outcomes.send(outcome) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }
}
