//! Job handles returned by the broker.
//!
//! A [`Job`] bundles the job id, a [`Canceller`], the result future and the
//! timing future. The result future settles at most once: with the typed
//! result, the dispatcher's error, a cancellation, or abandonment when the
//! broker goes away.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use cadence_core::config::JobDefaults;
use cadence_core::{Backend, Command, GpuPolicy, JobId};

use crate::broker::Shared;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    /// `cancel()` was called before an outcome was delivered.
    #[error("job cancelled")]
    Cancelled,
    /// The dispatcher reported an ERROR for this job.
    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
    },
    /// The broker was destroyed while the job was in flight.
    #[error("job abandoned: broker shut down")]
    Abandoned,
    /// The dispatcher answered with the wrong outcome type.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Per-submission execution flags. Unset fields fall back to [`JobDefaults`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub enable_gpu: Option<bool>,
    pub strict_gpu: Option<bool>,
    pub backend: Option<Backend>,
}

impl JobOptions {
    pub fn enable_gpu(mut self, on: bool) -> Self {
        self.enable_gpu = Some(on);
        self
    }

    pub fn strict_gpu(mut self, on: bool) -> Self {
        self.strict_gpu = Some(on);
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub(crate) fn resolve(&self, defaults: &JobDefaults, backend: Option<Backend>) -> GpuPolicy {
        GpuPolicy {
            enable_gpu: self.enable_gpu.unwrap_or(defaults.enable_gpu),
            strict_gpu: self.strict_gpu.unwrap_or(defaults.strict_gpu),
            backend: self.backend.or(backend),
        }
    }
}

// ── Listener side ─────────────────────────────────────────────────────────────

/// The settling half of a job, held in the broker's listener table.
pub(crate) struct Pending<T> {
    result: oneshot::Sender<Result<T, JobError>>,
    timing: oneshot::Sender<Duration>,
}

impl<T> Pending<T> {
    pub(crate) fn resolve(self, value: T, elapsed: Duration) {
        let _ = self.timing.send(elapsed);
        let _ = self.result.send(Ok(value));
    }

    pub(crate) fn reject(self, error: JobError) {
        let _ = self.result.send(Err(error));
    }
}

pub(crate) fn channel<T>() -> (Pending<T>, JobResult<T>, JobTiming) {
    let (result_tx, result_rx) = oneshot::channel();
    let (timing_tx, timing_rx) = oneshot::channel();
    (
        Pending {
            result: result_tx,
            timing: timing_tx,
        },
        JobResult { rx: result_rx },
        JobTiming { rx: timing_rx },
    )
}

// ── Caller side ───────────────────────────────────────────────────────────────

/// Resolves to the job's typed result or the reason it has none.
pub struct JobResult<T> {
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> Unpin for JobResult<T> {}

impl<T> Future for JobResult<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(JobError::Abandoned)))
    }
}

/// Resolves to the dispatcher-measured wall-clock duration, or `None` if the
/// job never produced a result.
pub struct JobTiming {
    rx: oneshot::Receiver<Duration>,
}

impl Future for JobTiming {
    type Output = Option<Duration>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

/// Cancels one job. Cheap to clone; every clone cancels the same job.
#[derive(Clone)]
pub struct Canceller {
    job_id: JobId,
    shared: Arc<Shared>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Canceller {
    pub(crate) fn new(
        job_id: JobId,
        shared: Arc<Shared>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            job_id,
            shared,
            commands,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Cancel the job. Idempotent.
    ///
    /// The result future is rejected with [`JobError::Cancelled`] before this
    /// returns, and any outcome for the job that arrives later is discarded.
    /// CANCEL is forwarded to the dispatcher only if the job was still live.
    pub fn cancel(&self) {
        if !self.shared.cancelled.cancel(&self.job_id) {
            return;
        }
        let Some(listener) = self.shared.take_listener(&self.job_id) else {
            tracing::trace!(job_id = %self.job_id, "cancel after job settled");
            return;
        };
        listener.reject(JobError::Cancelled);
        tracing::debug!(job_id = %self.job_id, "job cancelled locally");

        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Cancel {
                job_id: self.job_id.clone(),
            });
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.is_cancelled(&self.job_id)
    }
}

/// A submitted job.
pub struct Job<T> {
    canceller: Canceller,
    result: JobResult<T>,
    timing: JobTiming,
}

impl<T> Job<T> {
    pub(crate) fn new(canceller: Canceller, result: JobResult<T>, timing: JobTiming) -> Self {
        Self {
            canceller,
            result,
            timing,
        }
    }

    pub fn id(&self) -> &JobId {
        self.canceller.job_id()
    }

    pub fn cancel(&self) {
        self.canceller.cancel();
    }

    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn into_parts(self) -> (Canceller, JobResult<T>, JobTiming) {
        (self.canceller, self.result, self.timing)
    }

    /// Wait for the result.
    pub async fn wait(self) -> Result<T, JobError> {
        self.result.await
    }

    /// Wait for the result together with the dispatcher-reported duration.
    pub async fn wait_timed(self) -> Result<(T, Duration), JobError> {
        let value = self.result.await?;
        let elapsed = self.timing.await.unwrap_or_default();
        Ok((value, elapsed))
    }
}
