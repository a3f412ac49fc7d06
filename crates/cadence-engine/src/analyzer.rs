//! Analyzer seam — the opaque DSP/ML routines the dispatcher invokes.
//!
//! The engine never looks inside an analyzer. It hands over a reconstructed
//! payload plus a [`JobContext`], and expects a result shape back.

use cadence_core::{AnalysisRequest, AnalysisResult, AudioPayload, JobId, SearchParams, SearchResult};

use crate::gpu::GpuContext;

/// Feature extraction and query-by-example search.
///
/// Runs on the dispatcher thread, one call at a time. Long-running
/// implementations should poll [`JobContext::is_cancelled`] and return
/// [`AnalysisError::Cancelled`] when it turns true.
pub trait Analyzer: Send + 'static {
    fn analyze(
        &mut self,
        ctx: &JobContext<'_>,
        audio: &AudioPayload,
        request: &AnalysisRequest,
    ) -> Result<AnalysisResult, AnalysisError>;

    /// Score every window of `audio` against the query window, optionally
    /// retraining the model on the refinement labels first.
    fn search(
        &mut self,
        ctx: &JobContext<'_>,
        audio: &AudioPayload,
        params: &SearchParams,
    ) -> Result<SearchResult, AnalysisError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("cancelled")]
    Cancelled,
    #[error("unsupported analysis function: {0}")]
    Unsupported(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error("{message}")]
    Failed {
        message: String,
        stack: Option<String>,
    },
}

impl AnalysisError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            stack: None,
        }
    }

    pub fn stack(&self) -> Option<&str> {
        match self {
            Self::Failed { stack, .. } => stack.as_deref(),
            _ => None,
        }
    }
}

/// Per-job view handed to the analyzer.
pub struct JobContext<'a> {
    job_id: &'a JobId,
    gpu: Option<&'a GpuContext>,
    cancelled: &'a dyn Fn() -> bool,
}

impl<'a> JobContext<'a> {
    pub fn new(
        job_id: &'a JobId,
        gpu: Option<&'a GpuContext>,
        cancelled: &'a dyn Fn() -> bool,
    ) -> Self {
        Self {
            job_id,
            gpu,
            cancelled,
        }
    }

    pub fn job_id(&self) -> &JobId {
        self.job_id
    }

    /// The shared GPU context, if this job acquired one. `None` means CPU.
    pub fn gpu(&self) -> Option<&GpuContext> {
        self.gpu
    }

    /// Cooperative cancellation check. Sticky: once true, stays true.
    pub fn is_cancelled(&self) -> bool {
        (self.cancelled)()
    }

    /// `Err(Cancelled)` if the job has been cancelled, for use with `?`.
    pub fn checkpoint(&self) -> Result<(), AnalysisError> {
        if self.is_cancelled() {
            Err(AnalysisError::Cancelled)
        } else {
            Ok(())
        }
    }
}
