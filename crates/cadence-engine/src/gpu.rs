//! GPU context manager — lazy, cached compute context owned by the dispatcher.
//!
//! The context is created on first use and reused by every later job.
//! Only the dispatcher thread touches the manager, so there is no lock.
//! A failed attempt is not cached: the next job that wants a GPU tries again.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cadence_core::{Backend, GpuPolicy};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GpuError {
    #[error("no GPU adapter available: {0}")]
    Unavailable(String),
    #[error("GPU device creation failed: {0}")]
    DeviceCreation(String),
    #[error("strictGpu requested together with a cpu backend override")]
    Conflict,
}

/// Opaque handle to a GPU device. Analyzers downcast [`handle`](Self::handle)
/// to whatever device type their provider created.
#[derive(Clone)]
pub struct GpuContext {
    adapter: String,
    handle: Arc<dyn Any + Send + Sync>,
}

impl GpuContext {
    pub fn new(adapter: impl Into<String>, handle: impl Any + Send + Sync) -> Self {
        Self {
            adapter: adapter.into(),
            handle: Arc::new(handle),
        }
    }

    /// Adapter name, e.g. "NVIDIA RTX 4070".
    pub fn adapter(&self) -> &str {
        &self.adapter
    }

    pub fn handle(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.handle
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }
}

impl fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuContext")
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

/// Creates GPU contexts. Called at most once per successful creation.
pub trait GpuProvider: Send {
    fn create(&mut self) -> Result<GpuContext, GpuError>;
}

impl<F> GpuProvider for F
where
    F: FnMut() -> Result<GpuContext, GpuError> + Send,
{
    fn create(&mut self) -> Result<GpuContext, GpuError> {
        self()
    }
}

/// Provider for hosts without GPU support. Every job runs on the CPU.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGpu;

impl GpuProvider for NoGpu {
    fn create(&mut self) -> Result<GpuContext, GpuError> {
        Err(GpuError::Unavailable("no GPU provider configured".into()))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GpuStats {
    pub attempts: u32,
    pub created: bool,
}

pub struct GpuContextManager {
    provider: Box<dyn GpuProvider>,
    context: Option<GpuContext>,
    attempts: u32,
}

impl GpuContextManager {
    pub fn new(provider: impl GpuProvider + 'static) -> Self {
        Self {
            provider: Box::new(provider),
            context: None,
            attempts: 0,
        }
    }

    /// Resolve a job's GPU policy to a context or CPU fallback.
    ///
    /// `Ok(None)` means run on the CPU. An error is only returned when the
    /// policy is strict (or self-contradictory) and no context can be had.
    pub fn acquire(&mut self, policy: &GpuPolicy) -> Result<Option<&GpuContext>, GpuError> {
        if policy.strict_gpu && policy.backend == Some(Backend::Cpu) {
            return Err(GpuError::Conflict);
        }
        if !policy.wants_gpu() {
            return Ok(None);
        }
        match self.get_or_create() {
            Ok(ctx) => Ok(Some(ctx)),
            Err(e) if policy.strict_gpu => Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "GPU unavailable, falling back to CPU");
                Ok(None)
            }
        }
    }

    /// Create the context ahead of the first job. Failures are reported,
    /// never fatal.
    pub fn prewarm(&mut self) -> Result<(), GpuError> {
        self.get_or_create().map(|_| ())
    }

    pub fn is_ready(&self) -> bool {
        self.context.is_some()
    }

    pub fn stats(&self) -> GpuStats {
        GpuStats {
            attempts: self.attempts,
            created: self.context.is_some(),
        }
    }

    fn get_or_create(&mut self) -> Result<&GpuContext, GpuError> {
        if self.context.is_none() {
            self.attempts += 1;
            let ctx = self.provider.create()?;
            tracing::info!(adapter = ctx.adapter(), attempt = self.attempts, "GPU context created");
            self.context = Some(ctx);
        }
        self.context
            .as_ref()
            .ok_or_else(|| GpuError::Unavailable("context vanished after creation".into()))
    }
}
