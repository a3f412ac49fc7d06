//! cadence-engine — runs audio analysis jobs off the caller's thread.
//!
//! ```text
//!   caller ──run/search──► Broker ──Command──► Dispatcher thread ──► Analyzer
//!      ▲                     │                      │
//!      └── Job futures ◄── demux task ◄──Outcome────┘
//! ```
//!
//! The broker owns the listener table and its own cancellation registry; the
//! dispatcher owns the analyzer, the cached GPU context and a second registry.
//! The two sides never share cancellation state.

pub mod analyzer;
pub mod broker;
pub mod dispatcher;
pub mod gpu;
pub mod job;

pub use analyzer::{AnalysisError, Analyzer, JobContext};
pub use broker::{Broker, BrokerError};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherHandle};
pub use gpu::{GpuContext, GpuContextManager, GpuError, GpuProvider, GpuStats, NoGpu};
pub use job::{Canceller, Job, JobError, JobOptions, JobResult, JobTiming};
