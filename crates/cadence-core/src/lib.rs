//! cadence-core — shared types for the analysis job engine: the audio payload
//! codec, envelope protocol, result shapes, cancellation registry and config.
//! The engine crate depends on this one.

pub mod cancel;
pub mod config;
pub mod job;
pub mod payload;
pub mod protocol;
pub mod request;
pub mod result;

pub use cancel::CancellationRegistry;
pub use config::EngineConfig;
pub use job::{JobId, JobIdMinter};
pub use payload::{AudioPayload, CodecError, F32Buffer, TransferAudio};
pub use protocol::{Command, GpuPolicy, LogLevel, LogRecord, Outcome, RunCommand, SearchCommand};
pub use request::{
    AnalysisRequest, Backend, FeatureSelection, LabelStatus, LabeledWindow, Refinement,
    SearchParams, SearchTuning, TimeWindow,
};
pub use result::{
    AnalysisResult, Candidate, Explanation, FeatureContribution, FeatureWeight, ModelDescriptor,
    ModelKind, SearchResult, ShapeError, Timings, TrainingStats,
};
