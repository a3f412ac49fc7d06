//! Envelope protocol between the job broker and the dispatcher.
//!
//! Two closed enums, one per direction. Both are serde-tagged on `type` so a
//! dump of either reads like the documented envelope shapes:
//!
//! ```text
//!   broker ──► dispatcher   INIT | CANCEL | RUN | SEARCH
//!   broker ◄── dispatcher   RESULT | SEARCH_RESULT | ERROR | LOG
//! ```
//!
//! Commands and outcomes are moved through in-process channels; the serde
//! derives exist for diagnostics and tests, not for transport.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::payload::TransferAudio;
use crate::request::{AnalysisRequest, Backend, SearchParams};
use crate::result::{AnalysisResult, SearchResult};

// ── Execution flags ───────────────────────────────────────────────────────────

/// Per-job GPU policy carried on every submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuPolicy {
    pub enable_gpu: bool,
    /// Fail the job instead of falling back to CPU when no GPU is available.
    #[serde(default)]
    pub strict_gpu: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
}

impl GpuPolicy {
    /// Whether the job should try to acquire a GPU context at all.
    pub fn wants_gpu(&self) -> bool {
        self.strict_gpu
            || self.backend == Some(Backend::Gpu)
            || (self.enable_gpu && self.backend != Some(Backend::Cpu))
    }
}

// ── Broker → dispatcher ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCommand {
    pub job_id: JobId,
    pub request: AnalysisRequest,
    pub audio: TransferAudio,
    #[serde(flatten)]
    pub policy: GpuPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCommand {
    pub job_id: JobId,
    pub audio: TransferAudio,
    #[serde(flatten)]
    pub params: SearchParams,
    #[serde(flatten)]
    pub policy: GpuPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Command {
    /// Optionally pre-warm the GPU context. Fire-and-forget.
    Init { enable_gpu: bool },
    /// Never acknowledged; the absence of an outcome is the acknowledgement.
    Cancel { job_id: JobId },
    Run(RunCommand),
    Search(SearchCommand),
}

impl Command {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Init { .. } => None,
            Self::Cancel { job_id } => Some(job_id),
            Self::Run(cmd) => Some(&cmd.job_id),
            Self::Search(cmd) => Some(&cmd.job_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "INIT",
            Self::Cancel { .. } => "CANCEL",
            Self::Run(_) => "RUN",
            Self::Search(_) => "SEARCH",
        }
    }
}

// ── Dispatcher → broker ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum Outcome {
    Result {
        job_id: JobId,
        worker_total_ms: f64,
        result: AnalysisResult,
    },
    SearchResult {
        job_id: JobId,
        result: SearchResult,
    },
    Error {
        job_id: JobId,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
    /// Out-of-band diagnostics, unordered relative to other outcomes.
    Log(LogRecord),
}

impl Outcome {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Result { job_id, .. }
            | Self::SearchResult { job_id, .. }
            | Self::Error { job_id, .. } => Some(job_id),
            Self::Log(record) => record.job_id.as_ref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Result { .. } => "RESULT",
            Self::SearchResult { .. } => "SEARCH_RESULT",
            Self::Error { .. } => "ERROR",
            Self::Log(_) => "LOG",
        }
    }

    /// True for the outcomes that terminate a job.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Log(_))
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id: None,
            level,
            message: message.into(),
            data: None,
        }
    }

    pub fn for_job(mut self, job_id: &JobId) -> Self {
        self.job_id = Some(job_id.clone());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}
