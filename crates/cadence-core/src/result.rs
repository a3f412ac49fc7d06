//! Result shapes returned by analysis and search jobs.
//!
//! All numeric series are [`F32Buffer`]s, so handing a result from the
//! dispatcher to the broker moves the buffers rather than copying them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::payload::F32Buffer;
use crate::request::TimeWindow;

// ── Analysis results ──────────────────────────────────────────────────────────

/// Output of a feature-extraction job. Every shape carries an ascending
/// `times` series (seconds) whose length equals the shape's series length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AnalysisResult {
    /// One value per frame (envelopes, tempo curves, ...).
    #[serde(rename = "1d")]
    OneD {
        times: F32Buffer,
        values: F32Buffer,
        #[serde(default)]
        meta: serde_json::Value,
    },
    /// `width` values per frame, row-major (spectrograms, MFCCs, ...).
    #[serde(rename = "2d")]
    TwoD {
        times: F32Buffer,
        values: F32Buffer,
        width: usize,
        #[serde(default)]
        meta: serde_json::Value,
    },
    /// Discrete occurrences with a weight each (onsets, beats, ...).
    Events {
        times: F32Buffer,
        weights: F32Buffer,
        #[serde(default)]
        meta: serde_json::Value,
    },
}

impl AnalysisResult {
    pub fn times(&self) -> &F32Buffer {
        match self {
            Self::OneD { times, .. } | Self::TwoD { times, .. } | Self::Events { times, .. } => {
                times
            }
        }
    }

    pub fn meta(&self) -> &serde_json::Value {
        match self {
            Self::OneD { meta, .. } | Self::TwoD { meta, .. } | Self::Events { meta, .. } => meta,
        }
    }

    /// Number of frames (or events) the result declares.
    pub fn series_len(&self) -> usize {
        match self {
            Self::OneD { values, .. } => values.len(),
            Self::TwoD { values, width, .. } => {
                if *width == 0 {
                    0
                } else {
                    values.len() / width
                }
            }
            Self::Events { weights, .. } => weights.len(),
        }
    }

    /// Rows of a 2-D result; empty for other shapes.
    pub fn rows(&self) -> std::slice::ChunksExact<'_, f32> {
        match self {
            Self::TwoD { values, width, .. } if *width > 0 => values.as_slice().chunks_exact(*width),
            _ => [].chunks_exact(1),
        }
    }

    pub fn shape_name(&self) -> &'static str {
        match self {
            Self::OneD { .. } => "1d",
            Self::TwoD { .. } => "2d",
            Self::Events { .. } => "events",
        }
    }

    /// Check the shape invariants before a result is emitted.
    pub fn validate(&self) -> Result<(), ShapeError> {
        if let Self::TwoD { values, width, .. } = self {
            if *width == 0 && !values.is_empty() {
                return Err(ShapeError::ZeroWidth);
            }
            if *width > 0 && values.len() % width != 0 {
                return Err(ShapeError::RaggedRows {
                    values: values.len(),
                    width: *width,
                });
            }
        }
        let times = self.times();
        if times.len() != self.series_len() {
            return Err(ShapeError::LengthMismatch {
                times: times.len(),
                series: self.series_len(),
            });
        }
        check_ascending(times.as_slice())
    }
}

// ── Search results ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Untrained similarity to the query fingerprint.
    Baseline,
    /// Centroid model over labeled examples.
    Prototype,
    /// Logistic classifier trained on labeled examples.
    Logistic,
}

impl ModelKind {
    pub fn is_trained(self) -> bool {
        !matches!(self, Self::Baseline)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureWeight {
    pub name: String,
    pub magnitude: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingStats {
    pub iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
}

/// Description of the scoring model used for a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub kind: ModelKind,
    pub positives: usize,
    pub negatives: usize,
    #[serde(default)]
    pub weights: Vec<FeatureWeight>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub training: Option<TrainingStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub group: String,
    pub value: f32,
}

/// Linear decomposition of a candidate's score: contributions + bias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Explanation {
    pub contributions: Vec<FeatureContribution>,
    pub bias: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub time_sec: f64,
    pub score: f32,
    pub window: TimeWindow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explain: Option<Explanation>,
}

/// Stage timings in milliseconds. `worker_total_ms` is measured by the
/// dispatcher around the analyzer call; `stages` is analyzer-reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub worker_total_ms: f64,
    #[serde(flatten)]
    pub stages: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub times: F32Buffer,
    pub scores: F32Buffer,
    /// What `scores` measures (`"similarity"`, `"probability"`, ...).
    pub curve_kind: String,
    pub model: ModelDescriptor,
    /// Ranked best-first.
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub timings: Timings,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl SearchResult {
    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.times.len() != self.scores.len() {
            return Err(ShapeError::LengthMismatch {
                times: self.times.len(),
                series: self.scores.len(),
            });
        }
        if let Some(c) = self
            .candidates
            .iter()
            .find(|c| !(0.0..=1.0).contains(&c.score))
        {
            return Err(ShapeError::ScoreOutOfRange(c.score));
        }
        check_ascending(self.times.as_slice())
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("times has {times} entries but the series has {series}")]
    LengthMismatch { times: usize, series: usize },
    #[error("{values} values do not divide into rows of width {width}")]
    RaggedRows { values: usize, width: usize },
    #[error("2d result has values but zero width")]
    ZeroWidth,
    #[error("times not ascending at index {0}")]
    NotAscending(usize),
    #[error("candidate score {0} outside [0, 1]")]
    ScoreOutOfRange(f32),
}

fn check_ascending(times: &[f32]) -> Result<(), ShapeError> {
    match times.windows(2).position(|w| !(w[0] <= w[1])) {
        Some(i) => Err(ShapeError::NotAscending(i + 1)),
        None => Ok(()),
    }
}
