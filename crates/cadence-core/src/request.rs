//! Job requests — what the caller asks the analyzer to compute.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Execution backend override for a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Cpu,
    Gpu,
}

/// Feature-extraction request. `function` names an analyzer routine
/// (`"spectrogram"`, `"onset"`, `"mfcc"`, ...); `options` carries its
/// settings and is passed through unexamined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    #[serde(rename = "fn")]
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

impl AnalysisRequest {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            backend: None,
            options: serde_json::Value::Null,
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }
}

/// Half-open time span in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub t0: f64,
    pub t1: f64,
}

impl TimeWindow {
    pub fn new(t0: f64, t1: f64) -> Self {
        Self { t0, t1 }
    }

    pub fn duration(&self) -> f64 {
        self.t1 - self.t0
    }

    pub fn is_valid(&self) -> bool {
        self.t0.is_finite() && self.t1.is_finite() && self.t0 >= 0.0 && self.t0 < self.t1
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.t0 < other.t1 && other.t0 < self.t1
    }
}

/// Scan tuning. Unset fields use the analyzer's defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTuning {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_sec: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_overlap: Option<bool>,
    /// Per-feature-group weights, keyed by group name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<BTreeMap<String, f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_softmax: Option<bool>,
}

/// Which feature groups make up the fingerprint. `None` means all.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSelection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
}

impl FeatureSelection {
    pub fn includes(&self, group: &str) -> bool {
        match &self.groups {
            Some(groups) => groups.iter().any(|g| g == group),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelStatus {
    Accepted,
    Rejected,
}

/// A window the user has judged, used to retrain the scoring model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledWindow {
    pub t0: f64,
    pub t1: f64,
    pub status: LabelStatus,
    /// Where the label came from (`"user"`, `"candidate"`, ...).
    #[serde(default)]
    pub source: String,
}

impl LabeledWindow {
    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.t0, self.t1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Refinement {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub include_query_as_positive: bool,
    #[serde(default)]
    pub labels: Vec<LabeledWindow>,
}

impl Default for Refinement {
    fn default() -> Self {
        Self {
            enabled: true,
            include_query_as_positive: true,
            labels: Vec::new(),
        }
    }
}

impl Refinement {
    /// Labels that actually take part in training.
    pub fn active_labels(&self) -> &[LabeledWindow] {
        if self.enabled {
            &self.labels
        } else {
            &[]
        }
    }

    pub fn count(&self, status: LabelStatus) -> usize {
        self.active_labels()
            .iter()
            .filter(|l| l.status == status)
            .count()
    }
}

fn default_true() -> bool {
    true
}

/// Query-by-example request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
    pub query: TimeWindow,
    #[serde(default, rename = "search", skip_serializing_if = "Option::is_none")]
    pub tuning: Option<SearchTuning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<FeatureSelection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<Refinement>,
}

impl SearchParams {
    pub fn new(query: TimeWindow) -> Self {
        Self {
            query,
            tuning: None,
            features: None,
            refinement: None,
        }
    }

    /// Check the windows before the job is queued.
    pub fn validate(&self) -> Result<(), String> {
        if !self.query.is_valid() {
            return Err(format!(
                "invalid query window [{}, {})",
                self.query.t0, self.query.t1
            ));
        }
        if let Some(refinement) = &self.refinement {
            if let Some(bad) = refinement.labels.iter().find(|l| !l.window().is_valid()) {
                return Err(format!("invalid label window [{}, {})", bad.t0, bad.t1));
            }
        }
        Ok(())
    }
}
