//! Cadence integration test harness.
//!
//! Every test spawns a real broker with its own dispatcher thread and drives
//! it through the public API. The analyzers below are deterministic stand-ins
//! for the DSP/ML routines:
//!
//!   rms          1-D RMS envelope, one frame per `hop` samples (default 441)
//!   bands        2-D, four energy bands per frame
//!   peaks        event list, one event per frame above `threshold`
//!   sleep        blocks until cancelled
//!   fail         returns an error with a stack
//!   panic        panics
//!   gpu          1-D, value 1.0 if a GPU context was handed in
//!   address      1-D, meta carries the address of the sample buffer
//!
//! Search scores windows by RMS distance to the query window and reports a
//! logistic model when refinement labels are present.
//!
//! Run with RUST_LOG=debug to see engine tracing.

mod run;
mod search;

use std::sync::Once;
use std::time::Duration;

use anyhow::{Context, Result};
use cadence_core::{
    AnalysisRequest, AnalysisResult, AudioPayload, Candidate, EngineConfig, FeatureWeight,
    JobId, LabelStatus, LogRecord, ModelDescriptor, ModelKind, SearchParams, SearchResult,
    TimeWindow, Timings, TrainingStats,
};
use cadence_engine::{AnalysisError, Analyzer, Broker, GpuProvider, JobContext, NoGpu};
use tokio::sync::broadcast;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SAMPLE_RATE: f32 = 44_100.0;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Constant-amplitude signal, so its RMS is `amplitude` everywhere.
pub fn flat(amplitude: f32, secs: f32) -> AudioPayload {
    let frames = (SAMPLE_RATE * secs) as usize;
    let samples = (0..frames)
        .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
        .collect::<Vec<_>>();
    AudioPayload::new(SAMPLE_RATE, samples).expect("valid sample rate")
}

/// Quiet signal with loud bursts over the given windows.
pub fn bursts(secs: f32, loud: &[TimeWindow]) -> AudioPayload {
    let frames = (SAMPLE_RATE * secs) as usize;
    let samples = (0..frames)
        .map(|i| {
            let t = i as f64 / f64::from(SAMPLE_RATE);
            let amp: f32 = if loud.iter().any(|w| t >= w.t0 && t < w.t1) { 0.8 } else { 0.05 };
            if i % 2 == 0 { amp } else { -amp }
        })
        .collect::<Vec<_>>();
    AudioPayload::new(SAMPLE_RATE, samples).expect("valid sample rate")
}

pub fn spawn_broker() -> Result<Broker> {
    spawn_broker_with(NoGpu, &EngineConfig::default())
}

pub fn spawn_broker_with(gpu: impl GpuProvider + 'static, config: &EngineConfig) -> Result<Broker> {
    init_tracing();
    Broker::spawn(Stub, gpu, config).context("spawning broker")
}

/// Wait for the first LOG record addressed to `job_id`.
pub async fn log_for(logs: &mut broadcast::Receiver<LogRecord>, job_id: &JobId) -> Result<LogRecord> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = tokio::time::timeout_at(deadline, logs.recv())
            .await
            .context("timed out waiting for LOG")??;
        if record.job_id.as_ref() == Some(job_id) {
            return Ok(record);
        }
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

// ── Stub analyzer ─────────────────────────────────────────────────────────────

pub struct Stub;

fn option_usize(request: &AnalysisRequest, key: &str, default: usize) -> usize {
    request
        .options
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .map_or(default, |v| v as usize)
}

fn frames(audio: &AudioPayload, hop: usize) -> (Vec<f32>, Vec<&[f32]>) {
    let chunks = audio.samples().chunks(hop.max(1)).collect::<Vec<_>>();
    let times = (0..chunks.len())
        .map(|i| (i * hop) as f32 / audio.sample_rate())
        .collect();
    (times, chunks)
}

impl Analyzer for Stub {
    fn analyze(
        &mut self,
        ctx: &JobContext<'_>,
        audio: &AudioPayload,
        request: &AnalysisRequest,
    ) -> Result<AnalysisResult, AnalysisError> {
        let hop = option_usize(request, "hop", 441);
        match request.function.as_str() {
            "rms" => {
                let (times, chunks) = frames(audio, hop);
                let mut values = Vec::with_capacity(chunks.len());
                for chunk in chunks {
                    ctx.checkpoint()?;
                    values.push(rms(chunk));
                }
                Ok(AnalysisResult::OneD {
                    times: times.into(),
                    values: values.into(),
                    meta: serde_json::json!({ "hop": hop }),
                })
            }
            "bands" => {
                let (times, chunks) = frames(audio, hop);
                let values = chunks
                    .iter()
                    .flat_map(|chunk| {
                        let quarter = (chunk.len() / 4).max(1);
                        (0..4).map(move |b| {
                            rms(chunk.get(b * quarter..((b + 1) * quarter).min(chunk.len())).unwrap_or(&[]))
                        })
                    })
                    .collect::<Vec<_>>();
                Ok(AnalysisResult::TwoD {
                    times: times.into(),
                    values: values.into(),
                    width: 4,
                    meta: serde_json::Value::Null,
                })
            }
            "peaks" => {
                let threshold = request
                    .options
                    .get("threshold")
                    .and_then(serde_json::Value::as_f64)
                    .unwrap_or(0.5) as f32;
                let (times, chunks) = frames(audio, hop);
                let (times, weights): (Vec<f32>, Vec<f32>) = times
                    .into_iter()
                    .zip(chunks.iter().map(|c| rms(c)))
                    .filter(|(_, w)| *w >= threshold)
                    .unzip();
                Ok(AnalysisResult::Events {
                    times: times.into(),
                    weights: weights.into(),
                    meta: serde_json::Value::Null,
                })
            }
            "sleep" => {
                while !ctx.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(AnalysisError::Cancelled)
            }
            "fail" => Err(AnalysisError::Failed {
                message: "fft size must be a power of two".into(),
                stack: Some("at stub::fft_plan".into()),
            }),
            "panic" => panic!("window index out of range"),
            "gpu" => Ok(AnalysisResult::OneD {
                times: vec![0.0].into(),
                values: vec![if ctx.gpu().is_some() { 1.0 } else { 0.0 }].into(),
                meta: serde_json::json!({ "adapter": ctx.gpu().map(|g| g.adapter().to_string()) }),
            }),
            "address" => Ok(AnalysisResult::OneD {
                times: vec![0.0].into(),
                values: vec![0.0].into(),
                meta: serde_json::json!({ "samples": audio.buffer().as_ptr() as usize }),
            }),
            other => Err(AnalysisError::Unsupported(other.to_string())),
        }
    }

    fn search(
        &mut self,
        ctx: &JobContext<'_>,
        audio: &AudioPayload,
        params: &SearchParams,
    ) -> Result<SearchResult, AnalysisError> {
        let tuning = params.tuning.clone().unwrap_or_default();
        let hop = tuning.hop_sec.unwrap_or(0.05);
        let threshold = tuning.threshold.unwrap_or(0.8);
        let width = params.query.duration();
        let sr = f64::from(audio.sample_rate());
        let window_rms = |w: TimeWindow| {
            let start = ((w.t0 * sr) as usize).min(audio.frames());
            let end = ((w.t1 * sr) as usize).min(audio.frames());
            rms(&audio.samples()[start..end])
        };

        let refinement = params.refinement.clone().unwrap_or_default();
        let labels = refinement.active_labels();
        let mut positives = labels
            .iter()
            .filter(|l| l.status == LabelStatus::Accepted)
            .map(|l| window_rms(l.window()))
            .collect::<Vec<_>>();
        if refinement.include_query_as_positive || positives.is_empty() {
            positives.push(window_rms(params.query));
        }
        let negatives = labels
            .iter()
            .filter(|l| l.status == LabelStatus::Rejected)
            .map(|l| window_rms(l.window()))
            .collect::<Vec<_>>();
        let target = positives.iter().sum::<f32>() / positives.len() as f32;

        let mut times = Vec::new();
        let mut scores = Vec::new();
        let mut t = 0.0;
        while t + width <= audio.duration_secs() + 1e-9 {
            ctx.checkpoint()?;
            let level = window_rms(TimeWindow::new(t, t + width));
            let mut score = 1.0 / (1.0 + 10.0 * (level - target).abs());
            if negatives.iter().any(|n| (level - n).abs() < 1e-3) {
                score *= 0.5;
            }
            times.push(t as f32);
            scores.push(score.clamp(0.0, 1.0));
            t += hop;
        }

        let mut candidates = times
            .iter()
            .zip(&scores)
            .filter(|(_, s)| **s >= threshold)
            .map(|(&time, &score)| Candidate {
                time_sec: f64::from(time),
                score,
                window: TimeWindow::new(f64::from(time), f64::from(time) + width),
                explain: None,
            })
            .collect::<Vec<_>>();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

        let trained = !labels.is_empty();
        let model = ModelDescriptor {
            kind: if trained { ModelKind::Logistic } else { ModelKind::Baseline },
            positives: positives.len(),
            negatives: negatives.len(),
            weights: vec![FeatureWeight {
                name: "rms".into(),
                magnitude: 1.0,
            }],
            training: trained.then_some(TrainingStats {
                iterations: 25,
                loss: Some(0.1),
            }),
        };

        Ok(SearchResult {
            times: times.into(),
            scores: scores.into(),
            curve_kind: "similarity".into(),
            model,
            candidates,
            timings: Timings::default(),
            meta: serde_json::Value::Null,
        })
    }
}
