use anyhow::Result;
use cadence_core::{
    LabelStatus, LabeledWindow, ModelKind, Refinement, SearchParams, SearchTuning, TimeWindow,
};
use cadence_engine::JobOptions;

use crate::*;

fn two_bursts() -> AudioPayload {
    bursts(2.0, &[TimeWindow::new(0.2, 0.4), TimeWindow::new(1.2, 1.4)])
}

fn label(t0: f64, t1: f64, status: LabelStatus) -> LabeledWindow {
    LabeledWindow {
        t0,
        t1,
        status,
        source: "user".into(),
    }
}

#[tokio::test]
async fn test_search_baseline() -> Result<()> {
    let broker = spawn_broker()?;
    let mut params = SearchParams::new(TimeWindow::new(0.2, 0.4));
    params.tuning = Some(SearchTuning {
        hop_sec: Some(0.1),
        ..SearchTuning::default()
    });

    let (result, elapsed) = broker
        .search(two_bursts(), params, JobOptions::default())?
        .wait_timed()
        .await?;

    assert_eq!(result.times.len(), result.scores.len());
    assert!(result.scores.as_slice().iter().all(|s| (0.0..=1.0).contains(s)));
    assert_eq!(result.model.kind, ModelKind::Baseline);
    assert!(result.model.training.is_none());
    assert!(result.timings.worker_total_ms > 0.0);
    assert!(elapsed.as_secs_f64() > 0.0);

    // both bursts match the query; the first is the query itself
    let starts = result
        .candidates
        .iter()
        .map(|c| (c.window.t0 * 10.0).round() as i32)
        .collect::<Vec<_>>();
    assert!(starts.contains(&2), "{starts:?}");
    assert!(starts.contains(&12), "{starts:?}");
    assert!(result
        .candidates
        .windows(2)
        .all(|pair| pair[0].score >= pair[1].score));
    Ok(())
}

/// Refinement labels retrain the model before the scan.
#[tokio::test]
async fn test_search_with_refinement_trains_model() -> Result<()> {
    let broker = spawn_broker()?;
    let mut params = SearchParams::new(TimeWindow::new(0.2, 0.4));
    params.refinement = Some(Refinement {
        labels: vec![
            label(1.2, 1.4, LabelStatus::Accepted),
            label(0.6, 0.8, LabelStatus::Rejected),
        ],
        ..Refinement::default()
    });

    let result = broker
        .search(two_bursts(), params, JobOptions::default())?
        .wait()
        .await?;

    assert_eq!(result.model.kind, ModelKind::Logistic);
    assert!(result.model.kind.is_trained());
    let training = result.model.training.as_ref().expect("training stats");
    assert!(training.iterations > 0);
    // accepted label plus the query itself
    assert_eq!(result.model.positives, 2);
    assert_eq!(result.model.negatives, 1);
    Ok(())
}

#[tokio::test]
async fn test_disabled_refinement_is_ignored() -> Result<()> {
    let broker = spawn_broker()?;
    let mut params = SearchParams::new(TimeWindow::new(0.2, 0.4));
    params.refinement = Some(Refinement {
        enabled: false,
        include_query_as_positive: true,
        labels: vec![label(1.2, 1.4, LabelStatus::Accepted)],
    });

    let result = broker
        .search(two_bursts(), params, JobOptions::default())?
        .wait()
        .await?;
    assert_eq!(result.model.kind, ModelKind::Baseline);
    assert_eq!(result.model.positives, 1);
    Ok(())
}

/// Search and analysis jobs share the dispatcher queue without mixing results.
#[tokio::test]
async fn test_search_and_run_interleave() -> Result<()> {
    let broker = spawn_broker()?;
    let run = broker.run(
        flat(0.3, 0.5),
        cadence_core::AnalysisRequest::new("rms"),
        JobOptions::default(),
    )?;
    let search = broker.search(
        two_bursts(),
        SearchParams::new(TimeWindow::new(0.2, 0.4)),
        JobOptions::default(),
    )?;

    let searched = search.wait().await?;
    let analysed = run.wait().await?;
    assert_eq!(analysed.shape_name(), "1d");
    assert!(!searched.times.is_empty());
    Ok(())
}
