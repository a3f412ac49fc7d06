use anyhow::Result;
use cadence_core::{AnalysisRequest, AnalysisResult};
use cadence_engine::JobOptions;

use crate::*;

/// One second at 44.1kHz through the RMS envelope.
#[tokio::test]
async fn test_run_one_d_envelope() -> Result<()> {
    let broker = spawn_broker()?;
    let job = broker.run(flat(0.5, 1.0), AnalysisRequest::new("rms"), JobOptions::default())?;
    assert_eq!(broker.in_flight(), 1);

    let (result, elapsed) = job.wait_timed().await?;
    let AnalysisResult::OneD { times, values, meta } = result else {
        panic!("expected a 1-D result");
    };
    assert_eq!(times.len(), 100);
    assert_eq!(values.len(), times.len());
    assert!(times.as_slice().iter().all(|t| (0.0..1.0).contains(t)));
    assert!(times.as_slice().windows(2).all(|w| w[0] <= w[1]));
    assert!(values.as_slice().iter().all(|v| (v - 0.5).abs() < 1e-4));
    assert_eq!(meta["hop"], 441);
    assert!(elapsed.as_secs_f64() > 0.0, "worker duration should be reported");
    assert_eq!(broker.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn test_run_two_d_rows() -> Result<()> {
    let broker = spawn_broker()?;
    let request = AnalysisRequest::new("bands").with_options(serde_json::json!({ "hop": 4410 }));
    let result = broker.run(flat(0.25, 1.0), request, JobOptions::default())?.wait().await?;

    assert_eq!(result.shape_name(), "2d");
    assert_eq!(result.series_len(), 10);
    assert_eq!(result.times().len(), 10);
    let rows = result.rows().collect::<Vec<_>>();
    assert_eq!(rows.len(), 10);
    assert!(rows.iter().all(|row| row.len() == 4));
    Ok(())
}

#[tokio::test]
async fn test_run_events() -> Result<()> {
    let broker = spawn_broker()?;
    let audio = bursts(
        1.0,
        &[cadence_core::TimeWindow::new(0.2, 0.3), cadence_core::TimeWindow::new(0.7, 0.8)],
    );
    let request = AnalysisRequest::new("peaks").with_options(serde_json::json!({ "threshold": 0.5 }));
    let result = broker.run(audio, request, JobOptions::default())?.wait().await?;

    let AnalysisResult::Events { times, weights, .. } = result else {
        panic!("expected an event result");
    };
    assert_eq!(times.len(), weights.len());
    assert!(!times.is_empty());
    assert!(times
        .as_slice()
        .iter()
        .all(|t| (0.19..0.3).contains(t) || (0.69..0.8).contains(t)));
    Ok(())
}

/// The dispatcher reads the caller's sample buffer in place.
#[tokio::test]
async fn test_run_moves_buffer_without_copy() -> Result<()> {
    let broker = spawn_broker()?;
    let audio = flat(0.1, 0.1);
    let address = audio.buffer().as_ptr() as usize;

    let result = broker
        .run(audio, AnalysisRequest::new("address"), JobOptions::default())?
        .wait()
        .await?;
    assert_eq!(result.meta()["samples"], address);
    Ok(())
}

/// Concurrent jobs each receive their own result.
#[tokio::test]
async fn test_results_route_by_job_id() -> Result<()> {
    let broker = spawn_broker()?;
    let amplitudes = [0.1_f32, 0.2, 0.3, 0.4, 0.5];
    let jobs = amplitudes
        .iter()
        .map(|&a| broker.run(flat(a, 0.2), AnalysisRequest::new("rms"), JobOptions::default()))
        .collect::<Result<Vec<_>, _>>()?;

    let ids = jobs.iter().map(|j| j.id().clone()).collect::<std::collections::HashSet<_>>();
    assert_eq!(ids.len(), amplitudes.len());

    for (job, expected) in jobs.into_iter().zip(amplitudes) {
        let AnalysisResult::OneD { values, .. } = job.wait().await? else {
            panic!("expected a 1-D result");
        };
        assert!(values.as_slice().iter().all(|v| (v - expected).abs() < 1e-4));
    }
    assert_eq!(broker.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn test_destroy_abandons_pending_jobs() -> Result<()> {
    let broker = spawn_broker()?;
    let job = broker.run(flat(0.1, 1.0), AnalysisRequest::new("rms"), JobOptions::default())?;
    let (canceller, result, timing) = job.into_parts();

    // the demux task has not been polled yet, so the job is still pending
    let dispatcher = broker.destroy().expect("dispatcher thread handle");
    assert_eq!(result.await, Err(cadence_engine::JobError::Abandoned));
    assert_eq!(timing.await, None);
    canceller.cancel();

    let stats = tokio::task::spawn_blocking(move || dispatcher.join()).await?;
    assert!(stats.is_ok());
    Ok(())
}

/// Destroying the broker stops a job that polls for cancellation.
#[tokio::test]
async fn test_destroy_stops_running_job() -> Result<()> {
    let broker = spawn_broker()?;
    let job = broker.run(flat(0.1, 1.0), AnalysisRequest::new("sleep"), JobOptions::default())?;
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;

    let dispatcher = broker.destroy().expect("dispatcher thread handle");
    assert_eq!(job.wait().await, Err(cadence_engine::JobError::Abandoned));

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(dispatcher.join());
    });
    let stats = rx
        .recv_timeout(std::time::Duration::from_secs(2))
        .expect("dispatcher thread exits after destroy")
        .expect("dispatcher thread did not panic");
    assert_eq!(stats.suppressed, 1);
    assert_eq!(stats.completed, 0);
    Ok(())
}
