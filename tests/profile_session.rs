use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use gpuprof::analysis::{self, OutlierPolicy};
use gpuprof::config::{ProfileConfig, Verbosity};
use gpuprof::metrics::{DeviceSnapshot, MetricName, MetricSource};
use gpuprof::recorder::{RunRecorder, SessionOutcome};
use gpuprof::store::MetricStore;

/// Two-device source with fixed per-device values, no NVML required.
struct FakeSource {
    utils: [f64; 2],
    powers: [f64; 2],
}

impl FakeSource {
    fn new() -> Self {
        Self {
            utils: [0.9, 0.4],
            powers: [250.0, 120.0],
        }
    }
}

impl MetricSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    fn device_count(&self) -> usize {
        2
    }

    fn query(&mut self) -> Result<Vec<DeviceSnapshot>> {
        Ok((0..2)
            .map(|device| DeviceSnapshot {
                device: device as u32,
                metrics: vec![
                    (MetricName::GpuUtil, self.utils[device]),
                    (MetricName::PowerUsage, self.powers[device]),
                ],
            })
            .collect())
    }
}

fn config(output: &Path, wrap: &str, max_runtime_secs: u64, sampling_ms: u64) -> ProfileConfig {
    ProfileConfig::from_args(
        vec!["sh".into(), "-c".into(), wrap.into()],
        Some("test run".into()),
        max_runtime_secs,
        sampling_ms,
        false,
        false,
        false,
        output.to_path_buf(),
        false,
    )
    .expect("valid config")
}

#[tokio::test]
async fn test_short_command_completes_and_persists() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("run.sqlite");

    let cfg = config(&output, "sleep 0.4", 10, 100);
    let report = RunRecorder::new(cfg)
        .record(Box::new(FakeSource::new()))
        .await
        .expect("session");

    match report.outcome {
        SessionOutcome::Completed { exit_code } => assert_eq!(exit_code, Some(0)),
        other => panic!("expected Completed, got {other:?}"),
    }

    // 100 ms period over a 400 ms child, 2 devices x 2 metrics per batch.
    assert!(report.samples >= 4, "samples={}", report.samples);
    assert_eq!(report.dropped_samples, 0);
    assert_eq!(report.query_failures, 0);

    let store = MetricStore::open_read(&output).expect("open store");
    let runs = store.load_runs().expect("load runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].label.as_deref(), Some("test run"));
    assert_eq!(runs[0].exit_code, Some(0));
    assert!(runs[0].ended_at.is_some());

    let samples = store.load_samples(runs[0].id).expect("load samples");
    assert_eq!(samples.len() as u64, report.samples);
}

#[tokio::test]
async fn test_deadline_times_out_long_command() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("run.sqlite");

    let cfg = config(&output, "sleep 30", 1, 100);
    let report = RunRecorder::new(cfg)
        .record(Box::new(FakeSource::new()))
        .await
        .expect("session");

    assert!(
        matches!(report.outcome, SessionOutcome::TimedOut),
        "got {:?}",
        report.outcome
    );
    assert!(
        report.duration < Duration::from_secs(5),
        "duration={:?}",
        report.duration
    );

    // The timed-out run is still finalized in the store.
    let store = MetricStore::open_read(&output).expect("open store");
    let runs = store.load_runs().expect("load runs");
    assert_eq!(runs.len(), 1);
    assert!(runs[0].ended_at.is_some());
}

#[tokio::test]
async fn test_child_failure_is_recorded_not_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("run.sqlite");

    let cfg = config(&output, "exit 7", 10, 100);
    let report = RunRecorder::new(cfg)
        .record(Box::new(FakeSource::new()))
        .await
        .expect("session");

    match report.outcome {
        SessionOutcome::Completed { exit_code } => assert_eq!(exit_code, Some(7)),
        other => panic!("expected Completed, got {other:?}"),
    }

    let store = MetricStore::open_read(&output).expect("open store");
    let runs = store.load_runs().expect("load runs");
    assert_eq!(runs[0].exit_code, Some(7));
}

#[tokio::test]
async fn test_append_accumulates_runs() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("run.sqlite");

    let first = config(&output, "sleep 0.2", 10, 100);
    RunRecorder::new(first)
        .record(Box::new(FakeSource::new()))
        .await
        .expect("first session");

    let second = ProfileConfig::from_args(
        vec!["sh".into(), "-c".into(), "sleep 0.2".into()],
        None,
        10,
        100,
        false,
        false,
        true, // append
        output.clone(),
        false,
    )
    .expect("valid config");
    RunRecorder::new(second)
        .record(Box::new(FakeSource::new()))
        .await
        .expect("second session");

    let store = MetricStore::open_read(&output).expect("open store");
    let runs = store.load_runs().expect("load runs");
    assert_eq!(runs.len(), 2);
    assert!(runs[0].id < runs[1].id);
}

#[tokio::test]
async fn test_recorded_run_analyzes_per_device() {
    let dir = TempDir::new().expect("tempdir");
    let output = dir.path().join("run.sqlite");

    let cfg = config(&output, "sleep 0.5", 10, 100);
    let report = RunRecorder::new(cfg)
        .record(Box::new(FakeSource::new()))
        .await
        .expect("session");
    let run_id = report.run_id.expect("run id");

    let store = MetricStore::open_read(&output).expect("open store");
    let samples = store.load_samples(run_id).expect("load samples");

    let analysis_report = analysis::summarize_streams(&samples, OutlierPolicy::All);
    // 2 devices x 2 metrics.
    assert_eq!(analysis_report.streams.len(), 4);

    let util0 = analysis_report
        .streams
        .iter()
        .find(|s| s.key.device == 0 && s.key.metric == MetricName::GpuUtil)
        .expect("device 0 gpu_util stream");
    assert!((util0.stats.mean - 0.9).abs() < 1e-9);

    let text = analysis::render_summary(
        &samples,
        &analysis_report,
        OutlierPolicy::All,
        Verbosity::High,
        true,
    );
    assert!(text.contains("device 0 gpu_util:"), "{text}");
    assert!(text.contains("device 1 power_watts:"), "{text}");
    assert!(text.contains("discarded:"), "{text}");
    // 0.9 vs 0.4 mean utilization across devices.
    assert!(text.contains("load imbalance"), "{text}");
}
