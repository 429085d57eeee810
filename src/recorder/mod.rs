use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ProfileConfig;
use crate::metrics::MetricSource;
use crate::sampler::{Sampler, SamplerConfig, DEFAULT_BACKPRESSURE_WAIT};
use crate::store::{MetricStore, NewRun};
use crate::supervisor::{ChildOutcome, Supervisor};

/// Capacity of the sampler-to-writer channel.
const CHANNEL_CAPACITY: usize = 64;

/// Terminal outcome of a profiling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The wrapped command exited on its own.
    Completed { exit_code: Option<i32> },
    /// The max-runtime deadline was hit; partial data was still persisted.
    TimedOut,
    /// The session was aborted by a fatal error elsewhere.
    Aborted,
}

/// Result of one profiling session, soft conditions included.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Run row id, when the session wrote to a store.
    pub run_id: Option<i64>,
    pub outcome: SessionOutcome,
    /// Samples handed to the writer.
    pub samples: u64,
    /// Samples dropped under backpressure.
    pub dropped_samples: u64,
    /// Soft metric query failures.
    pub query_failures: u64,
    pub duration: Duration,
}

/// Orchestrates one profiling session end to end.
///
/// Wires the supervisor, sampler, and store writer together around a single
/// cancellation token, and owns finalization of the run row.
pub struct RunRecorder {
    cfg: ProfileConfig,
}

impl RunRecorder {
    pub fn new(cfg: ProfileConfig) -> Self {
        Self { cfg }
    }

    /// Runs the session to completion and returns its report.
    ///
    /// Dry-run mode executes the same orchestration with samples routed to a
    /// counting no-op sink.
    pub async fn record(self, source: Box<dyn MetricSource>) -> Result<SessionReport> {
        let started_at = Utc::now();
        let run_start = Instant::now();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        // The run row must exist before any sample referencing it.
        let (writer_task, run_id) = if self.cfg.dry_run {
            info!("dry run: samples will not be persisted");
            (spawn_discarding_writer(rx), None)
        } else {
            let mut store = MetricStore::open(&self.cfg.output, self.cfg.mode)?;
            let run_id = store.create_run(&NewRun {
                label: self.cfg.label.clone(),
                started_at,
                sampling_ms: self.cfg.sampling.as_millis() as u64,
                max_runtime_secs: self.cfg.max_runtime.as_secs(),
                dry_run: false,
            })?;
            (
                spawn_store_writer(store, run_id, rx, cancel.clone()),
                Some(run_id),
            )
        };

        let sampler = Sampler::new(
            source,
            SamplerConfig {
                period: self.cfg.sampling,
                max_runtime: self.cfg.max_runtime,
                verbose: self.cfg.verbose,
                backpressure_wait: DEFAULT_BACKPRESSURE_WAIT,
            },
        );

        // A sampler failure is fatal for the whole session, so its wrapper
        // broadcasts cancellation before the supervisor would on child exit.
        let sampler_task = tokio::spawn({
            let session_cancel = cancel.clone();
            let sampler_cancel = cancel.clone();
            async move {
                let res = sampler.run(run_start, sampler_cancel, tx).await;
                if res.is_err() {
                    session_cancel.cancel();
                }
                res
            }
        });

        let supervisor = Supervisor::new(self.cfg.max_runtime);
        let child_res = supervisor.run(&self.cfg.argv, cancel.clone()).await;

        // Join order matters for cleanup: sampler first (drops the channel
        // sender), then the writer (drains and flushes).
        let sampler_res = sampler_task.await.context("joining sampler task")?;
        let (store, written) = writer_task.await.context("joining writer task")??;

        let duration = run_start.elapsed();
        let ended_at = Utc::now();

        let exit_code = match &child_res {
            Ok(ChildOutcome::Exited(status)) => status.code(),
            _ => None,
        };

        // Finalize even on error paths so partial data carries its terminal
        // state; fatal errors are propagated right after.
        if let (Some(mut store), Some(run_id)) = (store, run_id) {
            store.finalize_run(run_id, ended_at, exit_code)?;
            store.close()?;
        }

        let child_outcome = child_res?;
        let stats = sampler_res?;

        let outcome = match child_outcome {
            ChildOutcome::Exited(status) => {
                if !status.success() {
                    warn!(exit_code = ?status.code(), "wrapped command failed");
                }
                SessionOutcome::Completed {
                    exit_code: status.code(),
                }
            }
            ChildOutcome::TimedOut => SessionOutcome::TimedOut,
            ChildOutcome::Aborted => SessionOutcome::Aborted,
        };

        let report = SessionReport {
            run_id,
            outcome,
            samples: written,
            dropped_samples: stats.dropped_samples,
            query_failures: stats.query_failures,
            duration,
        };

        info!(
            run_id = ?report.run_id,
            outcome = ?report.outcome,
            samples = report.samples,
            dropped = report.dropped_samples,
            query_failures = report.query_failures,
            duration_secs = report.duration.as_secs_f64(),
            "profiling session finished",
        );

        Ok(report)
    }
}

/// Writer task draining the sample channel into the store.
///
/// Runs on the blocking pool: rusqlite is synchronous, and the bounded
/// channel already decouples it from the sampling loop.
fn spawn_store_writer(
    mut store: MetricStore,
    run_id: i64,
    mut rx: mpsc::Receiver<crate::metrics::SampleBatch>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<Result<(Option<MetricStore>, u64)>> {
    tokio::task::spawn_blocking(move || {
        let mut written = 0u64;

        while let Some(batch) = rx.blocking_recv() {
            written += batch.len() as u64;
            if let Err(e) = store.write_batch(run_id, &batch) {
                // Storage failure is fatal; stop the rest of the session.
                cancel.cancel();
                return Err(e);
            }
        }
        store.flush()?;

        Ok((Some(store), written))
    })
}

/// No-op writer used in dry-run mode; counts what it discards.
fn spawn_discarding_writer(
    mut rx: mpsc::Receiver<crate::metrics::SampleBatch>,
) -> tokio::task::JoinHandle<Result<(Option<MetricStore>, u64)>> {
    tokio::spawn(async move {
        let mut written = 0u64;
        while let Some(batch) = rx.recv().await {
            written += batch.len() as u64;
        }
        Ok((None, written))
    })
}
