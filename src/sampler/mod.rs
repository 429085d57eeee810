use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProfError;
use crate::metrics::{MetricSample, MetricSource, SampleBatch};

/// Consecutive source failures tolerated before the session aborts.
pub const SOURCE_FAILURE_LIMIT: u32 = 5;

/// Default bounded wait on a full sample channel before dropping a batch.
pub const DEFAULT_BACKPRESSURE_WAIT: Duration = Duration::from_millis(250);

/// Sampler timing and reporting configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Sampling period.
    pub period: Duration,
    /// Safety-net runtime guard, duplicated from the supervisor deadline.
    pub max_runtime: Duration,
    /// Emit each batch to the log as it is produced.
    pub verbose: bool,
    /// Bounded wait on a full channel before dropping the batch.
    pub backpressure_wait: Duration,
}

/// Counters accumulated over one sampling session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SamplerStats {
    /// Batches successfully handed to the writer channel.
    pub batches: u64,
    /// Samples contained in those batches.
    pub samples: u64,
    /// Samples dropped after the bounded backpressure wait expired.
    pub dropped_samples: u64,
    /// Soft source query failures (below the consecutive-failure limit).
    pub query_failures: u64,
}

/// Periodic metric sampler.
///
/// Queries the source once per tick and pushes timestamped batches onto a
/// bounded channel. Finite and not restartable: `run` consumes the sampler.
pub struct Sampler {
    source: Box<dyn MetricSource>,
    cfg: SamplerConfig,
}

impl Sampler {
    pub fn new(source: Box<dyn MetricSource>, cfg: SamplerConfig) -> Self {
        Self { source, cfg }
    }

    /// Runs the sampling loop until cancellation, the runtime guard, or a
    /// persistent source failure.
    ///
    /// The recorded offset is the actual sample time relative to `run_start`,
    /// not the nominal tick time. Stops within one tick of cancellation.
    pub async fn run(
        mut self,
        run_start: Instant,
        cancel: CancellationToken,
        tx: mpsc::Sender<SampleBatch>,
    ) -> Result<SamplerStats> {
        let mut ticker = tokio::time::interval(self.cfg.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut stats = SamplerStats::default();
        let mut consecutive_failures = 0u32;

        // One period of slack over the supervisor deadline: the supervisor
        // owns timeout enforcement, this guard only catches delayed delivery.
        let guard = self.cfg.max_runtime + self.cfg.period;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(batches = stats.batches, "sampler cancelled");
                    return Ok(stats);
                }
                _ = ticker.tick() => {
                    if run_start.elapsed() > guard {
                        warn!("sampler runtime guard hit, stopping without cancellation");
                        return Ok(stats);
                    }

                    let snapshots = match self.source.query() {
                        Ok(snapshots) => {
                            consecutive_failures = 0;
                            snapshots
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            stats.query_failures += 1;
                            warn!(
                                error = %e,
                                consecutive = consecutive_failures,
                                "metric query failed, skipping batch",
                            );

                            if consecutive_failures >= SOURCE_FAILURE_LIMIT {
                                return Err(ProfError::SourceUnavailable {
                                    consecutive: consecutive_failures,
                                    last: e.to_string(),
                                }
                                .into());
                            }
                            continue;
                        }
                    };

                    let offset = run_start.elapsed();
                    let mut batch = SampleBatch::default();
                    for snapshot in snapshots {
                        if self.cfg.verbose {
                            info!(
                                device = snapshot.device,
                                offset_ms = offset.as_millis() as u64,
                                metrics = ?snapshot.metrics,
                                "sample",
                            );
                        }
                        for (metric, value) in snapshot.metrics {
                            batch.samples.push(MetricSample {
                                device: snapshot.device,
                                metric,
                                value,
                                offset,
                            });
                        }
                    }

                    if batch.is_empty() {
                        continue;
                    }

                    let batch_len = batch.len() as u64;
                    match tx.send_timeout(batch, self.cfg.backpressure_wait).await {
                        Ok(()) => {
                            stats.batches += 1;
                            stats.samples += batch_len;
                        }
                        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                            stats.dropped_samples += batch_len;
                            warn!(
                                dropped = batch_len,
                                "sample channel full past bounded wait, dropping batch",
                            );
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                            // Writer went away; nothing left to sample for.
                            debug!("sample channel closed, stopping sampler");
                            return Ok(stats);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::metrics::{DeviceSnapshot, MetricName};

    /// Source reporting a fixed value for one device, optionally failing.
    struct FakeSource {
        value: f64,
        fail: bool,
    }

    impl MetricSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        fn device_count(&self) -> usize {
            1
        }

        fn query(&mut self) -> Result<Vec<DeviceSnapshot>> {
            if self.fail {
                bail!("synthetic failure");
            }
            Ok(vec![DeviceSnapshot {
                device: 0,
                metrics: vec![(MetricName::GpuUtil, self.value)],
            }])
        }
    }

    fn test_cfg(period_ms: u64) -> SamplerConfig {
        SamplerConfig {
            period: Duration::from_millis(period_ms),
            max_runtime: Duration::from_secs(10),
            verbose: false,
            backpressure_wait: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_sampler_stops_within_one_tick_of_cancel() {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let sampler = Sampler::new(
            Box::new(FakeSource {
                value: 0.5,
                fail: false,
            }),
            test_cfg(20),
        );

        let task = tokio::spawn(sampler.run(Instant::now(), cancel.clone(), tx));

        tokio::time::sleep(Duration::from_millis(110)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("sampler stopped within one tick")
            .expect("task join")
            .expect("sampler result");

        // ~5 ticks in 110ms at 20ms period, plus the immediate first tick.
        assert!(stats.batches >= 2, "batches={}", stats.batches);
        assert_eq!(stats.samples, stats.batches);
        assert_eq!(stats.dropped_samples, 0);

        // Drain and verify monotonic offsets.
        let mut last = Duration::ZERO;
        while let Ok(batch) = rx.try_recv() {
            for sample in &batch.samples {
                assert!(sample.offset >= last);
                last = sample.offset;
            }
        }
    }

    #[tokio::test]
    async fn test_sampler_aborts_after_consecutive_failures() {
        let (tx, _rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let sampler = Sampler::new(
            Box::new(FakeSource {
                value: 0.0,
                fail: true,
            }),
            test_cfg(5),
        );

        let err = sampler
            .run(Instant::now(), cancel, tx)
            .await
            .expect_err("persistent failures abort the sampler");

        let prof = err
            .downcast_ref::<ProfError>()
            .expect("typed error kind");
        assert!(matches!(
            prof,
            ProfError::SourceUnavailable {
                consecutive: SOURCE_FAILURE_LIMIT,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_sampler_drops_batches_under_backpressure() {
        // Capacity 1 and no consumer: after the first batch fills the
        // channel, every later batch waits out the bound and is dropped.
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let sampler = Sampler::new(
            Box::new(FakeSource {
                value: 1.0,
                fail: false,
            }),
            test_cfg(10),
        );

        let cancel2 = cancel.clone();
        let task = tokio::spawn(sampler.run(Instant::now(), cancel2, tx));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();

        let stats = task.await.expect("join").expect("sampler result");
        assert_eq!(stats.batches, 1);
        assert!(stats.dropped_samples > 0, "stats={stats:?}");
    }
}
