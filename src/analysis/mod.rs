pub mod outlier;
pub mod plot;
pub mod stats;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use rayon::prelude::*;
use tracing::debug;

pub use outlier::OutlierPolicy;
pub use stats::SummaryStats;

use crate::config::Verbosity;
use crate::metrics::{MetricName, MetricSample};
use crate::store::{MetricStore, RunRow};

use self::outlier::trim;
use self::stats::summarize;

/// Mean-utilization spread across devices above which the run is flagged as
/// load-imbalanced.
const IMBALANCE_SPREAD: f64 = 0.25;

/// Mean utilization below which the run is flagged as underutilized.
const LOW_UTILIZATION_FLOOR: f64 = 0.3;

/// Identity of one sample stream: a (device, metric) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamKey {
    pub device: u32,
    pub metric: MetricName,
}

/// One stream's samples in insertion (time) order.
#[derive(Debug, Clone)]
pub struct MetricStream {
    pub key: StreamKey,
    pub values: Vec<f64>,
    /// Offsets from run start, seconds, parallel to `values`.
    pub offsets_secs: Vec<f64>,
}

/// Statistics for one stream after outlier filtering.
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub key: StreamKey,
    pub stats: SummaryStats,
    /// Samples discarded by the outlier policy.
    pub discarded: usize,
    /// The heuristic declined to trim because it would empty the stream.
    pub trim_declined: bool,
}

/// Outcome of one `summarize` call over a run's samples.
#[derive(Debug, Clone)]
pub struct AnalysisReport {
    pub streams: Vec<StreamSummary>,
    /// Soft conditions encountered during analysis.
    pub notes: Vec<String>,
}

/// Groups samples into per-(device, metric) streams in stable
/// device-then-metric order, preserving sample order within each stream.
pub fn group_streams(samples: &[MetricSample]) -> Vec<MetricStream> {
    let mut streams: BTreeMap<StreamKey, MetricStream> = BTreeMap::new();

    for sample in samples {
        let key = StreamKey {
            device: sample.device,
            metric: sample.metric,
        };
        let stream = streams.entry(key).or_insert_with(|| MetricStream {
            key,
            values: Vec::new(),
            offsets_secs: Vec::new(),
        });
        stream.values.push(sample.value);
        stream.offsets_secs.push(sample.offset.as_secs_f64());
    }

    streams.into_values().collect()
}

/// Read-only analysis over a completed store.
pub struct Analyzer {
    store: MetricStore,
}

impl Analyzer {
    /// Opens a stored run file for analysis.
    pub fn load(path: &Path) -> Result<Self> {
        let store = MetricStore::open_read(path)
            .with_context(|| format!("loading metrics from {}", path.display()))?;
        Ok(Self { store })
    }

    /// All runs recorded in the store, in insertion order.
    pub fn runs(&self) -> Result<Vec<RunRow>> {
        self.store.load_runs()
    }

    /// All samples for one run, in original insertion order.
    pub fn samples(&self, run_id: i64) -> Result<Vec<MetricSample>> {
        self.store.load_samples(run_id)
    }

    /// Renders the run metadata of the whole store.
    pub fn metadata_report(&self) -> Result<String> {
        let runs = self.runs()?;

        let mut out = String::new();
        writeln!(out, "runs: {}", runs.len()).expect("write to string");
        for run in &runs {
            writeln!(
                out,
                "  run {}: label={} started={} ended={} exit_code={} sampling={}ms max_runtime={}s dry_run={}",
                run.id,
                run.label.as_deref().unwrap_or("-"),
                run.started_at.to_rfc3339(),
                run.ended_at.map_or_else(|| "-".into(), |t| t.to_rfc3339()),
                run.exit_code.map_or_else(|| "-".into(), |c| c.to_string()),
                run.sampling_ms,
                run.max_runtime_secs,
                run.dry_run,
            )
            .expect("write to string");
        }

        Ok(out)
    }
}

/// Computes per-stream summaries with the given outlier policy applied.
///
/// Streams are independent; they are processed in parallel and assembled in
/// stable device-then-metric order.
pub fn summarize_streams(samples: &[MetricSample], policy: OutlierPolicy) -> AnalysisReport {
    let streams = group_streams(samples);

    let summaries: Vec<Option<StreamSummary>> = streams
        .par_iter()
        .map(|stream| {
            let result = trim(&stream.values, policy);
            let retained = &stream.values[result.start..result.end];
            let stats = summarize(retained)?;

            Some(StreamSummary {
                key: stream.key,
                stats,
                discarded: result.discarded(stream.values.len()),
                trim_declined: result.declined,
            })
        })
        .collect();

    let mut notes = Vec::new();
    let streams: Vec<StreamSummary> = summaries.into_iter().flatten().collect();

    for summary in &streams {
        if summary.trim_declined {
            notes.push(format!(
                "outlier policy would empty stream device={} metric={}, kept full sequence",
                summary.key.device, summary.key.metric,
            ));
        }
    }

    debug!(streams = streams.len(), notes = notes.len(), "streams summarized");

    AnalysisReport { streams, notes }
}

/// Renders the textual summary at the requested verbosity tier.
pub fn render_summary(
    samples: &[MetricSample],
    report: &AnalysisReport,
    policy: OutlierPolicy,
    verbosity: Verbosity,
    auto_diagnose: bool,
) -> String {
    let mut out = String::new();

    match verbosity {
        Verbosity::Low => render_low(&mut out, report),
        Verbosity::Medium => render_medium(&mut out, samples, policy),
        Verbosity::High => render_high(&mut out, report, policy),
    }

    for note in &report.notes {
        writeln!(out, "note: {note}").expect("write to string");
    }

    if auto_diagnose {
        for line in diagnose(report) {
            writeln!(out, "diagnosis: {line}").expect("write to string");
        }
    }

    out
}

fn render_low(out: &mut String, report: &AnalysisReport) {
    let devices: std::collections::BTreeSet<u32> =
        report.streams.iter().map(|s| s.key.device).collect();
    let total_samples: usize = report.streams.iter().map(|s| s.stats.count).sum();
    let util_means: Vec<f64> = report
        .streams
        .iter()
        .filter(|s| s.key.metric == MetricName::GpuUtil)
        .map(|s| s.stats.mean)
        .collect();

    writeln!(
        out,
        "devices={} streams={} samples={}",
        devices.len(),
        report.streams.len(),
        total_samples,
    )
    .expect("write to string");

    if !util_means.is_empty() {
        let mean = util_means.iter().sum::<f64>() / util_means.len() as f64;
        writeln!(out, "mean gpu_util: {:.1}%", mean * 100.0).expect("write to string");
    }
}

fn render_medium(out: &mut String, samples: &[MetricSample], policy: OutlierPolicy) {
    // Per-metric aggregates across devices: streams are trimmed per device,
    // then their retained values are merged before computing statistics.
    let streams = group_streams(samples);
    let mut merged: BTreeMap<MetricName, Vec<f64>> = BTreeMap::new();

    for stream in &streams {
        let result = trim(&stream.values, policy);
        merged
            .entry(stream.key.metric)
            .or_default()
            .extend_from_slice(&stream.values[result.start..result.end]);
    }

    for (metric, values) in &merged {
        if let Some(stats) = summarize(values) {
            writeln!(
                out,
                "{metric}: count={} mean={:.3} min={:.3} max={:.3} p50={:.3} p95={:.3}",
                stats.count, stats.mean, stats.min, stats.max, stats.p50, stats.p95,
            )
            .expect("write to string");
        }
    }
}

fn render_high(out: &mut String, report: &AnalysisReport, policy: OutlierPolicy) {
    for summary in &report.streams {
        writeln!(
            out,
            "device {} {}: count={} mean={:.3} min={:.3} max={:.3} p5={:.3} p50={:.3} p95={:.3} std={:.3}",
            summary.key.device,
            summary.key.metric,
            summary.stats.count,
            summary.stats.mean,
            summary.stats.min,
            summary.stats.max,
            summary.stats.p5,
            summary.stats.p50,
            summary.stats.p95,
            summary.stats.std_dev,
        )
        .expect("write to string");

        if policy != OutlierPolicy::None {
            writeln!(out, "  discarded: {}", summary.discarded).expect("write to string");
        }
    }
}

/// Advisory classification of the run; never blocks summary generation.
fn diagnose(report: &AnalysisReport) -> Vec<String> {
    let mut lines = Vec::new();

    let util_by_device: Vec<(u32, f64)> = report
        .streams
        .iter()
        .filter(|s| s.key.metric == MetricName::GpuUtil)
        .map(|s| (s.key.device, s.stats.mean))
        .collect();

    if util_by_device.is_empty() {
        return lines;
    }

    let min = util_by_device
        .iter()
        .map(|(_, m)| *m)
        .fold(f64::INFINITY, f64::min);
    let max = util_by_device
        .iter()
        .map(|(_, m)| *m)
        .fold(f64::NEG_INFINITY, f64::max);

    if util_by_device.len() > 1 && max - min > IMBALANCE_SPREAD {
        lines.push(format!(
            "severe load imbalance: gpu_util spread {:.0}% across {} devices (min {:.0}%, max {:.0}%)",
            (max - min) * 100.0,
            util_by_device.len(),
            min * 100.0,
            max * 100.0,
        ));
    }

    let mean = util_by_device.iter().map(|(_, m)| *m).sum::<f64>() / util_by_device.len() as f64;
    if mean < LOW_UTILIZATION_FLOOR {
        lines.push(format!(
            "low utilization: mean gpu_util {:.0}% is below {:.0}%",
            mean * 100.0,
            LOW_UTILIZATION_FLOOR * 100.0,
        ));
    }

    lines
}
