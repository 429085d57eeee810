//! Plot dataset derivation.
//!
//! Rendering is textual: each dataset is emitted as labelled columns a plotting
//! tool can consume directly. Deriving the series is separated from rendering
//! so both stay testable without a display backend.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::metrics::{MetricName, MetricSample};

use super::{group_streams, StreamKey};

/// One stream's time series: (seconds from run start, value) pairs.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    pub key: StreamKey,
    pub points: Vec<(f64, f64)>,
}

/// Per-device mean of one metric, for cross-device comparison.
#[derive(Debug, Clone)]
pub struct LoadBalancingSeries {
    pub metric: MetricName,
    /// (device, mean) in ascending device order.
    pub devices: Vec<(u32, f64)>,
}

/// Derives one time series per (device, metric) stream, in stable order.
pub fn derive_time_series(samples: &[MetricSample]) -> Vec<TimeSeries> {
    group_streams(samples)
        .into_iter()
        .map(|stream| TimeSeries {
            key: stream.key,
            points: stream
                .offsets_secs
                .iter()
                .copied()
                .zip(stream.values.iter().copied())
                .collect(),
        })
        .collect()
}

/// Derives per-device means for each metric present in the samples.
pub fn derive_load_balancing(samples: &[MetricSample]) -> Vec<LoadBalancingSeries> {
    let mut per_metric: BTreeMap<MetricName, BTreeMap<u32, (f64, usize)>> = BTreeMap::new();

    for sample in samples {
        let (sum, count) = per_metric
            .entry(sample.metric)
            .or_default()
            .entry(sample.device)
            .or_insert((0.0, 0));
        *sum += sample.value;
        *count += 1;
    }

    per_metric
        .into_iter()
        .map(|(metric, devices)| LoadBalancingSeries {
            metric,
            devices: devices
                .into_iter()
                .map(|(device, (sum, count))| (device, sum / count as f64))
                .collect(),
        })
        .collect()
}

/// Renders time series as one labelled column block per stream.
pub fn render_time_series(series: &[TimeSeries]) -> String {
    let mut out = String::new();

    for ts in series {
        writeln!(out, "# device {} {}", ts.key.device, ts.key.metric).expect("write to string");
        for (secs, value) in &ts.points {
            writeln!(out, "{secs:.3} {value:.6}").expect("write to string");
        }
    }

    out
}

/// Renders load-balancing series as one labelled column block per metric.
pub fn render_load_balancing(series: &[LoadBalancingSeries]) -> String {
    let mut out = String::new();

    for lb in series {
        writeln!(out, "# {}", lb.metric).expect("write to string");
        for (device, mean) in &lb.devices {
            writeln!(out, "{device} {mean:.6}").expect("write to string");
        }
    }

    out
}
