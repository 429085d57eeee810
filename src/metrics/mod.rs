pub mod nvml;

use std::time::Duration;

use anyhow::Result;

/// Metric families collected per device on every sampling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricName {
    /// Compute utilization as a fraction in [0, 1].
    GpuUtil,
    /// Memory bandwidth utilization as a fraction in [0, 1].
    MemUtil,
    /// Device memory in use, bytes.
    MemUsed,
    /// Total device memory, bytes.
    MemTotal,
    /// Board power draw, watts.
    PowerUsage,
    /// Core temperature, degrees Celsius.
    Temperature,
    /// Graphics clock, MHz.
    SmClock,
    /// Memory clock, MHz.
    MemClock,
}

/// All metric names in canonical (stable) order.
pub const ALL_METRIC_NAMES: &[MetricName] = &[
    MetricName::GpuUtil,
    MetricName::MemUtil,
    MetricName::MemUsed,
    MetricName::MemTotal,
    MetricName::PowerUsage,
    MetricName::Temperature,
    MetricName::SmClock,
    MetricName::MemClock,
];

impl MetricName {
    /// Returns the canonical string label used in the store and in reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GpuUtil => "gpu_util",
            Self::MemUtil => "mem_util",
            Self::MemUsed => "mem_used_bytes",
            Self::MemTotal => "mem_total_bytes",
            Self::PowerUsage => "power_watts",
            Self::Temperature => "temperature_c",
            Self::SmClock => "sm_clock_mhz",
            Self::MemClock => "mem_clock_mhz",
        }
    }

    /// Parses a canonical label back into a metric name.
    pub fn from_str(s: &str) -> Option<Self> {
        ALL_METRIC_NAMES.iter().copied().find(|m| m.as_str() == s)
    }
}

impl std::fmt::Display for MetricName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (device, metric, value) observation at a known offset from run start.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    /// Device index as reported by the metric source.
    pub device: u32,
    /// Metric family.
    pub metric: MetricName,
    /// Observed value.
    pub value: f64,
    /// Offset from run start at the actual sample time.
    pub offset: Duration,
}

/// All samples produced by a single sampling tick.
#[derive(Debug, Clone, Default)]
pub struct SampleBatch {
    pub samples: Vec<MetricSample>,
}

impl SampleBatch {
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Point-in-time metrics for one device.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub device: u32,
    pub metrics: Vec<(MetricName, f64)>,
}

/// Synchronous hardware metrics provider queried once per sampling tick.
///
/// Implementations may fail transiently; the sampler treats individual
/// failures as soft errors until they become consecutive and persistent.
pub trait MetricSource: Send {
    /// Returns the source's name for logging.
    fn name(&self) -> &str;

    /// Number of devices this source reports on.
    fn device_count(&self) -> usize;

    /// Queries all devices for a snapshot of current metric values.
    fn query(&mut self) -> Result<Vec<DeviceSnapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_label_round_trip() {
        for metric in ALL_METRIC_NAMES {
            let parsed = MetricName::from_str(metric.as_str());
            assert_eq!(parsed, Some(*metric));
        }
    }

    #[test]
    fn test_metric_name_unknown_label() {
        assert_eq!(MetricName::from_str("fan_rpm"), None);
    }
}
