use anyhow::{Context, Result};
use nvml_wrapper::enum_wrappers::device::{Clock, TemperatureSensor};
use nvml_wrapper::Nvml;

use super::{DeviceSnapshot, MetricName, MetricSource};

/// GPU metrics provider backed by NVML (NVIDIA Management Library).
///
/// The device handle is re-fetched by index on every query, so a transient
/// driver hiccup on one tick does not poison the source.
pub struct NvmlSource {
    nvml: Nvml,
    device_count: u32,
}

impl NvmlSource {
    /// Initializes NVML and enumerates the available devices.
    pub fn new() -> Result<Self> {
        let nvml = Nvml::init().context("initializing NVML")?;
        let device_count = nvml.device_count().context("enumerating GPU devices")?;

        tracing::info!(devices = device_count, "NVML metric source initialized");

        Ok(Self { nvml, device_count })
    }
}

impl MetricSource for NvmlSource {
    fn name(&self) -> &str {
        "nvml"
    }

    fn device_count(&self) -> usize {
        self.device_count as usize
    }

    fn query(&mut self) -> Result<Vec<DeviceSnapshot>> {
        let mut snapshots = Vec::with_capacity(self.device_count as usize);

        for index in 0..self.device_count {
            let device = self
                .nvml
                .device_by_index(index)
                .with_context(|| format!("getting NVML handle for device {index}"))?;

            let util = device
                .utilization_rates()
                .with_context(|| format!("querying utilization for device {index}"))?;
            let memory = device
                .memory_info()
                .with_context(|| format!("querying memory info for device {index}"))?;
            let temperature = device
                .temperature(TemperatureSensor::Gpu)
                .with_context(|| format!("querying temperature for device {index}"))?;
            let power_mw = device
                .power_usage()
                .with_context(|| format!("querying power usage for device {index}"))?;
            let sm_clock = device
                .clock_info(Clock::Graphics)
                .with_context(|| format!("querying graphics clock for device {index}"))?;
            let mem_clock = device
                .clock_info(Clock::Memory)
                .with_context(|| format!("querying memory clock for device {index}"))?;

            // NVML reports utilization as integer percent; normalize to a
            // fraction so all utilization metrics share the same scale.
            snapshots.push(DeviceSnapshot {
                device: index,
                metrics: vec![
                    (MetricName::GpuUtil, f64::from(util.gpu) / 100.0),
                    (MetricName::MemUtil, f64::from(util.memory) / 100.0),
                    (MetricName::MemUsed, memory.used as f64),
                    (MetricName::MemTotal, memory.total as f64),
                    (MetricName::PowerUsage, f64::from(power_mw) / 1000.0),
                    (MetricName::Temperature, f64::from(temperature)),
                    (MetricName::SmClock, f64::from(sm_clock)),
                    (MetricName::MemClock, f64::from(mem_clock)),
                ],
            });
        }

        Ok(snapshots)
    }
}
