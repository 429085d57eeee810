use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::analysis::OutlierPolicy;
use crate::error::ProfError;
use crate::store::OpenMode;

/// Validated configuration for one profiling session.
#[derive(Debug, Clone)]
pub struct ProfileConfig {
    /// Wrapped command and its arguments.
    pub argv: Vec<String>,
    /// Optional free-text label stored with the run.
    pub label: Option<String>,
    /// Supervisor deadline.
    pub max_runtime: Duration,
    /// Sampling period.
    pub sampling: Duration,
    /// Emit each sample batch to the log as it is produced.
    pub verbose: bool,
    /// Output store path.
    pub output: PathBuf,
    /// How the output store is opened.
    pub mode: OpenMode,
    /// Route samples to a no-op sink instead of the store.
    pub dry_run: bool,
}

impl ProfileConfig {
    /// Builds and validates a profile configuration from CLI flags.
    #[allow(clippy::too_many_arguments)]
    pub fn from_args(
        wrap: Vec<String>,
        label: Option<String>,
        max_runtime_secs: u64,
        sampling_ms: u64,
        verbose: bool,
        force_overwrite: bool,
        append: bool,
        output: PathBuf,
        dry_run: bool,
    ) -> Result<Self> {
        if append && force_overwrite {
            return Err(ProfError::Config(
                "--append and --force-overwrite are mutually exclusive".into(),
            )
            .into());
        }

        if wrap.is_empty() {
            return Err(ProfError::Config("--wrap requires a command".into()).into());
        }

        if sampling_ms == 0 {
            return Err(ProfError::Config("--sampling-time must be > 0".into()).into());
        }

        if max_runtime_secs == 0 {
            return Err(ProfError::Config("--max-runtime must be > 0".into()).into());
        }

        let mode = if append {
            OpenMode::Append
        } else if force_overwrite {
            OpenMode::Overwrite
        } else {
            OpenMode::Create
        };

        Ok(Self {
            argv: wrap,
            label,
            max_runtime: Duration::from_secs(max_runtime_secs),
            sampling: Duration::from_millis(sampling_ms),
            verbose,
            output,
            mode,
            dry_run,
        })
    }
}

/// Verbosity tiers for the textual analysis summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Verbosity {
    /// Global per-run aggregates only.
    Low,
    /// Per-metric aggregates across devices.
    Medium,
    /// Per-metric, per-device breakdown plus discarded-sample counts.
    High,
}

/// Validated configuration for one analyze invocation.
#[derive(Debug, Clone)]
pub struct AnalyzeConfig {
    pub input: PathBuf,
    pub summary: bool,
    pub show_metadata: bool,
    pub verbosity: Verbosity,
    pub outlier_policy: OutlierPolicy,
    pub auto_diagnose: bool,
    pub plot_time_series: bool,
    pub plot_load_balancing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> (Vec<String>, PathBuf) {
        (vec!["sleep".into(), "1".into()], PathBuf::from("out.sqlite"))
    }

    #[test]
    fn test_append_and_force_overwrite_conflict() {
        let (wrap, output) = base_args();
        let err = ProfileConfig::from_args(wrap, None, 600, 500, false, true, true, output, false)
            .expect_err("conflicting flags");
        assert!(matches!(
            err.downcast_ref::<ProfError>(),
            Some(ProfError::Config(_)),
        ));
    }

    #[test]
    fn test_mode_resolution() {
        let (wrap, output) = base_args();

        let cfg = ProfileConfig::from_args(
            wrap.clone(),
            None,
            600,
            500,
            false,
            false,
            false,
            output.clone(),
            false,
        )
        .expect("valid");
        assert_eq!(cfg.mode, OpenMode::Create);

        let cfg = ProfileConfig::from_args(
            wrap.clone(),
            None,
            600,
            500,
            false,
            true,
            false,
            output.clone(),
            false,
        )
        .expect("valid");
        assert_eq!(cfg.mode, OpenMode::Overwrite);

        let cfg = ProfileConfig::from_args(wrap, None, 600, 500, false, false, true, output, false)
            .expect("valid");
        assert_eq!(cfg.mode, OpenMode::Append);
    }

    #[test]
    fn test_zero_periods_rejected() {
        let (wrap, output) = base_args();
        assert!(ProfileConfig::from_args(
            wrap.clone(),
            None,
            600,
            0,
            false,
            false,
            false,
            output.clone(),
            false,
        )
        .is_err());
        assert!(
            ProfileConfig::from_args(wrap, None, 0, 500, false, false, false, output, false)
                .is_err()
        );
    }
}
