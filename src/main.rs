use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use gpuprof::analysis::{self, plot, Analyzer, OutlierPolicy};
use gpuprof::config::{AnalyzeConfig, ProfileConfig, Verbosity};
use gpuprof::metrics::nvml::NvmlSource;
use gpuprof::recorder::{RunRecorder, SessionOutcome};

/// GPU workload profiler and analyzer.
#[derive(Parser)]
#[command(name = "gpuprof", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a command while sampling GPU metrics into a store.
    Profile {
        /// Command to wrap, with its arguments.
        #[arg(long, num_args = 1.., value_name = "CMD", allow_hyphen_values = true, required = true)]
        wrap: Vec<String>,

        /// Free-text label stored with the run.
        #[arg(long)]
        label: Option<String>,

        /// Session deadline in seconds.
        #[arg(long, default_value_t = 600)]
        max_runtime: u64,

        /// Sampling period in milliseconds.
        #[arg(long, default_value_t = 500)]
        sampling_time: u64,

        /// Log each sample batch as it is produced.
        #[arg(long)]
        verbose: bool,

        /// Replace the output file if it already exists.
        #[arg(long)]
        force_overwrite: bool,

        /// Append the run to an existing store.
        #[arg(long)]
        append: bool,

        /// Path to the output store.
        #[arg(long, value_name = "PATH")]
        output_file: PathBuf,

        /// Run the full pipeline but write nothing to disk.
        #[arg(long)]
        dry_run: bool,
    },

    /// Analyze a previously recorded store.
    Analyze {
        /// Path to the store to analyze.
        #[arg(long, value_name = "PATH")]
        input_file: PathBuf,

        /// Skip the statistics summary.
        #[arg(long)]
        no_summary: bool,

        /// Print run metadata.
        #[arg(long)]
        show_metadata: bool,

        /// Summary detail tier.
        #[arg(long, value_enum, default_value = "medium")]
        verbosity: Verbosity,

        /// Outlier trimming policy applied before statistics.
        #[arg(long, value_enum, default_value = "none")]
        detect_outliers: OutlierPolicy,

        /// Emit advisory classification of the run.
        #[arg(long)]
        auto_diagnose: bool,

        /// Emit per-stream time-series datasets.
        #[arg(long)]
        plot_time_series: bool,

        /// Emit per-device load-balancing datasets.
        #[arg(long)]
        plot_load_balancing: bool,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        Cli::command().print_help().context("printing help")?;
        return Ok(());
    };

    if let Command::Version = command {
        println!("gpuprof {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { dispatch(command).await })
}

async fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Profile {
            wrap,
            label,
            max_runtime,
            sampling_time,
            verbose,
            force_overwrite,
            append,
            output_file,
            dry_run,
        } => {
            let cfg = ProfileConfig::from_args(
                wrap,
                label,
                max_runtime,
                sampling_time,
                verbose,
                force_overwrite,
                append,
                output_file,
                dry_run,
            )?;
            profile(cfg).await
        }
        Command::Analyze {
            input_file,
            no_summary,
            show_metadata,
            verbosity,
            detect_outliers,
            auto_diagnose,
            plot_time_series,
            plot_load_balancing,
        } => {
            let cfg = AnalyzeConfig {
                input: input_file,
                summary: !no_summary,
                show_metadata,
                verbosity,
                outlier_policy: detect_outliers,
                auto_diagnose,
                plot_time_series,
                plot_load_balancing,
            };
            analyze(cfg)
        }
        Command::Version => unreachable!("handled before runtime startup"),
    }
}

async fn profile(cfg: ProfileConfig) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        command = %cfg.argv.join(" "),
        output = %cfg.output.display(),
        dry_run = cfg.dry_run,
        "starting profiling session",
    );

    let source = NvmlSource::new().context("initializing NVML metric source")?;
    let report = RunRecorder::new(cfg).record(Box::new(source)).await?;

    match report.outcome {
        SessionOutcome::Completed { exit_code } => {
            println!(
                "session complete: exit_code={} samples={} dropped={} query_failures={} duration={:.1}s",
                exit_code.map_or_else(|| "signal".into(), |c| c.to_string()),
                report.samples,
                report.dropped_samples,
                report.query_failures,
                report.duration.as_secs_f64(),
            );
        }
        SessionOutcome::TimedOut => {
            println!(
                "session timed out: samples={} dropped={} duration={:.1}s",
                report.samples,
                report.dropped_samples,
                report.duration.as_secs_f64(),
            );
        }
        SessionOutcome::Aborted => {
            println!(
                "session aborted: samples={} duration={:.1}s",
                report.samples,
                report.duration.as_secs_f64(),
            );
        }
    }

    Ok(())
}

fn analyze(cfg: AnalyzeConfig) -> Result<()> {
    let analyzer = Analyzer::load(&cfg.input)?;

    if cfg.show_metadata {
        print!("{}", analyzer.metadata_report()?);
    }

    let runs = analyzer.runs()?;
    if runs.is_empty() {
        println!("no runs recorded in {}", cfg.input.display());
        return Ok(());
    }

    for run in &runs {
        let samples = analyzer
            .samples(run.id)
            .with_context(|| format!("loading samples for run {}", run.id))?;

        if runs.len() > 1 || cfg.show_metadata {
            println!("== run {} ==", run.id);
        }

        if samples.is_empty() {
            println!("run {} has no samples", run.id);
            continue;
        }

        if cfg.summary {
            let report = analysis::summarize_streams(&samples, cfg.outlier_policy);
            print!(
                "{}",
                analysis::render_summary(
                    &samples,
                    &report,
                    cfg.outlier_policy,
                    cfg.verbosity,
                    cfg.auto_diagnose,
                )
            );
        }

        if cfg.plot_time_series {
            print!("{}", plot::render_time_series(&plot::derive_time_series(&samples)));
        }

        if cfg.plot_load_balancing {
            print!(
                "{}",
                plot::render_load_balancing(&plot::derive_load_balancing(&samples))
            );
        }
    }

    Ok(())
}
