use std::path::PathBuf;

use thiserror::Error;

/// Fatal error taxonomy for profiling and analysis operations.
///
/// Soft conditions (sub-threshold query failures, backpressure drops, outlier
/// heuristics declining to trim) are not represented here; they are aggregated
/// into the session or analysis report instead.
#[derive(Debug, Error)]
pub enum ProfError {
    /// Invalid flag combination or configuration value. The session never starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The hardware metrics source failed persistently.
    #[error("metric source unavailable after {consecutive} consecutive failures: {last}")]
    SourceUnavailable { consecutive: u32, last: String },

    /// Append was requested onto a store whose schema does not match.
    #[error("schema mismatch in {path}: {detail}")]
    SchemaMismatch { path: PathBuf, detail: String },

    /// The persistent store is unreachable or unwritable.
    #[error("store I/O failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

impl ProfError {
    /// Wraps a rusqlite error with the store path it occurred against.
    pub fn io(path: impl Into<PathBuf>, source: rusqlite::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
