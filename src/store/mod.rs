use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::error::ProfError;
use crate::metrics::{MetricName, MetricSample, SampleBatch};

/// Samples buffered before a transactional flush to disk.
pub const BATCH_FLUSH_THRESHOLD: usize = 512;

/// How an output store is opened for writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if the file already exists.
    Create,
    /// Destroy any existing file and recreate the schema.
    Overwrite,
    /// Add runs to an existing store; the schema must match exactly.
    Append,
}

/// Expected declared schema, used to validate append-mode compatibility.
const EXPECTED_SCHEMA: &[(&str, &[(&str, &str)])] = &[
    (
        "runs",
        &[
            ("id", "INTEGER"),
            ("label", "TEXT"),
            ("started_at", "TEXT"),
            ("ended_at", "TEXT"),
            ("exit_code", "INTEGER"),
            ("sampling_ms", "INTEGER"),
            ("max_runtime_secs", "INTEGER"),
            ("dry_run", "INTEGER"),
        ],
    ),
    (
        "samples",
        &[
            ("run_id", "INTEGER"),
            ("device", "INTEGER"),
            ("metric", "TEXT"),
            ("value", "REAL"),
            ("offset_ms", "INTEGER"),
        ],
    ),
];

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    label TEXT,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    exit_code INTEGER,
    sampling_ms INTEGER NOT NULL,
    max_runtime_secs INTEGER NOT NULL,
    dry_run INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE samples (
    run_id INTEGER NOT NULL REFERENCES runs(id),
    device INTEGER NOT NULL,
    metric TEXT NOT NULL,
    value REAL NOT NULL,
    offset_ms INTEGER NOT NULL
);
CREATE INDEX samples_by_run ON samples (run_id, device, metric);
";

/// Parameters for a run row created at session start.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub sampling_ms: u64,
    pub max_runtime_secs: u64,
    pub dry_run: bool,
}

/// One row of the `runs` table.
#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub label: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub sampling_ms: u64,
    pub max_runtime_secs: u64,
    pub dry_run: bool,
}

#[derive(Debug)]
struct PendingSample {
    run_id: i64,
    device: u32,
    metric: &'static str,
    value: f64,
    offset_ms: i64,
}

/// File-backed relational store for runs and their samples.
///
/// Writes are buffered and flushed in one transaction when
/// [`BATCH_FLUSH_THRESHOLD`] is reached or at session end, so the sampling
/// loop never pays per-sample I/O latency.
#[derive(Debug)]
pub struct MetricStore {
    conn: Connection,
    path: PathBuf,
    pending: Vec<PendingSample>,
}

impl MetricStore {
    /// Opens a store for writing in the given mode.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let exists = path.exists();

        match mode {
            OpenMode::Create if exists => {
                return Err(ProfError::Config(format!(
                    "output file {} already exists (use --force-overwrite or --append)",
                    path.display(),
                ))
                .into());
            }
            OpenMode::Overwrite if exists => {
                std::fs::remove_file(path)
                    .with_context(|| format!("removing existing store {}", path.display()))?;
            }
            _ => {}
        }

        let fresh = !path.exists();
        let conn = Connection::open(path).map_err(|e| ProfError::io(path, e))?;

        let store = if fresh {
            conn.execute_batch(CREATE_SCHEMA_SQL)
                .map_err(|e| ProfError::io(path, e))?;
            debug!(path = %path.display(), "created store schema");
            Self {
                conn,
                path: path.to_path_buf(),
                pending: Vec::with_capacity(BATCH_FLUSH_THRESHOLD),
            }
        } else {
            // Append onto an existing file: validate before touching anything.
            validate_schema(&conn, path)?;
            Self {
                conn,
                path: path.to_path_buf(),
                pending: Vec::with_capacity(BATCH_FLUSH_THRESHOLD),
            }
        };

        info!(path = %path.display(), ?mode, "metric store opened");

        Ok(store)
    }

    /// Opens an existing store read-only for analysis.
    pub fn open_read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ProfError::Config(format!(
                "input file {} does not exist",
                path.display(),
            ))
            .into());
        }

        let conn = Connection::open(path).map_err(|e| ProfError::io(path, e))?;
        validate_schema(&conn, path)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            pending: Vec::new(),
        })
    }

    /// Inserts the parent run row and returns its id.
    pub fn create_run(&mut self, run: &NewRun) -> Result<i64> {
        self.conn
            .execute(
                "INSERT INTO runs (label, started_at, sampling_ms, max_runtime_secs, dry_run)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run.label,
                    run.started_at.to_rfc3339(),
                    run.sampling_ms as i64,
                    run.max_runtime_secs as i64,
                    run.dry_run,
                ],
            )
            .map_err(|e| ProfError::io(&self.path, e))?;

        Ok(self.conn.last_insert_rowid())
    }

    /// Buffers a batch of samples for the given run, flushing when the
    /// threshold is reached.
    pub fn write_batch(&mut self, run_id: i64, batch: &SampleBatch) -> Result<()> {
        for sample in &batch.samples {
            self.pending.push(PendingSample {
                run_id,
                device: sample.device,
                metric: sample.metric.as_str(),
                value: sample.value,
                offset_ms: sample.offset.as_millis() as i64,
            });
        }

        if self.pending.len() >= BATCH_FLUSH_THRESHOLD {
            self.flush()?;
        }

        Ok(())
    }

    /// Writes all buffered samples in a single transaction.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let tx = self
            .conn
            .transaction()
            .map_err(|e| ProfError::io(&self.path, e))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO samples (run_id, device, metric, value, offset_ms)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .map_err(|e| ProfError::io(&self.path, e))?;

            for sample in &self.pending {
                stmt.execute(params![
                    sample.run_id,
                    sample.device,
                    sample.metric,
                    sample.value,
                    sample.offset_ms,
                ])
                .map_err(|e| ProfError::io(&self.path, e))?;
            }
        }
        tx.commit().map_err(|e| ProfError::io(&self.path, e))?;

        debug!(samples = self.pending.len(), "flushed sample batch");
        self.pending.clear();

        Ok(())
    }

    /// Records the terminal state of a run.
    pub fn finalize_run(
        &mut self,
        run_id: i64,
        ended_at: DateTime<Utc>,
        exit_code: Option<i32>,
    ) -> Result<()> {
        self.flush()?;

        self.conn
            .execute(
                "UPDATE runs SET ended_at = ?2, exit_code = ?3 WHERE id = ?1",
                params![run_id, ended_at.to_rfc3339(), exit_code],
            )
            .map_err(|e| ProfError::io(&self.path, e))?;

        Ok(())
    }

    /// Flushes and closes the store.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    /// Returns all runs in insertion order.
    pub fn load_runs(&self) -> Result<Vec<RunRow>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, label, started_at, ended_at, exit_code,
                        sampling_ms, max_runtime_secs, dry_run
                 FROM runs ORDER BY id",
            )
            .map_err(|e| ProfError::io(&self.path, e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(RunRow {
                    id: row.get(0)?,
                    label: row.get(1)?,
                    started_at: parse_timestamp(row.get::<_, String>(2)?.as_str()),
                    ended_at: row
                        .get::<_, Option<String>>(3)?
                        .map(|s| parse_timestamp(&s)),
                    exit_code: row.get(4)?,
                    sampling_ms: row.get::<_, i64>(5)? as u64,
                    max_runtime_secs: row.get::<_, i64>(6)? as u64,
                    dry_run: row.get(7)?,
                })
            })
            .map_err(|e| ProfError::io(&self.path, e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| ProfError::io(&self.path, e))?;

        Ok(rows)
    }

    /// Returns all samples for a run in original insertion order.
    pub fn load_samples(&self, run_id: i64) -> Result<Vec<MetricSample>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT device, metric, value, offset_ms
                 FROM samples WHERE run_id = ?1 ORDER BY rowid",
            )
            .map_err(|e| ProfError::io(&self.path, e))?;

        let mut samples = Vec::new();
        let mut rows = stmt
            .query(params![run_id])
            .map_err(|e| ProfError::io(&self.path, e))?;

        while let Some(row) = rows.next().map_err(|e| ProfError::io(&self.path, e))? {
            let metric_label: String = row.get(1).map_err(|e| ProfError::io(&self.path, e))?;
            let Some(metric) = MetricName::from_str(&metric_label) else {
                // Unknown metric label written by a newer build; skip it
                // instead of failing the whole load.
                continue;
            };

            samples.push(MetricSample {
                device: row.get::<_, i64>(0).map_err(|e| ProfError::io(&self.path, e))? as u32,
                metric,
                value: row.get(2).map_err(|e| ProfError::io(&self.path, e))?,
                offset: Duration::from_millis(
                    row.get::<_, i64>(3).map_err(|e| ProfError::io(&self.path, e))? as u64,
                ),
            });
        }

        Ok(samples)
    }

    /// Path this store is backed by.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parses an RFC 3339 timestamp, falling back to the epoch on corruption.
fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Validates that the store's declared schema matches what this build writes.
fn validate_schema(conn: &Connection, path: &Path) -> Result<()> {
    for (table, expected_columns) in EXPECTED_SCHEMA {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(|e| ProfError::io(path, e))?;

        let actual: Vec<(String, String)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?.to_uppercase(),
                ))
            })
            .map_err(|e| ProfError::io(path, e))?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| ProfError::io(path, e))?;

        if actual.is_empty() {
            return Err(ProfError::SchemaMismatch {
                path: path.to_path_buf(),
                detail: format!("missing table {table}"),
            }
            .into());
        }

        let expected: Vec<(String, String)> = expected_columns
            .iter()
            .map(|(name, ty)| ((*name).to_string(), (*ty).to_string()))
            .collect();

        if actual != expected {
            return Err(ProfError::SchemaMismatch {
                path: path.to_path_buf(),
                detail: format!("table {table} has columns {actual:?}, expected {expected:?}"),
            }
            .into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricName;

    fn new_run() -> NewRun {
        NewRun {
            label: Some("test".into()),
            started_at: Utc::now(),
            sampling_ms: 500,
            max_runtime_secs: 600,
            dry_run: false,
        }
    }

    fn sample(device: u32, metric: MetricName, value: f64, offset_ms: u64) -> MetricSample {
        MetricSample {
            device,
            metric,
            value,
            offset: Duration::from_millis(offset_ms),
        }
    }

    #[test]
    fn test_create_fails_if_exists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.sqlite");
        std::fs::write(&path, b"occupied").expect("seed file");

        let err = MetricStore::open(&path, OpenMode::Create).expect_err("create must fail");
        assert!(matches!(
            err.downcast_ref::<ProfError>(),
            Some(ProfError::Config(_)),
        ));
    }

    #[test]
    fn test_overwrite_replaces_existing_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.sqlite");

        let mut store = MetricStore::open(&path, OpenMode::Create).expect("create");
        store.create_run(&new_run()).expect("run");
        store.close().expect("close");

        let store = MetricStore::open(&path, OpenMode::Overwrite).expect("overwrite");
        assert!(store.load_runs().expect("runs").is_empty());
    }

    #[test]
    fn test_round_trip_preserves_order_and_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.sqlite");

        let mut store = MetricStore::open(&path, OpenMode::Create).expect("create");
        let run_id = store.create_run(&new_run()).expect("run");

        let written: Vec<MetricSample> = (0..100u32)
            .flat_map(|i| {
                vec![
                    sample(0, MetricName::GpuUtil, f64::from(i) / 100.0, u64::from(i) * 500),
                    sample(1, MetricName::PowerUsage, 150.0 + f64::from(i), u64::from(i) * 500),
                ]
            })
            .collect();

        for chunk in written.chunks(16) {
            store
                .write_batch(
                    run_id,
                    &SampleBatch {
                        samples: chunk.to_vec(),
                    },
                )
                .expect("write");
        }
        store
            .finalize_run(run_id, Utc::now(), Some(0))
            .expect("finalize");

        let loaded = store.load_samples(run_id).expect("load");
        assert_eq!(loaded, written);
    }

    #[test]
    fn test_flush_threshold_persists_midway() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.sqlite");

        let mut store = MetricStore::open(&path, OpenMode::Create).expect("create");
        let run_id = store.create_run(&new_run()).expect("run");

        let batch = SampleBatch {
            samples: (0..BATCH_FLUSH_THRESHOLD as u64)
                .map(|i| sample(0, MetricName::GpuUtil, 0.5, i))
                .collect(),
        };
        store.write_batch(run_id, &batch).expect("write");

        // The threshold was reached, so the buffer is already on disk.
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM samples", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, BATCH_FLUSH_THRESHOLD as i64);
    }

    #[test]
    fn test_append_accepts_matching_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.sqlite");

        let mut store = MetricStore::open(&path, OpenMode::Create).expect("create");
        store.create_run(&new_run()).expect("run 1");
        store.close().expect("close");

        let mut store = MetricStore::open(&path, OpenMode::Append).expect("append");
        store.create_run(&new_run()).expect("run 2");
        assert_eq!(store.load_runs().expect("runs").len(), 2);
    }

    #[test]
    fn test_append_rejects_foreign_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.sqlite");

        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(
            "CREATE TABLE runs (id INTEGER PRIMARY KEY, comment TEXT);
             CREATE TABLE samples (run_id INTEGER, payload BLOB);",
        )
        .expect("foreign schema");
        drop(conn);

        let err = MetricStore::open(&path, OpenMode::Append).expect_err("append must fail");
        assert!(matches!(
            err.downcast_ref::<ProfError>(),
            Some(ProfError::SchemaMismatch { .. }),
        ));

        // Nothing was written: the foreign tables are untouched.
        let conn = Connection::open(&path).expect("reopen");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_finalize_records_exit_code_and_end_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.sqlite");

        let mut store = MetricStore::open(&path, OpenMode::Create).expect("create");
        let run_id = store.create_run(&new_run()).expect("run");
        store
            .finalize_run(run_id, Utc::now(), Some(3))
            .expect("finalize");

        let runs = store.load_runs().expect("runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].exit_code, Some(3));
        assert!(runs[0].ended_at.is_some());
    }
}
