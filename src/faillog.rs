//! Persistent failure log for crawl runs.
//!
//! Every failed run is appended as a single JSON line to
//! `weekly-crawling-scheduler-error.log`. Writes are serialized through a
//! `tokio::sync::Mutex`; before each append the file is rotated away once it
//! reaches the size ceiling, and rotation triggers a prune of archives older
//! than the retention window. Rotation and pruning are best-effort: their
//! failures are logged and the append still happens.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Fixed name of the active failure log inside the log directory.
pub const FILE_NAME: &str = "weekly-crawling-scheduler-error.log";

/// Timestamp format used in rotated archive names, filesystem-safe.
const ARCHIVE_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S-%3f";

// ---------------------------------------------------------------------------
// FailureRecord
// ---------------------------------------------------------------------------

/// One persisted failure, with the counter state at the time of the write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    /// ISO 8601 timestamp of the failure.
    pub timestamp: String,
    /// Identifier of the failed run.
    pub run_id: Uuid,
    /// Synthesized error message (exit code, signal, timeout, spawn error).
    pub error: String,
    /// Wall-clock duration of the run in milliseconds.
    pub duration_ms: u64,
    pub consecutive_failures: u32,
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl FailureRecord {
    /// Create a record stamped with the current time.
    pub fn new(run_id: Uuid, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            run_id,
            error: error.into(),
            duration_ms,
            consecutive_failures: 0,
            total_runs: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }

    /// Attach the counter snapshot taken after the failure was accounted.
    pub fn with_counters(
        mut self,
        consecutive_failures: u32,
        total_runs: u64,
        total_successes: u64,
        total_failures: u64,
    ) -> Self {
        self.consecutive_failures = consecutive_failures;
        self.total_runs = total_runs;
        self.total_successes = total_successes;
        self.total_failures = total_failures;
        self
    }
}

// ---------------------------------------------------------------------------
// FailureLog
// ---------------------------------------------------------------------------

/// Append-only JSON-lines failure log with size rotation and age pruning.
///
/// The file handle is reopened on every append so rotation can rename the
/// active file out from underneath without holding a stale descriptor.
pub struct FailureLog {
    dir: PathBuf,
    max_bytes: u64,
    retention_days: u32,
    lock: Mutex<()>,
}

impl FailureLog {
    /// Build a log rooted at `dir`. The directory is created lazily on the
    /// first append so a misconfigured path cannot block startup.
    pub fn new(dir: PathBuf, max_bytes: u64, retention_days: u32) -> Self {
        Self {
            dir,
            max_bytes,
            retention_days,
            lock: Mutex::new(()),
        }
    }

    /// Path of the active log file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    /// Append a single failure record as a JSON line, rotating first if the
    /// active file has reached the size ceiling.
    pub async fn append(&self, record: &FailureRecord) -> Result<()> {
        let _guard = self.lock.lock().await;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create log directory: {}", self.dir.display()))?;

        let path = self.path();
        if self.rotate_if_needed(&path).await {
            self.prune_archives(Utc::now()).await;
        }

        let mut line = serde_json::to_string(record)
            .context("failed to serialize failure record")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open failure log: {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to write to failure log: {}", path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("failed to flush failure log: {}", path.display()))?;

        debug!(path = %path.display(), run_id = %record.run_id, "failure recorded");
        Ok(())
    }

    /// Rename the active file to a timestamp-suffixed archive once it has
    /// reached the ceiling. Returns whether a rotation happened.
    async fn rotate_if_needed(&self, path: &Path) -> bool {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            // Nothing to rotate, including the not-yet-created case.
            Err(_) => return false,
        };
        if size < self.max_bytes {
            return false;
        }

        let archive = self.dir.join(format!(
            "{}.{}",
            FILE_NAME,
            Utc::now().format(ARCHIVE_TIME_FORMAT)
        ));
        match tokio::fs::rename(path, &archive).await {
            Ok(()) => {
                info!(
                    archive = %archive.display(),
                    size,
                    "rotated failure log"
                );
                true
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %path.display(),
                    "failed to rotate failure log, continuing with current file"
                );
                false
            }
        }
    }

    /// Delete archives whose name-embedded timestamp is past the retention
    /// window. Files whose suffix does not parse are left alone.
    async fn prune_archives(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::days(i64::from(self.retention_days));
        let prefix = format!("{FILE_NAME}.");

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, dir = %self.dir.display(), "failed to scan log directory for pruning");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(stamp) = NaiveDateTime::parse_from_str(suffix, ARCHIVE_TIME_FORMAT) else {
                continue;
            };
            if stamp.and_utc() >= cutoff {
                continue;
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => debug!(archive = name, "pruned expired failure log archive"),
                Err(e) => warn!(error = %e, archive = name, "failed to prune failure log archive"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
