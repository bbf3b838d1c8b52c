//! Run ledger: the status snapshot external pollers see and the transitions
//! the scheduler applies to it.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// What initiated a crawl run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The weekly timer fired.
    Scheduled,
    /// An operator asked for a run (CLI or HTTP).
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Scheduled => write!(f, "scheduled"),
            Trigger::Manual => write!(f, "manual"),
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// The scheduler's run ledger.
///
/// `total_runs` is bumped when a run begins; the success and failure totals
/// when it settles. After every settled run the totals balance:
/// `total_runs == total_successes + total_failures`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub last_success: Option<bool>,
    pub last_error: Option<String>,
    pub last_run_duration_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub total_runs: u64,
    pub total_successes: u64,
    pub total_failures: u64,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self {
            is_running: false,
            last_run: None,
            next_run: None,
            last_success: None,
            last_error: None,
            last_run_duration_ms: None,
            consecutive_failures: 0,
            total_runs: 0,
            total_successes: 0,
            total_failures: 0,
        }
    }
}

impl RunStatus {
    /// Mark a run as started.
    pub fn begin(&mut self, started: DateTime<Utc>) {
        self.is_running = true;
        self.last_run = Some(started);
        self.total_runs += 1;
    }

    /// Settle the in-flight run as a success. Clears the error state and the
    /// consecutive-failure streak.
    pub fn settle_success(&mut self, duration_ms: u64) {
        self.is_running = false;
        self.last_success = Some(true);
        self.last_error = None;
        self.last_run_duration_ms = Some(duration_ms);
        self.consecutive_failures = 0;
        self.total_successes += 1;
    }

    /// Settle the in-flight run as a failure and extend the streak.
    pub fn settle_failure(&mut self, error: String, duration_ms: u64) {
        self.is_running = false;
        self.last_success = Some(false);
        self.last_error = Some(error);
        self.last_run_duration_ms = Some(duration_ms);
        self.consecutive_failures += 1;
        self.total_failures += 1;
    }

    /// Whether the circuit breaker is open for the given threshold.
    pub fn breaker_open(&self, threshold: u32) -> bool {
        self.consecutive_failures >= threshold
    }
}

// ---------------------------------------------------------------------------
// RunReport
// ---------------------------------------------------------------------------

/// Outcome summary handed back to whoever initiated a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub success: bool,
    /// Synthesized error message for failed runs.
    pub error: Option<String>,
    pub duration: Duration,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
