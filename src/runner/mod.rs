//! Crawl run supervision.
//!
//! `CrawlScheduler` owns the run ledger behind a single `tokio::sync::Mutex`
//! and funnels every trigger, scheduled or manual, through the same pipeline:
//! admission (overlap guard, circuit breaker), script resolution, execution,
//! settlement. The weekly timer runs ticks inline in its loop, so a slow
//! crawl can never overlap the next slot.

pub mod executor;
pub mod status;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{CrawlschedConfig, DeployMode};
use crate::faillog::{FailureLog, FailureRecord};
use crate::schedule::{self, ScheduleSpec};
use crate::script::{ScriptCommand, ScriptError, ScriptLocator};

use executor::{ExecLimits, ExecOutcome};
use status::{RunReport, RunStatus, Trigger};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a trigger was refused without starting a run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerRefused {
    #[error("a crawl run is already in progress")]
    AlreadyRunning,

    #[error("circuit breaker open after {failures} consecutive failures")]
    BreakerOpen { failures: u32 },
}

/// Why the weekly timer will not arm.
#[derive(Debug, Error)]
pub enum ArmRefusal {
    #[error("deployment mode is {0}, the weekly timer arms only in production")]
    NotProduction(DeployMode),

    #[error(transparent)]
    ScriptUnavailable(#[from] ScriptError),
}

// ---------------------------------------------------------------------------
// CrawlScheduler
// ---------------------------------------------------------------------------

/// Proof that a run was admitted. Consumed exactly once when the run settles.
struct RunTicket {
    run_id: Uuid,
    trigger: Trigger,
    started: Instant,
}

/// Supervises crawl runs: admission, execution, accounting, and the weekly
/// timer. Shared across tasks as `Arc<CrawlScheduler>`.
pub struct CrawlScheduler {
    schedule: ScheduleSpec,
    locator: ScriptLocator,
    limits: ExecLimits,
    failure_threshold: u32,
    mode: DeployMode,
    state: Mutex<RunStatus>,
    faillog: FailureLog,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl CrawlScheduler {
    /// Build the scheduler from configuration.
    ///
    /// A configured expression outside the allow-list is replaced by the
    /// default weekly slot with a warning, the same treatment environment
    /// overrides get.
    pub fn new(config: &CrawlschedConfig) -> Result<Self> {
        let expression = if schedule::validate(&config.schedule.expression) {
            config.schedule.expression.clone()
        } else {
            warn!(
                value = %config.schedule.expression,
                allowed = schedule::ALLOWED_EXPRESSION,
                "configured schedule is not allow-listed, using the default weekly slot"
            );
            schedule::ALLOWED_EXPRESSION.to_string()
        };
        let spec = ScheduleSpec::new(&expression, &config.schedule.timezone)
            .context("failed to build weekly schedule")?;

        Ok(Self {
            schedule: spec,
            locator: ScriptLocator::new(
                config.crawler.script.clone(),
                config.crawler.candidates.clone(),
            ),
            limits: ExecLimits {
                timeout: Duration::from_secs(config.crawler.timeout_sec),
                grace: Duration::from_secs(config.crawler.grace_sec),
                max_capture_bytes: config.crawler.max_capture_bytes,
            },
            failure_threshold: config.crawler.failure_threshold,
            mode: config.runtime.mode,
            state: Mutex::new(RunStatus::default()),
            faillog: FailureLog::new(
                config.failure_log.dir.clone(),
                config.failure_log.max_bytes,
                config.failure_log.retention_days,
            ),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn schedule(&self) -> &ScheduleSpec {
        &self.schedule
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Path of the persistent failure log.
    pub fn failure_log_path(&self) -> PathBuf {
        self.faillog.path()
    }

    // -- Admission and settlement -------------------------------------------

    /// Admit a run or refuse it. Refusals never touch the run counters.
    async fn begin_run(&self, trigger: Trigger) -> Result<RunTicket, TriggerRefused> {
        let mut status = self.state.lock().await;

        if status.is_running {
            warn!(%trigger, "crawl already in progress, refusing trigger");
            return Err(TriggerRefused::AlreadyRunning);
        }
        if status.breaker_open(self.failure_threshold) {
            if trigger == Trigger::Scheduled {
                warn!(
                    consecutive_failures = status.consecutive_failures,
                    threshold = self.failure_threshold,
                    "circuit breaker open, skipping scheduled crawl"
                );
                return Err(TriggerRefused::BreakerOpen {
                    failures: status.consecutive_failures,
                });
            }
            info!(
                consecutive_failures = status.consecutive_failures,
                "manual trigger bypassing open circuit breaker"
            );
        }

        let run_id = Uuid::new_v4();
        status.begin(Utc::now());
        info!(
            run_id = %run_id,
            %trigger,
            total_runs = status.total_runs,
            "crawl run started"
        );
        Ok(RunTicket {
            run_id,
            trigger,
            started: Instant::now(),
        })
    }

    /// Settle the admitted run with its outcome: counters, next-run
    /// projection, and the persistent record for failures.
    async fn finish_run(&self, ticket: RunTicket, outcome: ExecOutcome) -> RunReport {
        let RunTicket {
            run_id,
            trigger,
            started,
        } = ticket;
        let duration = started.elapsed();
        let duration_ms = duration.as_millis() as u64;

        let error = match outcome {
            ExecOutcome::Completed { .. } => None,
            ExecOutcome::Failed { message } => Some(message),
            ExecOutcome::TimedOut { limit } => Some(format!(
                "crawl timed out after {}s and was terminated",
                limit.as_secs()
            )),
            ExecOutcome::Cancelled => Some("crawl aborted: scheduler shutting down".to_string()),
        };

        let mut record = None;
        {
            let mut status = self.state.lock().await;
            match &error {
                None => {
                    status.settle_success(duration_ms);
                    info!(
                        run_id = %run_id,
                        %trigger,
                        duration_ms,
                        total_successes = status.total_successes,
                        "crawl run succeeded"
                    );
                }
                Some(message) => {
                    status.settle_failure(message.clone(), duration_ms);
                    error!(
                        run_id = %run_id,
                        %trigger,
                        duration_ms,
                        consecutive_failures = status.consecutive_failures,
                        error = %message,
                        "crawl run failed"
                    );
                    if status.breaker_open(self.failure_threshold) {
                        warn!(
                            consecutive_failures = status.consecutive_failures,
                            threshold = self.failure_threshold,
                            "circuit breaker opened, scheduled runs suspended until a manual run succeeds"
                        );
                    }
                    record = Some(
                        FailureRecord::new(run_id, message.clone(), duration_ms).with_counters(
                            status.consecutive_failures,
                            status.total_runs,
                            status.total_successes,
                            status.total_failures,
                        ),
                    );
                }
            }
            status.next_run = self.schedule.next_occurrence(Utc::now());
        }

        // Persisting the record is best-effort; the in-memory ledger is
        // already settled.
        if let Some(record) = &record {
            if let Err(e) = self.faillog.append(record).await {
                warn!(run_id = %run_id, error = %e, "failed to persist crawl failure record");
            }
        }

        RunReport {
            run_id,
            trigger,
            success: error.is_none(),
            error,
            duration,
        }
    }

    // -- Execution ----------------------------------------------------------

    /// Run one crawl to completion. Refused while a run is in flight, or,
    /// for scheduled triggers, while the circuit breaker is open.
    pub async fn run_once(&self, trigger: Trigger) -> Result<RunReport, TriggerRefused> {
        let ticket = self.begin_run(trigger).await?;
        Ok(self.execute(ticket).await)
    }

    /// Start a manual run in the background and return its id. The overlap
    /// guard is taken before this returns, so concurrent callers get a
    /// definitive started-or-conflict answer.
    pub async fn spawn_manual(self: Arc<Self>) -> Result<Uuid, TriggerRefused> {
        let ticket = self.begin_run(Trigger::Manual).await?;
        let run_id = ticket.run_id;
        let scheduler = Arc::clone(&self);
        self.tasks.spawn(async move {
            scheduler.execute(ticket).await;
        });
        Ok(run_id)
    }

    async fn execute(&self, ticket: RunTicket) -> RunReport {
        // A deploy can swap the script layout between ticks, so it is
        // re-validated on every launch.
        let outcome = match self.locator.locate() {
            Ok(script) => {
                let command = ScriptCommand::for_path(&script);
                executor::run(ticket.run_id, &command, self.limits, self.cancel.clone()).await
            }
            Err(e) => ExecOutcome::Failed {
                message: format!("crawl script unavailable: {e}"),
            },
        };
        self.finish_run(ticket, outcome).await
    }

    // -- Arming and the weekly timer ----------------------------------------

    /// Whether the weekly timer may arm: production mode and a usable
    /// script. Returns the script that would run.
    pub fn check_armable(&self) -> Result<PathBuf, ArmRefusal> {
        if self.mode != DeployMode::Production {
            return Err(ArmRefusal::NotProduction(self.mode));
        }
        Ok(self.locator.locate()?)
    }

    /// Arm the weekly timer. On success the timer loop runs on the
    /// scheduler's task tracker until shutdown.
    pub fn arm(self: Arc<Self>) -> Result<PathBuf, ArmRefusal> {
        let script = self.check_armable()?;
        let scheduler = Arc::clone(&self);
        self.tasks.spawn(async move {
            scheduler.run_loop().await;
        });
        Ok(script)
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let Some(next) = self.schedule.next_occurrence(now) else {
                // Unreachable for a weekly expression, but the cron iterator
                // is allowed to end.
                error!("schedule produced no further occurrences, stopping timer");
                return;
            };
            {
                let mut status = self.state.lock().await;
                if !status.is_running {
                    status.next_run = Some(next);
                }
            }
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(next = %next, wait_sec = wait.as_secs(), "weekly timer sleeping until next slot");

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("weekly timer stopped");
                    return;
                }

                _ = tokio::time::sleep(wait) => {}
            }

            // Failures are settled and logged inside the run pipeline; the
            // loop itself only notes refusals and keeps ticking.
            if let Err(refused) = self.run_once(Trigger::Scheduled).await {
                info!(reason = %refused, "scheduled crawl skipped");
            }
        }
    }

    // -- Status and shutdown ------------------------------------------------

    /// Copy of the run ledger. While idle, `next_run` is recomputed so
    /// pollers between ticks always see a fresh projection.
    pub async fn snapshot(&self) -> RunStatus {
        let mut status = self.state.lock().await.clone();
        if !status.is_running {
            status.next_run = self.schedule.next_occurrence(Utc::now());
        }
        status
    }

    /// Stop the timer, terminate any in-flight crawl with the full
    /// graceful-then-forced sequence, and wait for every scheduler task to
    /// settle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
