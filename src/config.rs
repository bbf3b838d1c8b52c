//! TOML configuration for the crawl scheduler.
//!
//! Layered model: compiled-in defaults, optionally overlaid by a config file
//! (path from `CRAWLSCHED_CONFIG` or a standard system location), optionally
//! overlaid by individual environment variables. Invalid overrides never
//! abort startup; they are logged and the previous value is kept.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::schedule;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the scheduler process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlschedConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub failure_log: FailureLogConfig,
}

impl Default for CrawlschedConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            schedule: ScheduleConfig::default(),
            crawler: CrawlerConfig::default(),
            failure_log: FailureLogConfig::default(),
        }
    }
}

impl CrawlschedConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded scheduler configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `CRAWLSCHED_CONFIG` environment variable.
    /// 2. `/etc/crawlsched/crawlsched.toml`.
    /// 3. Fall back to compiled-in defaults.
    ///
    /// The per-field environment overrides are applied on top in every case.
    pub fn load_or_default() -> Self {
        let mut config = Self::load_file_or_default();
        config.apply_overrides(
            std::env::var("CRAWLSCHED_MODE").ok().as_deref(),
            std::env::var("CRAWLSCHED_SCHEDULE").ok().as_deref(),
            std::env::var("CRAWLSCHED_SCRIPT").ok().as_deref(),
        );
        config
    }

    fn load_file_or_default() -> Self {
        // 1. Environment variable override.
        if let Ok(env_path) = std::env::var("CRAWLSCHED_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CRAWLSCHED_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        // 2. Standard system location.
        let system_path = Path::new("/etc/crawlsched/crawlsched.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        // 3. Defaults.
        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply individual overrides on top of the loaded configuration.
    ///
    /// `mode` and `schedule` are validated; a value that does not pass keeps
    /// the configured one and logs a warning. `script` is taken verbatim, the
    /// locator validates it at run time.
    pub fn apply_overrides(
        &mut self,
        mode: Option<&str>,
        schedule_expr: Option<&str>,
        script: Option<&str>,
    ) {
        if let Some(raw) = mode {
            match raw.parse::<DeployMode>() {
                Ok(parsed) => self.runtime.mode = parsed,
                Err(_) => {
                    warn!(
                        value = raw,
                        "CRAWLSCHED_MODE is not `development` or `production`, keeping configured mode"
                    );
                }
            }
        }

        self.schedule.expression =
            schedule::resolve(schedule_expr, &self.schedule.expression);

        if let Some(path) = script {
            self.crawler.script = Some(PathBuf::from(path));
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Process-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Deployment mode. The weekly timer arms only in `production`.
    pub mode: DeployMode,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: DeployMode::Development,
        }
    }
}

/// Deployment mode gate for the weekly timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    Development,
    Production,
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployMode::Development => write!(f, "development"),
            DeployMode::Production => write!(f, "production"),
        }
    }
}

impl FromStr for DeployMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" => Ok(DeployMode::Development),
            "production" => Ok(DeployMode::Production),
            _ => Err(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// Cron schedule configuration for the weekly crawl.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Five-field cron expression. Only the allow-listed weekly slot is
    /// accepted; anything else falls back to it with a warning.
    pub expression: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            expression: schedule::ALLOWED_EXPRESSION.to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Crawler
// ---------------------------------------------------------------------------

/// Configuration for the crawl script child process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Explicit script path. When unset, `candidates` are probed in order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script: Option<PathBuf>,
    /// Candidate script locations, checked-out tree first, packaged layout
    /// second.
    pub candidates: Vec<PathBuf>,
    /// Wall-clock ceiling for one crawl run (seconds).
    pub timeout_sec: u64,
    /// Grace period between SIGTERM and SIGKILL (seconds).
    pub grace_sec: u64,
    /// Capture cap per output stream (bytes). Output past the cap is drained
    /// and discarded so the child never blocks on a full pipe.
    pub max_capture_bytes: usize,
    /// Consecutive failures that open the circuit breaker.
    pub failure_threshold: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            script: None,
            candidates: vec![
                PathBuf::from("scripts/crawl_gyms.py"),
                PathBuf::from("dist/crawl_gyms.py"),
            ],
            timeout_sec: 7200,
            grace_sec: 5,
            max_capture_bytes: 1_048_576,
            failure_threshold: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Failure log
// ---------------------------------------------------------------------------

/// Rotating failure log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureLogConfig {
    /// Directory holding the failure log and its rotated archives.
    pub dir: PathBuf,
    /// Rotation ceiling for the active log file (bytes).
    pub max_bytes: u64,
    /// Archives older than this many days are pruned after a rotation.
    pub retention_days: u32,
}

impl Default for FailureLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            max_bytes: 10 * 1024 * 1024,
            retention_days: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
