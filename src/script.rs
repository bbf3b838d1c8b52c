//! Crawl script location and validation.
//!
//! The crawler ships either as a checked-out tree (`scripts/`) or packaged
//! (`dist/`), so the locator probes a candidate list in order. Validation is
//! repeated immediately before every launch; a deploy can swap the layout
//! between ticks.

use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("crawl script not found at {path}")]
    NotFound { path: String },

    #[error("crawl script at {path} is not a regular file")]
    NotAFile { path: String },

    #[error("crawl script at {path} is not readable: {source}")]
    NotReadable {
        path: String,
        source: std::io::Error,
    },

    #[error("crawl script at {path} is empty")]
    Empty { path: String },

    #[error("no usable crawl script; tried {tried}")]
    NoCandidate { tried: String },
}

/// Probes an optional explicit path, then the candidate list, and returns the
/// first script that passes [`validate`].
#[derive(Debug, Clone)]
pub struct ScriptLocator {
    override_path: Option<PathBuf>,
    candidates: Vec<PathBuf>,
}

impl ScriptLocator {
    pub fn new(override_path: Option<PathBuf>, candidates: Vec<PathBuf>) -> Self {
        Self {
            override_path,
            candidates,
        }
    }

    /// Resolve the script to launch. The explicit override is probed first
    /// and wins even over earlier candidates.
    pub fn locate(&self) -> Result<PathBuf, ScriptError> {
        for path in self.search_order() {
            match validate(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "crawl script resolved");
                    return Ok(path.clone());
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "crawl script candidate rejected");
                }
            }
        }
        let tried = self
            .search_order()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(ScriptError::NoCandidate { tried })
    }

    fn search_order(&self) -> impl Iterator<Item = &PathBuf> {
        self.override_path.iter().chain(self.candidates.iter())
    }
}

/// Check that `path` is an existing, readable, non-empty regular file.
pub fn validate(path: &Path) -> Result<(), ScriptError> {
    let display = path.display().to_string();
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ScriptError::NotFound { path: display });
        }
        Err(e) => {
            return Err(ScriptError::NotReadable {
                path: display,
                source: e,
            });
        }
    };
    if !meta.is_file() {
        return Err(ScriptError::NotAFile { path: display });
    }
    if meta.len() == 0 {
        return Err(ScriptError::Empty { path: display });
    }
    // Read permission is the one thing metadata cannot answer.
    if let Err(e) = fs::File::open(path) {
        return Err(ScriptError::NotReadable {
            path: display,
            source: e,
        });
    }
    Ok(())
}

/// Launch command for a resolved script: program plus argv, never a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ScriptCommand {
    /// Map a script path to its launch command. `.py` runs under `python3`;
    /// anything else is treated as directly executable.
    pub fn for_path(script: &Path) -> Self {
        match script.extension().and_then(|e| e.to_str()) {
            Some("py") => Self {
                program: PathBuf::from("python3"),
                args: vec![script.as_os_str().to_os_string()],
            },
            _ => Self {
                program: script.to_path_buf(),
                args: Vec::new(),
            },
        }
    }
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn script_in(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_validate_accepts_regular_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = script_in(dir.path(), "crawl_gyms.py", "print('ok')\n");
        assert!(validate(&path).is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = validate(&dir.path().join("nope.py")).unwrap_err();
        assert!(matches!(err, ScriptError::NotFound { .. }));
    }

    #[test]
    fn test_validate_rejects_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = validate(dir.path()).unwrap_err();
        assert!(matches!(err, ScriptError::NotAFile { .. }));
    }

    #[test]
    fn test_validate_rejects_empty_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = script_in(dir.path(), "empty.py", "");
        let err = validate(&path).unwrap_err();
        assert!(matches!(err, ScriptError::Empty { .. }));
    }

    #[test]
    fn test_locator_walks_candidates_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let first = dir.path().join("scripts/crawl_gyms.py");
        let second = dir.path().join("dist/crawl_gyms.py");
        fs::create_dir_all(second.parent().unwrap()).unwrap();
        fs::write(&second, "print('packaged')\n").unwrap();

        let locator = ScriptLocator::new(None, vec![first, second.clone()]);
        assert_eq!(locator.locate().unwrap(), second);
    }

    #[test]
    fn test_locator_skips_empty_candidate() {
        let dir = tempfile::TempDir::new().unwrap();
        let empty = script_in(dir.path(), "empty.py", "");
        let good = script_in(dir.path(), "good.py", "print('ok')\n");

        let locator = ScriptLocator::new(None, vec![empty, good.clone()]);
        assert_eq!(locator.locate().unwrap(), good);
    }

    #[test]
    fn test_locator_override_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let candidate = script_in(dir.path(), "candidate.py", "print('a')\n");
        let explicit = script_in(dir.path(), "explicit.py", "print('b')\n");

        let locator = ScriptLocator::new(Some(explicit.clone()), vec![candidate]);
        assert_eq!(locator.locate().unwrap(), explicit);
    }

    #[test]
    fn test_locator_reports_every_probed_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let a = dir.path().join("scripts/crawl_gyms.py");
        let b = dir.path().join("dist/crawl_gyms.py");
        let locator = ScriptLocator::new(None, vec![a.clone(), b.clone()]);

        let err = locator.locate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(&a.display().to_string()));
        assert!(msg.contains(&b.display().to_string()));
    }

    #[test]
    fn test_python_scripts_run_under_python3() {
        let cmd = ScriptCommand::for_path(Path::new("dist/crawl_gyms.py"));
        assert_eq!(cmd.program, PathBuf::from("python3"));
        assert_eq!(cmd.args, vec![OsString::from("dist/crawl_gyms.py")]);
        assert_eq!(cmd.to_string(), "python3 dist/crawl_gyms.py");
    }

    #[test]
    fn test_other_scripts_run_directly() {
        let cmd = ScriptCommand::for_path(Path::new("dist/crawl_gyms"));
        assert_eq!(cmd.program, PathBuf::from("dist/crawl_gyms"));
        assert!(cmd.args.is_empty());
    }
}
