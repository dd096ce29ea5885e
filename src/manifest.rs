/// Run manifest: writes `run.json` as JSON when a run starts and when it ends.
///
/// Uses atomic write pattern: write to temp file then rename.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Lifecycle states recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Interrupted,
    Failed,
}

/// The JSON payload written to `run.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunManifest {
    pub pid: u32,
    pub benchmark_pid: Option<u32>,
    pub state: RunState,
    pub command: String,
    pub mode: crate::config::LaunchMode,
    pub monitors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl RunManifest {
    pub fn started(command: String, mode: crate::config::LaunchMode, monitors: Vec<String>) -> Self {
        Self {
            pid: std::process::id(),
            benchmark_pid: None,
            state: RunState::Running,
            command,
            mode,
            monitors,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
        }
    }

    /// Mark the run as ended in `state`.
    pub fn finish(&mut self, state: RunState, exit_code: Option<i32>) {
        self.state = state;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    /// Atomically write the manifest to `path`.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// so readers never see a partial write.
    pub fn write(&self, path: &Path) -> Result<(), ManifestError> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| ManifestError::Serialize { source: e })?;

        let dir = path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".run.json.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| ManifestError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, path).map_err(|e| ManifestError::Rename {
            from: tmp_path,
            to: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }

    /// Write, logging instead of failing. The manifest is informational.
    pub fn write_or_warn(&self, path: &Path) {
        if let Err(e) = self.write(path) {
            tracing::warn!(error = %e, "failed to write run manifest");
        }
    }
}

/// Errors from manifest writes.
#[derive(Debug)]
pub enum ManifestError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ManifestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestError::Serialize { source } => {
                write!(f, "failed to serialize run manifest: {source}")
            }
            ManifestError::Write { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            ManifestError::Rename { from, to, source } => write!(
                f,
                "failed to rename {} to {}: {source}",
                from.display(),
                to.display()
            ),
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Serialize { source } => Some(source),
            ManifestError::Write { source, .. } => Some(source),
            ManifestError::Rename { source, .. } => Some(source),
        }
    }
}
