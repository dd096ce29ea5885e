/// Checkpoint saver: copy a run's artifacts and the database LOG into
/// `results/<name>/`.
use crate::compress;
use crate::config::CheckpointConfig;
use crate::data_dir::ExperimentDir;
use std::path::{Path, PathBuf};

/// What a checkpoint copied, what it could not find, and what failed to copy.
#[derive(Debug, Default)]
pub struct CheckpointSummary {
    pub dest: PathBuf,
    pub copied: Vec<PathBuf>,
    pub missing: Vec<String>,
    pub failed: Vec<PathBuf>,
}

impl CheckpointSummary {
    fn record(&mut self, result: Result<PathBuf, CheckpointError>) {
        match result {
            Ok(to) => self.copied.push(to),
            Err(e) => {
                tracing::warn!(error = %e, "checkpoint copy failed");
                if let CheckpointError::Copy { from, .. } = e {
                    self.failed.push(from);
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum CheckpointError {
    /// `USER` is unset or empty; nothing was created.
    MissingUser,
    /// The checkpoint name is empty or not a single path component.
    InvalidName { name: String },
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointError::MissingUser => write!(f, "USER environment variable is not set"),
            CheckpointError::InvalidName { name } => {
                write!(f, "invalid checkpoint name {:?}", name)
            }
            CheckpointError::InvalidPattern { pattern, source } => {
                write!(f, "invalid file pattern {:?}: {}", pattern, source)
            }
            CheckpointError::CreateDir { path, source } => {
                write!(f, "failed to create {}: {}", path.display(), source)
            }
            CheckpointError::Copy { from, to, source } => write!(
                f,
                "failed to copy {} to {}: {}",
                from.display(),
                to.display(),
                source
            ),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CheckpointError::MissingUser | CheckpointError::InvalidName { .. } => None,
            CheckpointError::InvalidPattern { source, .. } => Some(source),
            CheckpointError::CreateDir { source, .. } => Some(source),
            CheckpointError::Copy { source, .. } => Some(source),
        }
    }
}

fn valid_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

/// Expand one configured entry against the experiment dir. Absolute entries
/// are used as-is.
fn expand(dir: &ExperimentDir, pattern: &str) -> Result<Vec<PathBuf>, CheckpointError> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        format!(
            "{}/{}",
            glob::Pattern::escape(&dir.root().to_string_lossy()),
            pattern
        )
    };
    let paths = glob::glob(&full).map_err(|e| CheckpointError::InvalidPattern {
        pattern: pattern.to_string(),
        source: e,
    })?;
    let mut matched = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) if path.is_file() => matched.push(path),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "unreadable path while expanding pattern"),
        }
    }
    Ok(matched)
}

fn copy_into(src: &Path, dest_dir: &Path) -> Result<PathBuf, CheckpointError> {
    let to = dest_dir.join(src.file_name().unwrap_or(src.as_os_str()));
    std::fs::copy(src, &to).map_err(|e| CheckpointError::Copy {
        from: src.to_path_buf(),
        to: to.clone(),
        source: e,
    })?;
    Ok(to)
}

/// Save a checkpoint named `name`. `user` is the value of `$USER`.
///
/// Fails before touching the filesystem when `user` is unset. Missing
/// artifacts and failed copies are logged and listed in the summary; the
/// remaining artifacts are still copied.
pub fn save_checkpoint(
    dir: &ExperimentDir,
    config: &CheckpointConfig,
    name: &str,
    user: Option<&str>,
) -> Result<CheckpointSummary, CheckpointError> {
    let user = user
        .filter(|u| !u.is_empty())
        .ok_or(CheckpointError::MissingUser)?;
    if !valid_name(name) {
        return Err(CheckpointError::InvalidName {
            name: name.to_string(),
        });
    }

    let dest = dir.resolve(&config.results_dir).join(name);
    std::fs::create_dir_all(&dest).map_err(|e| CheckpointError::CreateDir {
        path: dest.clone(),
        source: e,
    })?;

    let mut summary = CheckpointSummary {
        dest: dest.clone(),
        ..Default::default()
    };

    for pattern in &config.files {
        let matched = expand(dir, pattern)?;
        if matched.is_empty() {
            tracing::warn!(pattern = %pattern, "checkpoint file not found");
            summary.missing.push(pattern.clone());
        }
        for src in matched {
            summary.record(copy_into(&src, &dest));
        }
    }

    let log = PathBuf::from(config.log_file.replace("{user}", user));
    if log.is_file() {
        let (to, copied) = if config.compress_log {
            let to = dest.join("LOG.zst");
            let copied = compress::compress_file(&log, &to);
            (to, copied)
        } else {
            let to = dest.join("LOG");
            let copied = std::fs::copy(&log, &to);
            (to, copied)
        };
        summary.record(copied.map(|_| to.clone()).map_err(|e| CheckpointError::Copy {
            from: log.clone(),
            to,
            source: e,
        }));
    } else {
        tracing::warn!(path = %log.display(), "database LOG not found");
        summary.missing.push(log.display().to_string());
    }

    tracing::info!(
        dest = %dest.display(),
        copied = summary.copied.len(),
        missing = summary.missing.len(),
        failed = summary.failed.len(),
        "checkpoint saved"
    );
    Ok(summary)
}
