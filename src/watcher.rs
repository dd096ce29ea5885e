/// Polling directory watcher.
///
/// Runs alongside the benchmark, periodically listing a directory (typically
/// the database directory) and appending a line to the run log whenever the
/// set of files or their total size changes.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

/// File name -> size for the regular files directly inside a directory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DirSnapshot {
    files: BTreeMap<String, u64>,
}

impl DirSnapshot {
    pub async fn scan(dir: &Path) -> std::io::Result<Self> {
        let mut files = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(m) => m,
                // Deleted between listing and stat (e.g. compaction inputs).
                Err(_) => continue,
            };
            if meta.is_file() {
                files.insert(entry.file_name().to_string_lossy().into_owned(), meta.len());
            }
        }
        Ok(Self { files })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().sum()
    }

    /// Names present here but not in `previous`, and the reverse.
    pub fn diff(&self, previous: &DirSnapshot) -> (Vec<String>, Vec<String>) {
        let added = self
            .files
            .keys()
            .filter(|k| !previous.files.contains_key(*k))
            .cloned()
            .collect();
        let removed = previous
            .files
            .keys()
            .filter(|k| !self.files.contains_key(*k))
            .cloned()
            .collect();
        (added, removed)
    }

    /// One log line describing this snapshot relative to `previous`.
    pub fn report_line(&self, previous: &DirSnapshot, at: chrono::DateTime<chrono::Utc>) -> String {
        let (added, removed) = self.diff(previous);
        format!(
            "[watch {}] files={} bytes={} added=[{}] removed=[{}]\n",
            at.to_rfc3339(),
            self.file_count(),
            self.total_bytes(),
            added.join(", "),
            removed.join(", ")
        )
    }
}

/// Counters reported when the watcher stops.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub scans: u64,
    pub reports: u64,
}

pub struct DirWatcher {
    dir: PathBuf,
    poll_interval: Duration,
    log_path: PathBuf,
}

impl DirWatcher {
    pub fn new(dir: PathBuf, poll_interval: Duration, log_path: PathBuf) -> Self {
        Self {
            dir,
            poll_interval,
            log_path,
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await
    }

    /// Poll until `cancel` turns true or its sender is dropped.
    pub async fn run(self, mut cancel: watch::Receiver<bool>) -> WatchSummary {
        let mut summary = WatchSummary::default();
        let mut previous: Option<DirSnapshot> = None;
        let mut missing = false;

        loop {
            if *cancel.borrow() {
                break;
            }

            summary.scans += 1;
            match DirSnapshot::scan(&self.dir).await {
                Ok(snapshot) => {
                    missing = false;
                    let baseline = previous.clone().unwrap_or_default();
                    if previous.as_ref() != Some(&snapshot) {
                        let line = snapshot.report_line(&baseline, chrono::Utc::now());
                        match self.append(&line).await {
                            Ok(()) => summary.reports += 1,
                            Err(e) => tracing::warn!(
                                error = %e,
                                path = %self.log_path.display(),
                                "failed to append watch report"
                            ),
                        }
                        previous = Some(snapshot);
                    }
                }
                Err(e) => {
                    if !missing {
                        tracing::warn!(error = %e, dir = %self.dir.display(), "cannot scan watched directory");
                        missing = true;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!(scans = summary.scans, reports = summary.reports, "directory watcher stopped");
        summary
    }
}
