use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Well-known file layout of an experiment directory.
///
/// Every artifact a run produces or the analysis steps consume lives at a
/// fixed name under one root, so the subcommands can find each other's output.
#[derive(Debug, Clone)]
pub struct ExperimentDir {
    root: PathBuf,
}

impl ExperimentDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a path relative to the root; absolute paths pass through.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join(path)
    }

    /// Raw `iostat` capture written while the benchmark runs.
    pub fn iostat_raw(&self) -> PathBuf {
        self.root.join("iostat_output.txt")
    }

    pub fn iostat_csv(&self) -> PathBuf {
        self.root.join("iostat_results.csv")
    }

    /// Raw `mpstat` capture written while the benchmark runs.
    pub fn mpstat_raw(&self) -> PathBuf {
        self.root.join("mpstat_output.txt")
    }

    pub fn mpstat_csv(&self) -> PathBuf {
        self.root.join("mpstat_results.csv")
    }

    /// Benchmark stdout/stderr (and watcher lines), append-only.
    pub fn status_log(&self) -> PathBuf {
        self.root.join("status_thread.txt")
    }

    pub fn client_stats_csv(&self) -> PathBuf {
        self.root.join("client_stats.csv")
    }

    /// Per-client cumulative operation counts, one row per client.
    pub fn client_progress_csv(&self) -> PathBuf {
        self.root.join("client_progress.csv")
    }

    /// Flat events timeseries produced by `extract`.
    pub fn events_csv(&self) -> PathBuf {
        self.root.join("output.csv")
    }

    pub fn flush_queue_log(&self) -> PathBuf {
        self.root.join("logs").join("WAL_logs.csv")
    }

    pub fn flush_queue_metrics(&self) -> PathBuf {
        self.root.join("flush_queue_metrics.txt")
    }

    pub fn manifest(&self) -> PathBuf {
        self.root.join("run.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(".harness.lock")
    }

    /// Gnuplot script path for a named chart; the rendered SVG sits next to it.
    pub fn chart_script(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.gp"))
    }

    pub fn chart_image(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.svg"))
    }

    /// Create the root and `logs/` if missing.
    pub fn init(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.root.join("logs"))?;
        Ok(())
    }

    /// Take the singleton lock for a run. Fails with `WouldBlock` if another
    /// run holds it; the lock is released when the returned file is dropped.
    pub fn try_lock(&self) -> std::io::Result<RunLock> {
        let file = File::create(self.lock())?;
        file.try_lock_exclusive()?;
        Ok(RunLock { file })
    }
}

/// Exclusive hold on an experiment directory.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
