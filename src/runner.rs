/// One experiment run: lock the experiment directory, start the monitors and
/// the benchmark, tee benchmark output to the console and the status log, and
/// tear everything down exactly once however the run ends.
use crate::config::HarnessConfig;
use crate::data_dir::ExperimentDir;
use crate::launch::BenchmarkInvocation;
use crate::manifest::{RunManifest, RunState};
use crate::monitor::{self, MonitorKind};
use crate::signals::{self, KillOutcome, ShutdownSignal};
use crate::watcher::{DirWatcher, WatchSummary};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How long stream tasks get to drain buffered output once the benchmark is gone.
const STREAM_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The benchmark exited on its own. `None` if it was killed by a signal.
    Completed { exit_code: Option<i32> },
    /// A shutdown signal arrived first and the benchmark was killed.
    Interrupted(ShutdownSignal),
}

/// Errors that abort a run.
#[derive(Debug)]
pub enum RunError {
    /// Failed to create the experiment directory layout.
    Init { source: std::io::Error },
    /// Another run holds the experiment directory.
    Locked { path: PathBuf },
    /// Failed to open the lock file.
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to create the status log.
    StatusLog {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to spawn the benchmark.
    Spawn {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Init { source } => {
                write!(f, "failed to prepare experiment directory: {}", source)
            }
            RunError::Locked { path } => {
                write!(f, "another run holds the lock {}", path.display())
            }
            RunError::Lock { path, source } => {
                write!(f, "failed to open lock file {}: {}", path.display(), source)
            }
            RunError::StatusLog { path, source } => {
                write!(f, "failed to create status log {}: {}", path.display(), source)
            }
            RunError::Spawn { program, source } => {
                write!(f, "failed to spawn benchmark {}: {}", program, source)
            }
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RunError::Init { source } => Some(source),
            RunError::Locked { .. } => None,
            RunError::Lock { source, .. } => Some(source),
            RunError::StatusLog { source, .. } => Some(source),
            RunError::Spawn { source, .. } => Some(source),
        }
    }
}

struct MonitorHandle {
    kind: MonitorKind,
    raw: PathBuf,
    csv: PathBuf,
    child: Option<Child>,
}

/// Owns every process and task started for a run.
///
/// `finish` must be awaited on every exit path; dropping an unfinished
/// context still kills the process groups it owns.
pub struct RunContext {
    monitors: Vec<MonitorHandle>,
    /// Set while the benchmark has been spawned but not yet reaped.
    benchmark_pid: Option<u32>,
    streams: Vec<JoinHandle<()>>,
    watcher: Option<JoinHandle<WatchSummary>>,
    cancel: watch::Sender<bool>,
    finished: bool,
}

impl RunContext {
    fn new() -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            monitors: Vec::new(),
            benchmark_pid: None,
            streams: Vec::new(),
            watcher: None,
            cancel,
            finished: false,
        }
    }

    /// Spawn each monitor; one that fails to start is logged and skipped,
    /// but its CSV is still produced at the end.
    fn start_monitors(&mut self, kinds: Vec<MonitorKind>, interval_secs: u64, dir: &ExperimentDir) {
        for kind in kinds {
            let (raw, csv) = match kind {
                MonitorKind::Iostat { .. } => (dir.iostat_raw(), dir.iostat_csv()),
                MonitorKind::Mpstat => (dir.mpstat_raw(), dir.mpstat_csv()),
            };
            let child = match monitor::spawn_monitor(&kind, interval_secs, &raw) {
                Ok(child) => Some(child),
                Err(e) => {
                    tracing::warn!(tool = kind.name(), error = %e, "failed to start monitor");
                    None
                }
            };
            self.monitors.push(MonitorHandle {
                kind,
                raw,
                csv,
                child,
            });
        }
    }

    fn start_watcher(&mut self, watcher: DirWatcher) {
        self.watcher = Some(tokio::spawn(watcher.run(self.cancel.subscribe())));
    }

    fn kill_benchmark(&self) {
        if let Some(pid) = self.benchmark_pid {
            match signals::kill_group(pid) {
                Ok(KillOutcome::Signalled) => tracing::info!(pid, "benchmark process group killed"),
                Ok(KillOutcome::AlreadyExited) => tracing::debug!(pid, "benchmark already exited"),
                Err(e) => tracing::error!(pid, error = %e, "failed to kill benchmark process group"),
            }
        }
    }

    /// Tear down the run. Runs its body at most once.
    pub async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        // Normally already reaped; only an early return leaves it set.
        self.kill_benchmark();
        self.benchmark_pid = None;

        for mut stream in self.streams.drain(..) {
            if tokio::time::timeout(STREAM_DRAIN_GRACE, &mut stream).await.is_err() {
                tracing::warn!("output stream did not drain in time");
                stream.abort();
            }
        }

        let _ = self.cancel.send(true);
        if let Some(watcher) = self.watcher.take() {
            match watcher.await {
                Ok(summary) => tracing::debug!(scans = summary.scans, reports = summary.reports, "watcher joined"),
                Err(e) => tracing::warn!(error = %e, "directory watcher task failed"),
            }
        }

        for handle in &mut self.monitors {
            if let Some(mut child) = handle.child.take() {
                if let Some(pid) = child.id() {
                    if let Err(e) = signals::kill_group(pid) {
                        tracing::error!(tool = handle.kind.name(), pid, error = %e, "failed to kill monitor");
                    }
                }
                if let Err(e) = child.wait().await {
                    tracing::warn!(tool = handle.kind.name(), error = %e, "failed to reap monitor");
                }
            }
            if let Err(e) = handle.kind.capture_to_csv(&handle.raw, &handle.csv) {
                tracing::error!(tool = handle.kind.name(), error = %e, "failed to convert monitor output");
            }
        }
    }
}

impl Drop for RunContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!("run context dropped without cleanup, killing children");
        self.kill_benchmark();
        for handle in &self.monitors {
            if let Some(pid) = handle.child.as_ref().and_then(|c| c.id()) {
                let _ = signals::kill_group(pid);
            }
        }
        for stream in &self.streams {
            stream.abort();
        }
        let _ = self.cancel.send(true);
    }
}

/// Copy lines from a child pipe to the console and append them to `log_path`.
fn spawn_stream<R>(reader: R, log_path: PathBuf) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut log = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::error!(path = %log_path.display(), error = %e, "failed to open status log");
                None
            }
        };

        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.last() != Some(&b'\n') {
                        buf.push(b'\n');
                    }
                    // Bytes go to the status log untouched; the terminal gets a lossy copy.
                    print!("{}", String::from_utf8_lossy(&buf));
                    if let Some(file) = log.as_mut() {
                        if let Err(e) = file.write_all(&buf).await {
                            tracing::error!(path = %log_path.display(), error = %e, "status log write failed");
                            log = None;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read benchmark output");
                    break;
                }
            }
        }
    })
}

/// A relative program path with a separator is taken relative to the
/// experiment directory; bare names go through `PATH`.
fn resolve_program(dir: &ExperimentDir, program: &str) -> PathBuf {
    let path = Path::new(program);
    if path.is_relative() && path.components().count() > 1 {
        dir.resolve(path)
    } else {
        path.to_path_buf()
    }
}

enum Ended {
    Exited(std::io::Result<std::process::ExitStatus>),
    Signalled(ShutdownSignal),
}

/// Run one experiment in `dir` until the benchmark exits or `shutdown` resolves.
pub async fn run_experiment<F>(
    config: &HarnessConfig,
    dir: &ExperimentDir,
    shutdown: F,
) -> Result<RunOutcome, RunError>
where
    F: Future<Output = ShutdownSignal>,
{
    dir.init().map_err(|e| RunError::Init { source: e })?;
    let _lock = dir.try_lock().map_err(|e| {
        if e.kind() == std::io::ErrorKind::WouldBlock {
            RunError::Locked { path: dir.lock() }
        } else {
            RunError::Lock {
                path: dir.lock(),
                source: e,
            }
        }
    })?;

    let status_log = dir.status_log();
    std::fs::File::create(&status_log).map_err(|e| RunError::StatusLog {
        path: status_log.clone(),
        source: e,
    })?;

    let invocation = BenchmarkInvocation::from_config(config);
    let kinds = monitor::enabled_monitors(&config.monitor);
    let mut manifest = RunManifest::started(
        invocation.command_line(),
        config.benchmark.mode,
        kinds.iter().map(|k| k.name().to_string()).collect(),
    );
    manifest.write_or_warn(&dir.manifest());

    let mut ctx = RunContext::new();
    ctx.start_monitors(kinds, config.monitor.interval_secs, dir);

    let program = resolve_program(dir, &invocation.program);
    tracing::info!(command = %invocation.command_line(), "spawning benchmark");
    let spawned = Command::new(&program)
        .args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(dir.root())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            ctx.finish().await;
            manifest.finish(RunState::Failed, None);
            manifest.write_or_warn(&dir.manifest());
            return Err(RunError::Spawn {
                program: program.display().to_string(),
                source: e,
            });
        }
    };

    let pid = child.id().unwrap_or(0);
    ctx.benchmark_pid = child.id();
    manifest.benchmark_pid = child.id();
    manifest.write_or_warn(&dir.manifest());
    tracing::info!(pid, "benchmark started");

    if let Some(stdout) = child.stdout.take() {
        ctx.streams.push(spawn_stream(stdout, status_log.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        ctx.streams.push(spawn_stream(stderr, status_log.clone()));
    }
    if let Some(watch_dir) = &config.watch.dir {
        ctx.start_watcher(DirWatcher::new(
            dir.resolve(watch_dir),
            Duration::from_secs(config.watch.poll_interval_secs.max(1)),
            status_log.clone(),
        ));
    }

    let ended = tokio::select! {
        status = child.wait() => Ended::Exited(status),
        signal = shutdown => Ended::Signalled(signal),
    };

    let outcome = match ended {
        Ended::Exited(Ok(status)) => {
            ctx.benchmark_pid = None;
            tracing::info!(pid, exit_code = ?status.code(), "benchmark exited");
            RunOutcome::Completed {
                exit_code: status.code(),
            }
        }
        Ended::Exited(Err(e)) => {
            tracing::error!(pid, error = %e, "failed to wait for benchmark");
            ctx.kill_benchmark();
            ctx.benchmark_pid = None;
            RunOutcome::Completed { exit_code: None }
        }
        Ended::Signalled(signal) => {
            tracing::info!(pid, %signal, "interrupting benchmark");
            ctx.kill_benchmark();
            if let Err(e) = child.wait().await {
                tracing::warn!(pid, error = %e, "failed to reap benchmark");
            }
            ctx.benchmark_pid = None;
            RunOutcome::Interrupted(signal)
        }
    };

    ctx.finish().await;

    match outcome {
        RunOutcome::Completed { exit_code: Some(0) } => manifest.finish(RunState::Completed, Some(0)),
        RunOutcome::Completed { exit_code } => manifest.finish(RunState::Failed, exit_code),
        RunOutcome::Interrupted(_) => manifest.finish(RunState::Interrupted, None),
    }
    manifest.write_or_warn(&dir.manifest());

    Ok(outcome)
}
