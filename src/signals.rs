/// Signal handling for a run.
///
/// SIGINT (Ctrl-C) and SIGTERM both end the run early: the benchmark is
/// killed and the normal cleanup path runs. Children are started in their own
/// process groups and are stopped by signalling the whole group.
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, SignalKind};

/// Which signal ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Install SIGINT/SIGTERM listeners and wait for the first one to arrive.
///
/// Listeners are installed when the future is first polled.
pub async fn wait_for_shutdown() -> std::io::Result<ShutdownSignal> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let received = tokio::select! {
        _ = interrupt.recv() => ShutdownSignal::Interrupt,
        _ = terminate.recv() => ShutdownSignal::Terminate,
    };
    tracing::info!(signal = %received, "shutdown signal received");
    Ok(received)
}

/// Outcome of signalling a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    Signalled,
    /// The group no longer exists; nothing to do.
    AlreadyExited,
}

/// Send SIGKILL to the process group led by `pid`.
pub fn kill_group(pid: u32) -> Result<KillOutcome, Errno> {
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => Ok(KillOutcome::Signalled),
        Err(Errno::ESRCH) => Ok(KillOutcome::AlreadyExited),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_kill_group_stops_grandchildren() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30; wait")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert_eq!(kill_group(pid).unwrap(), KillOutcome::Signalled);
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("killed group should exit promptly")
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_kill_group_after_exit() {
        let mut child = Command::new("true").process_group(0).spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert_eq!(kill_group(pid).unwrap(), KillOutcome::AlreadyExited);
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_on_sigterm() {
        let waiter = tokio::spawn(wait_for_shutdown());
        // Let the listeners install before raising.
        tokio::time::sleep(Duration::from_millis(100)).await;
        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got, ShutdownSignal::Terminate);
    }
}
