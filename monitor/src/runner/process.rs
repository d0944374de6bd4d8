//! Ownership wrapper around one native process

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::MonitorError;

/// Exit code reported when the process was terminated by [`RunnerProcess::kill`].
///
/// No real process can report it: unix codes are 0..=255 (or 128 + signal)
/// and windows codes are u32 values reinterpreted as i32, which never hit MIN
/// for a process that was not killed.
pub const PROCESS_TERMINATED_EXIT_CODE: i32 = i32::MIN;

/// Cloneable trigger that asks a runner to kill its process.
///
/// It never touches the OS handle itself, so firing it after the runner is
/// gone has no effect.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    token: CancellationToken,
}

impl KillSwitch {
    /// Request termination; idempotent and non-blocking
    pub fn kill(&self) {
        self.token.cancel();
    }
}

struct ChildSlot {
    child: Option<Child>,
    exit_code: Option<i32>,
}

/// Exclusive owner of one spawned process
pub struct RunnerProcess {
    pid: Option<u32>,
    slot: Mutex<ChildSlot>,
    kill_switch: KillSwitch,
    closed: AtomicBool,
}

impl RunnerProcess {
    /// Spawn `command` and take ownership of the child
    pub fn spawn(mut command: Command) -> Result<Self, MonitorError> {
        command.kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|e| MonitorError::ProcessError(format!("Failed to spawn process: {}", e)))?;
        Ok(Self::from_child(child))
    }

    /// Wrap an already spawned child
    pub fn from_child(child: Child) -> Self {
        Self {
            pid: child.id(),
            slot: Mutex::new(ChildSlot {
                child: Some(child),
                exit_code: None,
            }),
            kill_switch: KillSwitch::default(),
            closed: AtomicBool::new(false),
        }
    }

    /// OS process id, if the process was still running when wrapped
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Handle for cancellation callbacks
    pub fn kill_switch(&self) -> KillSwitch {
        self.kill_switch.clone()
    }

    /// Forcefully terminate the process.
    ///
    /// Safe to call any number of times, from any thread, before or after the
    /// process exited.
    pub fn kill(&self) {
        self.kill_switch.kill();
    }

    /// Wait until the process exits.
    ///
    /// Returns the real exit code on natural exit and
    /// [`PROCESS_TERMINATED_EXIT_CODE`] when [`kill`](Self::kill) ended a
    /// process that was still running.
    /// Once an outcome was observed, later calls return the same outcome.
    pub async fn wait_for_exit(&self) -> Result<i32, MonitorError> {
        let mut slot = self.slot.lock().await;
        if let Some(code) = slot.exit_code {
            return Ok(code);
        }

        let child = slot
            .child
            .as_mut()
            .ok_or_else(|| MonitorError::ProcessError("process handle is closed".to_string()))?;

        let code = tokio::select! {
            biased;
            _ = self.kill_switch.token.cancelled() => terminate(child, self.pid).await?,
            status = child.wait() => exit_code(status?),
        };

        slot.exit_code = Some(code);
        Ok(code)
    }

    /// Close the OS handle.
    ///
    /// Refuses while a wait is in flight. A still running process is killed.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), MonitorError> {
        let mut slot = self
            .slot
            .try_lock()
            .map_err(|_| MonitorError::ProcessError("cannot close while waiting".to_string()))?;

        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Some(child) = slot.child.take() {
            release_child(child, self.pid);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(child) = self.slot.get_mut().child.take() {
            release_child(child, self.pid);
        }
    }
}

/// Kill a child unless it already exited on its own
async fn terminate(child: &mut Child, pid: Option<u32>) -> Result<i32, MonitorError> {
    if let Some(status) = child.try_wait()? {
        debug!("Pid {:?} exited before the kill", pid);
        return Ok(exit_code(status));
    }

    if let Err(e) = child.start_kill() {
        debug!("Kill of pid {:?} ignored: {}", pid, e);
    }
    let status = child.wait().await?;
    Ok(if ended_by_kill(status) {
        PROCESS_TERMINATED_EXIT_CODE
    } else {
        exit_code(status)
    })
}

fn release_child(mut child: Child, pid: Option<u32>) {
    if let Ok(None) = child.try_wait() {
        debug!("Closing pid {:?} while it still runs, killing it", pid);
        let _ = child.start_kill();
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// A process that exited with a code raced the kill and won
#[cfg(unix)]
fn ended_by_kill(status: ExitStatus) -> bool {
    status.code().is_none()
}

#[cfg(not(unix))]
fn ended_by_kill(_status: ExitStatus) -> bool {
    true
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn test_natural_exit_reports_real_code() {
        let runner = RunnerProcess::spawn(shell("exit 3")).unwrap();
        assert_eq!(runner.wait_for_exit().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kill_before_exit_reports_sentinel() {
        let runner = RunnerProcess::spawn(shell("sleep 30")).unwrap();
        runner.kill();
        assert_eq!(
            runner.wait_for_exit().await.unwrap(),
            PROCESS_TERMINATED_EXIT_CODE
        );
    }

    #[tokio::test]
    async fn test_kill_during_wait_unblocks_it() {
        let runner = std::sync::Arc::new(RunnerProcess::spawn(shell("sleep 30")).unwrap());
        let kill_switch = runner.kill_switch();

        let waiter = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.wait_for_exit().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        kill_switch.kill();

        let code = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, PROCESS_TERMINATED_EXIT_CODE);
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_harmless() {
        let runner = RunnerProcess::spawn(shell("exit 0")).unwrap();
        assert_eq!(runner.wait_for_exit().await.unwrap(), 0);

        runner.kill();
        runner.kill();
        assert_eq!(runner.wait_for_exit().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_kill_after_unobserved_exit_reports_real_code() {
        let runner = RunnerProcess::spawn(shell("exit 5")).unwrap();
        // Exited on its own, nobody waited yet
        tokio::time::sleep(Duration::from_millis(300)).await;

        runner.kill();
        assert_eq!(runner.wait_for_exit().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_close_is_single_shot() {
        let runner = RunnerProcess::spawn(shell("exit 0")).unwrap();
        runner.wait_for_exit().await.unwrap();

        runner.close().unwrap();
        runner.close().unwrap();
        assert!(runner.is_closed());
    }

    #[tokio::test]
    async fn test_wait_after_close_fails() {
        let runner = RunnerProcess::spawn(shell("sleep 30")).unwrap();
        runner.close().unwrap();
        assert!(runner.wait_for_exit().await.is_err());
    }
}
