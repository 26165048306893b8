use crate::error::{Error, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::{getppid, pipe2, Pid};
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread;
use std::time::Duration;

const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

// returns (read_end_fd, write_end_fd) of a pipe with CLOEXEC flag set
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    Ok(pipe2(OFlag::O_CLOEXEC)?)
}

/// Puts the child into a new process group led by itself, so that it and
/// everything it spawns can be signaled together.
pub(crate) fn configure_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

/// True if this process has been reparented to init.
pub(crate) fn is_orphaned() -> bool {
    getppid() == Pid::from_raw(1)
}

/// A started child, addressed by pid. The child leads its own process
/// group, so the pid doubles as the group id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProcessHandle {
    pid: Pid,
}

impl ProcessHandle {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
        }
    }

    pub(crate) fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// Signals the process itself. A process that has already gone away is
    /// not an error.
    pub(crate) fn signal(&self, sig: Signal) -> Result<()> {
        match kill(self.pid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(Error::Os(e)),
        }
    }

    fn group_alive(&self) -> bool {
        killpg(self.pid, None::<Signal>) != Err(Errno::ESRCH)
    }

    /// Sends SIGINT to the whole process group, then SIGKILL to whatever is
    /// still alive after `grace`.
    pub(crate) fn shutdown_group(&self, grace: Duration) {
        if killpg(self.pid, Signal::SIGINT) == Err(Errno::ESRCH) {
            return;
        }
        let mut waited = Duration::ZERO;
        while waited < grace {
            thread::sleep(GROUP_POLL_INTERVAL);
            waited += GROUP_POLL_INTERVAL;
            if !self.group_alive() {
                return;
            }
        }
        tracing::debug!(pgid = self.pid.as_raw(), "process group still alive, sending SIGKILL");
        _ = killpg(self.pid, Signal::SIGKILL);
    }
}
