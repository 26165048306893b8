use nix::errno::Errno;
use nix::sys::signal::Signal;
use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by shells, commands, pipelines and the function
/// registry.
///
/// Usage errors (calling things in the wrong order) and runtime errors
/// (a child failed, a pipe broke) share this type so that every failure can
/// be routed through [`crate::Shell::handle_error()`]. The type is `Clone`
/// so the same error can be kept as the "last error" of a [`crate::Cmd`]
/// and of its shell while also being returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("already called Cmd::start")]
    AlreadyCalledStart,
    #[error("already called Cmd::wait")]
    AlreadyCalledWait,
    #[error("already set stdin")]
    AlreadySetStdin,
    #[error("did not call Cmd::start")]
    DidNotCallStart,
    #[error("already called Shell::cleanup")]
    AlreadyCalledCleanup,
    #[error("did not call procshell::init_main")]
    DidNotCallInitMain,
    #[error("dir stack is empty")]
    DirStackEmpty,
    #[error("pipeline commands belong to different shells")]
    DifferentShells,
    #[error("process exited")]
    ProcessExited,
    #[error("failed to locate executable: {0}")]
    ExecutableNotFound(String),
    #[error("{0}")]
    Exit(ExitError),
    #[error("write on closed pipe")]
    ClosedPipe,
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),
    #[error("system call failed: {0}")]
    Os(#[from] Errno),
    #[error("{0}")]
    Move(&'static str),

    #[error("function {0:?} is already registered")]
    AlreadyRegistered(String),
    #[error("unknown function {0:?}")]
    UnknownFunction(String),
    #[error("function {name:?} takes {expected} argument(s), got {got}")]
    ArgCount {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("function {name:?}: bad argument {index}: {message}")]
    ArgType {
        name: String,
        index: usize,
        message: String,
    },
    #[error("invocation codec: {0}")]
    Codec(String),
    #[error("function {name:?} failed: {message}")]
    Func { name: String, message: String },
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    /// True if the error reports a child that exited unsuccessfully,
    /// either with a non-zero code or by a signal.
    pub fn is_exit_error(&self) -> bool {
        matches!(self, Error::Exit(_))
    }

    /// True if the error indicates a closed pipe. This is what the first
    /// command of `yes | head -1` sees once `head` has exited: either a
    /// write error in the parent's output copier, or death by `SIGPIPE`.
    pub fn is_closed_pipe(&self) -> bool {
        match self {
            Error::ClosedPipe => true,
            Error::Io(e) => {
                e.kind() == io::ErrorKind::BrokenPipe
                    || e.raw_os_error() == Some(Errno::EPIPE as i32)
            }
            Error::Os(errno) => *errno == Errno::EPIPE,
            Error::Exit(e) => e.signal == Some(Signal::SIGPIPE as i32),
            _ => false,
        }
    }
}

/// Unsuccessful termination of a child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitError {
    pub path: String,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitError {
    pub(crate) fn from_status(path: &str, status: ExitStatus) -> Option<Self> {
        use std::os::unix::process::ExitStatusExt;
        if status.success() {
            return None;
        }
        Some(Self {
            path: path.to_string(),
            code: status.code(),
            signal: status.signal(),
        })
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "{}: exit status {}", self.path, code),
            (None, Some(sig)) => match Signal::try_from(sig) {
                Ok(sig) => write!(f, "{}: killed by {}", self.path, sig),
                Err(_) => write!(f, "{}: killed by signal {}", self.path, sig),
            },
            (None, None) => write!(f, "{}: terminated abnormally", self.path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_pipe_classification() {
        assert!(Error::ClosedPipe.is_closed_pipe());
        assert!(Error::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_closed_pipe());
        assert!(Error::from(io::Error::from_raw_os_error(Errno::EPIPE as i32)).is_closed_pipe());
        let sigpipe = Error::Exit(ExitError {
            path: "yes".into(),
            code: None,
            signal: Some(Signal::SIGPIPE as i32),
        });
        assert!(sigpipe.is_closed_pipe());
        assert!(sigpipe.is_exit_error());

        let exit1 = Error::Exit(ExitError {
            path: "false".into(),
            code: Some(1),
            signal: None,
        });
        assert!(!exit1.is_closed_pipe());
        assert!(exit1.is_exit_error());
        assert_eq!(exit1.to_string(), "false: exit status 1");
        assert!(!Error::ProcessExited.is_closed_pipe());
    }
}
