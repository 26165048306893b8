//! Cleanup on SIGINT, SIGQUIT and SIGTERM.
//!
//! The handler only writes the signal number to a pipe. A dispatcher thread
//! reads it, cleans up every live shell, and exits with status 1.

use crate::error::Result;
use crate::shell::ShellInner;
use crate::sys::cloexec_pipe;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, BorrowedFd, IntoRawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

const HANDLED: [Signal; 3] = [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM];

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static INSTALLED: OnceLock<Result<()>> = OnceLock::new();
static SHELLS: Mutex<Vec<Weak<ShellInner>>> = parking_lot::const_mutex(Vec::new());

extern "C" fn on_signal(sig: nix::libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // SAFETY: the write end is never closed once published; write(2) is
        // async-signal-safe.
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        _ = nix::unistd::write(fd, &[sig as u8]);
    }
}

fn install() -> Result<()> {
    let (r, w) = cloexec_pipe()?;
    // A full pipe must not block the handler; the dispatcher only needs one
    // byte to act.
    fcntl(w.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    WRITE_FD.store(w.into_raw_fd(), Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for sig in HANDLED {
        // SAFETY: on_signal only performs an async-signal-safe write.
        unsafe { sigaction(sig, &action) }?;
    }
    let read = File::from(r);
    thread::Builder::new()
        .name("procshell-signals".to_string())
        .spawn(move || dispatch(read))?;
    Ok(())
}

fn dispatch(mut read: File) {
    let mut buf = [0u8; 1];
    loop {
        match read.read(&mut buf) {
            Ok(0) => return,
            Ok(_) => on_dispatch(buf[0] as i32),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!(error = %e, "signal pipe failed");
                return;
            }
        }
    }
}

fn on_dispatch(signo: i32) {
    let Ok(sig) = Signal::try_from(signo) else {
        return;
    };
    let shells: Vec<Arc<ShellInner>> = SHELLS.lock().iter().filter_map(Weak::upgrade).collect();
    if shells.is_empty() {
        // Nothing to clean up; die the way we would have without a handler.
        // SAFETY: restores the default disposition.
        _ = unsafe { sigaction(sig, &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty())) };
        _ = raise(sig);
        return;
    }
    tracing::info!(signal = %sig, shells = shells.len(), "received signal, cleaning up");
    // Keep every shell locked until exit, so no other thread starts a child
    // after its shell was cleaned up.
    let _guards: Vec<_> = shells.iter().map(|sh| sh.cleanup_and_hold()).collect();
    std::process::exit(1);
}

/// Installs the handlers on first use and adds `sh` to the shells cleaned up
/// on a signal.
pub(crate) fn register(sh: &Arc<ShellInner>) -> Result<()> {
    INSTALLED.get_or_init(install).clone()?;
    let mut shells = SHELLS.lock();
    shells.retain(|w| w.strong_count() > 0);
    shells.push(Arc::downgrade(sh));
    Ok(())
}

pub(crate) fn unregister(sh: &ShellInner) {
    SHELLS
        .lock()
        .retain(|w| w.strong_count() > 0 && !std::ptr::eq(w.as_ptr(), sh));
}
