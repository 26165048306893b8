//! Functions meant to be called from a child process spawned by a
//! [`crate::Shell`].

use crate::envconfig::{Vars, ENV_EXIT_AFTER, ENV_WATCH_PARENT};
use crate::msg::Msg;
use crate::sys::is_orphaned;
use std::io::Write;
use std::thread;
use std::time::Duration;

const WATCH_PARENT_INTERVAL: Duration = Duration::from_secs(1);

fn send(msg: Msg) {
    let mut stderr = std::io::stderr().lock();
    _ = stderr.write_all(&msg.encode());
    _ = stderr.flush();
}

/// Tells the parent that this child is "ready", e.g. ready to serve
/// requests. See [`crate::Cmd::await_ready()`].
pub fn send_ready() {
    send(Msg::Ready);
}

/// Sends the given vars to the parent. See [`crate::Cmd::await_vars()`].
pub fn send_vars(vars: Vars) {
    send(Msg::Vars { vars });
}

/// Starts a thread that periodically checks whether the parent has exited
/// and, if so, exits this process.
pub fn watch_parent() {
    thread::spawn(|| loop {
        if is_orphaned() {
            tracing::error!("parent process has exited");
            std::process::exit(1);
        }
        thread::sleep(WATCH_PARENT_INTERVAL);
    });
}

/// Calls [`watch_parent()`] iff this process was spawned by a shell that
/// asked for it. The request is removed from the environment, so that
/// grandchildren only watch their parent if their own shell asks again.
pub fn maybe_watch_parent() {
    if std::env::var_os(ENV_WATCH_PARENT).is_some() {
        std::env::remove_var(ENV_WATCH_PARENT);
        watch_parent();
    }
}

/// Starts a thread that exits this process once `d` has elapsed.
pub fn exit_after(d: Duration) {
    thread::spawn(move || {
        thread::sleep(d);
        tracing::error!(after = ?d, "exiting after deadline");
        std::process::exit(1);
    });
}

/// Applies the watch-parent and exit-after settings passed down by the
/// spawning shell. Children that are not started through
/// [`crate::init_main()`] should call this early in `main`.
pub fn init_child_main() {
    maybe_watch_parent();
    if let Some(v) = std::env::var_os(ENV_EXIT_AFTER) {
        std::env::remove_var(ENV_EXIT_AFTER);
        match v.to_str().and_then(|s| s.parse::<u64>().ok()) {
            Some(ms) => exit_after(Duration::from_millis(ms)),
            None => tracing::warn!(value = ?v, "ignoring malformed {}", ENV_EXIT_AFTER),
        }
    }
}
