use crate::cmd::{Cmd, CmdShared};
use crate::envconfig::{inherited_vars, look_path, merge_vars, Vars, ENV_CHILD_OUTPUT_DIR, ENV_INVOCATION};
use crate::error::{Error, Result};
use crate::registry::{called_init_main, Registry};
use crate::signals;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::{NamedTempFile, TempDir, TempPath};

/// Options for [`Shell::new()`].
#[derive(Debug, Clone)]
pub struct ShellOpts {
    /// If false (the default), any error passed to
    /// [`Shell::handle_error()`] panics. Otherwise the error is recorded,
    /// logged, and returned to the caller.
    pub continue_on_error: bool,
    /// Default for [`Cmd::set_propagate_output()`].
    pub propagate_child_output: bool,
    /// Default for [`Cmd::set_output_dir()`]. Defaults to the value of
    /// `PROCSHELL_CHILD_OUTPUT_DIR`, if set.
    pub child_output_dir: Option<PathBuf>,
    /// Clean up and exit on SIGINT, SIGQUIT and SIGTERM.
    pub handle_signals: bool,
    /// How long child process groups get to exit after SIGINT before they
    /// are sent SIGKILL.
    pub cleanup_grace: Duration,
}

impl Default for ShellOpts {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            propagate_child_output: false,
            child_output_dir: std::env::var_os(ENV_CHILD_OUTPUT_DIR)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            handle_signals: true,
            cleanup_grace: Duration::from_secs(1),
        }
    }
}

impl ShellOpts {
    pub fn continue_on_error(mut self, v: bool) -> Self {
        self.continue_on_error = v;
        self
    }

    pub fn propagate_child_output(mut self, v: bool) -> Self {
        self.propagate_child_output = v;
        self
    }

    pub fn child_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.child_output_dir = dir;
        self
    }

    pub fn handle_signals(mut self, v: bool) -> Self {
        self.handle_signals = v;
        self
    }

    pub fn cleanup_grace(mut self, d: Duration) -> Self {
        self.cleanup_grace = d;
        self
    }
}

/// Everything [`Shell::cleanup()`] tears down. Guarded by one lock, which
/// is also held while a child is spawned.
pub(crate) struct ShellState {
    pub(crate) called_cleanup: bool,
    cmds: Vec<Arc<CmdShared>>,
    temp_files: Vec<TempPath>,
    temp_dirs: Vec<TempDir>,
    dir_stack: Vec<PathBuf>,
    cleanup_handlers: Vec<Box<dyn FnOnce() + Send>>,
}

pub(crate) struct ShellInner {
    opts: Mutex<ShellOpts>,
    vars: Mutex<Vars>,
    args: Mutex<Vec<String>>,
    err: Mutex<Option<Error>>,
    state: Mutex<ShellState>,
}

impl ShellInner {
    /// Runs cleanup unless it already ran, and returns the state lock so the
    /// caller can keep other threads out, e.g. until the process exits.
    pub(crate) fn cleanup_and_hold(&self) -> MutexGuard<'_, ShellState> {
        let mut st = self.state.lock();
        if !st.called_cleanup {
            self.cleanup_locked(&mut st);
        }
        st
    }

    fn cleanup_locked(&self, st: &mut ShellState) {
        st.called_cleanup = true;
        let grace = self.opts.lock().cleanup_grace;

        thread::scope(|s| {
            for c in st.cmds.iter().filter(|c| c.is_started()) {
                s.spawn(move || c.cleanup_process_group(grace));
            }
        });
        st.cmds.clear();

        if let Some(dir) = st.dir_stack.first() {
            if let Err(e) = std::env::set_current_dir(dir) {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to restore working directory");
            }
        }
        st.dir_stack.clear();

        for path in st.temp_files.drain(..) {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                tracing::warn!(path = %shown, error = %e, "failed to remove temp file");
            }
        }
        for dir in st.temp_dirs.drain(..) {
            let shown = dir.path().display().to_string();
            if let Err(e) = dir.close() {
                tracing::warn!(path = %shown, error = %e, "failed to remove temp dir");
            }
        }

        while let Some(handler) = st.cleanup_handlers.pop() {
            handler();
        }
        signals::unregister(self);
    }
}

/// A shell: the environment, error policy and resources shared by the
/// commands created from it.
///
/// Clones share everything. Call [`Self::cleanup()`] when done, typically
/// via `defer`-style scoping in tests; it kills leftover children, removes
/// temp files, and restores the working directory.
///
/// ```no_run
/// use procshell::{Shell, ShellOpts};
///
/// let sh = Shell::new(ShellOpts::default());
/// let mut c = sh.cmd("echo", ["hello"]).unwrap();
/// assert_eq!(c.stdout().unwrap(), "hello\n");
/// sh.cleanup();
/// ```
#[derive(Clone)]
pub struct Shell {
    pub(crate) inner: Arc<ShellInner>,
}

impl fmt::Debug for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shell")
            .field("opts", &*self.inner.opts.lock())
            .field("err", &*self.inner.err.lock())
            .finish_non_exhaustive()
    }
}

impl Shell {
    /// Returns a new shell whose vars are a copy of this process's
    /// environment.
    pub fn new(opts: ShellOpts) -> Shell {
        let handle_signals = opts.handle_signals;
        let sh = Shell {
            inner: Arc::new(ShellInner {
                opts: Mutex::new(opts),
                vars: Mutex::new(inherited_vars()),
                args: Mutex::new(Vec::new()),
                err: Mutex::new(None),
                state: Mutex::new(ShellState {
                    called_cleanup: false,
                    cmds: Vec::new(),
                    temp_files: Vec::new(),
                    temp_dirs: Vec::new(),
                    dir_stack: Vec::new(),
                    cleanup_handlers: Vec::new(),
                }),
            }),
        };
        if handle_signals {
            if let Err(e) = signals::register(&sh.inner) {
                tracing::warn!(error = %e, "failed to install signal handlers");
            }
        }
        sh
    }

    /// True if `self` and `other` are clones of the same shell.
    pub fn same(&self, other: &Shell) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn opts(&self) -> ShellOpts {
        self.inner.opts.lock().clone()
    }

    pub fn set_continue_on_error(&self, v: bool) {
        self.inner.opts.lock().continue_on_error = v;
    }

    /// Base environment for commands created from now on.
    pub fn vars(&self) -> Vars {
        self.inner.vars.lock().clone()
    }

    pub fn set_var(&self, k: impl Into<String>, v: impl Into<String>) {
        self.inner.vars.lock().insert(k.into(), v.into());
    }

    pub fn remove_var(&self, k: &str) {
        self.inner.vars.lock().remove(k);
    }

    /// Arguments appended to every command created from now on.
    pub fn args(&self) -> Vec<String> {
        self.inner.args.lock().clone()
    }

    pub fn set_args<I, S>(&self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.inner.args.lock() = args.into_iter().map(Into::into).collect();
    }

    /// The most recent error passed to [`Self::handle_error()`], cleared by
    /// the next successful operation.
    pub fn err(&self) -> Option<Error> {
        self.inner.err.lock().clone()
    }

    /// Panics if [`Self::cleanup()`] has been called. Every other method
    /// calls this first.
    pub fn ok(&self) {
        if self.inner.state.lock().called_cleanup {
            panic!("procshell: {}", Error::AlreadyCalledCleanup);
        }
    }

    /// The single place errors are reported. Records `err` as the shell's
    /// last error and logs it, then panics unless
    /// [`ShellOpts::continue_on_error`] is set, in which case the error is
    /// returned for the caller to propagate.
    pub fn handle_error(&self, err: Error) -> Error {
        self.ok();
        *self.inner.err.lock() = Some(err.clone());
        if !self.inner.opts.lock().continue_on_error {
            tracing::error!(error = %err, "fatal error");
            panic!("procshell: {}", err);
        }
        tracing::warn!(error = %err, "error");
        err
    }

    pub(crate) fn handle<T>(&self, res: Result<T>) -> Result<T> {
        match res {
            Ok(v) => {
                *self.inner.err.lock() = None;
                Ok(v)
            }
            Err(e) => Err(self.handle_error(e)),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ShellState> {
        self.inner.state.lock()
    }

    pub(crate) fn register_cmd(&self, c: Arc<CmdShared>) -> Result<()> {
        let mut st = self.inner.state.lock();
        if st.called_cleanup {
            return Err(Error::AlreadyCalledCleanup);
        }
        st.cmds.push(c);
        Ok(())
    }

    /// Returns a command for the executable `name` with the given
    /// arguments. A bare name is looked up in the shell's PATH.
    pub fn cmd<I, S>(&self, name: &str, args: I) -> Result<Cmd>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ok();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let res = look_path(&self.vars(), name).and_then(|path| self.cmd_inner(Vars::new(), path, args));
        self.handle(res)
    }

    /// Returns a command that runs the function registered as `name` in
    /// `registry`, in a child re-executing the current binary. `args` is
    /// normally a tuple of the arguments; see [`Registry::encode()`] for how
    /// other values are read, and why a lone `Vec` or `Option` argument
    /// needs a 1-tuple.
    ///
    /// Requires [`crate::init_main()`] to have been called with the same
    /// registry.
    pub fn fn_cmd<A: Serialize>(&self, registry: &Registry, name: &str, args: A) -> Result<Cmd> {
        self.ok();
        let res = self.fn_cmd_inner(registry, name, args);
        self.handle(res)
    }

    fn fn_cmd_inner<A: Serialize>(&self, registry: &Registry, name: &str, args: A) -> Result<Cmd> {
        if !called_init_main() {
            return Err(Error::DidNotCallInitMain);
        }
        let invocation = registry.encode(name, args)?;
        let exe = std::env::current_exe()?;
        let vars = Vars::from([(ENV_INVOCATION.to_string(), invocation)]);
        self.cmd_inner(vars, exe, Vec::new())
    }

    fn cmd_inner(&self, vars: Vars, path: PathBuf, mut args: Vec<String>) -> Result<Cmd> {
        args.extend(self.args());
        let vars = merge_vars([&self.vars(), &vars]);
        let mut c = Cmd::new_internal(self.clone(), vars, path, args)?;
        let opts = self.opts();
        c.set_propagate_output(opts.propagate_child_output)
            .set_output_dir(opts.child_output_dir);
        Ok(c)
    }

    /// Waits for every command that was started but not yet waited for.
    /// Returns the last error encountered, after all of them exited.
    pub fn wait(&self) -> Result<()> {
        self.ok();
        let cmds = self.inner.state.lock().cmds.clone();
        let mut res = Ok(());
        for c in cmds.iter().filter(|c| c.is_waitable()) {
            let err = c.record(c.wait().err());
            if let Some(e) = err {
                tracing::warn!(path = c.path(), pid = ?c.pid(), error = %e, "command failed");
                res = Err(e);
            }
        }
        self.handle(res)
    }

    /// Creates a temp file, removed on cleanup.
    pub fn make_temp_file(&self) -> Result<(File, PathBuf)> {
        self.ok();
        let res = NamedTempFile::new().map_err(Error::from).map(|f| {
            let (file, path) = f.into_parts();
            let p = path.to_path_buf();
            self.inner.state.lock().temp_files.push(path);
            (file, p)
        });
        self.handle(res)
    }

    /// Creates a temp directory, removed with its contents on cleanup.
    pub fn make_temp_dir(&self) -> Result<PathBuf> {
        self.ok();
        let res = TempDir::new().map_err(Error::from).map(|d| {
            let p = d.path().to_path_buf();
            self.inner.state.lock().temp_dirs.push(d);
            p
        });
        self.handle(res)
    }

    /// Changes into `dir`, remembering the current directory for
    /// [`Self::popd()`]. Cleanup returns to the directory the first pushd
    /// started from. The working directory is process-wide, so shells that
    /// push and pop concurrently will interfere.
    pub fn pushd(&self, dir: impl AsRef<Path>) -> Result<()> {
        self.ok();
        let res = (|| -> Result<()> {
            let cwd = std::env::current_dir()?;
            std::env::set_current_dir(dir.as_ref())?;
            self.inner.state.lock().dir_stack.push(cwd);
            Ok(())
        })();
        self.handle(res)
    }

    pub fn popd(&self) -> Result<()> {
        self.ok();
        let res = (|| -> Result<()> {
            let mut st = self.inner.state.lock();
            let dir = st.dir_stack.last().ok_or(Error::DirStackEmpty)?;
            std::env::set_current_dir(dir)?;
            st.dir_stack.pop();
            Ok(())
        })();
        self.handle(res)
    }

    /// Registers `f` to run on cleanup. Handlers run in reverse order of
    /// registration. They run with the shell's state locked and must not
    /// call back into the shell.
    pub fn add_cleanup_handler(&self, f: impl FnOnce() + Send + 'static) {
        self.ok();
        self.inner.state.lock().cleanup_handlers.push(Box::new(f));
    }

    /// Moves a file, falling back to copy-and-delete across filesystems.
    /// Directories are not supported, `new` must not exist, and its parent
    /// must.
    pub fn move_file(&self, old: impl AsRef<Path>, new: impl AsRef<Path>) -> Result<()> {
        self.ok();
        let res = move_file(old.as_ref(), new.as_ref());
        self.handle(res)
    }

    /// Kills leftover child process groups, restores the working directory,
    /// removes temp files and directories, then runs cleanup handlers.
    /// Idempotent and safe to call concurrently. Afterwards every other
    /// method panics.
    pub fn cleanup(&self) {
        drop(self.inner.cleanup_and_hold());
    }
}

fn move_file(old: &Path, new: &Path) -> Result<()> {
    if fs::metadata(old)?.is_dir() {
        return Err(Error::Move("moving a directory is not supported"));
    }
    if fs::symlink_metadata(new).is_ok() {
        return Err(Error::Move("destination file must not exist"));
    }
    let parent_exists = match new.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.is_dir(),
        _ => true,
    };
    if !parent_exists {
        return Err(Error::Move("destination file's parent directory must exist"));
    }
    if let Err(e) = fs::rename(old, new) {
        tracing::debug!(error = %e, "rename failed, copying instead");
        fs::copy(old, new)?;
        fs::remove_file(old)?;
    }
    Ok(())
}
