use crate::buffered_pipe::BufferedPipe;
use crate::envconfig::{Vars, ENV_EXIT_AFTER, ENV_WATCH_PARENT};
use crate::error::{Error, ExitError, Result};
use crate::ioconfig::{BoxWriter, Close, LockedWriter, PipeReadEnd, SharedWriter, Tee};
use crate::msg::{Msg, MessageScanner};
use crate::ring_buffer::HeadTail;
use crate::shell::Shell;
use crate::sys::{configure_process_group, ProcessHandle};
use nix::sys::signal::Signal;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const HEAD_TAIL_CAPACITY: usize = 1 << 15;
const OUTPUT_SEPARATOR: &str = "----------------------------------------";

/// Lifecycle of a [`Cmd`]. Each step is only reachable from the previous
/// one; a command whose start failed stays `Created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdState {
    Created,
    Started,
    Exited,
    Waited,
}

#[derive(Clone, Copy)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

enum Stdin {
    Null,
    Pipe(BufferedPipe),
    Reader(Box<dyn Read + Send>),
    Fd(PipeReadEnd),
}

struct ProcState {
    started: bool,
    handle: Option<ProcessHandle>,
    reaped: bool,
    exited: bool,
    called_wait: bool,
    ready: bool,
    recv_vars: Vars,
    result: Option<Result<()>>,
    err: Option<Error>,
    exit_error_is_ok: bool,
    ignore_closed_pipe_error: bool,
}

/// The part of a command that outlives the caller's `&mut Cmd`: it is
/// shared with the thread watching the child exit and with the owning
/// shell, which may tear the process down from a signal handler thread.
pub(crate) struct CmdShared {
    path: String,
    state: Mutex<ProcState>,
    cond: Condvar,
    group_cleaned: Mutex<bool>,
}

impl CmdShared {
    fn new(path: String) -> Self {
        Self {
            path,
            state: Mutex::new(ProcState {
                started: false,
                handle: None,
                reaped: false,
                exited: false,
                called_wait: false,
                ready: false,
                recv_vars: Vars::new(),
                result: None,
                err: None,
                exit_error_is_ok: false,
                ignore_closed_pipe_error: false,
            }),
            cond: Condvar::new(),
            group_cleaned: Mutex::new(false),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn pid(&self) -> Option<i32> {
        self.state.lock().handle.map(|h| h.pid())
    }

    /// True if started and not yet waited for.
    pub(crate) fn is_waitable(&self) -> bool {
        let st = self.state.lock();
        st.started && !st.called_wait
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state.lock().started
    }

    /// Records `err` as the last error, after dropping closed-pipe errors
    /// if so configured. Returns the error if it should be reported, i.e.
    /// unless it is an exit error and exit errors are ok.
    pub(crate) fn record(&self, err: Option<Error>) -> Option<Error> {
        let mut st = self.state.lock();
        let err = err.filter(|e| !(st.ignore_closed_pipe_error && e.is_closed_pipe()));
        st.err = err.clone();
        err.filter(|e| !(st.exit_error_is_ok && e.is_exit_error()))
    }

    pub(crate) fn wait(&self) -> Result<()> {
        let mut st = self.state.lock();
        if !st.started {
            return Err(Error::DidNotCallStart);
        }
        if st.called_wait {
            return Err(Error::AlreadyCalledWait);
        }
        st.called_wait = true;
        loop {
            if let Some(res) = st.result.take() {
                return res;
            }
            self.cond.wait(&mut st);
        }
    }

    /// Shuts down whatever is left of the child's process group. Runs at
    /// most once, either after the child exits or during shell cleanup.
    pub(crate) fn cleanup_process_group(&self, grace: Duration) {
        let Some(handle) = self.state.lock().handle else {
            return;
        };
        let mut cleaned = self.group_cleaned.lock();
        if *cleaned {
            return;
        }
        *cleaned = true;
        handle.shutdown_group(grace);
    }

    fn check_running(&self) -> Result<()> {
        let st = self.state.lock();
        if !st.started {
            return Err(Error::DidNotCallStart);
        }
        if st.called_wait {
            return Err(Error::AlreadyCalledWait);
        }
        Ok(())
    }

    fn receive(&self, msgs: Vec<Msg>) {
        let mut st = self.state.lock();
        for msg in msgs {
            match msg {
                Msg::Ready => st.ready = true,
                Msg::Vars { vars } => st.recv_vars.extend(vars),
            }
        }
        self.cond.notify_all();
    }
}

/// Feeds a child's stderr to the message scanner.
struct RecvWriter {
    scanner: MessageScanner,
    shared: Arc<CmdShared>,
}

impl Write for RecvWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let msgs = self.scanner.feed(buf);
        if !msgs.is_empty() {
            self.shared.receive(msgs);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A command to run as a child process, created by [`Shell::cmd()`] or
/// [`Shell::fn_cmd()`].
///
/// Configure it (arguments, environment, stdio) before calling
/// [`Self::start()`]; once started only waiting, signaling and awaiting
/// child messages are allowed. Every fallible method reports its error
/// through [`Shell::handle_error()`], which panics unless the shell was
/// created with [`crate::ShellOpts::continue_on_error`].
///
/// The child gets its own process group. Its stdout and stderr are always
/// captured in bounded head/tail buffers, printed if the command fails
/// fatally; stderr is also scanned for messages sent with
/// [`crate::child::send_vars()`] and [`crate::child::send_ready()`].
pub struct Cmd {
    sh: Shell,
    shared: Arc<CmdShared>,
    path: PathBuf,
    // args[0] is the resolved path, so that a child started by a shell can
    // reliably find its own executable.
    args: Vec<String>,
    vars: Vars,
    ignore_parent_exit: bool,
    exit_after: Option<Duration>,
    propagate_output: bool,
    output_dir: Option<PathBuf>,
    called_start: bool,
    stdin: Stdin,
    stdout_writers: Vec<BoxWriter>,
    stderr_writers: Vec<BoxWriter>,
    after_wait_closers: Vec<Box<dyn Close>>,
    stdout_head_tail: Arc<Mutex<HeadTail>>,
    stderr_head_tail: Arc<Mutex<HeadTail>>,
}

impl fmt::Debug for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cmd")
            .field("path", &self.path)
            .field("args", &self.args)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish()
    }
}

impl Drop for Cmd {
    fn drop(&mut self) {
        // Readers of pipes from a command that never ran would block forever.
        if !self.shared.is_started() {
            self.close_after_wait_closers();
        }
    }
}

impl Cmd {
    pub(crate) fn new_internal(
        sh: Shell,
        vars: Vars,
        path: PathBuf,
        args: Vec<String>,
    ) -> Result<Self> {
        let path_str = path.to_string_lossy().into_owned();
        let shared = Arc::new(CmdShared::new(path_str.clone()));
        sh.register_cmd(shared.clone())?;
        let mut all_args = vec![path_str];
        all_args.extend(args);
        Ok(Self {
            sh,
            shared,
            path,
            args: all_args,
            vars,
            ignore_parent_exit: false,
            exit_after: None,
            propagate_output: false,
            output_dir: None,
            called_start: false,
            stdin: Stdin::Null,
            stdout_writers: Vec::new(),
            stderr_writers: Vec::new(),
            after_wait_closers: Vec::new(),
            stdout_head_tail: Arc::new(Mutex::new(HeadTail::new(HEAD_TAIL_CAPACITY))),
            stderr_head_tail: Arc::new(Mutex::new(HeadTail::new(HEAD_TAIL_CAPACITY))),
        })
    }

    /// The shell this command was created from.
    pub fn shell(&self) -> &Shell {
        &self.sh
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Arguments, starting with the resolved path.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// The environment the child will get (before the shell adds its
    /// reserved variables).
    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(&mut self, k: impl Into<String>, v: impl Into<String>) -> &mut Self {
        self.vars.insert(k.into(), v.into());
        self
    }

    pub fn env_remove(&mut self, k: &str) -> &mut Self {
        self.vars.remove(k);
        self
    }

    /// If set, the child does not exit when its parent exits. Only takes
    /// effect for children that call [`crate::child::init_child_main()`]
    /// (which [`crate::init_main()`] does).
    pub fn set_ignore_parent_exit(&mut self, v: bool) -> &mut Self {
        self.ignore_parent_exit = v;
        self
    }

    /// Makes the child exit once `d` has elapsed. Same caveat as
    /// [`Self::set_ignore_parent_exit()`].
    pub fn set_exit_after(&mut self, d: Option<Duration>) -> &mut Self {
        self.exit_after = d;
        self
    }

    /// Also copy the child's stdout and stderr to ours.
    pub fn set_propagate_output(&mut self, v: bool) -> &mut Self {
        self.propagate_output = v;
        self
    }

    /// Also copy the child's stdout and stderr to timestamped files in
    /// `dir`.
    pub fn set_output_dir(&mut self, dir: Option<PathBuf>) -> &mut Self {
        self.output_dir = dir;
        self
    }

    /// Whether a non-zero exit (or death by signal) is reported as an
    /// error through the shell. The error is still available from
    /// [`Self::err()`].
    pub fn set_exit_error_is_ok(&mut self, v: bool) -> &mut Self {
        self.shared.state.lock().exit_error_is_ok = v;
        self
    }

    /// Whether closed-pipe errors count as success. These happen in
    /// pipelines such as `yes | head -1`, where `yes` gets a closed pipe
    /// (or dies of SIGPIPE) after `head` exits. [`crate::Pipeline`] turns
    /// this on for every stage.
    pub fn set_ignore_closed_pipe_error(&mut self, v: bool) -> &mut Self {
        self.shared.state.lock().ignore_closed_pipe_error = v;
        self
    }

    /// The most recent error from this command, if any.
    pub fn err(&self) -> Option<Error> {
        self.shared.state.lock().err.clone()
    }

    /// The child's pid, once started.
    pub fn pid(&self) -> Option<i32> {
        self.shared.pid()
    }

    pub fn state(&self) -> CmdState {
        let st = self.shared.state.lock();
        match (st.started, st.exited, st.called_wait) {
            (false, _, _) => CmdState::Created,
            (true, _, true) => CmdState::Waited,
            (true, true, false) => CmdState::Exited,
            (true, false, false) => CmdState::Started,
        }
    }

    /// Head and tail of everything the child wrote to stdout so far.
    pub fn captured_stdout(&self) -> String {
        self.stdout_head_tail.lock().to_string()
    }

    /// Head and tail of everything the child wrote to stderr so far.
    pub fn captured_stderr(&self) -> String {
        self.stderr_head_tail.lock().to_string()
    }

    /// Returns a new command with a copy of this command's configuration.
    /// Stdio attachments are not copied.
    pub fn clone_cmd(&self) -> Result<Cmd> {
        self.sh.ok();
        let res = self.clone_inner();
        self.handle_value(res)
    }

    /// Returns the write end of an unbounded pipe feeding the child's
    /// stdin. Writes never block. The pipe is closed once the child exits,
    /// but may be closed earlier, e.g. for a child that runs until its
    /// stdin is closed. Repeated calls return the same pipe. Must be called
    /// before start, and not together with [`Self::set_stdin_reader()`].
    pub fn stdin_pipe(&mut self) -> Result<BufferedPipe> {
        self.sh.ok();
        let res = self.stdin_pipe_inner();
        self.handle_value(res)
    }

    /// Copies `r` to the child's stdin. Must be called before start, and
    /// at most once.
    pub fn set_stdin_reader(&mut self, r: impl Read + Send + 'static) -> Result<()> {
        self.sh.ok();
        let res = self.set_stdin(Stdin::Reader(Box::new(r)));
        self.handle(res)
    }

    /// Feeds `bytes` to the child's stdin, then closes it.
    pub fn set_stdin_bytes(&mut self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.set_stdin_reader(io::Cursor::new(bytes.into()))
    }

    /// Returns the read end of an unbounded pipe receiving the child's
    /// stdout. Closed once the child exits. May be called more than once;
    /// each call creates a new pipe. Must be called before start.
    pub fn stdout_pipe(&mut self) -> Result<BufferedPipe> {
        self.sh.ok();
        let res = self.output_pipe(Stream::Stdout);
        self.handle_value(res)
    }

    /// Like [`Self::stdout_pipe()`], for stderr.
    pub fn stderr_pipe(&mut self) -> Result<BufferedPipe> {
        self.sh.ok();
        let res = self.output_pipe(Stream::Stderr);
        self.handle_value(res)
    }

    /// Tees the child's stdout to `w`. Must be called before start.
    /// Writes to stdout and stderr sinks are serialized, so a writer added
    /// to both (e.g. two clones of one [`BufferedPipe`]) never sees
    /// concurrent writes and gets bytes in the order they were read.
    pub fn add_stdout_writer(&mut self, w: impl Write + Send + 'static) -> Result<()> {
        self.sh.ok();
        let res = self.add_writer(Stream::Stdout, Box::new(w));
        self.handle(res)
    }

    /// Tees the child's stderr to `w`. See [`Self::add_stdout_writer()`].
    pub fn add_stderr_writer(&mut self, w: impl Write + Send + 'static) -> Result<()> {
        self.sh.ok();
        let res = self.add_writer(Stream::Stderr, Box::new(w));
        self.handle(res)
    }

    pub fn start(&mut self) -> Result<()> {
        self.sh.ok();
        let res = self.start_inner();
        self.handle(res)
    }

    /// Blocks until the child sends a ready message. Fails if the child
    /// exits first. Must be called after start and before wait.
    pub fn await_ready(&self) -> Result<()> {
        self.sh.ok();
        let res = self.await_inner(|st| st.ready.then_some(()));
        self.handle_value(res)
    }

    /// Blocks until the child has sent values for all of `keys`, and
    /// returns them. Fails if the child exits first, even if some of the
    /// keys were received. Must be called after start and before wait.
    pub fn await_vars(&self, keys: &[&str]) -> Result<Vars> {
        self.sh.ok();
        let wanted: BTreeSet<&str> = keys.iter().copied().collect();
        let res = self.await_inner(|st| {
            let got: Vars = wanted
                .iter()
                .filter_map(|k| st.recv_vars.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect();
            (got.len() == wanted.len()).then_some(got)
        });
        self.handle_value(res)
    }

    /// Waits for the child to exit. Fails if the child exited with a
    /// non-zero status or was killed by a signal (see
    /// [`Self::set_exit_error_is_ok()`]). May only be called once.
    pub fn wait(&mut self) -> Result<()> {
        self.sh.ok();
        let res = self.wait_inner();
        self.handle(res)
    }

    /// Sends `sig` to the child. Succeeds if the child has already exited.
    pub fn signal(&mut self, sig: Signal) -> Result<()> {
        self.sh.ok();
        let res = self.signal_inner(sig);
        self.handle(res)
    }

    /// Sends `sig` to the child, then waits for it to exit. Unlike
    /// [`Self::signal()`] followed by [`Self::wait()`], this succeeds as
    /// long as the child exits, whatever its exit status.
    pub fn terminate(&mut self, sig: Signal) -> Result<()> {
        self.sh.ok();
        let res = self.terminate_inner(sig);
        self.handle(res)
    }

    /// Starts the child and waits for it.
    pub fn run(&mut self) -> Result<()> {
        self.sh.ok();
        let res = self.run_inner();
        self.handle(res)
    }

    /// Runs the child and returns its stdout.
    pub fn stdout(&mut self) -> Result<String> {
        self.sh.ok();
        let (stdout, res) = self.stdout_inner();
        self.handle(res)?;
        Ok(stdout)
    }

    /// Runs the child and returns its stdout and stderr.
    pub fn stdout_stderr(&mut self) -> Result<(String, String)> {
        self.sh.ok();
        let (stdout, stderr, res) = self.stdout_stderr_inner();
        self.handle(res)?;
        Ok((stdout, stderr))
    }

    /// Runs the child and returns its stdout and stderr interleaved.
    pub fn combined_output(&mut self) -> Result<String> {
        self.sh.ok();
        let (output, res) = self.combined_output_inner();
        self.handle(res)?;
        Ok(output)
    }

    ////////////////////////////////////////
    // Error routing

    pub(crate) fn record(&self, err: Option<Error>) -> Option<Error> {
        self.shared.record(err)
    }

    fn handle(&self, res: Result<()>) -> Result<()> {
        match self.record(res.err()) {
            None => Ok(()),
            Some(e) => Err(self.report(e)),
        }
    }

    fn handle_value<T>(&self, res: Result<T>) -> Result<T> {
        match res {
            Ok(v) => {
                self.record(None);
                Ok(v)
            }
            Err(e) => {
                let e = self.record(Some(e.clone())).unwrap_or(e);
                Err(self.report(e))
            }
        }
    }

    fn report(&self, err: Error) -> Error {
        if err.is_exit_error() && !self.sh.opts().continue_on_error {
            tracing::error!(
                "command failed: {}\n\nSTDOUT\n{}\n{}\n\nSTDERR\n{}\n{}\n",
                self.args.join(" "),
                OUTPUT_SEPARATOR,
                self.captured_stdout(),
                OUTPUT_SEPARATOR,
                self.captured_stderr(),
            );
        }
        self.sh.handle_error(err)
    }

    ////////////////////////////////////////
    // Internals

    pub(crate) fn clone_inner(&self) -> Result<Cmd> {
        let mut res = Cmd::new_internal(
            self.sh.clone(),
            self.vars.clone(),
            self.path.clone(),
            self.args[1..].to_vec(),
        )?;
        res.ignore_parent_exit = self.ignore_parent_exit;
        res.exit_after = self.exit_after;
        res.propagate_output = self.propagate_output;
        res.output_dir = self.output_dir.clone();
        {
            let src = self.shared.state.lock();
            let mut dst = res.shared.state.lock();
            dst.exit_error_is_ok = src.exit_error_is_ok;
            dst.ignore_closed_pipe_error = src.ignore_closed_pipe_error;
        }
        Ok(res)
    }

    fn stdin_pipe_inner(&mut self) -> Result<BufferedPipe> {
        if self.called_start {
            return Err(Error::AlreadyCalledStart);
        }
        match &self.stdin {
            Stdin::Pipe(p) => return Ok(p.clone()),
            Stdin::Null => {}
            _ => return Err(Error::AlreadySetStdin),
        }
        let p = BufferedPipe::new();
        self.after_wait_closers.push(Box::new(p.clone()));
        self.stdin = Stdin::Pipe(p.clone());
        Ok(p)
    }

    fn set_stdin(&mut self, stdin: Stdin) -> Result<()> {
        if self.called_start {
            return Err(Error::AlreadyCalledStart);
        }
        if !matches!(self.stdin, Stdin::Null) {
            return Err(Error::AlreadySetStdin);
        }
        self.stdin = stdin;
        Ok(())
    }

    pub(crate) fn set_stdin_fd(&mut self, fd: PipeReadEnd) -> Result<()> {
        self.set_stdin(Stdin::Fd(fd))
    }

    fn output_pipe(&mut self, stream: Stream) -> Result<BufferedPipe> {
        let p = BufferedPipe::new();
        self.add_writer(stream, Box::new(p.clone()))?;
        self.after_wait_closers.push(Box::new(p.clone()));
        Ok(p)
    }

    pub(crate) fn add_writer(&mut self, stream: Stream, w: BoxWriter) -> Result<()> {
        if self.called_start {
            return Err(Error::AlreadyCalledStart);
        }
        match stream {
            Stream::Stdout => self.stdout_writers.push(w),
            Stream::Stderr => self.stderr_writers.push(w),
        }
        Ok(())
    }

    pub(crate) fn add_after_wait_closer(&mut self, c: Box<dyn Close>) {
        self.after_wait_closers.push(c);
    }

    fn close_after_wait_closers(&mut self) {
        for p in self.after_wait_closers.drain(..) {
            p.close();
        }
    }

    /// The environment handed to the child: the command's vars plus the
    /// shell's reserved settings.
    fn child_vars(&self) -> Vars {
        let mut vars = self.vars.clone();
        if self.ignore_parent_exit {
            vars.remove(ENV_WATCH_PARENT);
        } else {
            vars.insert(ENV_WATCH_PARENT.to_string(), "1".to_string());
        }
        match self.exit_after {
            Some(d) => {
                vars.insert(ENV_EXIT_AFTER.to_string(), d.as_millis().to_string());
            }
            None => {
                vars.remove(ENV_EXIT_AFTER);
            }
        }
        vars
    }

    fn make_stdout_stderr(&mut self) -> Result<(BoxWriter, BoxWriter)> {
        let mut stdout: Vec<BoxWriter> = vec![Box::new(SharedWriter(self.stdout_head_tail.clone()))];
        let mut stderr: Vec<BoxWriter> = vec![
            Box::new(RecvWriter {
                scanner: MessageScanner::new(),
                shared: self.shared.clone(),
            }),
            Box::new(SharedWriter(self.stderr_head_tail.clone())),
        ];
        stdout.append(&mut self.stdout_writers);
        stderr.append(&mut self.stderr_writers);
        if self.propagate_output {
            stdout.push(Box::new(io::stdout()));
            stderr.push(Box::new(io::stderr()));
        }
        if let Some(dir) = &self.output_dir {
            let base = self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let t = chrono::Local::now().format("%Y%m%d.%H%M%S.%6f");
            let mut opts = OpenOptions::new();
            opts.write(true).create_new(true).mode(0o600);
            stdout.push(Box::new(opts.open(dir.join(format!("{}.{}.stdout", base, t)))?));
            stderr.push(Box::new(opts.open(dir.join(format!("{}.{}.stderr", base, t)))?));
        }
        // Writes to stdout and stderr are serialized, so that sinks attached
        // to both see one ordering and never see concurrent writes.
        let lock = Arc::new(Mutex::new(()));
        Ok((
            Box::new(LockedWriter::new(lock.clone(), Tee::new(stdout))),
            Box::new(LockedWriter::new(lock, Tee::new(stderr))),
        ))
    }

    pub(crate) fn start_inner(&mut self) -> Result<()> {
        if self.called_start {
            return Err(Error::AlreadyCalledStart);
        }
        self.called_start = true;
        let res = self.spawn();
        if res.is_err() {
            self.close_after_wait_closers();
        }
        res
    }

    fn spawn(&mut self) -> Result<()> {
        // Hold the shell's cleanup lock, so a signal-triggered cleanup
        // either sees this child as started or runs before it exists.
        let sh = self.sh.clone();
        let sh_state = sh.lock_state();
        if sh_state.called_cleanup {
            return Err(Error::AlreadyCalledCleanup);
        }

        let mut command = Command::new(&self.path);
        command
            .arg0(&self.args[0])
            .args(&self.args[1..])
            .env_clear()
            .envs(self.child_vars())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        configure_process_group(&mut command);

        let stdin = std::mem::replace(&mut self.stdin, Stdin::Null);
        let mut stdin_source = None;
        match stdin {
            Stdin::Null => {
                command.stdin(Stdio::null());
            }
            Stdin::Fd(read_end) => {
                command.stdin(read_end.take().map_or_else(Stdio::null, Stdio::from));
            }
            Stdin::Pipe(p) => {
                command.stdin(Stdio::piped());
                stdin_source = Some((Box::new(p) as Box<dyn Read + Send>, true));
            }
            Stdin::Reader(r) => {
                command.stdin(Stdio::piped());
                stdin_source = Some((r, false));
            }
        }
        let (stdout_sink, stderr_sink) = self.make_stdout_stderr()?;

        let mut child = command.spawn()?;
        // The parent's copies of fds handed to the child (e.g. the read end
        // of a pipeline junction) are closed here.
        drop(command);

        let handle = ProcessHandle::new(child.id());
        {
            let mut st = self.shared.state.lock();
            st.started = true;
            st.handle = Some(handle);
        }
        tracing::debug!(pid = handle.pid(), path = %self.path.display(), "started");

        let mut stdin_copier = None;
        if let (Some((src, joined)), Some(dst)) = (stdin_source, child.stdin.take()) {
            let copier = thread::spawn(move || copy_stdin(src, dst));
            if joined {
                stdin_copier = Some(copier);
            }
        }
        let stdout_copier = child
            .stdout
            .take()
            .map(|src| thread::spawn(move || copy_output(src, stdout_sink)));
        let stderr_copier = child
            .stderr
            .take()
            .map(|src| thread::spawn(move || copy_output(src, stderr_sink)));

        let watcher = ExitWatcher {
            child,
            shared: self.shared.clone(),
            grace: sh.opts().cleanup_grace,
            stdin_copier,
            stdout_copier,
            stderr_copier,
            closers: std::mem::take(&mut self.after_wait_closers),
        };
        thread::spawn(move || watcher.run());
        Ok(())
    }

    fn await_inner<T>(&self, mut satisfied: impl FnMut(&ProcState) -> Option<T>) -> Result<T> {
        self.shared.check_running()?;
        let mut st = self.shared.state.lock();
        loop {
            // Both conditions may hold at once; the child's messages win.
            if let Some(res) = satisfied(&*st) {
                return Ok(res);
            }
            if st.exited {
                return Err(Error::ProcessExited);
            }
            self.shared.cond.wait(&mut st);
        }
    }

    pub(crate) fn wait_inner(&mut self) -> Result<()> {
        self.shared.wait()
    }

    pub(crate) fn signal_inner(&mut self, sig: Signal) -> Result<()> {
        self.shared.check_running()?;
        let st = self.shared.state.lock();
        match st.handle {
            Some(handle) if !st.reaped => handle.signal(sig),
            _ => Ok(()),
        }
    }

    pub(crate) fn terminate_inner(&mut self, sig: Signal) -> Result<()> {
        self.signal_inner(sig)?;
        match self.wait_inner() {
            Err(e) if e.is_exit_error() => Ok(()),
            res => res,
        }
    }

    pub(crate) fn run_inner(&mut self) -> Result<()> {
        self.start_inner()?;
        self.wait_inner()
    }

    fn stdout_inner(&mut self) -> (String, Result<()>) {
        if self.called_start {
            return (String::new(), Err(Error::AlreadyCalledStart));
        }
        let stdout = Arc::new(Mutex::new(Vec::new()));
        self.stdout_writers.push(Box::new(SharedWriter(stdout.clone())));
        let res = self.run_inner();
        let stdout = String::from_utf8_lossy(&stdout.lock()).into_owned();
        (stdout, res)
    }

    fn stdout_stderr_inner(&mut self) -> (String, String, Result<()>) {
        if self.called_start {
            return (String::new(), String::new(), Err(Error::AlreadyCalledStart));
        }
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        self.stdout_writers.push(Box::new(SharedWriter(stdout.clone())));
        self.stderr_writers.push(Box::new(SharedWriter(stderr.clone())));
        let res = self.run_inner();
        let stdout = String::from_utf8_lossy(&stdout.lock()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.lock()).into_owned();
        (stdout, stderr, res)
    }

    fn combined_output_inner(&mut self) -> (String, Result<()>) {
        if self.called_start {
            return (String::new(), Err(Error::AlreadyCalledStart));
        }
        let output = Arc::new(Mutex::new(Vec::new()));
        self.stdout_writers.push(Box::new(SharedWriter(output.clone())));
        self.stderr_writers.push(Box::new(SharedWriter(output.clone())));
        let res = self.run_inner();
        let output = String::from_utf8_lossy(&output.lock()).into_owned();
        (output, res)
    }
}

// Stops at the first write error and drops `src`, so the child gets a
// closed pipe on its next write instead of blocking on a full one.
fn copy_output(mut src: impl Read, mut sink: BoxWriter) -> Result<()> {
    io::copy(&mut src, &mut sink)?;
    Ok(())
}

fn copy_stdin(mut src: Box<dyn Read + Send>, mut dst: impl Write) -> Result<()> {
    match io::copy(&mut src, &mut dst) {
        Err(e) if e.kind() != io::ErrorKind::BrokenPipe => Err(e.into()),
        _ => Ok(()),
    }
}

fn join(copier: Option<JoinHandle<Result<()>>>) -> Result<()> {
    match copier.map(JoinHandle::join) {
        None => Ok(()),
        Some(Ok(res)) => res,
        Some(Err(_)) => Err(io::Error::other("stdio copier panicked").into()),
    }
}

/// Reaps the child, drains its output, then publishes the result for
/// [`CmdShared::wait()`]. Reaping here rather than in `wait` means exited
/// children never linger as zombies.
struct ExitWatcher {
    child: Child,
    shared: Arc<CmdShared>,
    grace: Duration,
    stdin_copier: Option<JoinHandle<Result<()>>>,
    stdout_copier: Option<JoinHandle<Result<()>>>,
    stderr_copier: Option<JoinHandle<Result<()>>>,
    closers: Vec<Box<dyn Close>>,
}

impl ExitWatcher {
    fn run(mut self) {
        let status = self.child.wait();
        self.shared.state.lock().reaped = true;
        // Leftover members of the group may hold our pipes open.
        self.shared.cleanup_process_group(self.grace);

        let stdout_res = join(self.stdout_copier.take());
        let stderr_res = join(self.stderr_copier.take());
        {
            let mut st = self.shared.state.lock();
            st.exited = true;
            self.shared.cond.notify_all();
        }
        for p in self.closers.drain(..) {
            p.close();
        }
        let stdin_res = join(self.stdin_copier.take());

        let exit_res = match status {
            Ok(status) => {
                tracing::debug!(path = self.shared.path(), %status, "exited");
                match ExitError::from_status(self.shared.path(), status) {
                    Some(e) => Err(Error::Exit(e)),
                    None => Ok(()),
                }
            }
            Err(e) => Err(e.into()),
        };
        let res = exit_res.and(stdout_res).and(stderr_res).and(stdin_res);
        let mut st = self.shared.state.lock();
        st.result = Some(res);
        self.shared.cond.notify_all();
    }
}
