//! Helpers for composing commands into a pipeline. Constructing pipelines
//! manually is tedious and error prone: every junction needs an OS pipe
//! whose ends are closed at the right moments, or stages hang waiting for
//! an EOF that never comes. [`Pipeline`] handles that, along with the
//! closed-pipe errors that upstream stages get when a downstream stage
//! exits early.

use crate::cmd::{Cmd, Stream};
use crate::error::{Error, Result};
use crate::ioconfig::{interprocess_pipe, PipeReadEnd, PipeWriteEnd, SharedWriter};
use crate::shell::Shell;
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::sync::Arc;

/// Which output of a stage feeds the next stage's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    Stdout,
    Stderr,
    CombinedOutput,
}

// The junction between stage i and stage i+1.
struct Junction {
    mode: PipeMode,
    read: PipeReadEnd,
    write: PipeWriteEnd,
}

/// A pipeline of commands, each stage's output piped to the next stage's
/// stdin.
///
/// The general pattern is to build each [`Cmd`] first, configuring its
/// arguments and environment, then add it to the pipeline, which takes
/// ownership. Every stage ignores closed-pipe errors, so pipelines like
/// `yes | head -1` succeed. All commands must come from the same shell.
///
/// ```no_run
/// use procshell::{PipeMode, Pipeline, Shell, ShellOpts};
///
/// let sh = Shell::new(ShellOpts::default());
/// let mut p = Pipeline::new(sh.cmd("yes", Vec::<String>::new()).unwrap(), []).unwrap();
/// p.pipe_to(sh.cmd("head", ["-n", "1"]).unwrap(), PipeMode::Stdout).unwrap();
/// assert_eq!(p.stdout().unwrap(), "y\n");
/// sh.cleanup();
/// ```
pub struct Pipeline {
    sh: Shell,
    cmds: Vec<Cmd>,
    junctions: Vec<Junction>,
}

impl Pipeline {
    /// Returns a pipeline of `first` followed by `rest`, each connected by
    /// stdout.
    pub fn new(first: Cmd, rest: impl IntoIterator<Item = Cmd>) -> Result<Pipeline> {
        let sh = first.shell().clone();
        sh.ok();
        let res = Pipeline::new_inner(first, rest);
        sh.handle(res)
    }

    fn new_inner(mut first: Cmd, rest: impl IntoIterator<Item = Cmd>) -> Result<Pipeline> {
        first.set_ignore_closed_pipe_error(true);
        let mut p = Pipeline {
            sh: first.shell().clone(),
            cmds: vec![first],
            junctions: Vec::new(),
        };
        for c in rest {
            p.pipe_to_inner(c, PipeMode::Stdout)?;
        }
        Ok(p)
    }

    pub fn shell(&self) -> &Shell {
        &self.sh
    }

    /// The stages, in order.
    pub fn cmds(&self) -> &[Cmd] {
        &self.cmds
    }

    /// The stages, in order. Use this to configure a stage after it was
    /// added, e.g. to make it report closed-pipe errors again.
    pub fn cmds_mut(&mut self) -> &mut [Cmd] {
        &mut self.cmds
    }

    /// Appends `c`, feeding it the selected output of the current last
    /// stage. Must be called before start.
    pub fn pipe_to(&mut self, c: Cmd, mode: PipeMode) -> Result<()> {
        self.sh.ok();
        let res = self.pipe_to_inner(c, mode);
        self.sh.handle(res)
    }

    pub fn pipe_stdout(&mut self, c: Cmd) -> Result<()> {
        self.pipe_to(c, PipeMode::Stdout)
    }

    pub fn pipe_stderr(&mut self, c: Cmd) -> Result<()> {
        self.pipe_to(c, PipeMode::Stderr)
    }

    pub fn pipe_combined_output(&mut self, c: Cmd) -> Result<()> {
        self.pipe_to(c, PipeMode::CombinedOutput)
    }

    /// Returns a new pipeline with clones of every stage, connected the
    /// same way.
    pub fn clone_pipeline(&self) -> Result<Pipeline> {
        self.sh.ok();
        let res = self.clone_inner();
        self.sh.handle(res)
    }

    pub fn start(&mut self) -> Result<()> {
        self.sh.ok();
        let res = self.start_inner();
        self.sh.handle(res)
    }

    /// Waits for every stage, in order. Returns the first error.
    pub fn wait(&mut self) -> Result<()> {
        self.sh.ok();
        let res = self.wait_inner();
        self.sh.handle(res)
    }

    /// Sends `sig` to every stage. Stages that already exited are skipped.
    pub fn signal(&mut self, sig: Signal) -> Result<()> {
        self.sh.ok();
        let res = self.signal_inner(sig);
        self.sh.handle(res)
    }

    /// Sends `sig` to every stage and waits for all of them. Exit errors
    /// are not reported.
    pub fn terminate(&mut self, sig: Signal) -> Result<()> {
        self.sh.ok();
        let res = self.terminate_inner(sig);
        self.sh.handle(res)
    }

    pub fn run(&mut self) -> Result<()> {
        self.sh.ok();
        let res = self.run_inner();
        self.sh.handle(res)
    }

    /// Runs the pipeline and returns the last stage's stdout.
    pub fn stdout(&mut self) -> Result<String> {
        self.sh.ok();
        let res = self.capture(&[Stream::Stdout]);
        self.sh.handle(res)
    }

    /// Runs the pipeline and returns the last stage's stdout and stderr.
    pub fn stdout_stderr(&mut self) -> Result<(String, String)> {
        self.sh.ok();
        let res = self.stdout_stderr_inner();
        self.sh.handle(res)
    }

    /// Runs the pipeline and returns the last stage's stdout and stderr,
    /// interleaved.
    pub fn combined_output(&mut self) -> Result<String> {
        self.sh.ok();
        let res = self.capture(&[Stream::Stdout, Stream::Stderr]);
        self.sh.handle(res)
    }

    ////////////////////////////////////////
    // Internals

    fn last(&mut self) -> &mut Cmd {
        let i = self.cmds.len() - 1;
        &mut self.cmds[i]
    }

    fn pipe_to_inner(&mut self, mut c: Cmd, mode: PipeMode) -> Result<()> {
        if !self.sh.same(c.shell()) {
            return Err(Error::DifferentShells);
        }
        c.set_ignore_closed_pipe_error(true);
        let (read, write) = interprocess_pipe()?;
        c.set_stdin_fd(read.clone())?;
        let last = self.last();
        last.add_after_wait_closer(Box::new(write.clone()));
        if mode != PipeMode::Stderr {
            last.add_writer(Stream::Stdout, Box::new(write.clone()))?;
        }
        if mode != PipeMode::Stdout {
            last.add_writer(Stream::Stderr, Box::new(write.clone()))?;
        }
        self.cmds.push(c);
        self.junctions.push(Junction { mode, read, write });
        Ok(())
    }

    fn clone_inner(&self) -> Result<Pipeline> {
        let mut res = Pipeline::new_inner(self.cmds[0].clone_inner()?, [])?;
        for (c, j) in self.cmds[1..].iter().zip(&self.junctions) {
            res.pipe_to_inner(c.clone_inner()?, j.mode)?;
        }
        Ok(res)
    }

    fn close_write_ends(&self) {
        for j in &self.junctions {
            j.write.close();
        }
    }

    fn start_inner(&mut self) -> Result<()> {
        let mut first_err = None;
        for (i, c) in self.cmds.iter_mut().enumerate() {
            // Keep going after a failure, so that every stage gets to start
            // and see EOF or a closed pipe instead of hanging.
            let res = c.start_inner();
            if let Some(e) = c.record(res.err()) {
                first_err.get_or_insert(e);
            }
            // Our copy of the read end must go, or the upstream stage never
            // gets a closed pipe once this stage exits.
            if i > 0 {
                self.junctions[i - 1].read.close();
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => {
                self.close_write_ends();
                Err(e)
            }
        }
    }

    fn wait_inner(&mut self) -> Result<()> {
        let mut first_err = None;
        for (i, c) in self.cmds.iter_mut().enumerate() {
            let res = c.wait_inner();
            if let Some(e) = c.record(res.err()) {
                first_err.get_or_insert(e);
            }
            // Once a stage exits and its output is drained, the next stage
            // must see EOF.
            if let Some(j) = self.junctions.get(i) {
                j.write.close();
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn signal_inner(&mut self, sig: Signal) -> Result<()> {
        let mut first_err = None;
        for c in self.cmds.iter_mut() {
            let res = c.signal_inner(sig);
            if let Some(e) = c.record(res.err()) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn terminate_inner(&mut self, sig: Signal) -> Result<()> {
        let mut first_err = None;
        for (i, c) in self.cmds.iter_mut().enumerate() {
            let res = c.terminate_inner(sig);
            if let Some(e) = c.record(res.err()) {
                first_err.get_or_insert(e);
            }
            if let Some(j) = self.junctions.get(i) {
                j.write.close();
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn run_inner(&mut self) -> Result<()> {
        self.start_inner()?;
        self.wait_inner()
    }

    fn capture(&mut self, streams: &[Stream]) -> Result<String> {
        let buf = Arc::new(Mutex::new(Vec::new()));
        for &s in streams {
            self.last().add_writer(s, Box::new(SharedWriter(buf.clone())))?;
        }
        self.run_inner()?;
        let out = String::from_utf8_lossy(&buf.lock()).into_owned();
        Ok(out)
    }

    fn stdout_stderr_inner(&mut self) -> Result<(String, String)> {
        let stdout = Arc::new(Mutex::new(Vec::new()));
        let stderr = Arc::new(Mutex::new(Vec::new()));
        let last = self.last();
        last.add_writer(Stream::Stdout, Box::new(SharedWriter(stdout.clone())))?;
        last.add_writer(Stream::Stderr, Box::new(SharedWriter(stderr.clone())))?;
        self.run_inner()?;
        let stdout = String::from_utf8_lossy(&stdout.lock()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr.lock()).into_owned();
        Ok((stdout, stderr))
    }
}
