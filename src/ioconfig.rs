//! Plumbing between a command's standard streams and the things attached to
//! them: OS pipes shared between pipeline stages, and writers that fan a
//! child's output out to several sinks.

use crate::error::Result;
use crate::sys::cloexec_pipe;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::OwnedFd;
use std::sync::Arc;

pub(crate) type BoxWriter = Box<dyn Write + Send>;

/// Something a command closes once its child has exited and its output
/// has been drained, so that readers downstream see EOF.
pub(crate) trait Close: Send {
    fn close(&self);
}

impl Close for crate::buffered_pipe::BufferedPipe {
    fn close(&self) {
        crate::buffered_pipe::BufferedPipe::close(self)
    }
}

/// Creates an OS pipe with CLOEXEC set on both ends. The read end is meant
/// to become the stdin of one child, the write end is fed from another
/// child's output.
pub(crate) fn interprocess_pipe() -> Result<(PipeReadEnd, PipeWriteEnd)> {
    let (r, w) = cloexec_pipe()?;
    Ok((
        PipeReadEnd {
            fd: Arc::new(Mutex::new(Some(r))),
        },
        PipeWriteEnd {
            file: Arc::new(Mutex::new(Some(Arc::new(File::from(w))))),
        },
    ))
}

/// Read end of an interprocess pipe. Either handed to a child at spawn time
/// via [`Self::take()`], or closed.
#[derive(Clone)]
pub(crate) struct PipeReadEnd {
    fd: Arc<Mutex<Option<OwnedFd>>>,
}

impl PipeReadEnd {
    pub(crate) fn take(&self) -> Option<OwnedFd> {
        self.fd.lock().take()
    }

    /// Closes the parent's copy of the fd, unless it was already taken.
    pub(crate) fn close(&self) {
        self.fd.lock().take();
    }
}

/// Write end of an interprocess pipe. Clones share the fd; once any clone
/// calls [`Self::close()`], writes through every clone fail with a broken
/// pipe, and the fd itself is closed as soon as no write is in flight.
#[derive(Clone)]
pub(crate) struct PipeWriteEnd {
    file: Arc<Mutex<Option<Arc<File>>>>,
}

impl PipeWriteEnd {
    pub(crate) fn close(&self) {
        self.file.lock().take();
    }
}

impl Close for PipeWriteEnd {
    fn close(&self) {
        PipeWriteEnd::close(self)
    }
}

impl Write for PipeWriteEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Don't hold the lock across a write that may block on a full pipe.
        let file = self.file.lock().clone();
        match file {
            Some(f) => (&*f).write(buf),
            None => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write on closed pipe",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes everything to every writer, in order. Stops at the first error.
pub(crate) struct Tee {
    writers: Vec<BoxWriter>,
}

impl Tee {
    pub(crate) fn new(writers: Vec<BoxWriter>) -> Self {
        Self { writers }
    }
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for w in self.writers.iter_mut() {
            w.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in self.writers.iter_mut() {
            w.flush()?;
        }
        Ok(())
    }
}

/// Serializes writes with every other writer holding the same lock. Used
/// for a child's stdout and stderr, so a sink attached to both sees bytes in
/// the order they were read and never sees concurrent writes.
pub(crate) struct LockedWriter<W> {
    lock: Arc<Mutex<()>>,
    inner: W,
}

impl<W: Write> LockedWriter<W> {
    pub(crate) fn new(lock: Arc<Mutex<()>>, inner: W) -> Self {
        Self { lock, inner }
    }
}

impl<W: Write> Write for LockedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _guard = self.lock.lock();
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let _guard = self.lock.lock();
        self.inner.flush()
    }
}

/// A writer shared between the thread copying a child's output and
/// whoever inspects it later.
pub(crate) struct SharedWriter<T>(pub(crate) Arc<Mutex<T>>);

impl<T: Write> Write for SharedWriter<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush()
    }
}
