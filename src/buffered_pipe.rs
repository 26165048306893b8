use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

struct State {
    buf: VecDeque<u8>,
    closed: bool,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

/// A pipe backed by an unbounded in-memory buffer. Writes never block;
/// reads block until data is available or the pipe is closed.
///
/// Handles are cheap to clone and all refer to the same pipe, so one clone
/// can be handed to a writer thread while another is read from. After
/// [`Self::close()`], buffered bytes are still readable, then every read
/// returns EOF (`Ok(0)`) and every write fails with
/// [`io::ErrorKind::BrokenPipe`].
///
/// Memory grows without bound if the reader falls behind, so this is only
/// used for in-process capture, never in front of an OS pipe between two
/// children.
#[derive(Clone)]
pub struct BufferedPipe {
    inner: Arc<Inner>,
}

impl Default for BufferedPipe {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferedPipe {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    buf: VecDeque::new(),
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Closes the pipe and wakes any blocked reader. Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if !state.closed {
            state.closed = true;
            self.inner.cond.notify_all();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    fn read_blocking(&self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        let mut state = self.inner.state.lock();
        loop {
            if !state.buf.is_empty() {
                return state.buf.read(dst);
            }
            if state.closed {
                return Ok(0);
            }
            self.inner.cond.wait(&mut state);
        }
    }

    fn write_nonblocking(&self, src: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write on closed pipe",
            ));
        }
        state.buf.extend(src);
        self.inner.cond.notify_all();
        Ok(src.len())
    }
}

impl Read for BufferedPipe {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(dst)
    }
}

impl Read for &BufferedPipe {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(dst)
    }
}

impl Write for BufferedPipe {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.write_nonblocking(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &BufferedPipe {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.write_nonblocking(src)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_write_after_close() {
        let mut p = BufferedPipe::new();
        assert_eq!(p.write(b"foo").unwrap(), 3);
        assert_eq!(p.write(b"barbaz").unwrap(), 6);
        p.close();
        p.close();

        let mut got = String::new();
        p.read_to_string(&mut got).unwrap();
        assert_eq!(got, "foobarbaz");
        // EOF forever.
        assert_eq!(p.read(&mut [0u8; 4]).unwrap(), 0);

        let err = p.write(b"already closed").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn read_returns_what_is_available() {
        let mut p = BufferedPipe::new();
        p.write_all(b"ab").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(p.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn read_blocks_until_write() {
        let p = BufferedPipe::new();
        let (tx, rx) = mpsc::channel();
        let reader = p.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            let n = (&reader).read(&mut buf).unwrap();
            tx.send(buf[..n].to_vec()).unwrap();
        });
        // The reader must still be parked.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        (&p).write_all(b"hi").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"hi");
        handle.join().unwrap();
    }

    #[test]
    fn read_blocks_until_close() {
        let p = BufferedPipe::new();
        let reader = p.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 8];
            (&reader).read(&mut buf).unwrap()
        });
        thread::sleep(Duration::from_millis(50));
        p.close();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn copy_between_threads() {
        let p = BufferedPipe::new();
        let reader = p.clone();
        let handle = thread::spawn(move || {
            let mut out = Vec::new();
            io::copy(&mut &reader, &mut out).unwrap();
            out
        });
        let parts = [
            "mary had",
            "a little lamb",
            "three helpings of corn",
            "two baked potatoes",
            "and extra bread",
        ];
        for part in parts {
            (&p).write_all(part.as_bytes()).unwrap();
        }
        p.close();
        assert_eq!(handle.join().unwrap(), parts.concat().as_bytes());
    }
}
