use std::io::{self, Write};

/// Fixed-size buffer that holds the last `capacity` bytes appended to it.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies `p` into the buffer, overwriting the oldest bytes first.
    pub fn append(&mut self, p: &[u8]) {
        let cap = self.buf.len();
        if cap == 0 {
            return;
        }
        if p.len() >= cap {
            self.buf.copy_from_slice(&p[p.len() - cap..]);
            self.start = 0;
            self.len = cap;
            return;
        }
        let end = (self.start + self.len) % cap;
        let n = p.len().min(cap - end);
        self.buf[end..end + n].copy_from_slice(&p[..n]);
        if n < p.len() {
            self.buf[..p.len() - n].copy_from_slice(&p[n..]);
        }
        self.len += p.len();
        if self.len > cap {
            self.start = (self.start + self.len) % cap;
            self.len = cap;
        }
    }

    /// Returns the retained bytes, oldest first.
    pub fn to_vec(&self) -> Vec<u8> {
        // start > 0 implies the buffer is full.
        let mut out = Vec::with_capacity(self.len);
        if self.start == 0 {
            out.extend_from_slice(&self.buf[..self.len]);
        } else {
            out.extend_from_slice(&self.buf[self.start..]);
            out.extend_from_slice(&self.buf[..self.start]);
        }
        out
    }
}

impl std::fmt::Display for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_vec()))
    }
}

/// Keeps the first and last `capacity` bytes written to it, so that the
/// output of a long-running child can be shown on failure without holding
/// all of it in memory. Renders as `[ empty ]` if nothing was written.
#[derive(Debug, Clone)]
pub struct HeadTail {
    head: Vec<u8>,
    capacity: usize,
    tail: Option<RingBuffer>,
    written: usize,
}

impl HeadTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            head: Vec::with_capacity(capacity),
            capacity,
            tail: None,
            written: 0,
        }
    }

    /// Total number of bytes ever written.
    pub fn written(&self) -> usize {
        self.written
    }

    pub fn append(&mut self, p: &[u8]) {
        let n_head = self.capacity.saturating_sub(self.written).min(p.len());
        self.head.extend_from_slice(&p[..n_head]);
        if p.len() > n_head {
            let capacity = self.capacity;
            self.tail
                .get_or_insert_with(|| RingBuffer::new(capacity))
                .append(&p[n_head..]);
        }
        self.written += p.len();
    }
}

impl Write for HeadTail {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        self.append(p);
        Ok(p.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Display for HeadTail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.written == 0 {
            return f.write_str("[ empty ]");
        }
        let head = String::from_utf8_lossy(&self.head);
        let Some(tail) = &self.tail else {
            return f.write_str(&head);
        };
        let skipped = self.written.saturating_sub(2 * self.capacity);
        if skipped == 0 {
            write!(f, "{}{}", head, tail)
        } else {
            write!(f, "{}\n[ ... skipping {} bytes ... ]\n{}", head, skipped, tail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(cap: usize) -> RingBuffer {
        RingBuffer::new(cap)
    }

    #[test]
    fn ring_basic() {
        let mut b = ring(5);
        assert_eq!(b.to_string(), "");
        b.append(b"foo");
        assert_eq!(b.to_string(), "foo");
        b.append(b"bar");
        assert_eq!(b.to_string(), "oobar");
        b.append(b"");
        assert_eq!(b.to_string(), "oobar");

        // Appending right up to the capacity.
        let mut b = ring(3);
        b.append(b"foo");
        assert_eq!(b.to_string(), "foo");
        b.append(b"bar");
        assert_eq!(b.to_string(), "bar");

        // Much bigger than the buffer.
        let mut b = ring(2);
        b.append(b"012345678");
        assert_eq!(b.to_string(), "78");
        b.append(b"0123456789");
        assert_eq!(b.to_string(), "89");
        b.append(b"0");
        assert_eq!(b.to_string(), "90");

        let mut b = ring(1);
        b.append(b"f");
        assert_eq!(b.to_string(), "f");
        b.append(b"bar");
        assert_eq!(b.to_string(), "r");

        let mut b = ring(0);
        b.append(b"f");
        assert_eq!(b.to_string(), "");
        assert!(b.is_empty());
    }

    #[test]
    fn ring_copies_bytes() {
        let mut foo = b"foo".to_vec();
        let mut bar = b"bar".to_vec();
        let mut b = ring(5);
        b.append(&foo);
        foo[2] = b'z';
        assert_eq!(b.to_string(), "foo");
        b.append(&bar);
        bar[2] = b'z';
        assert_eq!(b.to_string(), "oobar");
    }

    #[test]
    fn ring_matches_suffix_of_everything_appended() {
        let s = "0123456789";
        for str_len in 0..=s.len() {
            for cap in 0..=2 * s.len() {
                let mut b = ring(cap);
                let mut all = String::new();
                for _ in 0..2 * s.len() {
                    b.append(&s.as_bytes()[..str_len]);
                    all.push_str(&s[..str_len]);
                }
                let start = all.len().saturating_sub(cap);
                assert_eq!(b.to_string(), all[start..], "len {} cap {}", str_len, cap);
                assert_eq!(b.len(), all.len().min(cap));
            }
        }
    }

    #[test]
    fn head_tail_renders_head_only_when_small() {
        let mut ht = HeadTail::new(4);
        assert_eq!(ht.to_string(), "[ empty ]");
        ht.append(b"");
        assert_eq!(ht.to_string(), "[ empty ]");
        ht.append(b"abc");
        assert_eq!(ht.to_string(), "abc");
        ht.append(b"d");
        assert_eq!(ht.to_string(), "abcd");
    }

    #[test]
    fn head_tail_without_elision_up_to_twice_capacity() {
        let mut ht = HeadTail::new(4);
        ht.append(b"abcd");
        ht.append(b"efgh");
        assert_eq!(ht.to_string(), "abcdefgh");
        assert_eq!(ht.written(), 8);
    }

    #[test]
    fn head_tail_elides_the_middle() {
        let mut ht = HeadTail::new(4);
        ht.append(b"abcdMIDDefgh");
        assert_eq!(ht.to_string(), "abcd\n[ ... skipping 4 bytes ... ]\nefgh");

        // Same content in small writes.
        let mut ht = HeadTail::new(4);
        for b in b"abcdMIDDefgh" {
            ht.write_all(&[*b]).unwrap();
        }
        assert_eq!(ht.to_string(), "abcd\n[ ... skipping 4 bytes ... ]\nefgh");
    }
}
