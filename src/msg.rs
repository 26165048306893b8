//! Messages sent by a child to the shell that spawned it.
//!
//! A child writes a frame to its stderr: [`MSG_PREFIX`], a JSON object,
//! then [`MSG_SUFFIX`]. Frames need not start on a line boundary and may be
//! surrounded by arbitrary output, so the parent scans the raw byte stream
//! with [`MessageScanner`].

use crate::envconfig::Vars;
use serde::{Deserialize, Serialize};

pub const MSG_PREFIX: &[u8] = b"<procshell:";
pub const MSG_SUFFIX: &[u8] = b":procshell>";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Msg {
    /// The child is ready, e.g. to serve requests.
    Ready,
    /// Key/value pairs, merged into what the parent already received.
    Vars { vars: Vars },
}

impl Msg {
    /// Returns the framed bytes for this message.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = MSG_PREFIX.to_vec();
        // Serializing a tag and a string map cannot fail.
        out.extend(serde_json::to_vec(self).unwrap_or_default());
        out.extend_from_slice(MSG_SUFFIX);
        out
    }
}

/// Incremental, byte-at-a-time parser for framed messages. Bytes outside of
/// frames are ignored; a frame may be split across any number of
/// [`Self::feed()`] calls.
#[derive(Debug, Default)]
pub struct MessageScanner {
    buf: Vec<u8>,
    matched_prefix: usize,
    matched_suffix: usize,
}

impl MessageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes `p` and returns the messages completed by it. Frames whose
    /// payload does not parse are dropped with a warning.
    pub fn feed(&mut self, p: &[u8]) -> Vec<Msg> {
        let mut out = Vec::new();
        for &b in p {
            if self.matched_prefix < MSG_PREFIX.len() {
                self.matched_prefix = advance(MSG_PREFIX, self.matched_prefix, b);
                continue;
            }
            self.buf.push(b);
            self.matched_suffix = advance(MSG_SUFFIX, self.matched_suffix, b);
            if self.matched_suffix < MSG_SUFFIX.len() {
                continue;
            }
            let payload = &self.buf[..self.buf.len() - MSG_SUFFIX.len()];
            match serde_json::from_slice::<Msg>(payload) {
                Ok(msg) => out.push(msg),
                Err(e) => tracing::warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "ignoring malformed child message"
                ),
            }
            self.buf.clear();
            self.matched_prefix = 0;
            self.matched_suffix = 0;
        }
        out
    }
}

// Neither delimiter repeats its first byte, so on a mismatch the only
// possible restart is at the current byte.
fn advance(delim: &[u8], matched: usize, b: u8) -> usize {
    if b == delim[matched] {
        matched + 1
    } else if b == delim[0] {
        1
    } else {
        0
    }
}
