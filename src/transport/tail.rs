//! Bounded tail of the child's stderr, kept for error context.

use std::fmt;
use std::sync::Mutex;

/// Keeps the most recent stderr output up to a byte limit.
///
/// On overflow the buffer is reset and restarted; losing the older half is
/// acceptable for diagnostics. Guarded by its own mutex so the tee task and
/// error paths can touch it concurrently.
pub struct TailBuffer {
    limit: usize,
    buf: Mutex<Vec<u8>>,
}

impl TailBuffer {
    /// Create a tail buffer bounded to `limit` bytes.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: Mutex::new(Vec::new()),
        }
    }

    /// Append bytes, resetting first when they would overflow the limit.
    pub fn write(&self, p: &[u8]) {
        let mut buf = self.buf.lock().unwrap();
        if p.len() + buf.len() > self.limit {
            buf.clear();
        }
        buf.extend_from_slice(p);
    }

    /// Current contents, lossily decoded.
    pub fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }
}

impl fmt::Display for TailBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.contents())
    }
}
