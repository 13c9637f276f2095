//! Output handling and buffering for service logs.
//!
//! This module provides the line sanitizer applied to every captured line (`strip`) and
//! the shared, bounded store that supervisors write into and the consumer drains
//! (`LogAggregator`).

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

use regex::Regex;

/// Accumulator size that triggers eviction.
pub const DEFAULT_LOG_CEILING: usize = 50_000;
/// Trailing slice kept after eviction.
pub const DEFAULT_LOG_KEEP: usize = 20_000;

// CSI sequences and two-character escapes (ESC followed by a byte in '@'..='_').
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("escape pattern is valid")
});

/// Removes terminal control sequences from a captured chunk.
///
/// Stray `ESC` bytes that do not start a recognised sequence are dropped as well, so the
/// result never contains `ESC` and `strip(strip(x)) == strip(x)`. Text without `ESC` is
/// returned unchanged.
pub fn strip(raw: &str) -> String {
    if !raw.contains('\x1b') {
        return raw.to_string();
    }
    ANSI_ESCAPE.replace_all(raw, "").replace('\x1b', "")
}

/// Pending output per service, drained by the consumer on a fixed cadence.
///
/// Each accumulator is capped: once it grows past `ceiling` bytes it is replaced by its
/// trailing `keep` bytes. Eviction is lossy and drops the oldest text first.
#[derive(Debug)]
pub struct LogAggregator {
    ceiling: usize,
    keep: usize,
    pending: Mutex<HashMap<String, String>>,
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CEILING, DEFAULT_LOG_KEEP)
    }
}

impl LogAggregator {
    /// Creates an aggregator. `keep` is clamped to `ceiling`.
    pub fn new(ceiling: usize, keep: usize) -> Self {
        Self {
            ceiling,
            keep: keep.min(ceiling),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Accumulator size that triggers eviction.
    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Appends `text` to the accumulator for `name`.
    pub fn write(&self, name: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut pending = self.lock();
        let buffer = pending.entry(name.to_string()).or_default();
        buffer.push_str(text);
        if buffer.len() > self.ceiling {
            let cut = tail_start(buffer, self.keep);
            buffer.drain(..cut);
        }
    }

    /// Returns everything written since the last flush and resets the store.
    pub fn flush(&self) -> HashMap<String, String> {
        let mut pending = self.lock();
        if pending.is_empty() {
            return HashMap::new();
        }
        std::mem::take(&mut *pending)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // Every critical section leaves the map consistent, so a poisoned lock is safe to reuse.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Byte offset at which the last `keep` bytes start, moved forward to a char boundary.
fn tail_start(text: &str, keep: usize) -> usize {
    let mut cut = text.len().saturating_sub(keep);
    while !text.is_char_boundary(cut) {
        cut += 1;
    }
    cut
}
