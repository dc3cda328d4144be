//! Bounded scrollback for session output.
//!
//! Chunk-granular ring: appended chunks are never mutated or merged, and the
//! total byte size stays under the configured limit by dropping whole chunks
//! from the front. New viewers replay the snapshot to reconstruct the screen
//! without shipping the full session transcript.

use bytes::Bytes;
use std::collections::VecDeque;

/// Default history limit: 1 MiB.
pub const DEFAULT_HISTORY_LIMIT: usize = 1024 * 1024;

/// Ordered chunks of terminal output, bounded by total byte size.
///
/// A single chunk larger than the limit is kept as the only element, so a
/// burst bigger than the whole buffer still reaches late-joining viewers.
#[derive(Debug)]
pub struct HistoryRing {
    chunks: VecDeque<Bytes>,
    total: usize,
    limit: usize,
}

impl HistoryRing {
    /// # Panics
    ///
    /// Panics if `limit == 0`.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "history limit must be > 0");
        Self {
            chunks: VecDeque::new(),
            total: 0,
            limit,
        }
    }

    /// Append a chunk, evicting the oldest chunks while over the limit.
    ///
    /// Empty chunks are a no-op.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total += chunk.len();
        self.chunks.push_back(chunk);
        while self.total > self.limit && self.chunks.len() > 1 {
            if let Some(dropped) = self.chunks.pop_front() {
                self.total -= dropped.len();
            }
        }
    }

    /// Copy of the current chunk sequence, oldest first.
    ///
    /// `Bytes` clones are reference-counted, so this never copies payloads.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().cloned().collect()
    }

    /// Total buffered bytes.
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    /// Number of buffered chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Configured byte limit.
    pub fn limit(&self) -> usize {
        self.limit
    }
}
