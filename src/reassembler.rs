//! In-order reconstruction of segments that may arrive out of order.
//!
//! Each connection owns one `Reassembler` per direction. Segments are keyed
//! by the identifier the envelope carries; the reassembler buffers gaps and
//! releases the longest contiguous run starting at the next expected
//! identifier.

use std::collections::BTreeMap;

use tracing::{debug, warn};

/// Number of buffered out-of-order segments above which a warning is logged.
/// A backlog this deep usually means the sender restarted its counter
/// without the connection being torn down.
const BACKLOG_WARN_THRESHOLD: usize = 64;

/// Reorders segments and releases them as contiguous runs.
///
/// Delivery is exactly-once per identifier: duplicates of a buffered or
/// already-delivered segment are discarded, and the first arrival wins.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: BTreeMap<i32, Vec<u8>>,
    next_expected_id: i32,
}

impl Reassembler {
    /// Creates an empty reassembler expecting segment 0 first.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts one segment and returns every payload that became
    /// deliverable, in identifier order.
    ///
    /// Returns an empty `Vec` when the segment only fills a gap partially,
    /// is stale (identifier below the next expected one), or duplicates a
    /// buffered segment.
    pub fn accept(&mut self, segment_id: i32, payload: Vec<u8>) -> Vec<Vec<u8>> {
        if segment_id < self.next_expected_id {
            debug!(segment_id, next = self.next_expected_id, "stale segment discarded");
            return Vec::new();
        }
        if self.pending.contains_key(&segment_id) {
            debug!(segment_id, "duplicate segment discarded");
            return Vec::new();
        }

        self.pending.insert(segment_id, payload);
        if self.pending.len() > BACKLOG_WARN_THRESHOLD {
            warn!(
                buffered = self.pending.len(),
                next = self.next_expected_id,
                "deep reorder backlog"
            );
        }

        let mut released = Vec::new();
        while let Some(payload) = self.pending.remove(&self.next_expected_id) {
            released.push(payload);
            self.next_expected_id += 1;
        }
        released
    }

    /// Discards all buffered segments and resets the expected identifier
    /// to 0.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.next_expected_id = 0;
    }

    /// Number of segments buffered while waiting for a gap to fill.
    pub fn pending_segments(&self) -> usize {
        self.pending.len()
    }

    /// Total payload bytes currently buffered.
    pub fn buffered_bytes(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}
