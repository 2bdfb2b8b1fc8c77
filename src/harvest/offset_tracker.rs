// SPDX-License-Identifier: Apache-2.0

//! Offset tracking for at-least-once delivery.
//!
//! Records are tracked per identity from the moment a harvester hands them to
//! the spooler until the publisher acknowledges them. The offset that may be
//! persisted is the start of the lowest record still in flight, or the end of
//! the highest acknowledged record once nothing is pending. Persisting
//! anything beyond that could skip unacknowledged data after a crash.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::harvest::identity::FileIdentity;
use crate::harvest::record::ByteRange;

/// Tracker shared between harvesters (which track) and the committer (which
/// acknowledges).
pub type SharedOffsetTracker = Arc<Mutex<OffsetTracker>>;

/// Pending ranges (start -> end) and high water mark per identity.
#[derive(Default)]
pub struct OffsetTracker {
    files: HashMap<FileIdentity, BTreeMap<u64, u64>>,
    high_water_marks: HashMap<FileIdentity, ByteRange>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a record before it is handed to the spooler.
    pub fn track(&mut self, identity: FileIdentity, range: ByteRange) {
        self.files
            .entry(identity)
            .or_default()
            .insert(range.start, range.end);
    }

    /// Forget a tracked record that was never handed over.
    pub fn untrack(&mut self, identity: FileIdentity, range: ByteRange) {
        if let Some(pending) = self.files.get_mut(&identity) {
            pending.remove(&range.start);
        }
    }

    /// Mark a record as delivered downstream.
    pub fn acknowledge(&mut self, identity: FileIdentity, range: ByteRange) {
        let hwm = self
            .high_water_marks
            .entry(identity)
            .or_insert(ByteRange::new(0, 0));
        if range.end > hwm.end {
            *hwm = range;
        }

        if let Some(pending) = self.files.get_mut(&identity) {
            pending.remove(&range.start);
        }
    }

    /// Lowest pending start offset, if anything is in flight.
    pub fn lowest_pending_offset(&self, identity: &FileIdentity) -> Option<u64> {
        self.files
            .get(identity)
            .and_then(|pending| pending.first_key_value().map(|(start, _)| *start))
    }

    /// Offset that is safe to persist for `identity`:
    /// - the lowest pending start if records are in flight
    /// - otherwise the end of the highest acknowledged record
    /// - `None` when nothing was ever acknowledged
    pub fn persistable_offset(&self, identity: &FileIdentity) -> Option<u64> {
        if let Some(lowest) = self.lowest_pending_offset(identity) {
            return Some(lowest);
        }

        self.high_water_marks.get(identity).map(|hwm| hwm.end)
    }

    pub fn pending_count(&self, identity: &FileIdentity) -> usize {
        self.files.get(identity).map(|p| p.len()).unwrap_or(0)
    }

    pub fn has_pending(&self, identity: &FileIdentity) -> bool {
        self.pending_count(identity) > 0
    }

    /// Drop all state for `identity`.
    pub fn remove(&mut self, identity: &FileIdentity) {
        self.files.remove(identity);
        self.high_water_marks.remove(identity);
    }
}
