// SPDX-License-Identifier: Apache-2.0

//! Durable ledger of per-file read progress.
//!
//! The registry keeps two offsets per identity:
//! - the *proposed* offset, advanced by the harvester as it reads. It lives in
//!   memory only.
//! - the *committed* offset, advanced only after the publisher acknowledged the
//!   records before it. It is persisted before `commit` returns.
//!
//! A restart resumes from the committed offset, so anything read but not yet
//! acknowledged is delivered again (at-least-once).

mod entry;
mod store;

pub use entry::{EntryState, REGISTRY_ENTRY_VERSION, RegistryEntry};
pub use store::{JsonDirStore, MemoryStore, Store};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::harvest::error::Result;
use crate::harvest::identity::{FileIdentity, Fingerprint};
use entry::now_millis;

struct Slot {
    entry: RegistryEntry,
    proposed: Option<u64>,
    // Metadata changed since the entry was last persisted
    dirty: bool,
    // Pruned; late commits must not write the entry back
    removed: bool,
}

type SharedSlot = Arc<Mutex<Slot>>;

/// Registry of known files. Entries are locked individually, operations on
/// different identities never wait on each other's I/O.
pub struct Registry {
    store: Box<dyn Store>,
    slots: RwLock<HashMap<FileIdentity, SharedSlot>>,
}

impl Registry {
    /// Load every persisted entry from `store`.
    pub fn open(store: impl Store + 'static) -> Result<Self> {
        let entries = store.load_all()?;
        debug!(entries = entries.len(), "Loaded registry");

        let slots = entries
            .into_iter()
            .map(|entry| {
                let slot = Slot {
                    entry,
                    proposed: None,
                    dirty: false,
                    removed: false,
                };
                (slot.entry.identity, Arc::new(Mutex::new(slot)))
            })
            .collect();

        Ok(Self {
            store: Box::new(store),
            slots: RwLock::new(slots),
        })
    }

    fn slot(&self, identity: &FileIdentity) -> Option<SharedSlot> {
        self.slots.read().get(identity).cloned()
    }

    pub fn get(&self, identity: &FileIdentity) -> Option<RegistryEntry> {
        self.slot(identity).map(|slot| slot.lock().entry.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all entries.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        let slots: Vec<SharedSlot> = self.slots.read().values().cloned().collect();
        slots.iter().map(|s| s.lock().entry.clone()).collect()
    }

    /// Create and persist the entry for a newly discovered file, starting at
    /// `offset`. An existing entry is returned unchanged.
    ///
    /// Only the new entry is locked while it is written, other identities
    /// stay available.
    pub fn register(
        &self,
        identity: FileIdentity,
        path: &Path,
        offset: u64,
        size: u64,
    ) -> Result<RegistryEntry> {
        let fresh: SharedSlot = Arc::new(Mutex::new(Slot {
            entry: RegistryEntry::new(identity, path.to_path_buf(), offset, size),
            proposed: None,
            dirty: false,
            removed: false,
        }));

        let mut slots = self.slots.write();
        if let Some(existing) = slots.get(&identity) {
            let existing = existing.clone();
            drop(slots);
            return Ok(existing.lock().entry.clone());
        }
        slots.insert(identity, fresh.clone());
        let mut slot = fresh.lock();
        drop(slots);

        if let Err(e) = self.store.put(&slot.entry) {
            slot.removed = true;
            drop(slot);

            let mut slots = self.slots.write();
            if slots
                .get(&identity)
                .is_some_and(|current| Arc::ptr_eq(current, &fresh))
            {
                slots.remove(&identity);
            }
            return Err(e);
        }

        Ok(slot.entry.clone())
    }

    /// Record that a scan saw the file. Persisted on the next commit or flush.
    pub fn touch(&self, identity: &FileIdentity, path: &Path, size: u64) {
        if let Some(slot) = self.slot(identity) {
            let mut slot = slot.lock();
            if slot.entry.path != path {
                slot.entry.path = path.to_path_buf();
            }
            slot.entry.size = size;
            slot.entry.last_seen_ms = now_millis();
            slot.dirty = true;
        }
    }

    /// Record a longer head fingerprint for `identity`. Persisted on the next
    /// commit or flush.
    pub fn update_head(&self, identity: &FileIdentity, head: Fingerprint) {
        if let Some(slot) = self.slot(identity) {
            let mut slot = slot.lock();
            if head.len > slot.entry.head().len {
                slot.entry.head = Some(head);
                slot.dirty = true;
            }
        }
    }

    pub fn set_state(&self, identity: &FileIdentity, state: EntryState) {
        if let Some(slot) = self.slot(identity) {
            let mut slot = slot.lock();
            if slot.entry.state != state {
                slot.entry.state = state;
                slot.dirty = true;
            }
        }
    }

    /// Note how far a harvester has read. Not durable.
    pub fn propose(&self, identity: &FileIdentity, offset: u64) {
        if let Some(slot) = self.slot(identity) {
            let mut slot = slot.lock();
            slot.proposed = Some(slot.proposed.map_or(offset, |p| p.max(offset)));
        }
    }

    /// Offset a new harvester for `identity` should start at. Within one run
    /// this includes data already read but not yet acknowledged, those records
    /// are in flight and must not be read twice.
    pub fn resume_offset(&self, identity: &FileIdentity) -> Option<u64> {
        self.slot(identity).map(|slot| {
            let slot = slot.lock();
            slot.proposed
                .map_or(slot.entry.offset, |p| p.max(slot.entry.offset))
        })
    }

    /// Persist an acknowledged offset. Returns `Ok(true)` if the persisted
    /// offset advanced. Offsets at or below the persisted one are ignored, so
    /// commits are idempotent and never regress.
    pub fn commit(&self, identity: &FileIdentity, offset: u64) -> Result<bool> {
        let Some(slot) = self.slot(identity) else {
            debug!(identity = %identity, offset, "Ignoring commit for unknown file");
            return Ok(false);
        };

        let mut slot = slot.lock();
        if slot.removed || offset <= slot.entry.offset {
            return Ok(false);
        }

        let mut updated = slot.entry.clone();
        updated.offset = offset;
        self.store.put(&updated)?;

        slot.entry = updated;
        slot.dirty = false;
        debug!(identity = %identity, offset, "Committed offset");
        Ok(true)
    }

    /// Persist entries whose metadata changed since they were last written.
    /// Returns how many entries were written.
    pub fn flush(&self) -> Result<usize> {
        let slots: Vec<SharedSlot> = self.slots.read().values().cloned().collect();

        let mut written = 0;
        let mut first_error = None;
        for slot in slots {
            let mut slot = slot.lock();
            if !slot.dirty || slot.removed {
                continue;
            }
            match self.store.put(&slot.entry) {
                Ok(()) => {
                    slot.dirty = false;
                    written += 1;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Remove entries for files unseen for longer than `older_than`, except
    /// those `keep` vouches for. Returns the removed identities.
    pub fn prune(
        &self,
        older_than: Duration,
        keep: impl Fn(&FileIdentity) -> bool,
    ) -> Result<Vec<FileIdentity>> {
        let cutoff = now_millis().saturating_sub(older_than.as_millis() as u64);
        let candidates: Vec<(FileIdentity, SharedSlot)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut pruned = Vec::new();
        for (identity, shared) in candidates {
            {
                let mut slot = shared.lock();
                if slot.removed || slot.entry.last_seen_ms >= cutoff || keep(&identity) {
                    continue;
                }
                self.store.remove(&identity)?;
                slot.removed = true;
            }

            let mut slots = self.slots.write();
            if slots
                .get(&identity)
                .is_some_and(|current| Arc::ptr_eq(current, &shared))
            {
                slots.remove(&identity);
            }
            debug!(identity = %identity, "Pruned registry entry");
            pruned.push(identity);
        }

        Ok(pruned)
    }
}
