// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::harvest::identity::{FileIdentity, FileKey};

/// Files currently owned by a live harvester.
///
/// Claims are keyed by device and inode, so one physical file can never be
/// harvested twice even while its identity is being replaced after a
/// truncation. Claiming is an atomic check-and-mark.
#[derive(Default)]
pub struct ClaimSet {
    claims: Mutex<HashMap<FileKey, FileIdentity>>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `identity`. Returns false if its file is already claimed.
    pub fn try_claim(&self, identity: FileIdentity) -> bool {
        let mut claims = self.claims.lock();
        if claims.contains_key(&identity.key) {
            return false;
        }
        claims.insert(identity.key, identity);
        true
    }

    /// Point an existing claim at the file's new identity.
    pub fn rebind(&self, identity: FileIdentity) {
        if let Some(current) = self.claims.lock().get_mut(&identity.key) {
            *current = identity;
        }
    }

    pub fn release(&self, key: &FileKey) -> Option<FileIdentity> {
        self.claims.lock().remove(key)
    }

    /// Identity the claim on `key` currently points at.
    pub fn get(&self, key: &FileKey) -> Option<FileIdentity> {
        self.claims.lock().get(key).copied()
    }

    pub fn is_claimed(&self, identity: &FileIdentity) -> bool {
        self.claims.lock().get(&identity.key) == Some(identity)
    }

    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
