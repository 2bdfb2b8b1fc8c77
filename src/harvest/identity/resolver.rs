// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use tokio::io::AsyncSeekExt;
use tracing::debug;

use super::{FileIdentity, FileKey, Fingerprint};
use crate::harvest::error::{Error, Result};

struct Assignment {
    identity: FileIdentity,
    /// Leading bytes seen so far. Starts as the identity's fingerprint and
    /// grows with the file until it covers the fingerprint size.
    head: Fingerprint,
}

/// Assigns identities to files and hands back the same identity for the same
/// physical file on every later call.
///
/// The resolver remembers the identity currently assigned to each device and
/// inode, together with a head fingerprint over the leading bytes seen so
/// far. A file keeps its identity while its leading bytes still match that
/// head. Otherwise the inode now holds different content (rotation onto a
/// reused inode, truncate and rewrite) and a new identity is minted.
///
/// The head only grows, so a file that was empty or short when first seen is
/// compared against the content it had later, not against nothing.
pub struct IdentityResolver {
    fingerprint_size: usize,
    assigned: Mutex<HashMap<FileKey, Assignment>>,
}

impl IdentityResolver {
    pub fn new(fingerprint_size: usize) -> Self {
        Self {
            fingerprint_size,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    pub fn fingerprint_size(&self) -> usize {
        self.fingerprint_size
    }

    /// Remember an identity loaded from the registry, with the longest head
    /// recorded for it. Later seeds for the same inode replace earlier ones.
    pub fn seed(&self, identity: FileIdentity, head: Option<Fingerprint>) {
        let head = head
            .filter(|h| h.len > identity.fingerprint.len)
            .unwrap_or(identity.fingerprint);
        self.assigned
            .lock()
            .insert(identity.key, Assignment { identity, head });
    }

    /// Drop an identity, unless its inode was already reassigned.
    pub fn forget(&self, identity: &FileIdentity) {
        let mut assigned = self.assigned.lock();
        if assigned
            .get(&identity.key)
            .is_some_and(|a| a.identity == *identity)
        {
            assigned.remove(&identity.key);
        }
    }

    /// Current head fingerprint of `identity`, if it is still the identity
    /// assigned to its inode.
    pub fn head(&self, identity: &FileIdentity) -> Option<Fingerprint> {
        self.assigned
            .lock()
            .get(&identity.key)
            .filter(|a| a.identity == *identity)
            .map(|a| a.head)
    }

    /// Extend the head of `identity` after more of the file was consumed.
    /// Shorter heads are ignored.
    pub fn update_head(&self, identity: &FileIdentity, head: Fingerprint) {
        if let Some(a) = self.assigned.lock().get_mut(&identity.key) {
            if a.identity == *identity && head.len > a.head.len {
                a.head = head;
            }
        }
    }

    /// Resolve the identity of the file currently at `path`.
    pub fn identify(&self, path: &Path) -> Result<FileIdentity> {
        let mut file = std::fs::File::open(path).map_err(|e| Error::not_accessible(path, e))?;
        let metadata = file
            .metadata()
            .map_err(|e| Error::not_accessible(path, e))?;
        let head = Fingerprint::read_head(&mut file, self.fingerprint_size)
            .map_err(|e| Error::not_accessible(path, e))?;

        Ok(self.resolve(FileKey::from_metadata(&metadata), &head))
    }

    /// Mint a fresh identity for an open handle whose content was replaced.
    /// The handle is left positioned at the start of the file.
    pub async fn reidentify(&self, file: &mut tokio::fs::File) -> std::io::Result<FileIdentity> {
        let metadata = file.metadata().await?;
        let head = Fingerprint::read_head_async(file, self.fingerprint_size).await?;
        file.seek(SeekFrom::Start(0)).await?;

        let identity = FileIdentity::new(
            FileKey::from_metadata(&metadata),
            Fingerprint::from_bytes(&head),
        );
        self.assigned.lock().insert(
            identity.key,
            Assignment {
                identity,
                head: identity.fingerprint,
            },
        );
        Ok(identity)
    }

    fn resolve(&self, key: FileKey, head: &[u8]) -> FileIdentity {
        let mut assigned = self.assigned.lock();

        if let Some(known) = assigned.get_mut(&key) {
            if known.head.matches(head) {
                if head.len() > known.head.len as usize {
                    known.head = Fingerprint::from_bytes(head);
                }
                return known.identity;
            }
            debug!(
                identity = %known.identity,
                "Content no longer matches fingerprint, assigning new identity"
            );
        }

        let identity = FileIdentity::new(key, Fingerprint::from_bytes(head));
        assigned.insert(
            key,
            Assignment {
                identity,
                head: identity.fingerprint,
            },
        );
        identity
    }
}
