// SPDX-License-Identifier: Apache-2.0

//! File identity: which physical file a path points at, independent of the
//! path itself.

mod file_key;
mod fingerprint;
mod resolver;

pub use file_key::{FileKey, get_path_from_file};
pub use fingerprint::Fingerprint;
pub use resolver::IdentityResolver;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable key of a physical file: device, inode and the fingerprint taken
/// when the identity was assigned.
///
/// A path whose identity changes (rotation, inode reuse, rewrite in place) is
/// a new file from the engine's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    #[serde(flatten)]
    pub key: FileKey,
    pub fingerprint: Fingerprint,
}

impl FileIdentity {
    pub fn new(key: FileKey, fingerprint: Fingerprint) -> Self {
        Self { key, fingerprint }
    }

    /// File-name safe form, used as the registry storage key.
    pub fn storage_key(&self) -> String {
        format!("{}-{}-{}", self.key.dev, self.key.ino, self.fingerprint)
    }
}

impl fmt::Display for FileIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_storage_key() {
        let id = FileIdentity::new(FileKey::new(64769, 1234), Fingerprint { len: 3, hash: 0xab });
        assert_eq!(id.to_string(), "64769:1234:00000000000000ab");
        assert_eq!(id.storage_key(), "64769-1234-00000000000000ab");
    }

    #[test]
    fn test_serialized_shape() {
        let id = FileIdentity::new(FileKey::new(1, 2), Fingerprint { len: 4, hash: 5 });
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"dev": 1, "ino": 2, "fingerprint": {"len": 4, "hash": 5}})
        );

        let back: FileIdentity = serde_json::from_value(json).unwrap();
        assert_eq!(back, id);
    }
}
