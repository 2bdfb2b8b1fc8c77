// SPDX-License-Identifier: Apache-2.0

//! Persisted registry entry schema.
//!
//! Every field added after version 1 must carry a serde default so that older
//! entries keep loading. Unknown fields are ignored, so entries written by a
//! newer agent can be read by an older one.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::harvest::identity::{FileIdentity, Fingerprint};

/// Current schema version for persisted entries
pub const REGISTRY_ENTRY_VERSION: u8 = 1;

/// Lifecycle of a known file, as last recorded
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// A harvester is reading the file
    Active,
    /// Known and still present, but nobody is reading it
    #[default]
    Inactive,
    /// No longer matched by the configured patterns
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    #[serde(default = "default_version")]
    pub version: u8,

    pub identity: FileIdentity,

    /// Last path the file was seen under
    pub path: PathBuf,

    /// Bytes consumed and acknowledged
    pub offset: u64,

    /// File size when last checked
    #[serde(default)]
    pub size: u64,

    /// Unix epoch millis of the last time the file was seen by a scan
    #[serde(default)]
    pub last_seen_ms: u64,

    #[serde(default)]
    pub state: EntryState,

    /// Fingerprint over the leading bytes consumed so far, once it covers
    /// more than the identity's own fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<Fingerprint>,
}

fn default_version() -> u8 {
    REGISTRY_ENTRY_VERSION
}

impl RegistryEntry {
    pub fn new(identity: FileIdentity, path: PathBuf, offset: u64, size: u64) -> Self {
        Self {
            version: REGISTRY_ENTRY_VERSION,
            identity,
            path,
            offset,
            size,
            last_seen_ms: now_millis(),
            state: EntryState::default(),
            head: None,
        }
    }

    /// Longest known head fingerprint of the file.
    pub fn head(&self) -> Fingerprint {
        self.head.unwrap_or(self.identity.fingerprint)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
