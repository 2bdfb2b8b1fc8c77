// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;

use crate::harvest::identity::FileIdentity;

/// Half-open byte range `[start, end)` of a record within its file,
/// including the trailing delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// One unit of work emitted by a harvester.
///
/// The payload is opaque: the record's bytes without the delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub identity: FileIdentity,
    /// Path the harvester was reading when the record was emitted
    pub source: Arc<PathBuf>,
    pub range: ByteRange,
    pub payload: Bytes,
}
