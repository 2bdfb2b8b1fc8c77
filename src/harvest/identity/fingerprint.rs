// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Digest of the leading bytes of a file, taken when its identity is assigned.
///
/// Only `len` bytes are covered, so the fingerprint of a file that was small
/// when first seen keeps matching while the file grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Number of leading bytes covered by the digest
    pub len: u32,
    /// First 8 bytes of the SHA-256 of those bytes
    pub hash: u64,
}

impl Fingerprint {
    /// Fingerprint an already truncated head of a file.
    pub fn from_bytes(head: &[u8]) -> Self {
        Self {
            len: head.len() as u32,
            hash: digest(head),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when `head` (the file's current leading bytes) starts with the
    /// bytes this fingerprint was taken from. An empty fingerprint matches
    /// any content.
    pub fn matches(&self, head: &[u8]) -> bool {
        let len = self.len as usize;
        if head.len() < len {
            return false;
        }
        digest(&head[..len]) == self.hash
    }

    /// Read up to `size` bytes from the start of the file.
    pub fn read_head(file: &mut File, size: usize) -> io::Result<Vec<u8>> {
        file.seek(SeekFrom::Start(0))?;

        let mut buf = Vec::with_capacity(size);
        file.by_ref().take(size as u64).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Async counterpart of [`Fingerprint::read_head`]. Leaves the file
    /// positioned after the head, callers seek back to where they were.
    pub async fn read_head_async(file: &mut tokio::fs::File, size: usize) -> io::Result<Vec<u8>> {
        file.seek(SeekFrom::Start(0)).await?;

        let mut buf = Vec::with_capacity(size);
        file.take(size as u64).read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.hash)
    }
}

pub(crate) fn digest(bytes: &[u8]) -> u64 {
    let sum = Sha256::digest(bytes);
    let mut leading = [0u8; 8];
    leading.copy_from_slice(&sum[..8]);
    u64::from_be_bytes(leading)
}
