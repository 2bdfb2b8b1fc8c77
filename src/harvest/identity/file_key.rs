// SPDX-License-Identifier: Apache-2.0

//! Physical file key based on device and inode.
//!
//! The key stays stable across renames, which is what lets a harvester follow
//! a file through rotation.

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};

/// Device ID + inode number of a file.
///
/// Off Unix there is no portable inode, so `ino` is derived from the creation
/// timestamp and `dev` is always 0. That fallback is weaker: two files created
/// in the same instant share a key, and the fingerprint is all that tells
/// them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
}

impl FileKey {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            dev: 0,
            ino: creation_key(metadata.created().ok()),
        }
    }

    /// Stat the path without opening it.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

#[cfg(any(not(unix), test))]
fn creation_key(created: Option<std::time::SystemTime>) -> u64 {
    let nanos = created
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    super::fingerprint::digest(&nanos.to_be_bytes())
}

/// Get the current path of an open file handle.
///
/// Used to follow a file after it was renamed. Fails if the file was deleted
/// while the handle is still open.
#[cfg(target_os = "linux")]
pub fn get_path_from_file(file: &impl std::os::fd::AsRawFd) -> io::Result<PathBuf> {
    let link_path = format!("/proc/self/fd/{}", file.as_raw_fd());
    let path = std::fs::read_link(&link_path)?;

    // The kernel marks unlinked files instead of failing the readlink
    if path.to_string_lossy().ends_with(" (deleted)") {
        return Err(io::Error::new(io::ErrorKind::NotFound, "file was deleted"));
    }
    Ok(path)
}

/// Get the current path of an open file handle.
#[cfg(target_os = "macos")]
pub fn get_path_from_file(file: &impl std::os::fd::AsRawFd) -> io::Result<PathBuf> {
    let fd = file.as_raw_fd();

    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let result = unsafe { libc::fcntl(fd, libc::F_GETPATH, buf.as_mut_ptr()) };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let path = std::str::from_utf8(&buf[..len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(PathBuf::from(path))
}

/// Get the current path of an open file handle.
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn get_path_from_file<F>(_file: &F) -> io::Result<PathBuf> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "resolving a path from a file handle is not supported on this platform",
    ))
}
