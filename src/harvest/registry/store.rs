// SPDX-License-Identifier: Apache-2.0

//! Durable storage for registry entries.
//!
//! Each identity is stored independently so that replacing one entry never
//! touches another. Writes go to a unique temp file which is synced and then
//! renamed over the target, so a crash leaves either the old or the new entry
//! on disk and never a torn one.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::entry::RegistryEntry;
use crate::harvest::error::{Error, Result};
use crate::harvest::identity::FileIdentity;

const ENTRY_EXTENSION: &str = "json";
const TEMP_MARKER: &str = ".tmp.";

/// Persistence backend for the registry.
pub trait Store: Send + Sync {
    /// Enumerate every persisted entry.
    fn load_all(&self) -> Result<Vec<RegistryEntry>>;

    /// Atomically create or replace the entry for `entry.identity`.
    fn put(&self, entry: &RegistryEntry) -> Result<()>;

    /// Remove the entry for `identity`. Removing a missing entry succeeds.
    fn remove(&self, identity: &FileIdentity) -> Result<()>;
}

/// One JSON document per identity inside a directory.
pub struct JsonDirStore {
    dir: PathBuf,
}

impl JsonDirStore {
    /// Open or create the store directory. Temp files left behind by an
    /// interrupted write are removed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            Error::Persistence(format!(
                "failed to create registry directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let store = Self { dir };
        store.remove_stale_temp_files()?;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, identity: &FileIdentity) -> PathBuf {
        self.dir
            .join(format!("{}.{}", identity.storage_key(), ENTRY_EXTENSION))
    }

    fn remove_stale_temp_files(&self) -> Result<()> {
        for dirent in read_dir(&self.dir)? {
            let path = dirent.path();
            if is_temp_file(&path) {
                debug!(path = ?path, "Removing stale registry temp file");
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = ?path, error = %e, "Failed to remove stale registry temp file");
                }
            }
        }
        Ok(())
    }
}

impl Store for JsonDirStore {
    fn load_all(&self) -> Result<Vec<RegistryEntry>> {
        let mut entries = Vec::new();

        for dirent in read_dir(&self.dir)? {
            let path = dirent.path();
            if is_temp_file(&path)
                || path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION)
            {
                continue;
            }

            let file = File::open(&path).map_err(|e| {
                Error::Persistence(format!(
                    "failed to open registry entry {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let entry: RegistryEntry =
                serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                    Error::Persistence(format!(
                        "failed to parse registry entry {}: {}. \
                         Remove the file to forget this entry.",
                        path.display(),
                        e
                    ))
                })?;
            entries.push(entry);
        }

        Ok(entries)
    }

    fn put(&self, entry: &RegistryEntry) -> Result<()> {
        atomic_write(&self.dir, &self.entry_path(&entry.identity), entry)
    }

    fn remove(&self, identity: &FileIdentity) -> Result<()> {
        match fs::remove_file(self.entry_path(identity)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Persistence(format!(
                "failed to remove registry entry for {}: {}",
                identity, e
            ))),
        }
    }
}

/// Keeps entries in memory only. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<FileIdentity, RegistryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn load_all(&self) -> Result<Vec<RegistryEntry>> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn put(&self, entry: &RegistryEntry) -> Result<()> {
        self.entries.lock().insert(entry.identity, entry.clone());
        Ok(())
    }

    fn remove(&self, identity: &FileIdentity) -> Result<()> {
        self.entries.lock().remove(identity);
        Ok(())
    }
}

fn read_dir(dir: &Path) -> Result<Vec<fs::DirEntry>> {
    let iter = fs::read_dir(dir).map_err(|e| {
        Error::Persistence(format!(
            "failed to read registry directory {}: {}",
            dir.display(),
            e
        ))
    })?;
    Ok(iter.filter_map(|d| d.ok()).collect())
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.contains(TEMP_MARKER))
        .unwrap_or(false)
}

fn atomic_write(dir: &Path, path: &Path, entry: &RegistryEntry) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    // Unique per process and per write so concurrent writers never share a temp file
    let unique_id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let temp_path = path.with_extension(format!(
        "{}{}{}.{}",
        ENTRY_EXTENSION,
        TEMP_MARKER,
        std::process::id(),
        unique_id
    ));

    let result = write_synced(&temp_path, entry).and_then(|()| {
        fs::rename(&temp_path, path).map_err(|e| {
            Error::Persistence(format!("failed to rename registry entry: {}", e))
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    sync_dir(dir);
    Ok(())
}

fn write_synced(temp_path: &Path, entry: &RegistryEntry) -> Result<()> {
    let file = File::create(temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, entry)
        .map_err(|e| Error::Persistence(format!("failed to write registry entry: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush registry entry: {}", e)))?;

    let file = writer
        .into_inner()
        .map_err(|e| Error::Persistence(format!("failed to flush registry entry: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::Persistence(format!("failed to sync registry entry: {}", e)))?;
    Ok(())
}

// Makes the rename itself durable. Not every platform lets a directory be
// opened for syncing, so failures are ignored.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::identity::{FileKey, Fingerprint};
    use tempfile::TempDir;

    fn identity(ino: u64) -> FileIdentity {
        FileIdentity::new(FileKey::new(1, ino), Fingerprint::from_bytes(b"head"))
    }

    #[test]
    fn test_put_and_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirStore::open(dir.path().join("registry")).unwrap();

        let mut entry = RegistryEntry::new(identity(7), PathBuf::from("/var/log/a.log"), 0, 50);
        store.put(&entry).unwrap();
        entry.offset = 50;
        store.put(&entry).unwrap();
        store
            .put(&RegistryEntry::new(identity(8), PathBuf::from("/var/log/b.log"), 0, 0))
            .unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by_key(|e| e.identity.key.ino);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], entry);

        // Only the two entry files remain, no temp files
        assert_eq!(fs::read_dir(store.dir()).unwrap().count(), 2);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let store = JsonDirStore::open(dir.path()).unwrap();

        let entry = RegistryEntry::new(identity(7), PathBuf::from("/var/log/a.log"), 0, 0);
        store.put(&entry).unwrap();
        store.remove(&entry.identity).unwrap();
        // Removing twice is fine
        store.remove(&entry.identity).unwrap();

        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_open_removes_stale_temp_files() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("1-7-abc.json.tmp.123.0");
        fs::write(&stale, b"{\"identity\":").unwrap();

        let store = JsonDirStore::open(dir.path()).unwrap();
        assert!(!stale.exists());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_entry_fails_load() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("1-7-abc.json"), b"not json").unwrap();

        let store = JsonDirStore::open(dir.path()).unwrap();
        let err = store.load_all().unwrap_err();
        assert!(err.to_string().contains("1-7-abc.json"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        let entry = RegistryEntry::new(identity(1), PathBuf::from("/a"), 3, 3);
        store.put(&entry).unwrap();
        assert_eq!(store.load_all().unwrap(), vec![entry.clone()]);
        store.remove(&entry.identity).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
