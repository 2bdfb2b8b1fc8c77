// SPDX-License-Identifier: Apache-2.0

use bytes::{Bytes, BytesMut};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::harvest::config::HarvestConfig;
use crate::harvest::error::{Error, Result};
use crate::harvest::record::ByteRange;

/// How a file is split into records
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub delimiter: Bytes,
    pub max_record_size: usize,
    pub read_buffer_size: usize,
}

impl From<&HarvestConfig> for ReaderOptions {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            delimiter: Bytes::copy_from_slice(config.delimiter.as_bytes()),
            max_record_size: config.max_record_size,
            read_buffer_size: config.read_buffer_size,
        }
    }
}

/// Outcome of one read call
#[derive(Debug, Default)]
pub struct Chunk {
    /// Complete records found, in file order
    pub records: Vec<(ByteRange, Bytes)>,
    /// The read hit end of file
    pub eof: bool,
}

/// Reads delimited records from an open file handle.
///
/// `offset` always points just past the last complete record returned.
/// Bytes read beyond it are kept as a partial record until the delimiter
/// shows up, they are never returned on their own.
pub struct RecordReader {
    file: File,
    path: PathBuf,
    offset: u64,
    pending: BytesMut,
    // Bytes of `pending` already searched for the delimiter
    scanned: usize,
    options: ReaderOptions,
}

impl RecordReader {
    /// Open `path` and position the reader at `offset`.
    pub async fn open(path: &Path, offset: u64, options: ReaderOptions) -> Result<Self> {
        let file = File::open(path).await.map_err(|e| Error::open(path, e))?;
        let mut reader = Self {
            file,
            path: path.to_path_buf(),
            offset: 0,
            pending: BytesMut::new(),
            scanned: 0,
            options,
        };
        reader
            .seek_to(offset)
            .await
            .map_err(|e| Error::open(path, e))?;
        Ok(reader)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_path(&mut self, path: PathBuf) {
        self.path = path;
    }

    /// End of the last complete record
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// File position of the next read
    pub fn read_pos(&self) -> u64 {
        self.offset + self.pending.len() as u64
    }

    /// Bytes of an incomplete trailing record are buffered
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub async fn file_len(&self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .await
            .map_err(|e| Error::read(&self.path, e))?;
        Ok(metadata.len())
    }

    /// Drop buffered data and continue reading at `offset`.
    pub async fn seek_to(&mut self, offset: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.offset = offset;
        self.pending.clear();
        self.scanned = 0;
        Ok(())
    }

    /// Read once and return the complete records that became available.
    pub async fn read_chunk(&mut self) -> Result<Chunk> {
        self.pending.reserve(self.options.read_buffer_size);
        let n = (&mut self.file)
            .take(self.options.read_buffer_size as u64)
            .read_buf(&mut self.pending)
            .await
            .map_err(|e| Error::read(&self.path, e))?;

        Ok(Chunk {
            records: self.split_records(),
            eof: n == 0,
        })
    }

    fn split_records(&mut self) -> Vec<(ByteRange, Bytes)> {
        let delimiter = self.options.delimiter.clone();
        let max = self.options.max_record_size;
        let mut records = Vec::new();

        loop {
            let found = find(&self.pending[self.scanned..], &delimiter).map(|i| i + self.scanned);

            let (consumed, payload_len) = match found {
                Some(i) if i <= max => (i + delimiter.len(), i),
                // Over-long record: cut it at the size limit, the remainder
                // becomes the next record
                _ if self.pending.len() >= max => (max, max),
                _ => {
                    self.scanned = self.pending.len().saturating_sub(delimiter.len() - 1);
                    break;
                }
            };

            let mut raw = self.pending.split_to(consumed);
            raw.truncate(payload_len);
            self.scanned = 0;

            let start = self.offset;
            self.offset += consumed as u64;
            records.push((ByteRange::new(start, self.offset), raw.freeze()));
        }

        records
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if let [byte] = needle {
        return haystack.iter().position(|b| b == byte);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::TempDir;

    fn options() -> ReaderOptions {
        ReaderOptions {
            delimiter: Bytes::from_static(b"\n"),
            max_record_size: 1024,
            read_buffer_size: 4096,
        }
    }

    fn append(path: &Path, data: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn payloads(chunk: &Chunk) -> Vec<&[u8]> {
        chunk.records.iter().map(|(_, p)| p.as_ref()).collect()
    }

    #[tokio::test]
    async fn test_reads_complete_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\ntwo\nthree\n").unwrap();

        let mut reader = RecordReader::open(&path, 0, options()).await.unwrap();
        let chunk = reader.read_chunk().await.unwrap();

        assert_eq!(payloads(&chunk), vec![&b"one"[..], b"two", b"three"]);
        assert_eq!(chunk.records[0].0, ByteRange::new(0, 4));
        assert_eq!(chunk.records[2].0, ByteRange::new(8, 14));
        assert_eq!(reader.offset(), 14);

        let chunk = reader.read_chunk().await.unwrap();
        assert!(chunk.eof);
        assert!(chunk.records.is_empty());
    }

    #[tokio::test]
    async fn test_partial_record_waits_for_delimiter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\ntw").unwrap();

        let mut reader = RecordReader::open(&path, 0, options()).await.unwrap();
        let chunk = reader.read_chunk().await.unwrap();
        assert_eq!(payloads(&chunk), vec![&b"one"[..]]);
        assert!(reader.has_partial());
        assert_eq!(reader.offset(), 4);
        assert_eq!(reader.read_pos(), 6);

        append(&path, b"o\n");
        let chunk = reader.read_chunk().await.unwrap();
        assert_eq!(payloads(&chunk), vec![&b"two"[..]]);
        assert_eq!(chunk.records[0].0, ByteRange::new(4, 8));
        assert!(!reader.has_partial());
    }

    #[tokio::test]
    async fn test_resumes_at_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\ntwo\n").unwrap();

        let mut reader = RecordReader::open(&path, 4, options()).await.unwrap();
        let chunk = reader.read_chunk().await.unwrap();
        assert_eq!(payloads(&chunk), vec![&b"two"[..]]);
        assert_eq!(chunk.records[0].0, ByteRange::new(4, 8));
    }

    #[tokio::test]
    async fn test_splits_oversized_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"abcdefghij\nxy\n").unwrap();

        let opts = ReaderOptions {
            max_record_size: 4,
            ..options()
        };
        let mut reader = RecordReader::open(&path, 0, opts).await.unwrap();
        let chunk = reader.read_chunk().await.unwrap();

        assert_eq!(
            payloads(&chunk),
            vec![&b"abcd"[..], b"efgh", b"ij", b"xy"]
        );
        // Ranges stay contiguous so offsets never skip bytes
        assert_eq!(chunk.records[0].0, ByteRange::new(0, 4));
        assert_eq!(chunk.records[2].0, ByteRange::new(8, 11));
        assert_eq!(reader.offset(), 14);
    }

    #[tokio::test]
    async fn test_multi_byte_delimiter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a\r\nb\r\nc\r").unwrap();

        let opts = ReaderOptions {
            delimiter: Bytes::from_static(b"\r\n"),
            ..options()
        };
        let mut reader = RecordReader::open(&path, 0, opts).await.unwrap();
        let chunk = reader.read_chunk().await.unwrap();
        assert_eq!(payloads(&chunk), vec![&b"a"[..], b"b"]);

        // Delimiter split across reads
        append(&path, b"\n");
        let chunk = reader.read_chunk().await.unwrap();
        assert_eq!(payloads(&chunk), vec![&b"c"[..]]);
        assert_eq!(chunk.records[0].0, ByteRange::new(6, 9));
    }

    #[tokio::test]
    async fn test_seek_to_resets_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\npartial").unwrap();

        let mut reader = RecordReader::open(&path, 0, options()).await.unwrap();
        reader.read_chunk().await.unwrap();
        assert!(reader.has_partial());

        reader.seek_to(0).await.unwrap();
        assert_eq!(reader.read_pos(), 0);
        let chunk = reader.read_chunk().await.unwrap();
        assert_eq!(payloads(&chunk), vec![&b"one"[..]]);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = RecordReader::open(&dir.path().join("nope.log"), 0, options())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Open { .. }));
    }
}
