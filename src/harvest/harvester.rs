// SPDX-License-Identifier: Apache-2.0

//! Per-file harvester.
//!
//! A harvester owns one open file handle for its whole life. It reads
//! delimited records, hands them to the spooler and proposes its new offset to
//! the registry after every batch. It keeps the handle across renames and only
//! gives it up once the file was drained, went idle, or the agent shuts down.

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncSeekExt;
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::harvest::claims::ClaimSet;
use crate::harvest::error::{Error, Result};
use crate::harvest::identity::{
    FileIdentity, FileKey, Fingerprint, IdentityResolver, get_path_from_file,
};
use crate::harvest::offset_tracker::SharedOffsetTracker;
use crate::harvest::reader::{ReaderOptions, RecordReader};
use crate::harvest::record::{ByteRange, Record};
use crate::harvest::registry::{EntryState, Registry};
use crate::harvest::spooler::Spooler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvesterState {
    Starting,
    Reading,
    /// At end of file, polling for growth
    WaitingForData,
    /// The path now points at another file, draining the held handle
    Rotated,
    /// The file shrank or its content was replaced, restarting from 0
    Truncated,
    Closed,
}

impl fmt::Display for HarvesterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HarvesterState::Starting => "starting",
            HarvesterState::Reading => "reading",
            HarvesterState::WaitingForData => "waiting_for_data",
            HarvesterState::Rotated => "rotated",
            HarvesterState::Truncated => "truncated",
            HarvesterState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Timing knobs for a harvester
#[derive(Debug, Clone)]
pub struct HarvesterTiming {
    pub poll_interval: Duration,
    pub rotate_wait: Duration,
    pub close_inactive: Duration,
}

/// Everything a harvester shares with the rest of the engine.
#[derive(Clone)]
pub struct HarvesterContext {
    pub registry: Arc<Registry>,
    pub resolver: Arc<IdentityResolver>,
    pub claims: Arc<ClaimSet>,
    pub tracker: SharedOffsetTracker,
    pub spooler: Spooler,
    pub reader_options: ReaderOptions,
    pub timing: HarvesterTiming,
    /// Agent-wide shutdown: finish the current cycle and close
    pub shutdown: CancellationToken,
}

/// Result reported back to the prospector when a harvester exits.
#[derive(Debug)]
pub struct HarvestOutcome {
    pub key: FileKey,
    /// Identity at exit, differs from the starting one after a truncation
    pub identity: FileIdentity,
    pub path: PathBuf,
    pub state: HarvesterState,
    pub result: Result<()>,
}

pub struct Harvester {
    ctx: HarvesterContext,
    identity: FileIdentity,
    path: PathBuf,
    source: Arc<PathBuf>,
    /// Fingerprint over the leading bytes consumed so far
    head: Fingerprint,
    start_offset: u64,
    state: HarvesterState,
    /// Drain to end of file, then close
    stop: CancellationToken,
    draining: bool,
    last_growth: Instant,
    rotated: bool,
}

impl Harvester {
    pub fn new(
        ctx: HarvesterContext,
        identity: FileIdentity,
        path: PathBuf,
        start_offset: u64,
        stop: CancellationToken,
    ) -> Self {
        let head = ctx
            .resolver
            .head(&identity)
            .unwrap_or(identity.fingerprint);
        Self {
            ctx,
            identity,
            source: Arc::new(path.clone()),
            head,
            path,
            start_offset,
            state: HarvesterState::Starting,
            stop,
            draining: false,
            last_growth: Instant::now(),
            rotated: false,
        }
    }

    pub fn state(&self) -> HarvesterState {
        self.state
    }

    pub async fn run(mut self) -> HarvestOutcome {
        let key = self.identity.key;
        let result = self.harvest().await;

        self.transition(HarvesterState::Closed);
        let state = if self.draining {
            EntryState::Removed
        } else {
            EntryState::Inactive
        };
        self.ctx.registry.set_state(&self.identity, state);

        HarvestOutcome {
            key,
            identity: self.identity,
            path: self.path,
            state: self.state,
            result,
        }
    }

    fn transition(&mut self, next: HarvesterState) {
        if self.state != next {
            debug!(
                path = ?self.path,
                identity = %self.identity,
                from = %self.state,
                to = %next,
                "Harvester state change"
            );
            self.state = next;
        }
    }

    async fn harvest(&mut self) -> Result<()> {
        let mut reader = RecordReader::open(
            &self.path,
            self.start_offset,
            self.ctx.reader_options.clone(),
        )
        .await?;

        // The path may have been replaced between the scan and the open
        let metadata = reader
            .file_mut()
            .metadata()
            .await
            .map_err(|e| Error::open(&self.path, e))?;
        if FileKey::from_metadata(&metadata) != self.identity.key {
            return Err(Error::open(
                &self.path,
                io::Error::new(io::ErrorKind::NotFound, "file replaced before open"),
            ));
        }

        debug!(
            path = ?self.path,
            identity = %self.identity,
            offset = self.start_offset,
            "Harvester started"
        );
        self.ctx
            .registry
            .set_state(&self.identity, EntryState::Active);
        self.transition(HarvesterState::Reading);

        loop {
            if self.ctx.shutdown.is_cancelled() {
                return Ok(());
            }
            if !self.draining && self.stop.is_cancelled() {
                debug!(path = ?self.path, "File left the candidate set, draining");
                self.draining = true;
            }

            match self.state {
                HarvesterState::Reading => {
                    let chunk = reader.read_chunk().await?;
                    if !chunk.records.is_empty() {
                        self.last_growth = Instant::now();
                        if !self.emit(chunk.records).await? {
                            return Ok(());
                        }
                    }
                    if chunk.eof {
                        if !self.refresh_head(&mut reader).await? {
                            let len = reader.file_len().await?;
                            self.restart_from_beginning(&mut reader, len).await?;
                            continue;
                        }
                        let next = if self.rotated {
                            HarvesterState::Rotated
                        } else {
                            HarvesterState::WaitingForData
                        };
                        self.transition(next);
                    }
                }
                HarvesterState::WaitingForData | HarvesterState::Rotated => {
                    if !self.check_for_data(&mut reader).await? {
                        return Ok(());
                    }
                }
                HarvesterState::Starting
                | HarvesterState::Truncated
                | HarvesterState::Closed => return Ok(()),
            }
        }
    }

    /// Inspect the file after end of file was reached. Returns false once the
    /// harvester should close.
    async fn check_for_data(&mut self, reader: &mut RecordReader) -> Result<bool> {
        let len = reader.file_len().await?;
        let read_pos = reader.read_pos();

        if len < read_pos {
            self.restart_from_beginning(reader, len).await?;
            return Ok(true);
        }

        if len > read_pos {
            if !self.head_matches(reader).await? {
                self.restart_from_beginning(reader, len).await?;
                return Ok(true);
            }
            self.last_growth = Instant::now();
            self.transition(HarvesterState::Reading);
            return Ok(true);
        }

        if self.draining {
            debug!(path = ?self.path, "File drained after removal");
            return Ok(false);
        }

        if !self.rotated && self.path_moved() {
            self.rotated = true;
            self.follow_rename(reader);
            info!(
                path = ?self.path,
                identity = %self.identity,
                "File rotated, draining before close"
            );
            self.transition(HarvesterState::Rotated);
        }

        let idle = self.last_growth.elapsed();
        if self.rotated && idle >= self.ctx.timing.rotate_wait {
            debug!(path = ?self.path, "Rotated file drained");
            return Ok(false);
        }
        if idle >= self.ctx.timing.close_inactive {
            debug!(path = ?self.path, idle = ?idle, "Closing inactive file");
            return Ok(false);
        }

        select! {
            _ = tokio::time::sleep(self.ctx.timing.poll_interval) => {},
            _ = self.stop.cancelled(), if !self.draining => {},
            _ = self.ctx.shutdown.cancelled() => {},
        }
        Ok(true)
    }

    /// Hand records to the spooler, waiting while it is full. Returns false if
    /// shutdown interrupted a blocked push. That record was never handed over
    /// and will be read again after a restart.
    async fn emit(&mut self, records: Vec<(ByteRange, bytes::Bytes)>) -> Result<bool> {
        let mut proposed = None;
        let mut completed = true;

        for (range, payload) in records {
            let record = Record {
                identity: self.identity,
                source: self.source.clone(),
                range,
                payload,
            };
            self.ctx.tracker.lock().track(self.identity, range);

            let pushed = select! {
                biased;
                res = self.ctx.spooler.push(record) => res,
                _ = self.ctx.shutdown.cancelled() => {
                    self.ctx.tracker.lock().untrack(self.identity, range);
                    completed = false;
                    break;
                }
            };
            if let Err(e) = pushed {
                self.ctx.tracker.lock().untrack(self.identity, range);
                return Err(e);
            }
            proposed = Some(range.end);
        }

        if let Some(offset) = proposed {
            self.ctx.registry.propose(&self.identity, offset);
        }
        Ok(completed)
    }

    /// Read `len` leading bytes, leaving the reader where it was.
    async fn read_head(&self, reader: &mut RecordReader, len: usize) -> Result<Vec<u8>> {
        let read_pos = reader.read_pos();
        let file = reader.file_mut();
        let head = Fingerprint::read_head_async(file, len)
            .await
            .map_err(|e| Error::read(&self.path, e))?;
        file.seek(SeekFrom::Start(read_pos))
            .await
            .map_err(|e| Error::read(&self.path, e))?;
        Ok(head)
    }

    async fn head_matches(&self, reader: &mut RecordReader) -> Result<bool> {
        let head = self.read_head(reader, self.head.len as usize).await?;
        Ok(self.head.matches(&head))
    }

    /// Extend the head fingerprint over the bytes consumed so far. Returns
    /// false when the file no longer starts with the known head.
    async fn refresh_head(&mut self, reader: &mut RecordReader) -> Result<bool> {
        let want = reader
            .offset()
            .min(self.ctx.resolver.fingerprint_size() as u64) as usize;
        if want <= self.head.len as usize {
            return Ok(true);
        }

        let head = self.read_head(reader, want).await?;
        if head.len() < want {
            // Shrank under us, the next length check restarts the file
            return Ok(true);
        }
        if !self.head.matches(&head) {
            return Ok(false);
        }

        let head = Fingerprint::from_bytes(&head);
        self.head = head;
        self.ctx.resolver.update_head(&self.identity, head);
        self.ctx.registry.update_head(&self.identity, head);
        Ok(true)
    }

    /// The file shrank or was rewritten in place. Data before the truncation
    /// point that was never read is lost; the new content is read from offset
    /// 0 under a fresh identity.
    async fn restart_from_beginning(&mut self, reader: &mut RecordReader, len: u64) -> Result<()> {
        warn!(
            path = ?self.path,
            identity = %self.identity,
            offset = reader.read_pos(),
            size = len,
            "File truncated, reading from the beginning"
        );
        self.transition(HarvesterState::Truncated);

        let previous = self.identity;
        let identity = self
            .ctx
            .resolver
            .reidentify(reader.file_mut())
            .await
            .map_err(|e| Error::read(&self.path, e))?;
        reader
            .seek_to(0)
            .await
            .map_err(|e| Error::read(&self.path, e))?;

        self.ctx.registry.register(identity, &self.path, 0, len)?;
        self.ctx
            .registry
            .set_state(&previous, EntryState::Inactive);
        self.ctx
            .registry
            .set_state(&identity, EntryState::Active);
        self.ctx.claims.rebind(identity);
        self.identity = identity;
        self.head = identity.fingerprint;
        self.last_growth = Instant::now();

        self.transition(HarvesterState::Reading);
        Ok(())
    }

    /// True when the path no longer points at the held file.
    fn path_moved(&self) -> bool {
        match FileKey::from_path(&self.path) {
            Ok(key) => key != self.identity.key,
            Err(e) => e.kind() == io::ErrorKind::NotFound,
        }
    }

    fn follow_rename(&mut self, reader: &mut RecordReader) {
        if let Ok(path) = get_path_from_file(reader.file_mut()) {
            self.ctx
                .registry
                .touch(&self.identity, &path, reader.read_pos());
            reader.set_path(path.clone());
            self.source = Arc::new(path.clone());
            self.path = path;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::offset_tracker::OffsetTracker;
    use crate::harvest::registry::MemoryStore;
    use crate::harvest::spooler::{self, SpoolDrain};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;
    use tempfile::TempDir;

    struct Fixture {
        ctx: HarvesterContext,
        drain: SpoolDrain,
    }

    fn fixture(capacity: usize) -> Fixture {
        let (spooler, drain) = spooler::bounded(capacity, None);
        let ctx = HarvesterContext {
            registry: Arc::new(Registry::open(MemoryStore::new()).unwrap()),
            resolver: Arc::new(IdentityResolver::new(1000)),
            claims: Arc::new(ClaimSet::new()),
            tracker: Arc::new(Mutex::new(OffsetTracker::new())),
            spooler,
            reader_options: ReaderOptions {
                delimiter: Bytes::from_static(b"\n"),
                max_record_size: 1024,
                read_buffer_size: 4096,
            },
            timing: HarvesterTiming {
                poll_interval: Duration::from_millis(10),
                rotate_wait: Duration::from_millis(50),
                close_inactive: Duration::from_secs(60),
            },
            shutdown: CancellationToken::new(),
        };
        Fixture { ctx, drain }
    }

    fn start(
        fx: &Fixture,
        path: &Path,
        offset: u64,
    ) -> (tokio::task::JoinHandle<HarvestOutcome>, CancellationToken) {
        let identity = fx.ctx.resolver.identify(path).unwrap();
        fx.ctx
            .registry
            .register(identity, path, offset, 0)
            .unwrap();
        assert!(fx.ctx.claims.try_claim(identity));

        let stop = CancellationToken::new();
        let harvester = Harvester::new(
            fx.ctx.clone(),
            identity,
            path.to_path_buf(),
            offset,
            stop.clone(),
        );
        (tokio::spawn(harvester.run()), stop)
    }

    async fn collect(drain: &SpoolDrain, count: usize) -> Vec<Record> {
        let mut out = Vec::new();
        while out.len() < count {
            let batch = tokio::time::timeout(Duration::from_secs(5), drain.drain(count))
                .await
                .expect("timed out waiting for records")
                .expect("spooler closed");
            out.extend(batch);
        }
        out
    }

    fn append(path: &Path, data: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn payloads(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .map(|r| String::from_utf8_lossy(&r.payload).to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_reads_then_follows_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\ntwo\n").unwrap();

        let fx = fixture(16);
        let (handle, _stop) = start(&fx, &path, 0);

        let records = collect(&fx.drain, 2).await;
        assert_eq!(payloads(&records), vec!["one", "two"]);

        append(&path, b"three\n");
        let records = collect(&fx.drain, 1).await;
        assert_eq!(payloads(&records), vec!["three"]);
        assert_eq!(records[0].range, ByteRange::new(8, 14));

        let identity = records[0].identity;
        assert_eq!(fx.ctx.registry.resume_offset(&identity), Some(14));
        // Nothing acknowledged, nothing committed
        assert_eq!(fx.ctx.registry.get(&identity).unwrap().offset, 0);
        assert_eq!(fx.ctx.tracker.lock().pending_count(&identity), 3);

        fx.ctx.shutdown.cancel();
        let outcome = handle.await.unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.state, HarvesterState::Closed);
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        let original: Vec<u8> = (0..100)
            .flat_map(|i| format!("line {:04}\n", i).into_bytes())
            .collect();
        assert_eq!(original.len(), 1000);
        std::fs::write(&path, &original).unwrap();

        let fx = fixture(256);
        let (handle, _stop) = start(&fx, &path, 0);
        let first = collect(&fx.drain, 100).await;
        let old_identity = first[0].identity;
        assert_eq!(first.last().unwrap().range.end, 1000);

        // Truncate in place and write 200 new bytes
        let replacement: Vec<u8> = (0..20)
            .flat_map(|i| format!("new {:05}\n", i).into_bytes())
            .collect();
        assert_eq!(replacement.len(), 200);
        let mut f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        f.write_all(&replacement).unwrap();
        drop(f);

        let second = collect(&fx.drain, 20).await;
        assert_eq!(second[0].range.start, 0);
        assert_eq!(second.last().unwrap().range.end, 200);
        assert!(payloads(&second).iter().all(|p| p.starts_with("new ")));

        let new_identity = second[0].identity;
        assert_ne!(new_identity, old_identity);
        assert_eq!(new_identity.key, old_identity.key);
        assert!(fx.ctx.claims.is_claimed(&new_identity));
        assert!(fx.ctx.registry.get(&new_identity).is_some());

        fx.ctx.shutdown.cancel();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome.identity, new_identity);
    }

    #[tokio::test]
    async fn test_rewrite_of_file_first_seen_empty_restarts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();

        let fx = fixture(16);
        let (handle, _stop) = start(&fx, &path, 0);

        append(&path, b"old 1\nold 2\n");
        let first = collect(&fx.drain, 2).await;
        assert_eq!(payloads(&first), vec!["old 1", "old 2"]);
        let old_identity = first[0].identity;
        assert!(old_identity.fingerprint.is_empty());

        // The consumed bytes become the head once end of file is reached
        let deadline = Instant::now() + Duration::from_secs(5);
        while fx.ctx.resolver.head(&old_identity).map(|h| h.len) != Some(12) {
            assert!(Instant::now() < deadline, "head never covered the consumed bytes");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            fx.ctx.registry.get(&old_identity).unwrap().head(),
            Fingerprint::from_bytes(b"old 1\nold 2\n")
        );

        // Rewrite in place with longer, different content
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all(b"rewritten line 1\nrewritten line 2\n").unwrap();
        drop(f);

        let second = collect(&fx.drain, 2).await;
        assert_eq!(
            payloads(&second),
            vec!["rewritten line 1", "rewritten line 2"]
        );
        assert_eq!(second[0].range.start, 0);
        assert_ne!(second[0].identity, old_identity);
        assert_eq!(second[0].identity.key, old_identity.key);

        fx.ctx.shutdown.cancel();
        let outcome = handle.await.unwrap();
        assert!(outcome.result.is_ok());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[tokio::test]
    async fn test_rotation_drains_and_closes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        let rotated = dir.path().join("a.log.1");
        std::fs::write(&path, b"x1\nx2\n").unwrap();

        let fx = fixture(16);
        let (handle, _stop) = start(&fx, &path, 0);
        assert_eq!(collect(&fx.drain, 2).await.len(), 2);

        std::fs::rename(&path, &rotated).unwrap();
        // Late write to the old file through the rotated name
        append(&rotated, b"x3\n");
        std::fs::write(&path, b"").unwrap();

        let late = collect(&fx.drain, 1).await;
        assert_eq!(payloads(&late), vec!["x3"]);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.path.file_name().unwrap(), "a.log.1");
        assert!(fx.drain.try_drain(10).is_empty());
    }

    #[tokio::test]
    async fn test_stop_drains_then_closes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a\nb\nc\n").unwrap();

        let fx = fixture(16);
        let (handle, stop) = start(&fx, &path, 0);
        stop.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(payloads(&fx.drain.try_drain(10)), vec!["a", "b", "c"]);
        assert_eq!(
            fx.ctx.registry.get(&outcome.identity).unwrap().state,
            EntryState::Removed
        );
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_push() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a\nb\nc\n").unwrap();

        let fx = fixture(1);
        let (handle, _stop) = start(&fx, &path, 0);

        // Let the spooler fill up, then shut down with nobody draining
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());
        fx.ctx.shutdown.cancel();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.is_ok());

        // Only the record that made it into the spooler is still tracked
        let queued = fx.drain.try_drain(10);
        assert_eq!(payloads(&queued), vec!["a"]);
        assert_eq!(fx.ctx.tracker.lock().pending_count(&outcome.identity), 1);
        assert_eq!(fx.ctx.registry.resume_offset(&outcome.identity), Some(2));
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a\n").unwrap();

        let fx = fixture(4);
        let identity = fx.ctx.resolver.identify(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let harvester = Harvester::new(
            fx.ctx.clone(),
            identity,
            path.clone(),
            0,
            CancellationToken::new(),
        );
        assert_eq!(harvester.state(), HarvesterState::Starting);

        let outcome = harvester.run().await;
        assert!(matches!(outcome.result, Err(Error::Open { .. })));
        assert_eq!(outcome.state, HarvesterState::Closed);
    }

    #[tokio::test]
    async fn test_idle_file_closes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a\n").unwrap();

        let mut fx = fixture(4);
        fx.ctx.timing.close_inactive = Duration::from_millis(50);
        let (handle, _stop) = start(&fx, &path, 0);

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(fx.drain.len(), 1);
    }
}
