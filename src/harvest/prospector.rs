// SPDX-License-Identifier: Apache-2.0

//! Prospector.
//!
//! Periodically expands the configured glob patterns, decides for each
//! candidate file whether a harvester has to run, and starts one per file
//! that is not already being harvested. Harvesters report back through a
//! JoinSet and release their claim once they exit.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::harvest::claims::ClaimSet;
use crate::harvest::config::{HarvestConfig, StartAt};
use crate::harvest::error::{Error, Result};
use crate::harvest::finder::FileFinder;
use crate::harvest::harvester::{HarvestOutcome, Harvester, HarvesterContext};
use crate::harvest::identity::{FileIdentity, FileKey, IdentityResolver};
use crate::harvest::registry::{EntryState, Registry};

type Joined = (FileKey, std::result::Result<HarvestOutcome, JoinError>);

/// What a single scan did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanSummary {
    pub candidates: usize,
    pub started: usize,
    pub stopped: usize,
    pub pruned: usize,
}

/// The filesystem side of a scan: globbing, stat, fingerprint reads and
/// registry writes. Runs on the blocking pool.
struct Discovery {
    finder: FileFinder,
    registry: Arc<Registry>,
    resolver: Arc<IdentityResolver>,
    claims: Arc<ClaimSet>,
    start_at: StartAt,
    retention: Duration,
}

/// Result of one discovery pass
struct Found {
    candidates: usize,
    /// Every inode matched by a pattern
    seen: HashSet<FileKey>,
    /// Files that need a harvester, with their start offset
    ready: Vec<(FileIdentity, PathBuf, u64)>,
}

impl Discovery {
    fn discover(&self, first_scan: bool) -> Result<Found> {
        let paths = self.finder.find_files()?;
        let mut found = Found {
            candidates: paths.len(),
            seen: HashSet::new(),
            ready: Vec::new(),
        };

        // Paths the registry already knows. A file found at such a path on the
        // first scan but under a new identity replaced the old one and is
        // read in full.
        let known_paths: HashSet<PathBuf> = if first_scan && self.start_at == StartAt::End {
            self.registry.entries().into_iter().map(|e| e.path).collect()
        } else {
            HashSet::new()
        };

        for path in paths {
            let metadata = match std::fs::metadata(&path) {
                Ok(metadata) => metadata,
                Err(e) => {
                    let e = Error::not_accessible(&path, e);
                    if e.is_not_found() {
                        debug!(error = %e, "File vanished during scan");
                    } else {
                        warn!(error = %e, "Skipping file until the next scan");
                    }
                    continue;
                }
            };

            let key = FileKey::from_metadata(&metadata);
            let size = metadata.len();
            // Hard links and renames mid-scan: one physical file, one pass
            if !found.seen.insert(key) {
                continue;
            }

            // Claimed inodes belong to their harvester, which detects rotation
            // and truncation itself
            if let Some(identity) = self.claims.get(&key) {
                self.registry.touch(&identity, &path, size);
                continue;
            }

            let identity = match self.resolver.identify(&path) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Failed to identify file");
                    continue;
                }
            };

            let start_offset = match self.registry.resume_offset(&identity) {
                Some(offset) => {
                    self.registry.touch(&identity, &path, size);
                    if let Some(head) = self.resolver.head(&identity) {
                        self.registry.update_head(&identity, head);
                    }
                    if size == offset {
                        continue;
                    }
                    offset
                }
                None => {
                    let offset = if first_scan
                        && self.start_at == StartAt::End
                        && !known_paths.contains(&path)
                    {
                        size
                    } else {
                        0
                    };
                    if let Err(e) = self.registry.register(identity, &path, offset, size) {
                        warn!(
                            path = ?path,
                            error = %e,
                            "Failed to register file, retrying on the next scan"
                        );
                        continue;
                    }
                    info!(path = ?path, identity = %identity, offset, "Discovered new file");
                    if offset == size && size > 0 {
                        continue;
                    }
                    offset
                }
            };

            found.ready.push((identity, path, start_offset));
        }

        Ok(found)
    }

    fn prune(&self) -> usize {
        let claims = &self.claims;
        match self
            .registry
            .prune(self.retention, |identity| claims.is_claimed(identity))
        {
            Ok(pruned) => {
                for identity in &pruned {
                    self.resolver.forget(identity);
                }
                pruned.len()
            }
            Err(e) => {
                warn!(error = %e, "Failed to prune registry");
                0
            }
        }
    }
}

pub struct Prospector {
    discovery: Arc<Discovery>,
    ctx: HarvesterContext,
    scan_interval: Duration,
    first_scan: bool,
    harvesters: JoinSet<Joined>,
    /// Stop tokens of live harvesters
    running: HashMap<FileKey, CancellationToken>,
}

impl Prospector {
    pub fn new(config: &HarvestConfig, finder: FileFinder, ctx: HarvesterContext) -> Self {
        let discovery = Discovery {
            finder,
            registry: ctx.registry.clone(),
            resolver: ctx.resolver.clone(),
            claims: ctx.claims.clone(),
            start_at: config.start_at,
            retention: config.registry_retention(),
        };
        Self {
            discovery: Arc::new(discovery),
            ctx,
            scan_interval: config.scan_interval(),
            first_scan: true,
            harvesters: JoinSet::new(),
            running: HashMap::new(),
        }
    }

    /// Number of live harvesters
    pub fn active(&self) -> usize {
        self.running.len()
    }

    /// Scan on every tick until cancelled, then wait for every harvester to
    /// finish its current cycle.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(interval = ?self.scan_interval, "Prospector started");

        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = self.harvesters.join_next() => self.reap(joined),

                _ = ticker.tick() => {
                    let summary = self.scan().await;
                    debug!(
                        candidates = summary.candidates,
                        started = summary.started,
                        stopped = summary.stopped,
                        pruned = summary.pruned,
                        active = self.running.len(),
                        "Scan complete"
                    );
                }
            }
        }

        debug!(active = self.running.len(), "Waiting for harvesters to close");
        while let Some(joined) = self.harvesters.join_next().await {
            self.reap(joined);
        }
        info!("Prospector stopped");
        Ok(())
    }

    /// Run one discovery pass and start harvesters for what it found.
    pub async fn scan(&mut self) -> ScanSummary {
        let mut summary = ScanSummary::default();
        let first_scan = std::mem::replace(&mut self.first_scan, false);

        let discovery = self.discovery.clone();
        let found = match tokio::task::spawn_blocking(move || discovery.discover(first_scan)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!(error = %e, "File discovery failed, retrying on the next scan");
                return summary;
            }
            Err(e) => {
                error!(error = %e, "File discovery task failed");
                return summary;
            }
        };
        summary.candidates = found.candidates;

        for (identity, path, start_offset) in found.ready {
            if self.spawn(identity, path, start_offset) {
                summary.started += 1;
            }
        }
        summary.stopped = self.stop_missing(&found.seen);

        let discovery = self.discovery.clone();
        summary.pruned = match tokio::task::spawn_blocking(move || discovery.prune()).await {
            Ok(pruned) => pruned,
            Err(e) => {
                error!(error = %e, "Registry prune task failed");
                0
            }
        };
        summary
    }

    fn spawn(&mut self, identity: FileIdentity, path: PathBuf, start_offset: u64) -> bool {
        if !self.ctx.claims.try_claim(identity) {
            return false;
        }

        debug!(path = ?path, identity = %identity, offset = start_offset, "Starting harvester");
        let stop = CancellationToken::new();
        let harvester = Harvester::new(self.ctx.clone(), identity, path, start_offset, stop.clone());
        let key = identity.key;

        // Inner task so a panicking harvester still reports which file it held
        self.harvesters
            .spawn(async move { (key, tokio::spawn(harvester.run()).await) });
        self.running.insert(key, stop);
        true
    }

    /// Harvesters whose file matched no pattern this scan drain and close.
    fn stop_missing(&mut self, seen: &HashSet<FileKey>) -> usize {
        let mut stopped = 0;
        for (key, stop) in &self.running {
            if seen.contains(key) || stop.is_cancelled() {
                continue;
            }
            if let Some(identity) = self.ctx.claims.get(key) {
                debug!(identity = %identity, "File no longer matches, stopping harvester");
                self.ctx.registry.set_state(&identity, EntryState::Removed);
            }
            stop.cancel();
            stopped += 1;
        }
        stopped
    }

    fn reap(&mut self, joined: std::result::Result<Joined, JoinError>) {
        let (key, result) = match joined {
            Ok(joined) => joined,
            Err(e) => {
                error!(error = %e, "Harvester supervisor task failed");
                return;
            }
        };

        self.running.remove(&key);
        self.ctx.claims.release(&key);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(key = ?key, error = %e, "Harvester task panicked");
                return;
            }
        };

        match outcome.result {
            Ok(()) => debug!(
                path = ?outcome.path,
                identity = %outcome.identity,
                "Harvester closed"
            ),
            // Gone between the scan and the open, picked up again if it returns
            Err(e @ Error::Open { .. }) => debug!(error = %e, "Harvester could not open file"),
            Err(e) => warn!(
                path = ?outcome.path,
                identity = %outcome.identity,
                error = %e,
                "Harvester failed"
            ),
        }
    }
}
