// SPDX-License-Identifier: Apache-2.0

//! Offset committer.
//!
//! Acknowledgements from the publish loop land here. The committer feeds them
//! to the offset tracker and persists the resulting safe offset per identity.
//! It runs as its own task so that acknowledgements arriving after the
//! harvesters stopped are still committed during shutdown.

use flume::{Receiver, Sender};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::harvest::config::HarvestConfig;
use crate::harvest::error::{Error, Result};
use crate::harvest::identity::FileIdentity;
use crate::harvest::offset_tracker::SharedOffsetTracker;
use crate::harvest::record::{ByteRange, Record};
use crate::harvest::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledgement {
    pub identity: FileIdentity,
    pub range: ByteRange,
}

/// Callback handle given to the publisher side. Cheap to clone.
#[derive(Clone)]
pub struct Acknowledger {
    tx: Sender<Vec<Acknowledgement>>,
}

impl Acknowledger {
    /// Report that the record at `range` of `identity` is durably delivered.
    pub fn acknowledge(&self, identity: FileIdentity, range: ByteRange) {
        self.send(vec![Acknowledgement { identity, range }]);
    }

    /// Acknowledge every record of a delivered batch.
    pub fn acknowledge_records(&self, records: &[Record]) {
        let acks = records
            .iter()
            .map(|r| Acknowledgement {
                identity: r.identity,
                range: r.range,
            })
            .collect();
        self.send(acks);
    }

    fn send(&self, acks: Vec<Acknowledgement>) {
        // The committer only goes away during shutdown, after which the
        // offsets are re-read from the last commit on restart.
        if self.tx.send(acks).is_err() {
            debug!("Offset committer gone, dropping acknowledgement");
        }
    }
}

/// Acknowledgement channel between the publish loop and the committer.
pub fn ack_channel() -> (Acknowledger, Receiver<Vec<Acknowledgement>>) {
    let (tx, rx) = flume::unbounded();
    (Acknowledger { tx }, rx)
}

/// Configuration for the offset committer
#[derive(Debug, Clone)]
pub struct CommitterConfig {
    /// First retry delay after a failed commit
    pub retry_initial: Duration,
    /// Upper bound for the retry delay
    pub retry_max: Duration,
    /// Continuous failure longer than this is fatal
    pub max_failure_duration: Duration,
    /// Interval between metadata flushes
    pub checkpoint_interval: Duration,
    /// Maximum time to wait for acknowledgements during shutdown
    pub drain_timeout: Duration,
}

impl Default for CommitterConfig {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

impl From<&HarvestConfig> for CommitterConfig {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            retry_initial: Duration::from_millis(config.commit_retry_initial_ms),
            retry_max: Duration::from_millis(config.commit_retry_max_ms),
            max_failure_duration: Duration::from_millis(config.max_commit_failure_ms),
            checkpoint_interval: config.checkpoint_interval(),
            drain_timeout: config.shutdown_timeout(),
        }
    }
}

pub struct OffsetCommitter {
    acks: Receiver<Vec<Acknowledgement>>,
    tracker: SharedOffsetTracker,
    registry: Arc<Registry>,
    config: CommitterConfig,
    /// Identities with acknowledged progress not yet persisted
    dirty: HashSet<FileIdentity>,
    first_failure: Option<Instant>,
    retry_delay: Duration,
    retry_at: Option<Instant>,
}

impl OffsetCommitter {
    pub fn new(
        acks: Receiver<Vec<Acknowledgement>>,
        tracker: SharedOffsetTracker,
        registry: Arc<Registry>,
        config: CommitterConfig,
    ) -> Self {
        Self {
            acks,
            tracker,
            registry,
            retry_delay: config.retry_initial,
            config,
            dirty: HashSet::new(),
            first_failure: None,
            retry_at: None,
        }
    }

    /// Commit acknowledged offsets until cancelled or until every
    /// acknowledger is gone, then drain and commit what is left.
    ///
    /// Returns an error if commits kept failing for longer than the configured
    /// threshold.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        debug!("Offset committer started");

        let mut checkpoint = tokio::time::interval(self.config.checkpoint_interval);
        checkpoint.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut fatal_error = None;

        loop {
            let retry_at = self.retry_at;
            select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Offset committer cancelled, draining acknowledgements");
                    break;
                }

                acks = self.acks.recv_async() => match acks {
                    Ok(acks) => {
                        self.process(acks);
                        while let Ok(more) = self.acks.try_recv() {
                            self.process(more);
                        }
                        if self.retry_at.is_none() {
                            if let Err(e) = self.commit_dirty() {
                                fatal_error = Some(e);
                                break;
                            }
                        }
                    }
                    Err(_) => {
                        debug!("Acknowledgement channel closed, exiting offset committer loop");
                        break;
                    }
                },

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    if let Err(e) = self.commit_dirty() {
                        fatal_error = Some(e);
                        break;
                    }
                }

                _ = checkpoint.tick() => {
                    if let Err(e) = self.registry.flush() {
                        warn!(error = %e, "Failed to flush registry metadata");
                    }
                }
            }
        }

        self.drain().await;

        match fatal_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn process(&mut self, acks: Vec<Acknowledgement>) {
        let mut tracker = self.tracker.lock();
        for ack in acks {
            tracker.acknowledge(ack.identity, ack.range);
            self.dirty.insert(ack.identity);
        }
    }

    /// Commit every dirty identity once. Failed identities stay dirty and are
    /// retried after a backoff.
    fn commit_dirty(&mut self) -> Result<()> {
        let mut failure = None;

        for identity in std::mem::take(&mut self.dirty) {
            let Some(offset) = self.tracker.lock().persistable_offset(&identity) else {
                continue;
            };

            match self.registry.commit(&identity, offset) {
                Ok(_) => {
                    let mut tracker = self.tracker.lock();
                    if !tracker.has_pending(&identity) {
                        tracker.remove(&identity);
                    }
                }
                Err(e) => {
                    self.dirty.insert(identity);
                    failure.get_or_insert(e);
                }
            }
        }

        let Some(e) = failure else {
            if self.first_failure.take().is_some() {
                info!("Registry commits succeeded after previous failures");
            }
            self.retry_delay = self.config.retry_initial;
            self.retry_at = None;
            return Ok(());
        };

        let first_failure = *self.first_failure.get_or_insert_with(Instant::now);
        let elapsed = first_failure.elapsed();
        if elapsed >= self.config.max_failure_duration {
            error!(
                elapsed = ?elapsed,
                error = %e,
                "Registry commits failing beyond threshold"
            );
            return Err(Error::RegistryCommit {
                elapsed,
                reason: e.to_string(),
            });
        }

        warn!(
            error = %e,
            retry_in = ?self.retry_delay,
            pending = self.dirty.len(),
            "Registry commit failed, will retry"
        );
        self.retry_at = Some(Instant::now() + self.retry_delay);
        self.retry_delay = (self.retry_delay * 2).min(self.config.retry_max);
        Ok(())
    }

    /// Take remaining acknowledgements until the channel closes or the drain
    /// timeout passes, then make a final commit and flush.
    async fn drain(&mut self) {
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut drained = 0usize;

        loop {
            match tokio::time::timeout_at(deadline, self.acks.recv_async()).await {
                Ok(Ok(acks)) => {
                    drained += acks.len();
                    self.process(acks);
                }
                Ok(Err(_)) => break,
                Err(_) => {
                    debug!(drained, "Drain deadline reached");
                    break;
                }
            }
        }

        if drained > 0 {
            debug!(drained, "Drained pending acknowledgements");
        }

        if let Err(e) = self.commit_dirty() {
            warn!(error = %e, "Final offset commit failed");
        } else if !self.dirty.is_empty() {
            warn!(
                pending = self.dirty.len(),
                "Final offset commit failed for some files"
            );
        }

        if let Err(e) = self.registry.flush() {
            warn!(error = %e, "Failed to flush registry metadata");
        }
    }
}
