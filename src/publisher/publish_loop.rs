// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::harvest::committer::Acknowledger;
use crate::harvest::config::HarvestConfig;
use crate::harvest::record::Record;
use crate::harvest::spooler::SpoolDrain;
use crate::publisher::Publisher;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&HarvestConfig::default())
    }
}

impl From<&HarvestConfig> for RetryConfig {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.publish_retry_initial_ms),
            max_backoff: Duration::from_millis(config.publish_retry_max_ms),
        }
    }
}

/// Single consumer of the spooler. Hands batches to the publisher and
/// acknowledges them once the publisher accepted the whole batch.
pub struct PublishLoop<P> {
    publisher: P,
    drain: SpoolDrain,
    acknowledger: Acknowledger,
    batch_size: usize,
    retry: RetryConfig,
}

impl<P: Publisher> PublishLoop<P> {
    pub fn new(
        publisher: P,
        drain: SpoolDrain,
        acknowledger: Acknowledger,
        batch_size: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            publisher,
            drain,
            acknowledger,
            batch_size,
            retry,
        }
    }

    /// Publish until every producer is gone and the spooler is empty, or until
    /// cancelled. A batch interrupted by cancellation is not acknowledged and
    /// is delivered again after a restart.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(publisher = self.publisher.name(), "Publish loop started");
        let mut published = 0u64;

        loop {
            let batch = select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(queued = self.drain.len(), "Publish loop cancelled");
                    break;
                }

                batch = self.drain.drain(self.batch_size) => batch,
            };

            let Some(batch) = batch else {
                debug!("Spooler closed and drained");
                break;
            };

            if !self.deliver(&batch, &cancel).await {
                break;
            }
            published += batch.len() as u64;
            self.acknowledger.acknowledge_records(&batch);
        }

        info!(
            publisher = self.publisher.name(),
            published, "Publish loop stopped"
        );
    }

    /// Returns false if cancelled before the batch was accepted.
    async fn deliver(&mut self, batch: &[Record], cancel: &CancellationToken) -> bool {
        let mut backoff = self.retry.initial_backoff;
        let mut attempts = 0u32;

        loop {
            let result = select! {
                biased;
                _ = cancel.cancelled() => return false,
                res = self.publisher.publish(batch) => res,
            };

            match result {
                Ok(()) => {
                    if attempts > 0 {
                        info!(attempts, "Publish succeeded after retries");
                    }
                    return true;
                }
                Err(e) => {
                    attempts += 1;
                    warn!(
                        publisher = self.publisher.name(),
                        error = %e,
                        records = batch.len(),
                        retry_in = ?backoff,
                        "Failed to publish batch, will retry"
                    );
                }
            }

            select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.retry.max_backoff);
        }
    }
}
