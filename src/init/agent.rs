// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::harvest::claims::ClaimSet;
use crate::harvest::committer::{CommitterConfig, OffsetCommitter, ack_channel};
use crate::harvest::finder::FileFinder;
use crate::harvest::harvester::{HarvesterContext, HarvesterTiming};
use crate::harvest::offset_tracker::OffsetTracker;
use crate::harvest::reader::ReaderOptions;
use crate::harvest::registry::JsonDirStore;
use crate::harvest::{Error, HarvestConfig, IdentityResolver, Prospector, Registry, spooler};
use crate::init::wait::{self, TaskSet};
use crate::publisher::publish_loop::RetryConfig;
use crate::publisher::{BoxError, PublishLoop, Publisher};

// Extra time for the committer after a forced cancel, it drains acknowledgements
// for up to the shutdown timeout itself.
const COMMITTER_GRACE: Duration = Duration::from_millis(500);

pub struct Agent<P> {
    config: HarvestConfig,
    publisher: P,
}

impl<P: Publisher> Agent<P> {
    pub fn new(config: HarvestConfig, publisher: P) -> Self {
        Self { config, publisher }
    }

    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let config = self.config;
        config.validate().map_err(Error::Config)?;
        info!(paths = ?config.paths, "Starting routebeat.");

        let finder = FileFinder::new(config.paths.clone(), config.exclude.clone())?;
        let registry = Arc::new(Registry::open(JsonDirStore::open(&config.registry_path)?)?);

        // Seed oldest first so the most recently seen identity of a reused
        // inode wins.
        let resolver = Arc::new(IdentityResolver::new(config.fingerprint_size));
        let mut entries = registry.entries();
        entries.sort_by_key(|e| e.last_seen_ms);
        for entry in &entries {
            resolver.seed(entry.identity, entry.head);
        }

        let tracker = Arc::new(Mutex::new(OffsetTracker::new()));
        let (spooler, drain) =
            spooler::bounded(config.spool_capacity, config.backpressure_warn_after());
        let (acknowledger, acks) = ack_channel();

        let prospector_cancel = CancellationToken::new();
        let publish_cancel = CancellationToken::new();
        let committer_cancel = CancellationToken::new();

        let ctx = HarvesterContext {
            registry: registry.clone(),
            resolver,
            claims: Arc::new(ClaimSet::new()),
            tracker: tracker.clone(),
            spooler,
            reader_options: ReaderOptions::from(&config),
            timing: HarvesterTiming {
                poll_interval: config.poll_interval(),
                rotate_wait: config.rotate_wait(),
                close_inactive: config.close_inactive(),
            },
            shutdown: prospector_cancel.clone(),
        };

        let mut prospector_task_set = TaskSet::new();
        let mut publish_task_set = TaskSet::new();
        let mut committer_task_set = TaskSet::new();

        // The prospector owns the only spooler handles, the spooler closes
        // once it and its harvesters are gone.
        let prospector = Prospector::new(&config, finder, ctx);
        {
            let token = prospector_cancel.clone();
            prospector_task_set.spawn(async move { Ok(prospector.run(token).await?) });
        }

        // Likewise the publish loop owns the only acknowledger.
        let publish_loop = PublishLoop::new(
            self.publisher,
            drain,
            acknowledger,
            config.publish_batch_size,
            RetryConfig::from(&config),
        );
        {
            let token = publish_cancel.clone();
            publish_task_set.spawn(async move {
                publish_loop.run(token).await;
                Ok(())
            });
        }

        let committer = OffsetCommitter::new(
            acks,
            tracker,
            registry.clone(),
            CommitterConfig::from(&config),
        );
        {
            let token = committer_cancel.clone();
            committer_task_set.spawn(async move { Ok(committer.run(token).await?) });
        }

        info!(
            registry = ?config.registry_path,
            entries = registry.len(),
            "routebeat is running! Hit CTRL-C to stop it."
        );

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut prospector_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of prospector."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut publish_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of publish loop."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut committer_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of offset committer."),
                    Err(e) => result = Err(e),
                }
            }
        }

        let timeout = config.shutdown_timeout();

        // Step one, stop discovery. Harvesters finish their current cycle and
        // release their files.
        prospector_cancel.cancel();
        if let Err(e) = wait::wait_for_tasks_with_timeout(&mut prospector_task_set, timeout).await
        {
            warn!(error = %e, "Prospector did not exit in time.");
            result = result.and(Err(
                format!("timed out waiting for prospector exit: {}", e).into(),
            ));
        }

        // Step two, the spooler is closed. Let the publisher drain it.
        if wait::wait_for_tasks_with_timeout(&mut publish_task_set, timeout)
            .await
            .is_err()
        {
            warn!("Publisher did not drain the spooler in time, cancelling.");
            publish_cancel.cancel();

            if let Err(e) = wait::wait_for_tasks_with_timeout(&mut publish_task_set, timeout).await
            {
                result =
                    result.and(Err(format!("timed out waiting for publisher exit: {}", e).into()));
            }
        }

        // Step three, the acknowledgement channel is closed. The committer
        // drains it and makes a final commit.
        if let Err(e) = wait::wait_for_tasks_with_timeout(&mut committer_task_set, timeout).await {
            if !committer_task_set.is_empty() {
                warn!("Offset committer did not exit in time, cancelling.");
                committer_cancel.cancel();
                if let Err(e) = wait::wait_for_tasks_with_timeout(
                    &mut committer_task_set,
                    timeout + COMMITTER_GRACE,
                )
                .await
                {
                    result = result.and(Err(
                        format!("timed out waiting for offset committer exit: {}", e).into(),
                    ));
                }
            } else {
                result = result.and(Err(e));
            }
        }

        match registry.flush() {
            Ok(written) => debug!(written, "Flushed registry"),
            Err(e) => warn!(error = %e, "Failed to flush registry on shutdown"),
        }

        info!("routebeat stopped.");
        result
    }
}
