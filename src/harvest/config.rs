// SPDX-License-Identifier: Apache-2.0

//! Configuration for the harvesting engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where to start reading a file that has no registry entry yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartAt {
    /// Read the whole file from offset 0
    #[default]
    Beginning,
    /// Only ingest data written after discovery. Applies to files present at
    /// startup, files created later are always read from the beginning.
    End,
}

/// Configuration for the harvesting engine.
///
/// Durations are expressed as integer milliseconds so that every field can be
/// supplied through environment variables as well as config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Glob patterns for files to harvest
    pub paths: Vec<String>,

    /// Glob patterns for files to skip even if they match `paths`
    pub exclude: Vec<String>,

    /// How often the prospector rescans the glob patterns
    pub scan_interval_ms: u64,

    /// How often an idle harvester checks its file for new data
    pub poll_interval_ms: u64,

    /// Where to start reading newly discovered files
    pub start_at: StartAt,

    /// Directory holding one registry entry per file identity
    pub registry_path: PathBuf,

    /// Number of leading bytes used to fingerprint a file
    pub fingerprint_size: usize,

    /// Record delimiter
    pub delimiter: String,

    /// Records longer than this are split into several records
    pub max_record_size: usize,

    /// Bytes requested per read
    pub read_buffer_size: usize,

    /// Number of records the spooler holds before harvesters block
    pub spool_capacity: usize,

    /// Maximum number of records handed to the publisher at once
    pub publish_batch_size: usize,

    /// Warn when a harvester has been blocked on a full spooler this long (0 disables)
    pub backpressure_warn_ms: u64,

    /// How long a rotated file must stay idle at EOF before its harvester closes
    pub rotate_wait_ms: u64,

    /// Idle harvesters release their file handle after this long without new data
    pub close_inactive_ms: u64,

    /// Registry entries for files unseen this long are removed
    pub registry_retention_ms: u64,

    /// First retry delay after a failed registry commit
    pub commit_retry_initial_ms: u64,

    /// Upper bound for the registry commit retry delay
    pub commit_retry_max_ms: u64,

    /// First retry delay after the publisher rejected a batch
    pub publish_retry_initial_ms: u64,

    /// Upper bound for the publish retry delay
    pub publish_retry_max_ms: u64,

    /// Commits failing continuously for this long stop the agent
    pub max_commit_failure_ms: u64,

    /// How often file metadata (path, size, last seen) is flushed to the registry
    pub checkpoint_interval_ms: u64,

    /// Upper bound for each shutdown phase
    pub shutdown_timeout_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            paths: vec![],
            exclude: vec![],
            scan_interval_ms: 10_000,
            poll_interval_ms: 250,
            start_at: StartAt::default(),
            registry_path: PathBuf::from("data/registry"),
            fingerprint_size: 1000,
            delimiter: "\n".to_string(),
            max_record_size: 1024 * 1024, // 1MB
            read_buffer_size: 64 * 1024,
            spool_capacity: 4096,
            publish_batch_size: 512,
            backpressure_warn_ms: 5_000,
            rotate_wait_ms: 1_000,
            close_inactive_ms: 5 * 60 * 1000,
            registry_retention_ms: 24 * 60 * 60 * 1000,
            commit_retry_initial_ms: 100,
            commit_retry_max_ms: 5_000,
            publish_retry_initial_ms: 100,
            publish_retry_max_ms: 5_000,
            max_commit_failure_ms: 60_000,
            checkpoint_interval_ms: 10_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl HarvestConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backpressure_warn_after(&self) -> Option<Duration> {
        match self.backpressure_warn_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn rotate_wait(&self) -> Duration {
        Duration::from_millis(self.rotate_wait_ms)
    }

    pub fn close_inactive(&self) -> Duration {
        Duration::from_millis(self.close_inactive_ms)
    }

    pub fn registry_retention(&self) -> Duration {
        Duration::from_millis(self.registry_retention_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.paths.is_empty() {
            return Err("at least one path pattern is required".to_string());
        }

        if self.fingerprint_size < 16 {
            return Err("fingerprint_size must be at least 16 bytes".to_string());
        }

        if self.delimiter.is_empty() {
            return Err("delimiter cannot be empty".to_string());
        }

        if self.max_record_size == 0 || self.read_buffer_size == 0 {
            return Err("max_record_size and read_buffer_size must be positive".to_string());
        }

        if self.spool_capacity == 0 || self.publish_batch_size == 0 {
            return Err("spool_capacity and publish_batch_size must be positive".to_string());
        }

        if self.scan_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err("scan_interval_ms and poll_interval_ms must be positive".to_string());
        }

        if self.checkpoint_interval_ms == 0 {
            return Err("checkpoint_interval_ms must be positive".to_string());
        }

        if self.commit_retry_initial_ms == 0 || self.publish_retry_initial_ms == 0 {
            return Err(
                "commit_retry_initial_ms and publish_retry_initial_ms must be positive"
                    .to_string(),
            );
        }

        if self.commit_retry_initial_ms > self.commit_retry_max_ms {
            return Err(
                "commit_retry_initial_ms cannot be larger than commit_retry_max_ms".to_string(),
            );
        }

        if self.publish_retry_initial_ms > self.publish_retry_max_ms {
            return Err(
                "publish_retry_initial_ms cannot be larger than publish_retry_max_ms".to_string(),
            );
        }

        Ok(())
    }
}
