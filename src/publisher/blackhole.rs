// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::harvest::Record;
use crate::publisher::{BoxError, Publisher};

/// Accepts and discards every batch.
#[derive(Default, Clone)]
pub struct BlackholePublisher {
    published: Arc<AtomicU64>,
}

impl BlackholePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records discarded so far, shared across clones
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Publisher for BlackholePublisher {
    fn name(&self) -> &'static str {
        "blackhole"
    }

    async fn publish(&mut self, batch: &[Record]) -> Result<(), BoxError> {
        self.published
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::{ByteRange, FileIdentity, FileKey, Fingerprint};
    use bytes::Bytes;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_counts_discarded_records() {
        let record = Record {
            identity: FileIdentity::new(FileKey::new(1, 1), Fingerprint::from_bytes(b"x")),
            source: Arc::new(PathBuf::from("/var/log/x.log")),
            range: ByteRange::new(0, 2),
            payload: Bytes::from_static(b"x"),
        };

        let counter = BlackholePublisher::new();
        let mut publisher = counter.clone();
        publisher.publish(&[record.clone(), record]).await.unwrap();
        assert_eq!(counter.published(), 2);
    }
}
