// SPDX-License-Identifier: Apache-2.0

//! Bounded record queue between harvesters and the publisher.
//!
//! Harvesters push, the publish loop drains. When the queue is full a push
//! waits until the consumer makes room, which is how a slow publisher slows
//! down file reading. Records are never dropped.

use flume::{Receiver, Sender, TrySendError};
use std::time::Duration;
use tokio::select;
use tracing::warn;

use crate::harvest::error::{Error, Result};
use crate::harvest::record::Record;

/// Result of a non-blocking push.
#[derive(Debug)]
pub enum PushOutcome {
    Accepted,
    /// The queue is full, the record is handed back untouched.
    Backpressure(Record),
}

/// Producer side. Cloned once per harvester.
#[derive(Clone)]
pub struct Spooler {
    tx: Sender<Record>,
    warn_after: Option<Duration>,
}

/// Consumer side, owned by the publish loop.
pub struct SpoolDrain {
    rx: Receiver<Record>,
}

pub fn bounded(capacity: usize, warn_after: Option<Duration>) -> (Spooler, SpoolDrain) {
    let (tx, rx) = flume::bounded(capacity);
    (Spooler { tx, warn_after }, SpoolDrain { rx })
}

impl Spooler {
    /// Enqueue a record, waiting while the queue is full.
    ///
    /// Fails only once the consumer is gone.
    pub async fn push(&self, record: Record) -> Result<()> {
        let warn_after = match self.warn_after {
            None => return self.tx.send_async(record).await.map_err(|_| Error::SpoolClosed),
            Some(d) => d,
        };

        let send = self.tx.send_async(record);
        tokio::pin!(send);

        select! {
            res = &mut send => return res.map_err(|_| Error::SpoolClosed),
            _ = tokio::time::sleep(warn_after) => {
                warn!(
                    waited = ?warn_after,
                    capacity = ?self.tx.capacity(),
                    "Harvester blocked on a full spooler, publisher is not keeping up"
                );
            }
        }

        send.await.map_err(|_| Error::SpoolClosed)
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, record: Record) -> Result<PushOutcome> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(PushOutcome::Accepted),
            Err(TrySendError::Full(record)) => Ok(PushOutcome::Backpressure(record)),
            Err(TrySendError::Disconnected(_)) => Err(Error::SpoolClosed),
        }
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl SpoolDrain {
    /// Wait for at least one record and return up to `max_batch` of them in
    /// insertion order. Returns `None` once every producer is gone and the
    /// queue is empty.
    pub async fn drain(&self, max_batch: usize) -> Option<Vec<Record>> {
        let first = self.rx.recv_async().await.ok()?;

        let mut batch = Vec::with_capacity(max_batch.min(self.rx.len() + 1));
        batch.push(first);
        self.fill(&mut batch, max_batch);
        Some(batch)
    }

    /// Return up to `max_batch` queued records without waiting.
    pub fn try_drain(&self, max_batch: usize) -> Vec<Record> {
        let mut batch = Vec::new();
        self.fill(&mut batch, max_batch);
        batch
    }

    fn fill(&self, batch: &mut Vec<Record>, max_batch: usize) {
        while batch.len() < max_batch {
            match self.rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// True once every producer was dropped.
    pub fn is_disconnected(&self) -> bool {
        self.rx.is_disconnected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::identity::{FileIdentity, FileKey, Fingerprint};
    use crate::harvest::record::ByteRange;
    use bytes::Bytes;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    fn record(n: u64) -> Record {
        Record {
            identity: FileIdentity::new(FileKey::new(1, 1), Fingerprint::from_bytes(b"")),
            source: Arc::new(PathBuf::from("/var/log/app.log")),
            range: ByteRange::new(n * 10, n * 10 + 10),
            payload: Bytes::from(format!("record {}", n)),
        }
    }

    #[tokio::test]
    async fn push_blocks_when_full() {
        let capacity = 3;
        let (spooler, drain) = bounded(capacity, None);

        for n in 0..capacity as u64 {
            assert_ok!(spooler.push(record(n)).await);
        }

        // The (C+1)-th push waits for the consumer
        let mut blocked = spawn(spooler.push(record(3)));
        assert_pending!(blocked.poll());
        assert_pending!(blocked.poll());

        let first = drain.try_drain(1);
        assert_eq!(first, vec![record(0)]);

        assert_ok!(assert_ready!(blocked.poll()));

        // Nothing was dropped and order is preserved
        let rest = drain.try_drain(10);
        assert_eq!(rest, vec![record(1), record(2), record(3)]);
    }

    #[tokio::test]
    async fn try_push_reports_backpressure() {
        let (spooler, drain) = bounded(1, None);

        assert!(matches!(spooler.try_push(record(0)), Ok(PushOutcome::Accepted)));
        match spooler.try_push(record(1)) {
            Ok(PushOutcome::Backpressure(r)) => assert_eq!(r, record(1)),
            other => panic!("expected backpressure, got {:?}", other),
        }

        assert_eq!(drain.len(), 1);
    }

    #[tokio::test]
    async fn drain_respects_max_batch_and_order() {
        let (spooler, drain) = bounded(10, None);
        for n in 0..5 {
            spooler.push(record(n)).await.unwrap();
        }

        let batch = drain.drain(2).await.unwrap();
        assert_eq!(batch, vec![record(0), record(1)]);

        let batch = drain.drain(10).await.unwrap();
        assert_eq!(batch, vec![record(2), record(3), record(4)]);
    }

    #[tokio::test]
    async fn drain_waits_then_ends_when_producers_gone() {
        let (spooler, drain) = bounded(2, None);

        let mut next = spawn(drain.drain(10));
        assert_pending!(next.poll());

        spooler.push(record(7)).await.unwrap();
        assert!(next.is_woken());
        assert_eq!(assert_ready!(next.poll()), Some(vec![record(7)]));
        drop(next);

        drop(spooler);
        assert!(drain.is_disconnected());
        assert_eq!(drain.drain(10).await, None);
    }

    #[tokio::test]
    async fn push_fails_once_consumer_is_gone() {
        let (spooler, drain) = bounded(1, Some(Duration::from_secs(5)));
        drop(drain);

        assert!(matches!(
            spooler.push(record(0)).await,
            Err(Error::SpoolClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_push_completes_after_warning() {
        let (spooler, drain) = bounded(1, Some(Duration::from_millis(50)));
        spooler.push(record(0)).await.unwrap();

        let pusher = {
            let spooler = spooler.clone();
            tokio::spawn(async move { spooler.push(record(1)).await })
        };

        // Past the warning threshold the push is still waiting, not failed
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!pusher.is_finished());

        assert_eq!(drain.drain(1).await, Some(vec![record(0)]));
        pusher.await.unwrap().unwrap();
        assert_eq!(drain.try_drain(1), vec![record(1)]);
    }
}
