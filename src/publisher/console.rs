// SPDX-License-Identifier: Apache-2.0

use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt, Stdout};

use crate::harvest::Record;
use crate::publisher::{BoxError, Publisher};

/// Writes one JSON object per record, newline separated.
pub struct ConsolePublisher<W = Stdout> {
    out: W,
}

impl ConsolePublisher<Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> ConsolePublisher<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn encode(record: &Record) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(&json!({
        "path": record.source.as_ref(),
        "identity": record.identity.to_string(),
        "start": record.range.start,
        "end": record.range.end,
        "message": String::from_utf8_lossy(&record.payload),
    }))?;
    line.push(b'\n');
    Ok(line)
}

impl<W> Publisher for ConsolePublisher<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn name(&self) -> &'static str {
        "console"
    }

    async fn publish(&mut self, batch: &[Record]) -> Result<(), BoxError> {
        let mut buf = Vec::new();
        for record in batch {
            buf.extend(encode(record)?);
        }
        self.out.write_all(&buf).await?;
        self.out.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::{ByteRange, FileIdentity, FileKey, Fingerprint};
    use bytes::Bytes;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn record(offset: u64, payload: &'static [u8]) -> Record {
        Record {
            identity: FileIdentity::new(FileKey::new(8, 42), Fingerprint::from_bytes(b"head")),
            source: Arc::new(PathBuf::from("/var/log/app.log")),
            range: ByteRange::new(offset, offset + payload.len() as u64 + 1),
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_writes_json_lines() {
        let mut publisher = ConsolePublisher::new(Vec::new());
        publisher
            .publish(&[record(0, b"first"), record(6, b"second \"quoted\"")])
            .await
            .unwrap();

        let out = String::from_utf8(publisher.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["path"], "/var/log/app.log");
        assert_eq!(second["start"], 6);
        assert_eq!(second["end"], 22);
        assert_eq!(second["message"], "second \"quoted\"");
        assert!(second["identity"].as_str().unwrap().starts_with("8:42:"));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let mut publisher = ConsolePublisher::new(Vec::new());
        publisher.publish(&[record(0, b"bad \xff byte")]).await.unwrap();

        let out = publisher.into_inner();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["message"], "bad \u{fffd} byte");
    }
}
