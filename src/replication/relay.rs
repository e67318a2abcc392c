//! Stream Relay
//!
//! Pumps bytes from a source to a sink in bounded chunks, optionally
//! compressing or decompressing on the way. Progress is best effort and
//! never blocks the pump. The result is delivered exactly once, after the
//! sink has been shut down.

use std::time::Instant;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::replication::compress;

/// Size of each read from the source
pub const CHUNK_SIZE: usize = 128 * 1024;

/// Transformation applied between source and sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Pass bytes through
    None,
    /// Frame and LZ4-compress each chunk
    Compress,
    /// Decode LZ4 frames back into raw bytes
    Decompress,
}

/// Bytes read from the source so far
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub bytes: u64,
    pub at: Instant,
}

/// A configured relay between two named endpoints
pub struct Relay {
    source_label: String,
    sink_label: String,
    transform: Transform,
    progress: Option<mpsc::Sender<Progress>>,
}

impl Relay {
    pub fn new(source: impl Into<String>, sink: impl Into<String>, transform: Transform) -> Self {
        Self {
            source_label: source.into(),
            sink_label: sink.into(),
            transform,
            progress: None,
        }
    }

    /// Report progress on a bounded channel. Updates are dropped when the
    /// receiver lags.
    pub fn with_progress(mut self, progress: mpsc::Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run the relay to completion. Returns the number of bytes read from
    /// the source. The sink is shut down whether or not the pump failed.
    pub async fn run<R, W>(self, mut source: R, mut sink: W) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let pumped = self.pump(&mut source, &mut sink).await;
        let shutdown = sink.shutdown().await;

        match (pumped, shutdown) {
            (Ok(bytes), Ok(())) => {
                tracing::debug!(
                    "Relay {} -> {} finished after {} bytes",
                    self.source_label,
                    self.sink_label,
                    bytes
                );
                Ok(bytes)
            }
            (Ok(_), Err(e)) => Err(self.sink_error(e)),
            (Err(e), _) => {
                tracing::debug!("Relay {} -> {} failed: {}", self.source_label, self.sink_label, e);
                Err(e)
            }
        }
    }

    /// Run the relay on its own task
    pub fn spawn<R, W>(self, source: R, sink: W) -> RelayHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let label = format!("{} -> {}", self.source_label, self.sink_label);
        tokio::spawn(async move {
            let result = self.run(source, sink).await;
            let _ = tx.send(result);
        });
        RelayHandle { label, rx }
    }

    async fn pump<R, W>(&self, source: &mut R, sink: &mut W) -> Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut total: u64 = 0;

        if self.transform == Transform::Decompress {
            while let Some(block) = compress::read_block(source)
                .await
                .map_err(|e| self.source_failure(e))?
            {
                total += 4 + block.len() as u64;
                let chunk = compress::decode_block(&block)?;
                sink.write_all(&chunk).await.map_err(|e| self.sink_error(e))?;
                self.report(total);
            }
            return Ok(total);
        }

        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = source.read(&mut buf).await.map_err(|e| self.source_error(e))?;
            if n == 0 {
                break;
            }
            total += n as u64;

            let written = match self.transform {
                Transform::Compress => {
                    let frame = compress::encode_frame(&buf[..n]);
                    sink.write_all(&frame).await
                }
                _ => sink.write_all(&buf[..n]).await,
            };
            written.map_err(|e| self.sink_error(e))?;

            self.report(total);
        }

        Ok(total)
    }

    fn report(&self, bytes: u64) {
        if let Some(progress) = &self.progress {
            let _ = progress.try_send(Progress {
                bytes,
                at: Instant::now(),
            });
        }
    }

    fn source_error(&self, e: std::io::Error) -> Error {
        Error::Relay {
            endpoint: self.source_label.clone(),
            reason: e.to_string(),
        }
    }

    fn source_failure(&self, e: Error) -> Error {
        match e {
            Error::Io(e) => self.source_error(e),
            other => other,
        }
    }

    fn sink_error(&self, e: std::io::Error) -> Error {
        Error::Relay {
            endpoint: self.sink_label.clone(),
            reason: e.to_string(),
        }
    }
}

/// Completion handle of a spawned relay
pub struct RelayHandle {
    label: String,
    rx: oneshot::Receiver<Result<u64>>,
}

impl RelayHandle {
    /// Wait for the relay to finish
    pub async fn done(self) -> Result<u64> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Relay {
                endpoint: self.label,
                reason: "relay task ended without a result".into(),
            }),
        }
    }
}
