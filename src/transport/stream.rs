//! Newline-delimited JSON over any byte stream pair.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

use super::{Connection, TransportResult};
use crate::error::TransportError;

/// Upper bound on a single framed message.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct LineConnection {
    reader: Mutex<FramedRead<BoxedReader, LinesCodec>>,
    writer: Mutex<BoxedWriter>,
    child: Mutex<Option<Child>>,
    closed: AtomicBool,
}

impl LineConnection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(FramedRead::new(
                Box::new(reader) as BoxedReader,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            writer: Mutex::new(Box::new(writer)),
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Ties a child process to the connection; it is killed on close.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Mutex::new(Some(child));
        self
    }

    /// Two connected in-memory endpoints.
    pub fn pair(buffer_size: usize) -> (LineConnection, LineConnection) {
        let (a, b) = tokio::io::duplex(buffer_size);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            LineConnection::new(a_read, a_write),
            LineConnection::new(b_read, b_write),
        )
    }
}

#[async_trait]
impl Connection for LineConnection {
    async fn send(&self, data: Bytes) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(&data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        if !data.ends_with(b"\n") {
            writer
                .write_all(b"\n")
                .await
                .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        }
        writer
            .flush()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Bytes> {
        let mut reader = self.reader.lock().await;
        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            match reader.next().await {
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => return Ok(Bytes::from(line)),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    return Err(TransportError::InvalidFormat(format!(
                        "message exceeds {MAX_LINE_LENGTH} bytes"
                    )))
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()))
                }
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(TransportError::Closed);
                }
            }
        }
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Failed to shut down writer: {}", e);
        }
        drop(writer);

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill child process: {}", e);
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
