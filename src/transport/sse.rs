//! Server-Sent Events client transport.
//!
//! The client opens a long-lived `GET` stream. The server first announces an
//! `endpoint` event naming the URL that accepts posted messages; responses
//! then arrive as `message` events on the stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use super::{Connection, Transport, TransportResult, TransportType};
use crate::error::TransportError;

const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    /// Event name, `message` when the server omitted it.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental `text/event-stream` parser. Feed it raw body chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing event not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            self.process_line(&line);
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        })
    }
}

pub struct SseTransport {
    url: String,
    client: reqwest::Client,
}

impl SseTransport {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }
}

/// Waits for the `endpoint` event; the reader is stopped on every failure.
async fn wait_for_endpoint(
    endpoint_rx: oneshot::Receiver<TransportResult<Url>>,
    reader: &JoinHandle<()>,
) -> TransportResult<Url> {
    let outcome = match tokio::time::timeout(ENDPOINT_TIMEOUT, endpoint_rx).await {
        Ok(Ok(endpoint)) => endpoint,
        Ok(Err(_)) => Err(TransportError::ConnectionFailed(
            "SSE stream closed before announcing an endpoint".into(),
        )),
        Err(_) => Err(TransportError::ConnectionFailed(
            "Timed out waiting for SSE endpoint".into(),
        )),
    };
    if outcome.is_err() {
        reader.abort();
    }
    outcome
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self) -> TransportResult<Arc<dyn Connection>> {
        let base = Url::parse(&self.url)
            .map_err(|e| TransportError::ConnectionFailed(format!("Invalid url '{}': {}", self.url, e)))?;

        let response = self
            .client
            .get(base.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::ConnectionFailed(format!(
                "SSE stream rejected with HTTP {}",
                response.status()
            )));
        }

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (endpoint_tx, endpoint_rx) = oneshot::channel();

        let reader = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();

            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::debug!("SSE stream ended with error: {}", e);
                        break;
                    }
                };
                for event in decoder.feed(&chunk) {
                    match event.name() {
                        "endpoint" => {
                            let resolved = base
                                .join(event.data.trim())
                                .map_err(|e| TransportError::InvalidFormat(e.to_string()));
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(resolved);
                            }
                        }
                        "message" => {
                            if inbox_tx.send(Bytes::from(event.data)).is_err() {
                                return;
                            }
                        }
                        other => tracing::debug!("Ignoring SSE event '{}'", other),
                    }
                }
            }
        });

        let endpoint = wait_for_endpoint(endpoint_rx, &reader).await?;

        tracing::debug!(endpoint = %endpoint, "SSE session established");
        Ok(Arc::new(SseConnection {
            endpoint,
            client: self.client.clone(),
            inbox: Mutex::new(inbox_rx),
            reader,
            closed: AtomicBool::new(false),
        }))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Sse
    }
}

pub struct SseConnection {
    endpoint: Url,
    client: reqwest::Client,
    inbox: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    reader: JoinHandle<()>,
    closed: AtomicBool,
}

impl SseConnection {
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Connection for SseConnection {
    async fn send(&self, data: Bytes) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::SendFailed(format!(
                "Message rejected with HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Bytes> {
        let mut inbox = self.inbox.lock().await;
        inbox.recv().await.ok_or(TransportError::Closed)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.reader.abort();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.reader.is_finished()
    }
}

impl Drop for SseConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
