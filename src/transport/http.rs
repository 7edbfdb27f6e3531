//! Streamable HTTP client transport.
//!
//! Every outgoing message is a `POST` to a single endpoint. The reply is
//! either a JSON body or an event stream carrying one or more messages;
//! `202 Accepted` carries none. Messages are queued for `recv`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::sse::SseDecoder;
use super::{Connection, Transport, TransportResult, TransportType};
use crate::error::TransportError;

pub const SESSION_HEADER: &str = "mcp-session-id";

pub struct StreamableHttpTransport {
    url: String,
    client: reqwest::Client,
}

impl StreamableHttpTransport {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn connect(&self) -> TransportResult<Arc<dyn Connection>> {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(StreamableHttpConnection {
            url: self.url.clone(),
            client: self.client.clone(),
            session_id: std::sync::Mutex::new(None),
            inbox_tx,
            inbox_rx: Mutex::new(inbox_rx),
            closed: CancellationToken::new(),
        }))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::StreamableHttp
    }
}

pub struct StreamableHttpConnection {
    url: String,
    client: reqwest::Client,
    session_id: std::sync::Mutex<Option<String>>,
    inbox_tx: mpsc::UnboundedSender<Bytes>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
}

impl StreamableHttpConnection {
    pub fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_session_id(&self, id: String) {
        *self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);
    }

    fn enqueue(&self, message: Bytes) -> TransportResult<()> {
        self.inbox_tx
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl Connection for StreamableHttpConnection {
    async fn send(&self, data: Bytes) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(data);
        if let Some(id) = self.session_id() {
            request = request.header(SESSION_HEADER, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.set_session_id(id.to_string());
        }

        let status = response.status();
        if status == reqwest::StatusCode::ACCEPTED {
            return Ok(());
        }
        if !status.is_success() {
            return Err(TransportError::SendFailed(format!("HTTP {status}")));
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("text/event-stream"))
            .unwrap_or(false);

        if is_stream {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
                for event in decoder.feed(&chunk) {
                    if event.name() == "message" && !event.data.is_empty() {
                        self.enqueue(Bytes::from(event.data))?;
                    }
                }
            }
            if let Some(event) = decoder.finish() {
                if event.name() == "message" && !event.data.is_empty() {
                    self.enqueue(Bytes::from(event.data))?;
                }
            }
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
            if !body.iter().all(u8::is_ascii_whitespace) {
                self.enqueue(body)?;
            }
        }
        Ok(())
    }

    async fn recv(&self) -> TransportResult<Bytes> {
        let mut inbox = self.inbox_rx.lock().await;
        tokio::select! {
            message = inbox.recv() => message.ok_or(TransportError::Closed),
            _ = self.closed.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        if let Some(id) = self.session_id() {
            let result = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, id)
                .send()
                .await;
            if let Err(e) = result {
                tracing::debug!("Failed to end HTTP session: {}", e);
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
