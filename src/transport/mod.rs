use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

use crate::error::TransportError;
use crate::plugin::config::{McpClientConfig, TransportKind};

pub mod http;
pub mod session;
pub mod sse;
pub mod stdio;
pub mod stream;
pub mod tls;

pub use session::RpcSession;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportType {
    Stdio,
    Sse,
    StreamableHttp,
    InProcess,
}

impl TransportType {
    /// Network transports are worth retrying on connect failure.
    pub fn is_network(self) -> bool {
        matches!(self, TransportType::Sse | TransportType::StreamableHttp)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self) -> TransportResult<Arc<dyn Connection>>;
    fn transport_type(&self) -> TransportType;
}

/// A bidirectional, message framed channel. Each `send`/`recv` carries one
/// serialized JSON-RPC message.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn send(&self, data: Bytes) -> TransportResult<()>;
    async fn recv(&self) -> TransportResult<Bytes>;
    async fn close(&self) -> TransportResult<()>;
    fn is_closed(&self) -> bool;
}

pub fn create_transport(config: &McpClientConfig) -> TransportResult<Arc<dyn Transport>> {
    match config.proto {
        TransportKind::Stdio => {
            let command = config.script.clone().ok_or_else(|| {
                TransportError::ConnectionFailed("STDIO transport requires a script".into())
            })?;
            let mut transport = stdio::StdioTransport::new().with_command(command, config.args.clone());
            if !config.env.is_empty() {
                transport = transport.with_env(config.env.clone());
            }
            if let Some(dir) = &config.cwd {
                transport = transport.with_working_dir(dir.clone());
            }
            Ok(Arc::new(transport))
        }
        TransportKind::StreamableHttp => {
            let url = require_url(config)?;
            let client = tls::build_http_client(config.tls.as_ref())?;
            Ok(Arc::new(http::StreamableHttpTransport::new(url, client)))
        }
        TransportKind::Sse => {
            let url = require_url(config)?;
            let client = tls::build_http_client(config.tls.as_ref())?;
            Ok(Arc::new(sse::SseTransport::new(url, client)))
        }
    }
}

fn require_url(config: &McpClientConfig) -> TransportResult<String> {
    config
        .url
        .clone()
        .ok_or_else(|| TransportError::ConnectionFailed("HTTP transport requires a url".into()))
}
