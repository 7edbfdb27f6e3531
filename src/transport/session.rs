//! Client side of a JSON-RPC conversation over a [`Connection`].
//!
//! A background task reads every inbound message and routes responses to the
//! caller waiting on the matching request id. Dropping a request future
//! before its response arrives sends `notifications/cancelled` to the peer.

use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Connection, TransportResult};
use crate::error::TransportError;
use crate::protocol::mcp::{
    CallToolParams, CallToolResult, Implementation, InitializeParams, InitializeResult,
    CANCELLED_NOTIFICATION, INITIALIZED_NOTIFICATION, INITIALIZE_METHOD, PING_METHOD,
    PROTOCOL_VERSION, TOOLS_CALL_METHOD,
};
use crate::protocol::{JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcV2Message};

type Pending = Arc<DashMap<JsonRpcId, oneshot::Sender<TransportResult<Value>>>>;

pub struct RpcSession {
    connection: Arc<dyn Connection>,
    pending: Pending,
    next_id: AtomicI64,
    reader: JoinHandle<()>,
}

impl RpcSession {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        let pending: Pending = Arc::new(DashMap::new());
        let reader = tokio::spawn(read_loop(connection.clone(), pending.clone()));
        Self {
            connection,
            pending,
            next_id: AtomicI64::new(1),
            reader,
        }
    }

    /// Performs the `initialize` handshake and confirms it with the
    /// `notifications/initialized` notification.
    pub async fn initialize(&self) -> TransportResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation::current(),
        };
        let params = serde_json::to_value(params)
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        let result = self.request(INITIALIZE_METHOD, Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| TransportError::InvalidFormat(format!("initialize result: {e}")))?;
        self.notify(INITIALIZED_NOTIFICATION, None).await?;
        debug!(
            server = %result.server_info.name,
            protocol = %result.protocol_version,
            "Session initialized"
        );
        Ok(result)
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> TransportResult<Value> {
        let id = JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let message = JsonRpcMessage::request(id.clone(), method, params)
            .to_line()
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        let mut guard = CancelOnDrop {
            id: id.clone(),
            pending: self.pending.clone(),
            connection: self.connection.clone(),
            armed: false,
        };

        self.connection.send(message).await?;
        guard.armed = true;

        let outcome = rx.await.map_err(|_| TransportError::Closed);
        guard.armed = false;
        outcome?
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> TransportResult<()> {
        let message = JsonRpcMessage::notification(method, params)
            .to_line()
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        self.connection.send(message).await
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> TransportResult<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        let params = serde_json::to_value(params)
            .map_err(|e| TransportError::InvalidFormat(e.to_string()))?;
        let result = self.request(TOOLS_CALL_METHOD, Some(params)).await?;
        serde_json::from_value(result)
            .map_err(|e| TransportError::InvalidFormat(format!("tools/call result: {e}")))
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed() || self.reader.is_finished()
    }

    pub async fn close(&self) {
        self.reader.abort();
        self.pending.clear();
        if let Err(e) = self.connection.close().await {
            debug!("Error closing connection: {}", e);
        }
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Withdraws an abandoned request and tells the peer to stop working on it.
struct CancelOnDrop {
    id: JsonRpcId,
    pending: Pending,
    connection: Arc<dyn Connection>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
        if !self.armed || self.connection.is_closed() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let connection = self.connection.clone();
        let id = self.id.clone();
        handle.spawn(async move {
            let params = json!({"requestId": id, "reason": "request cancelled by client"});
            let line = match JsonRpcMessage::notification(CANCELLED_NOTIFICATION, Some(params)).to_line() {
                Ok(line) => line,
                Err(_) => return,
            };
            if let Err(e) = connection.send(line).await {
                debug!(request_id = %id, "Failed to send cancellation: {}", e);
            }
        });
    }
}

async fn read_loop(connection: Arc<dyn Connection>, pending: Pending) {
    loop {
        let data = match connection.recv().await {
            Ok(data) => data,
            Err(TransportError::Closed) => break,
            Err(e) => {
                warn!("Session receive failed: {}", e);
                break;
            }
        };

        let message = match JsonRpcMessage::from_slice(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed message: {}", e);
                continue;
            }
        };

        match message {
            JsonRpcMessage::V2(JsonRpcV2Message::Response(response)) => {
                let Some((_, tx)) = pending.remove(&response.id) else {
                    debug!(id = %response.id, "Response for unknown request");
                    continue;
                };
                let outcome = match response.error {
                    Some(error) => Err(TransportError::Rpc {
                        code: error.code,
                        message: error.message,
                    }),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            JsonRpcMessage::V2(JsonRpcV2Message::Request(request)) => {
                let reply = if request.method == PING_METHOD {
                    JsonRpcMessage::success(request.id, json!({}))
                } else {
                    JsonRpcMessage::failure(
                        request.id,
                        JsonRpcError::new(JsonRpcError::METHOD_NOT_FOUND, "Method not found"),
                    )
                };
                if let Ok(line) = reply.to_line() {
                    if let Err(e) = connection.send(line).await {
                        debug!("Failed to answer server request: {}", e);
                    }
                }
            }
            JsonRpcMessage::V2(JsonRpcV2Message::Notification(notification)) => {
                debug!(method = %notification.method, "Server notification");
            }
        }
    }

    // Waiters observe a closed channel once their sender is dropped.
    pending.clear();
}
