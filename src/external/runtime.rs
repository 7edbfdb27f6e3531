//! Hosting an [`ExternalPluginServer`] over stdio, streamable HTTP or SSE.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::sse::Event;
use warp::{Filter, Reply};

use super::{ExternalPluginServer, RpcHandler};
use crate::error::{GatewayError, TransportError};
use crate::plugin::config::{CertRequirement, McpServerConfig, ServerTransport, HEALTH_PORT_OFFSET};
use crate::protocol::mcp::INITIALIZE_METHOD;
use crate::protocol::{JsonRpcMessage, JsonRpcV2Message};
use crate::transport::http::SESSION_HEADER;
use crate::transport::stream::LineConnection;
use crate::transport::{tls, Connection, Transport, TransportResult, TransportType};

/// Serves JSON-RPC messages arriving on `connection` until the peer leaves.
pub async fn serve_connection(handler: Arc<RpcHandler>, connection: Arc<dyn Connection>) {
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<JsonRpcMessage>();

    let writer_connection = connection.clone();
    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let line = match reply.to_line() {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode reply: {}", e);
                    continue;
                }
            };
            if let Err(e) = writer_connection.send(line).await {
                debug!("Failed to write reply: {}", e);
                break;
            }
        }
    });

    loop {
        let data = match connection.recv().await {
            Ok(data) => data,
            Err(TransportError::Closed) => break,
            Err(e) => {
                warn!("Receive failed: {}", e);
                break;
            }
        };
        match JsonRpcMessage::from_slice(&data) {
            Ok(message) => handler.dispatch(message, reply_tx.clone()),
            Err(e) => warn!("Discarding malformed message: {}", e),
        }
    }

    drop(reply_tx);
    if let Err(e) = writer.await {
        debug!("Reply writer ended abnormally: {}", e);
    }
    debug!("Connection closed");
}

/// Connects to a plugin server in the same process over an in-memory pipe.
pub struct InProcessTransport {
    server: Arc<ExternalPluginServer>,
}

impl InProcessTransport {
    pub fn new(server: Arc<ExternalPluginServer>) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self) -> TransportResult<Arc<dyn Connection>> {
        let (client, server_end) = LineConnection::pair(64 * 1024);
        let handler = Arc::new(RpcHandler::new(self.server.clone()));
        tokio::spawn(serve_connection(handler, Arc::new(server_end)));
        Ok(Arc::new(client))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::InProcess
    }
}

#[derive(Clone)]
struct SseSession {
    replies: mpsc::UnboundedSender<JsonRpcMessage>,
    handler: Arc<RpcHandler>,
}

#[derive(Clone)]
struct HttpState {
    server: Arc<ExternalPluginServer>,
    handler: Arc<RpcHandler>,
    sessions: Arc<DashMap<String, SseSession>>,
}

/// Removes an SSE session once its event stream is dropped.
struct SessionGuard {
    sessions: Arc<DashMap<String, SseSession>>,
    id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        debug!(session = %self.id, "SSE session closed");
    }
}

pub fn health_route() -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| warp::reply::json(&json!({"status": "healthy"})))
}

fn with_state(
    state: HttpState,
) -> impl Filter<Extract = (HttpState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

fn routes(
    state: HttpState,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let mcp_post = warp::path("mcp")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(handle_mcp_post);

    let mcp_delete = warp::path("mcp")
        .and(warp::path::end())
        .and(warp::delete())
        .map(|| StatusCode::OK);

    let sse = warp::path("sse")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .map(open_sse_session);

    let messages = warp::path("messages")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::body::bytes())
        .and(with_state(state))
        .and_then(handle_sse_post);

    health_route()
        .or(mcp_post)
        .or(mcp_delete)
        .or(sse)
        .or(messages)
        .with(warp::trace::request())
}

fn parse_error_reply(message: String) -> warp::reply::Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": null,
        "error": {"code": crate::protocol::JsonRpcError::PARSE_ERROR, "message": message},
    });
    warp::reply::with_status(warp::reply::json(&body), StatusCode::BAD_REQUEST).into_response()
}

async fn handle_mcp_post(body: Bytes, state: HttpState) -> Result<warp::reply::Response, Infallible> {
    let message = match JsonRpcMessage::from_slice(&body) {
        Ok(message) => message,
        Err(e) => return Ok(parse_error_reply(e.to_string())),
    };
    let is_initialize = matches!(
        &message,
        JsonRpcMessage::V2(JsonRpcV2Message::Request(request)) if request.method == INITIALIZE_METHOD
    );

    match state.handler.handle(message).await {
        Some(reply) => {
            let reply = warp::reply::json(&reply);
            if is_initialize {
                let session_id = Uuid::new_v4().simple().to_string();
                Ok(warp::reply::with_header(reply, SESSION_HEADER, session_id).into_response())
            } else {
                Ok(reply.into_response())
            }
        }
        None => Ok(StatusCode::ACCEPTED.into_response()),
    }
}

fn open_sse_session(state: HttpState) -> impl Reply {
    let session_id = Uuid::new_v4().simple().to_string();
    let (replies, rx) = mpsc::unbounded_channel::<JsonRpcMessage>();
    state.sessions.insert(
        session_id.clone(),
        SseSession {
            replies,
            handler: Arc::new(RpcHandler::new(state.server.clone())),
        },
    );
    debug!(session = %session_id, "SSE session opened");

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("/messages?session_id={session_id}"));
    let guard = SessionGuard {
        sessions: state.sessions.clone(),
        id: session_id,
    };
    let messages = UnboundedReceiverStream::new(rx).map(move |message| {
        let _session = &guard;
        let data = serde_json::to_string(&message).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event("message").data(data))
    });
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(endpoint) }).chain(messages);

    warp::sse::reply(warp::sse::keep_alive().stream(stream))
}

async fn handle_sse_post(
    query: HashMap<String, String>,
    body: Bytes,
    state: HttpState,
) -> Result<warp::reply::Response, Infallible> {
    let Some(session_id) = query.get("session_id") else {
        return Ok(warp::reply::with_status("missing session_id", StatusCode::BAD_REQUEST).into_response());
    };
    let Some(session) = state.sessions.get(session_id).map(|s| s.clone()) else {
        return Ok(warp::reply::with_status("unknown session", StatusCode::NOT_FOUND).into_response());
    };
    let message = match JsonRpcMessage::from_slice(&body) {
        Ok(message) => message,
        Err(e) => return Ok(parse_error_reply(e.to_string())),
    };
    session.handler.dispatch(message, session.replies.clone());
    Ok(StatusCode::ACCEPTED.into_response())
}

/// Handle to a running HTTP server.
pub struct RunningServer {
    pub addr: SocketAddr,
    pub health_addr: Option<SocketAddr>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningServer {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Waits until every listener has stopped.
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Listener task failed: {}", e);
            }
        }
    }
}

pub struct ServerRuntime {
    server: Arc<ExternalPluginServer>,
    settings: McpServerConfig,
}

impl ServerRuntime {
    pub fn new(server: Arc<ExternalPluginServer>, settings: McpServerConfig) -> Self {
        Self { server, settings }
    }

    pub fn settings(&self) -> &McpServerConfig {
        &self.settings
    }

    /// The configured transport, or stdio unless standard input is an
    /// interactive terminal.
    pub fn transport(&self) -> ServerTransport {
        self.settings.transport.unwrap_or_else(|| {
            if std::io::stdin().is_terminal() {
                ServerTransport::Http
            } else {
                ServerTransport::Stdio
            }
        })
    }

    /// Initializes the plugins, serves until `shutdown` resolves (or stdin
    /// closes for stdio) and shuts the plugins down.
    pub async fn run<F>(self, shutdown: F) -> Result<(), GatewayError>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.server.initialize().await?;
        let transport = self.transport();
        info!(transport = ?transport, "Starting plugin server");

        let outcome = match transport {
            ServerTransport::Stdio => {
                let handler = Arc::new(RpcHandler::new(self.server.clone()));
                let connection: Arc<dyn Connection> =
                    Arc::new(LineConnection::new(tokio::io::stdin(), tokio::io::stdout()));
                tokio::select! {
                    _ = serve_connection(handler, connection) => {}
                    _ = shutdown => {}
                }
                Ok(())
            }
            ServerTransport::Http | ServerTransport::Sse => match self.start().await {
                Ok(running) => {
                    shutdown.await;
                    running.shutdown();
                    running.wait().await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        self.server.shutdown().await;
        info!("Plugin server stopped");
        outcome
    }

    /// Binds the HTTP listeners and returns once they accept connections.
    ///
    /// With TLS enabled a plain HTTP listener serving only `/health` runs on
    /// the main port plus 1000.
    pub async fn start(&self) -> Result<RunningServer, GatewayError> {
        let addr = resolve(&self.settings.host, self.settings.port).await?;
        let token = CancellationToken::new();
        let state = HttpState {
            server: self.server.clone(),
            handler: Arc::new(RpcHandler::new(self.server.clone())),
            sessions: Arc::new(DashMap::new()),
        };
        let routes = routes(state);
        let mut tasks = Vec::new();

        let signal = {
            let token = token.clone();
            async move { token.cancelled().await }
        };

        let (bound, health_addr) = match &self.settings.tls {
            Some(server_tls) => {
                tls::load_certs(&server_tls.certfile)
                    .and_then(|_| tls::load_private_key(&server_tls.keyfile).map(|_| ()))
                    .map_err(|e| GatewayError::Server(format!("Invalid server certificate: {e}")))?;
                // The TLS builder panics instead of failing when the bind fails.
                std::net::TcpListener::bind(addr)
                    .map_err(|e| GatewayError::Server(format!("Failed to bind {addr}: {e}")))?;

                let mut builder = warp::serve(routes)
                    .tls()
                    .cert_path(&server_tls.certfile)
                    .key_path(&server_tls.keyfile);
                builder = match (server_tls.cert_reqs, &server_tls.ca_bundle) {
                    (CertRequirement::Required, Some(ca)) => builder.client_auth_required_path(ca),
                    (CertRequirement::Optional, Some(ca)) => builder.client_auth_optional_path(ca),
                    _ => builder,
                };
                let (bound, server) = builder.bind_with_graceful_shutdown(addr, signal);
                tasks.push(tokio::spawn(server));

                let health_port = bound
                    .port()
                    .checked_add(HEALTH_PORT_OFFSET)
                    .ok_or_else(|| {
                        GatewayError::Server(format!("No health port above {}", bound.port()))
                    })?;
                let health_addr = SocketAddr::new(bound.ip(), health_port);
                let health_signal = {
                    let token = token.clone();
                    async move { token.cancelled().await }
                };
                let (health_bound, health_server) = warp::serve(health_route())
                    .try_bind_with_graceful_shutdown(health_addr, health_signal)
                    .map_err(|e| {
                        token.cancel();
                        GatewayError::Server(format!("Failed to bind health listener: {e}"))
                    })?;
                tasks.push(tokio::spawn(health_server));
                info!("Health check listening on http://{}", health_bound);
                (bound, Some(health_bound))
            }
            None => {
                let (bound, server) = warp::serve(routes)
                    .try_bind_with_graceful_shutdown(addr, signal)
                    .map_err(|e| GatewayError::Server(format!("Failed to bind {addr}: {e}")))?;
                tasks.push(tokio::spawn(server));
                (bound, None)
            }
        };

        info!(
            tls = self.settings.tls.is_some(),
            "Plugin server listening on {} (POST /mcp, GET /sse)",
            bound
        );
        Ok(RunningServer {
            addr: bound,
            health_addr,
            token,
            tasks,
        })
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, GatewayError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| GatewayError::Server(format!("Cannot resolve {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| GatewayError::Server(format!("No address for {host}:{port}")))
}

/// Completes on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
