//! MCP method routing for the plugin server.

use dashmap::DashMap;
use futures::future::{abortable, AbortHandle};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ExternalPluginServer, GET_PLUGIN_CONFIG, GET_PLUGIN_CONFIGS, INVOKE_HOOK};
use crate::plugin::schema::PluginContext;
use crate::protocol::mcp::{
    CallToolParams, CallToolResult, CancelledParams, Implementation, InitializeResult,
    ListToolsResult, Tool, CANCELLED_NOTIFICATION, INITIALIZED_NOTIFICATION, INITIALIZE_METHOD,
    PING_METHOD, PROTOCOL_VERSION, TOOLS_CALL_METHOD, TOOLS_LIST_METHOD,
};
use crate::protocol::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcV2Message,
};

const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION, "2025-03-26", "2024-11-05"];

/// Answers MCP requests for one client session.
pub struct RpcHandler {
    server: Arc<ExternalPluginServer>,
    in_flight: DashMap<JsonRpcId, AbortHandle>,
}

impl RpcHandler {
    pub fn new(server: Arc<ExternalPluginServer>) -> Self {
        Self {
            server,
            in_flight: DashMap::new(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Handles one message and returns the reply, if any.
    pub async fn handle(&self, message: JsonRpcMessage) -> Option<JsonRpcMessage> {
        match message {
            JsonRpcMessage::V2(JsonRpcV2Message::Request(request)) => {
                Some(self.handle_request(request).await)
            }
            JsonRpcMessage::V2(JsonRpcV2Message::Notification(notification)) => {
                self.handle_notification(notification);
                None
            }
            JsonRpcMessage::V2(JsonRpcV2Message::Response(response)) => {
                debug!(id = %response.id, "Ignoring response from client");
                None
            }
        }
    }

    /// Handles one message of a long-lived session. Requests run
    /// concurrently; a cancelled request gets no reply.
    pub fn dispatch(self: &Arc<Self>, message: JsonRpcMessage, replies: mpsc::UnboundedSender<JsonRpcMessage>) {
        match message {
            JsonRpcMessage::V2(JsonRpcV2Message::Request(request)) => {
                let id = request.id.clone();
                let handler = self.clone();
                let task_id = id.clone();
                let (task, abort) = abortable(async move {
                    let reply = handler.handle_request(request).await;
                    handler.in_flight.remove(&task_id);
                    let _ = replies.send(reply);
                });
                self.in_flight.insert(id, abort);
                tokio::spawn(task);
            }
            other => {
                let handler = self.clone();
                tokio::spawn(async move {
                    if let Some(reply) = handler.handle(other).await {
                        let _ = replies.send(reply);
                    }
                });
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcMessage {
        let id = request.id.clone();
        match self.route(&request.method, request.params).await {
            Ok(result) => JsonRpcMessage::success(id, result),
            Err(error) => {
                debug!(method = %request.method, "Request failed: {}", error.message);
                JsonRpcMessage::failure(id, error)
            }
        }
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            CANCELLED_NOTIFICATION => {
                let params = notification
                    .params
                    .and_then(|p| serde_json::from_value::<CancelledParams>(p).ok());
                let Some(params) = params else {
                    warn!("Malformed cancellation notification");
                    return;
                };
                if let Some((_, abort)) = self.in_flight.remove(&params.request_id) {
                    abort.abort();
                    debug!(
                        request_id = %params.request_id,
                        reason = params.reason.as_deref().unwrap_or_default(),
                        "Cancelled request"
                    );
                }
            }
            INITIALIZED_NOTIFICATION => debug!("Client initialized"),
            other => debug!(method = other, "Ignoring notification"),
        }
    }

    async fn route(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            INITIALIZE_METHOD => {
                let requested = params
                    .as_ref()
                    .and_then(|p| p.get("protocolVersion"))
                    .and_then(Value::as_str)
                    .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
                    .unwrap_or(PROTOCOL_VERSION);
                to_json(InitializeResult {
                    protocol_version: requested.to_string(),
                    capabilities: json!({"tools": {"listChanged": false}}),
                    server_info: Implementation::current(),
                })
            }
            PING_METHOD => Ok(json!({})),
            TOOLS_LIST_METHOD => to_json(ListToolsResult {
                tools: self.tools(),
            }),
            TOOLS_CALL_METHOD => {
                let params: CallToolParams =
                    serde_json::from_value(params.unwrap_or_default()).map_err(|e| {
                        JsonRpcError::new(JsonRpcError::INVALID_PARAMS, e.to_string())
                    })?;
                let body = self.call_tool(&params.name, params.arguments).await?;
                to_json(CallToolResult::json(&body, false))
            }
            other => Err(JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            )),
        }
    }

    async fn call_tool(&self, name: &str, mut args: Map<String, Value>) -> Result<Value, JsonRpcError> {
        match name {
            GET_PLUGIN_CONFIGS => to_json(self.server.get_plugin_configs()),
            GET_PLUGIN_CONFIG => {
                let plugin = required_str(&args, "name")?;
                match self.server.get_plugin_config(&plugin) {
                    Some(config) => to_json(config),
                    None => Ok(Value::Null),
                }
            }
            INVOKE_HOOK => {
                let hook = required_str(&args, "hook_type")?;
                args.remove("hook_type");
                self.invoke(&hook, args).await
            }
            hook if self.server.serves_hook(hook) => self.invoke(hook, args).await,
            other => Err(JsonRpcError::new(
                JsonRpcError::INVALID_PARAMS,
                format!("Unknown tool: {other}"),
            )),
        }
    }

    async fn invoke(&self, hook: &str, mut args: Map<String, Value>) -> Result<Value, JsonRpcError> {
        let plugin_name = required_str(&args, "plugin_name")?;
        let payload = args.remove("payload").unwrap_or(Value::Null);
        let context = match args.remove("context") {
            Some(context) if !context.is_null() => context,
            _ => to_json(PluginContext::default())?,
        };
        let response = self
            .server
            .invoke_hook(hook, &plugin_name, payload, context)
            .await;
        to_json(response)
    }

    fn tools(&self) -> Vec<Tool> {
        let hook_properties = json!({
            "plugin_name": {"type": "string", "description": "Plugin to invoke"},
            "payload": {"type": "object", "description": "Hook payload"},
            "context": {"type": "object", "description": "Plugin context"},
        });
        let hook_schema = json!({
            "type": "object",
            "properties": hook_properties,
            "required": ["plugin_name", "payload", "context"],
        });

        let mut generic_properties = hook_properties.clone();
        if let Some(props) = generic_properties.as_object_mut() {
            props.insert(
                "hook_type".into(),
                json!({"type": "string", "description": "Hook identifier"}),
            );
        }

        let mut tools = vec![
            Tool {
                name: GET_PLUGIN_CONFIGS.into(),
                description: Some("Return the configuration of every loaded plugin".into()),
                input_schema: json!({"type": "object", "properties": {}}),
            },
            Tool {
                name: GET_PLUGIN_CONFIG.into(),
                description: Some("Return the configuration of one plugin".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}},
                    "required": ["name"],
                }),
            },
            Tool {
                name: INVOKE_HOOK.into(),
                description: Some("Invoke any hook on a plugin".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": generic_properties,
                    "required": ["hook_type", "plugin_name", "payload", "context"],
                }),
            },
        ];
        tools.extend(self.server.hook_types().into_iter().map(|hook| Tool {
            description: Some(format!("Invoke the {hook} hook on a plugin")),
            name: hook.to_string(),
            input_schema: hook_schema.clone(),
        }));
        tools
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(JsonRpcError::INTERNAL_ERROR, e.to_string()))
}

fn required_str(args: &Map<String, Value>, key: &str) -> Result<String, JsonRpcError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            JsonRpcError::new(
                JsonRpcError::INVALID_PARAMS,
                format!("Missing string argument '{key}'"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::InvokeHookResponse;
    use crate::hooks::HookType;
    use crate::plugin::config::{Config, PluginConfig};
    use crate::plugin::manager::PluginManager;

    async fn handler() -> RpcHandler {
        let config = Config {
            plugins: vec![PluginConfig::new("DenyList", "builtin.DenyListPlugin")
                .with_hooks([HookType::TOOL_PRE_INVOKE])
                .with_config(json!({"words": ["secret"]}))],
            ..Default::default()
        };
        let manager = Arc::new(PluginManager::new(config));
        let server = Arc::new(ExternalPluginServer::new(manager));
        server.initialize().await.unwrap();
        RpcHandler::new(server)
    }

    fn request(method: &str, params: Value) -> JsonRpcMessage {
        JsonRpcMessage::request(JsonRpcId::Number(1), method, Some(params))
    }

    fn result_of(reply: Option<JsonRpcMessage>) -> Value {
        match reply {
            Some(JsonRpcMessage::V2(JsonRpcV2Message::Response(r))) => {
                assert!(r.error.is_none(), "unexpected error: {:?}", r.error);
                r.result.unwrap()
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    fn tool_body(reply: Option<JsonRpcMessage>) -> Value {
        let result: CallToolResult = serde_json::from_value(result_of(reply)).unwrap();
        result.first_json().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_tools_list_includes_every_hook() {
        let handler = handler().await;
        let result = result_of(handler.handle(request(TOOLS_LIST_METHOD, json!({}))).await);
        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [GET_PLUGIN_CONFIGS, GET_PLUGIN_CONFIG, INVOKE_HOOK, "tool_pre_invoke", "http_post_request"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_get_plugin_config_ignores_case() {
        let handler = handler().await;
        let body = tool_body(
            handler
                .handle(request(
                    TOOLS_CALL_METHOD,
                    json!({"name": GET_PLUGIN_CONFIG, "arguments": {"name": "denylist"}}),
                ))
                .await,
        );
        assert_eq!(body["name"], "DenyList");

        let missing = tool_body(
            handler
                .handle(request(
                    TOOLS_CALL_METHOD,
                    json!({"name": GET_PLUGIN_CONFIG, "arguments": {"name": "ghost"}}),
                ))
                .await,
        );
        assert!(missing.is_null());
    }

    #[tokio::test]
    async fn test_hook_tool_reports_violation() {
        let handler = handler().await;
        let body = tool_body(
            handler
                .handle(request(
                    TOOLS_CALL_METHOD,
                    json!({
                        "name": "tool_pre_invoke",
                        "arguments": {
                            "plugin_name": "DenyList",
                            "payload": {"name": "search", "args": {"q": "the SECRET plan"}},
                            "context": {"global_context": {"request_id": "r1"}},
                        }
                    }),
                ))
                .await,
        );
        let response: InvokeHookResponse = serde_json::from_value(body).unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["continue_processing"], false);
        assert_eq!(result["violation"]["code"], "deny");
    }

    #[tokio::test]
    async fn test_generic_invoke_reports_unknown_plugin_as_error() {
        let handler = handler().await;
        let body = tool_body(
            handler
                .handle(request(
                    TOOLS_CALL_METHOD,
                    json!({
                        "name": INVOKE_HOOK,
                        "arguments": {
                            "hook_type": "tool_pre_invoke",
                            "plugin_name": "ghost",
                            "payload": {"name": "search", "args": {}},
                        }
                    }),
                ))
                .await,
        );
        let response: InvokeHookResponse = serde_json::from_value(body).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.unwrap().code, "PLUGIN_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let handler = handler().await;
        match handler.handle(request("resources/list", json!({}))).await {
            Some(JsonRpcMessage::V2(JsonRpcV2Message::Response(r))) => {
                assert_eq!(r.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_initialize_negotiates_known_version() {
        let handler = handler().await;
        let result = result_of(
            handler
                .handle(request(
                    INITIALIZE_METHOD,
                    json!({"protocolVersion": "2024-11-05", "capabilities": {}, "clientInfo": {"name": "t", "version": "0"}}),
                ))
                .await,
        );
        assert_eq!(result["protocolVersion"], "2024-11-05");
        assert!(result["capabilities"]["tools"].is_object());
    }
}
