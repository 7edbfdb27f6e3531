//! Registering hooks defined outside the crate and serving them remotely.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use mcp_plugin_gateway::error::{GatewayError, HookError, PluginError};
use mcp_plugin_gateway::external::ExternalPluginServer;
use mcp_plugin_gateway::hooks::{
    hook_registry, AgentPostInvoke, AgentPreInvoke, Hook, HookFuture, HookType, HttpPostRequest,
    HttpPreRequest, PromptPostFetch, PromptPreFetch, ResourcePostFetch, ResourcePreFetch,
    ToolPostInvoke, ToolPreInvoke, ToolPreInvokePayload,
};
use mcp_plugin_gateway::plugin::{
    Config, GlobalContext, Plugin, PluginConfig, PluginContext, PluginManager, PluginResult,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct AuditPayload {
    actor: String,
    action: String,
}

/// A hook that is not built in; plugins receive it through
/// `invoke_extension`.
struct AuditEvent;

impl Hook for AuditEvent {
    type Payload = AuditPayload;

    fn hook_type() -> HookType {
        HookType::from_static("audit_event")
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        Box::pin(async move {
            let raw = serde_json::to_value(&payload)
                .map_err(|e| PluginError::new("", e.to_string()))?;
            let result = plugin
                .invoke_extension(&Self::hook_type(), raw, context)
                .await?;
            let modified = result
                .modified_payload
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| PluginError::new("", e.to_string()))?;
            Ok(PluginResult {
                continue_processing: result.continue_processing,
                modified_payload: modified,
                violation: result.violation,
                metadata: result.metadata,
            })
        })
    }
}

struct UnboundHook;

impl Hook for UnboundHook {
    type Payload = Value;

    fn hook_type() -> HookType {
        HookType::from_static("never_registered")
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        Box::pin(async move {
            plugin
                .invoke_extension(&Self::hook_type(), payload, context)
                .await
        })
    }
}

struct Redactor {
    config: Arc<PluginConfig>,
}

#[async_trait]
impl Plugin for Redactor {
    fn config(&self) -> Arc<PluginConfig> {
        self.config.clone()
    }

    async fn invoke_extension(
        &self,
        hook: &HookType,
        mut payload: Value,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<Value>, PluginError> {
        assert_eq!(hook.as_str(), "audit_event");
        payload["actor"] = json!("[redacted]");
        Ok(PluginResult::modified(payload))
    }
}

fn redactor() -> Arc<Redactor> {
    Arc::new(Redactor {
        config: Arc::new(
            PluginConfig::new("Redactor", "test.Redactor")
                .with_hooks([HookType::from_static("audit_event")]),
        ),
    })
}

#[test]
fn test_builtin_hooks_are_bound() {
    let registry = hook_registry();
    for hook in HookType::builtin() {
        assert!(registry.is_registered(&hook), "{hook} not registered");
    }
    let bound = registry.payload_type(&HookType::TOOL_PRE_INVOKE).unwrap();
    assert!(bound.type_name.ends_with("ToolPreInvokePayload"));
}

#[test]
fn test_rebinding_builtin_hook_to_other_type_fails() {
    let err = hook_registry()
        .register::<AuditPayload, PluginResult<AuditPayload>>(HookType::TOOL_PRE_INVOKE)
        .unwrap_err();
    assert!(matches!(err, HookError::Conflict { .. }));
    assert!(hook_registry().register_hook::<ToolPreInvoke>().is_ok());
}

#[test]
fn test_decode_payload_checks_binding() {
    let raw = json!({"name": "calc", "args": {"x": 1}});
    let payload: ToolPreInvokePayload = hook_registry()
        .decode_payload(&HookType::TOOL_PRE_INVOKE, raw.clone())
        .unwrap();
    assert_eq!(payload.name, "calc");

    let err = hook_registry()
        .decode_payload::<AuditPayload>(&HookType::TOOL_PRE_INVOKE, raw)
        .unwrap_err();
    assert!(matches!(err, HookError::TypeMismatch { .. }));
}

/// Decoding, re-serializing and decoding again yields the same payload and
/// the same result for `H`.
fn assert_stable<H: Hook>(raw: Value)
where
    H::Payload: PartialEq,
{
    let hook = H::hook_type();
    let registry = hook_registry();

    let first: H::Payload = registry.decode_payload(&hook, raw.clone()).unwrap();
    let again: H::Payload = registry
        .decode_payload(&hook, serde_json::to_value(&first).unwrap())
        .unwrap();
    assert_eq!(first, again, "payload of {hook} changed on re-decode");

    let result = json!({
        "continue_processing": false,
        "modified_payload": raw,
        "violation": {
            "reason": "r",
            "description": "d",
            "code": "c",
            "details": {"k": 1},
            "plugin_name": "p"
        },
        "metadata": {"m": true}
    });
    let first: PluginResult<H::Payload> = registry.decode_result(&hook, result).unwrap();
    let again: PluginResult<H::Payload> = registry
        .decode_result(&hook, serde_json::to_value(&first).unwrap())
        .unwrap();
    assert_eq!(first, again, "result of {hook} changed on re-decode");
}

#[test]
fn test_builtin_payloads_survive_re_decoding() {
    let message = json!({"role": "user", "content": {"type": "text", "text": "hi"}});
    let samples = [
        (
            HookType::PROMPT_PRE_FETCH,
            json!({"prompt_id": "greet", "args": {"name": "alice"}}),
        ),
        (
            HookType::PROMPT_POST_FETCH,
            json!({"prompt_id": "greet", "result": {"description": "d", "messages": [message]}}),
        ),
        (
            HookType::TOOL_PRE_INVOKE,
            json!({"name": "calc", "args": {"x": 1, "y": [2, 3]}, "headers": {"x-id": "7"}}),
        ),
        (
            HookType::TOOL_POST_INVOKE,
            json!({"name": "calc", "result": {"content": [{"type": "text", "text": "3"}]}}),
        ),
        (
            HookType::RESOURCE_PRE_FETCH,
            json!({"uri": "file:///etc/motd", "metadata": {"cache": false}}),
        ),
        (
            HookType::RESOURCE_POST_FETCH,
            json!({"uri": "file:///etc/motd", "content": {"uri": "file:///etc/motd", "mimeType": "text/plain", "text": "welcome"}}),
        ),
        (
            HookType::AGENT_PRE_INVOKE,
            json!({"agent_id": "a1", "messages": [message], "tools": ["search"], "model": "m", "parameters": {"t": 0.5}}),
        ),
        (
            HookType::AGENT_POST_INVOKE,
            json!({"agent_id": "a1", "messages": [message], "tool_calls": [{"name": "search"}]}),
        ),
        (
            HookType::HTTP_PRE_REQUEST,
            json!({"path": "/mcp", "method": "POST", "client_host": "10.0.0.1", "client_port": 5000, "headers": {"a": "b"}}),
        ),
        (
            HookType::HTTP_POST_REQUEST,
            json!({"path": "/mcp", "method": "POST", "headers": {}, "response_headers": {"c": "d"}, "status_code": 200}),
        ),
    ];
    assert_eq!(samples.len(), HookType::builtin().len());

    for (hook, raw) in samples {
        assert!(HookType::builtin().contains(&hook));
        match hook.as_str() {
            "prompt_pre_fetch" => assert_stable::<PromptPreFetch>(raw),
            "prompt_post_fetch" => assert_stable::<PromptPostFetch>(raw),
            "tool_pre_invoke" => assert_stable::<ToolPreInvoke>(raw),
            "tool_post_invoke" => assert_stable::<ToolPostInvoke>(raw),
            "resource_pre_fetch" => assert_stable::<ResourcePreFetch>(raw),
            "resource_post_fetch" => assert_stable::<ResourcePostFetch>(raw),
            "agent_pre_invoke" => assert_stable::<AgentPreInvoke>(raw),
            "agent_post_invoke" => assert_stable::<AgentPostInvoke>(raw),
            "http_pre_request" => assert_stable::<HttpPreRequest>(raw),
            "http_post_request" => assert_stable::<HttpPostRequest>(raw),
            other => panic!("no sample for {other}"),
        }
    }
}

#[tokio::test]
async fn test_extension_hook_runs_through_manager() {
    hook_registry().register_hook::<AuditEvent>().unwrap();

    let manager = PluginManager::new(Config::default());
    manager.register_plugin(redactor()).await.unwrap();

    let mut global = GlobalContext::new("req-1");
    let (result, _) = manager
        .invoke_hook::<AuditEvent>(
            AuditPayload {
                actor: "alice".into(),
                action: "login".into(),
            },
            &mut global,
            None,
            false,
        )
        .await
        .unwrap();

    let modified = result.modified_payload.unwrap();
    assert_eq!(modified.actor, "[redacted]");
    assert_eq!(modified.action, "login");
}

#[tokio::test]
async fn test_unregistered_hook_is_rejected() {
    let manager = PluginManager::new(Config::default());
    let mut global = GlobalContext::new("req-1");
    let err = manager
        .invoke_hook::<UnboundHook>(json!({}), &mut global, None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Hook(HookError::NotRegistered(_))));
}

#[tokio::test]
async fn test_extension_hook_served_remotely() {
    let manager = Arc::new(PluginManager::new(Config::default()));
    manager.register_plugin(redactor()).await.unwrap();

    let mut server = ExternalPluginServer::new(manager);
    assert!(!server.serves_hook("audit_event"));
    server.register_hook::<AuditEvent>();
    assert!(server.serves_hook("audit_event"));

    let response = server
        .invoke_hook(
            "audit_event",
            "redactor",
            json!({"actor": "bob", "action": "delete"}),
            json!({"global_context": {"request_id": "req-9"}}),
        )
        .await;

    assert!(response.error.is_none());
    let result = response.result.unwrap();
    assert_eq!(result["modified_payload"]["actor"], "[redacted]");
    assert_eq!(result["continue_processing"], true);
}
