use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::{Hook, HookFuture, HookTarget, HookType};
use crate::plugin::base::Plugin;
use crate::plugin::schema::PluginContext;

/// A tool call before it reaches the upstream server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPreInvokePayload {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl ToolPreInvokePayload {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
            headers: None,
        }
    }
}

/// A tool call result on its way back to the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPostInvokePayload {
    pub name: String,
    #[serde(default)]
    pub result: Value,
}

impl ToolPostInvokePayload {
    pub fn new(name: impl Into<String>, result: Value) -> Self {
        Self {
            name: name.into(),
            result,
        }
    }

    /// Whether the upstream result reports a tool error.
    pub fn is_error(&self) -> bool {
        ["isError", "is_error"]
            .iter()
            .any(|key| self.result.get(key).and_then(Value::as_bool).unwrap_or(false))
    }
}

pub struct ToolPreInvoke;

impl Hook for ToolPreInvoke {
    type Payload = ToolPreInvokePayload;

    fn hook_type() -> HookType {
        HookType::TOOL_PRE_INVOKE
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.tool_pre_invoke(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Tool(&payload.name)
    }
}

pub struct ToolPostInvoke;

impl Hook for ToolPostInvoke {
    type Payload = ToolPostInvokePayload;

    fn hook_type() -> HookType {
        HookType::TOOL_POST_INVOKE
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.tool_post_invoke(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Tool(&payload.name)
    }
}
