use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::{Hook, HookFuture, HookTarget, HookType};
use crate::plugin::base::Plugin;
use crate::plugin::schema::PluginContext;
use crate::protocol::mcp::Message;

/// Conversation about to be sent to an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPreInvokePayload {
    pub agent_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

/// Agent response messages and any tool calls it requested.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentPostInvokePayload {
    pub agent_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
}

pub struct AgentPreInvoke;

impl Hook for AgentPreInvoke {
    type Payload = AgentPreInvokePayload;

    fn hook_type() -> HookType {
        HookType::AGENT_PRE_INVOKE
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.agent_pre_invoke(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Agent(&payload.agent_id)
    }
}

pub struct AgentPostInvoke;

impl Hook for AgentPostInvoke {
    type Payload = AgentPostInvokePayload;

    fn hook_type() -> HookType {
        HookType::AGENT_POST_INVOKE
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.agent_post_invoke(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Agent(&payload.agent_id)
    }
}
