use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{Hook, HookFuture, HookTarget, HookType};
use crate::plugin::base::Plugin;
use crate::plugin::schema::PluginContext;
use crate::protocol::mcp::PromptResult;

/// Prompt rendering request: the prompt id and its template arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptPrehookPayload {
    pub prompt_id: String,
    #[serde(default)]
    pub args: HashMap<String, String>,
}

/// Rendered prompt returned by the upstream server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptPosthookPayload {
    pub prompt_id: String,
    pub result: PromptResult,
}

pub struct PromptPreFetch;

impl Hook for PromptPreFetch {
    type Payload = PromptPrehookPayload;

    fn hook_type() -> HookType {
        HookType::PROMPT_PRE_FETCH
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.prompt_pre_fetch(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Prompt(&payload.prompt_id)
    }
}

pub struct PromptPostFetch;

impl Hook for PromptPostFetch {
    type Payload = PromptPosthookPayload;

    fn hook_type() -> HookType {
        HookType::PROMPT_POST_FETCH
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.prompt_post_fetch(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Prompt(&payload.prompt_id)
    }
}
