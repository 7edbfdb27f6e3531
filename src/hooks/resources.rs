use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{Hook, HookFuture, HookTarget, HookType};
use crate::plugin::base::Plugin;
use crate::plugin::schema::PluginContext;
use crate::protocol::mcp::ResourceContent;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcePreFetchPayload {
    pub uri: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePostFetchPayload {
    pub uri: String,
    pub content: ResourceContent,
}

pub struct ResourcePreFetch;

impl Hook for ResourcePreFetch {
    type Payload = ResourcePreFetchPayload;

    fn hook_type() -> HookType {
        HookType::RESOURCE_PRE_FETCH
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.resource_pre_fetch(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Resource(&payload.uri)
    }
}

pub struct ResourcePostFetch;

impl Hook for ResourcePostFetch {
    type Payload = ResourcePostFetchPayload;

    fn hook_type() -> HookType {
        HookType::RESOURCE_POST_FETCH
    }

    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload> {
        plugin.resource_post_fetch(payload, context)
    }

    fn target(payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::Resource(&payload.uri)
    }
}
