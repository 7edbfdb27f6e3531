//! Hook identifiers and the static binding of each hook to its payload type.
//!
//! A hook is a marker type implementing [`Hook`]. The marker names the wire
//! identifier, the payload shape, and which [`Plugin`] method handles it, so
//! the manager can dispatch without any runtime introspection.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

use crate::error::PluginError;
use crate::plugin::base::Plugin;
use crate::plugin::schema::{PluginContext, PluginResult};

pub mod agents;
pub mod http;
pub mod prompts;
pub mod registry;
pub mod resources;
pub mod tools;

pub use agents::{AgentPostInvoke, AgentPostInvokePayload, AgentPreInvoke, AgentPreInvokePayload};
pub use http::{HttpPostRequest, HttpPostRequestPayload, HttpPreRequest, HttpPreRequestPayload};
pub use prompts::{PromptPostFetch, PromptPosthookPayload, PromptPreFetch, PromptPrehookPayload};
pub use registry::{hook_registry, BoundType, HookRegistry};
pub use resources::{
    ResourcePostFetch, ResourcePostFetchPayload, ResourcePreFetch, ResourcePreFetchPayload,
};
pub use tools::{ToolPostInvoke, ToolPostInvokePayload, ToolPreInvoke, ToolPreInvokePayload};

/// Identifier of an interception point, e.g. `tool_pre_invoke`.
///
/// Built-in hooks are available as associated constants. Additional hooks can
/// be created with [`HookType::new`] and registered with the
/// [`HookRegistry`] before first use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HookType(Cow<'static, str>);

impl HookType {
    pub const PROMPT_PRE_FETCH: HookType = HookType::from_static("prompt_pre_fetch");
    pub const PROMPT_POST_FETCH: HookType = HookType::from_static("prompt_post_fetch");
    pub const TOOL_PRE_INVOKE: HookType = HookType::from_static("tool_pre_invoke");
    pub const TOOL_POST_INVOKE: HookType = HookType::from_static("tool_post_invoke");
    pub const RESOURCE_PRE_FETCH: HookType = HookType::from_static("resource_pre_fetch");
    pub const RESOURCE_POST_FETCH: HookType = HookType::from_static("resource_post_fetch");
    pub const AGENT_PRE_INVOKE: HookType = HookType::from_static("agent_pre_invoke");
    pub const AGENT_POST_INVOKE: HookType = HookType::from_static("agent_post_invoke");
    pub const HTTP_PRE_REQUEST: HookType = HookType::from_static("http_pre_request");
    pub const HTTP_POST_REQUEST: HookType = HookType::from_static("http_post_request");

    pub const fn from_static(name: &'static str) -> Self {
        HookType(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        HookType(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Family prefix of the identifier (`tool`, `prompt`, `http`, ...).
    pub fn family(&self) -> &str {
        self.0.split('_').next().unwrap_or_default()
    }

    /// Built-in hooks in registration order.
    pub fn builtin() -> [HookType; 10] {
        [
            HookType::PROMPT_PRE_FETCH,
            HookType::PROMPT_POST_FETCH,
            HookType::TOOL_PRE_INVOKE,
            HookType::TOOL_POST_INVOKE,
            HookType::RESOURCE_PRE_FETCH,
            HookType::RESOURCE_POST_FETCH,
            HookType::AGENT_PRE_INVOKE,
            HookType::AGENT_POST_INVOKE,
            HookType::HTTP_PRE_REQUEST,
            HookType::HTTP_POST_REQUEST,
        ]
    }
}

impl fmt::Display for HookType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HookType {
    fn from(name: &str) -> Self {
        HookType::new(name)
    }
}

/// Bounds every hook payload must satisfy to cross plugin and process
/// boundaries.
pub trait PluginPayload:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> PluginPayload for T where
    T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// What a payload is about, used for condition matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTarget<'a> {
    Tool(&'a str),
    Prompt(&'a str),
    Resource(&'a str),
    Agent(&'a str),
    None,
}

pub type HookFuture<'a, P> = BoxFuture<'a, Result<PluginResult<P>, PluginError>>;

/// Static description of a hook.
pub trait Hook: Send + Sync + 'static {
    type Payload: PluginPayload;

    fn hook_type() -> HookType;

    /// Routes the call to the plugin method handling this hook.
    fn invoke<'a>(
        plugin: &'a dyn Plugin,
        payload: Self::Payload,
        context: &'a mut PluginContext,
    ) -> HookFuture<'a, Self::Payload>;

    fn target(_payload: &Self::Payload) -> HookTarget<'_> {
        HookTarget::None
    }
}

/// Registers every built-in hook with its payload and result type.
pub(crate) fn register_builtin_hooks(registry: &HookRegistry) {
    fn bind<H: Hook>(registry: &HookRegistry) {
        if let Err(e) = registry.register_hook::<H>() {
            tracing::error!("Failed to register built-in hook {}: {}", H::hook_type(), e);
        }
    }

    bind::<PromptPreFetch>(registry);
    bind::<PromptPostFetch>(registry);
    bind::<ToolPreInvoke>(registry);
    bind::<ToolPostInvoke>(registry);
    bind::<ResourcePreFetch>(registry);
    bind::<ResourcePostFetch>(registry);
    bind::<AgentPreInvoke>(registry);
    bind::<AgentPostInvoke>(registry);
    bind::<HttpPreRequest>(registry);
    bind::<HttpPostRequest>(registry);
}
