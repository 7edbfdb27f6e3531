//! Client side of an external plugin.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{InvokeHookResponse, GET_PLUGIN_CONFIG};
use crate::error::{PluginError, TransportError};
use crate::hooks::{
    hook_registry, AgentPostInvoke, AgentPostInvokePayload, AgentPreInvoke, AgentPreInvokePayload,
    Hook, HookType, HttpPostRequest, HttpPostRequestPayload, HttpPreRequest, HttpPreRequestPayload,
    PromptPostFetch, PromptPosthookPayload, PromptPreFetch, PromptPrehookPayload, ResourcePostFetch,
    ResourcePostFetchPayload, ResourcePreFetch, ResourcePreFetchPayload, ToolPostInvoke,
    ToolPostInvokePayload, ToolPreInvoke, ToolPreInvokePayload,
};
use crate::plugin::base::Plugin;
use crate::plugin::config::PluginConfig;
use crate::plugin::schema::{PluginContext, PluginResult};
use crate::transport::{create_transport, RpcSession, Transport};

const CONNECT_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Forwards hook calls to a plugin server over MCP.
///
/// The session is opened on first use. When the manifest entry lists no
/// hooks, [`Plugin::initialize`] connects eagerly and completes the
/// configuration with what the server reports.
pub struct ExternalPlugin {
    name: String,
    config: ArcSwap<PluginConfig>,
    transport: Arc<dyn Transport>,
    session: OnceCell<Arc<RpcSession>>,
}

impl ExternalPlugin {
    pub fn new(config: PluginConfig) -> Result<Self, PluginError> {
        let mcp = config.mcp.as_ref().ok_or_else(|| {
            PluginError::new(&config.name, "External plugin requires an 'mcp' section")
        })?;
        let transport = create_transport(mcp).map_err(|source| PluginError::Transport {
            plugin_name: config.name.clone(),
            source,
        })?;
        Ok(Self::with_transport(config, transport))
    }

    /// Uses `transport` instead of the one described by the `mcp` section.
    pub fn with_transport(config: PluginConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: config.name.clone(),
            config: ArcSwap::from_pointee(config),
            transport,
            session: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.session.get().map(|s| !s.is_closed()).unwrap_or(false)
    }

    fn transport_error(&self, source: TransportError) -> PluginError {
        PluginError::Transport {
            plugin_name: self.name.clone(),
            source,
        }
    }

    async fn session(&self) -> Result<&Arc<RpcSession>, PluginError> {
        self.session.get_or_try_init(|| self.connect()).await
    }

    async fn connect(&self) -> Result<Arc<RpcSession>, PluginError> {
        let attempts = if self.transport.transport_type().is_network() {
            CONNECT_ATTEMPTS
        } else {
            1
        };
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.try_connect().await {
                Ok(session) => return Ok(session),
                Err(e) if attempt < attempts => {
                    warn!(
                        plugin = %self.name,
                        attempt,
                        "Connection to plugin server failed, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(self.transport_error(e)),
            }
        }
    }

    async fn try_connect(&self) -> Result<Arc<RpcSession>, TransportError> {
        let connection = self.transport.connect().await?;
        let session = RpcSession::new(connection);
        match session.initialize().await {
            Ok(result) => {
                info!(
                    plugin = %self.name,
                    server = %result.server_info.name,
                    transport = ?self.transport.transport_type(),
                    "Connected to plugin server"
                );
                Ok(Arc::new(session))
            }
            Err(e) => {
                session.close().await;
                Err(e)
            }
        }
    }

    async fn call(&self, tool: &str, arguments: Value) -> Result<Value, PluginError> {
        let session = self.session().await?;
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let result = session
            .call_tool(tool, arguments)
            .await
            .map_err(|e| self.transport_error(e))?;
        let body = result
            .first_json()
            .ok_or_else(|| PluginError::new(&self.name, format!("'{tool}' returned no content")))?
            .map_err(|e| PluginError::new(&self.name, format!("'{tool}' returned invalid JSON: {e}")))?;
        if result.is_error {
            return Err(PluginError::new(
                &self.name,
                format!("'{tool}' failed: {body}"),
            ));
        }
        Ok(body)
    }

    /// Asks the server for this plugin's configuration.
    pub async fn fetch_remote_config(&self) -> Result<Option<PluginConfig>, PluginError> {
        let body = self
            .call(GET_PLUGIN_CONFIG, json!({ "name": self.name }))
            .await?;
        if body.is_null() {
            return Ok(None);
        }
        serde_json::from_value(body)
            .map(Some)
            .map_err(|e| PluginError::new(&self.name, format!("Invalid remote configuration: {e}")))
    }

    /// Local settings win; the remote configuration fills what is unset.
    fn merge_remote(&self, remote: PluginConfig) {
        let mut merged = PluginConfig::clone(&self.config.load());
        if merged.hooks.is_empty() {
            merged.hooks = remote.hooks;
        }
        if merged.priority.is_none() {
            merged.priority = remote.priority;
        }
        if merged.conditions.is_empty() {
            merged.conditions = remote.conditions;
        }
        let local_config_empty = match &merged.config {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if local_config_empty {
            merged.config = remote.config;
        }
        if merged.description.is_none() {
            merged.description = remote.description;
        }
        if merged.author.is_none() {
            merged.author = remote.author;
        }
        if merged.version.is_none() {
            merged.version = remote.version;
        }
        if merged.tags.is_empty() {
            merged.tags = remote.tags;
        }
        self.config.store(Arc::new(merged));
    }

    async fn invoke<H: Hook>(
        &self,
        payload: H::Payload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<H::Payload>, PluginError> {
        let hook = H::hook_type();
        let raw = self.invoke_raw(&hook, &payload, context).await?;
        hook_registry()
            .decode_result::<PluginResult<H::Payload>>(&hook, raw)
            .map_err(PluginError::from)
    }

    /// Calls the tool named after `hook` and applies the returned context.
    async fn invoke_raw<P: serde::Serialize>(
        &self,
        hook: &HookType,
        payload: &P,
        context: &mut PluginContext,
    ) -> Result<Value, PluginError> {
        let arguments = json!({
            "plugin_name": self.name,
            "payload": payload,
            "context": context,
        });
        let body = self.call(hook.as_str(), arguments).await?;
        let response: InvokeHookResponse = serde_json::from_value(body)
            .map_err(|e| PluginError::new(&self.name, format!("Invalid hook response: {e}")))?;

        if let Some(returned) = response.context {
            context.state = returned.state;
            context.metadata = returned.metadata;
            context.global_context.state = returned.global_context.state;
        }

        if let Some(mut error) = response.error {
            if error.plugin_name.is_empty() {
                error.plugin_name = self.name.clone();
            }
            return Err(PluginError::Plugin { error });
        }
        response.result.ok_or_else(|| {
            PluginError::new(&self.name, format!("'{hook}' response carries neither result nor error"))
        })
    }
}

#[async_trait]
impl Plugin for ExternalPlugin {
    fn config(&self) -> Arc<PluginConfig> {
        self.config.load_full()
    }

    async fn initialize(&self) -> Result<(), PluginError> {
        if !self.config.load().hooks.is_empty() {
            debug!(plugin = %self.name, "Hooks configured locally, connecting lazily");
            return Ok(());
        }

        let remote = self.fetch_remote_config().await?.ok_or_else(|| {
            PluginError::new(
                &self.name,
                "Unable to retrieve configuration for external plugin",
            )
        })?;
        self.merge_remote(remote);
        info!(
            plugin = %self.name,
            hooks = ?self.config.load().hooks,
            "Loaded configuration from plugin server"
        );
        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(session) = self.session.get() {
            session.close().await;
        }
    }

    async fn prompt_pre_fetch(
        &self,
        payload: PromptPrehookPayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<PromptPrehookPayload>, PluginError> {
        self.invoke::<PromptPreFetch>(payload, context).await
    }

    async fn prompt_post_fetch(
        &self,
        payload: PromptPosthookPayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<PromptPosthookPayload>, PluginError> {
        self.invoke::<PromptPostFetch>(payload, context).await
    }

    async fn tool_pre_invoke(
        &self,
        payload: ToolPreInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPreInvokePayload>, PluginError> {
        self.invoke::<ToolPreInvoke>(payload, context).await
    }

    async fn tool_post_invoke(
        &self,
        payload: ToolPostInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPostInvokePayload>, PluginError> {
        self.invoke::<ToolPostInvoke>(payload, context).await
    }

    async fn resource_pre_fetch(
        &self,
        payload: ResourcePreFetchPayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ResourcePreFetchPayload>, PluginError> {
        self.invoke::<ResourcePreFetch>(payload, context).await
    }

    async fn resource_post_fetch(
        &self,
        payload: ResourcePostFetchPayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ResourcePostFetchPayload>, PluginError> {
        self.invoke::<ResourcePostFetch>(payload, context).await
    }

    async fn agent_pre_invoke(
        &self,
        payload: AgentPreInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<AgentPreInvokePayload>, PluginError> {
        self.invoke::<AgentPreInvoke>(payload, context).await
    }

    async fn agent_post_invoke(
        &self,
        payload: AgentPostInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<AgentPostInvokePayload>, PluginError> {
        self.invoke::<AgentPostInvoke>(payload, context).await
    }

    async fn http_pre_request(
        &self,
        payload: HttpPreRequestPayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<HttpPreRequestPayload>, PluginError> {
        self.invoke::<HttpPreRequest>(payload, context).await
    }

    async fn http_post_request(
        &self,
        payload: HttpPostRequestPayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<HttpPostRequestPayload>, PluginError> {
        self.invoke::<HttpPostRequest>(payload, context).await
    }

    async fn invoke_extension(
        &self,
        hook: &HookType,
        payload: Value,
        context: &mut PluginContext,
    ) -> Result<PluginResult<Value>, PluginError> {
        let raw = self.invoke_raw(hook, &payload, context).await?;
        serde_json::from_value(raw)
            .map_err(|e| PluginError::new(&self.name, format!("Invalid '{hook}' result: {e}")))
    }
}
