//! The plugin contract.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::PluginError;
use crate::hooks::{
    AgentPostInvokePayload, AgentPreInvokePayload, HookType, HttpPostRequestPayload,
    HttpPreRequestPayload, PromptPosthookPayload, PromptPrehookPayload, ResourcePostFetchPayload,
    ResourcePreFetchPayload, ToolPostInvokePayload, ToolPreInvokePayload,
};
use crate::plugin::config::{PluginCondition, PluginConfig, PluginMode};
use crate::plugin::schema::{PluginContext, PluginResult};

/// A plugin implements the hooks it cares about; every other hook passes the
/// payload through unchanged.
///
/// One instance serves every request concurrently, so any state a plugin
/// keeps must be safe to share.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// The configuration the plugin runs with.
    fn config(&self) -> Arc<PluginConfig>;

    /// Called once before the plugin is registered.
    async fn initialize(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn shutdown(&self) {}

    async fn prompt_pre_fetch(
        &self,
        _payload: PromptPrehookPayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<PromptPrehookPayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn prompt_post_fetch(
        &self,
        _payload: PromptPosthookPayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<PromptPosthookPayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn tool_pre_invoke(
        &self,
        _payload: ToolPreInvokePayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPreInvokePayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn tool_post_invoke(
        &self,
        _payload: ToolPostInvokePayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPostInvokePayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn resource_pre_fetch(
        &self,
        _payload: ResourcePreFetchPayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<ResourcePreFetchPayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn resource_post_fetch(
        &self,
        _payload: ResourcePostFetchPayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<ResourcePostFetchPayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn agent_pre_invoke(
        &self,
        _payload: AgentPreInvokePayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<AgentPreInvokePayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn agent_post_invoke(
        &self,
        _payload: AgentPostInvokePayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<AgentPostInvokePayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn http_pre_request(
        &self,
        _payload: HttpPreRequestPayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<HttpPreRequestPayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    async fn http_post_request(
        &self,
        _payload: HttpPostRequestPayload,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<HttpPostRequestPayload>, PluginError> {
        Ok(PluginResult::pass())
    }

    /// Entry point for hooks registered outside this crate. The payload
    /// arrives as JSON.
    async fn invoke_extension(
        &self,
        _hook: &HookType,
        _payload: Value,
        _context: &mut PluginContext,
    ) -> Result<PluginResult<Value>, PluginError> {
        Ok(PluginResult::pass())
    }
}

/// A registered plugin together with the configuration snapshot taken at
/// registration.
#[derive(Clone)]
pub struct PluginRef {
    plugin: Arc<dyn Plugin>,
    config: Arc<PluginConfig>,
    uuid: Uuid,
}

impl PluginRef {
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        let config = plugin.config();
        Self {
            plugin,
            config,
            uuid: Uuid::new_v4(),
        }
    }

    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn priority(&self) -> i32 {
        self.config.effective_priority()
    }

    pub fn mode(&self) -> PluginMode {
        self.config.mode
    }

    pub fn hooks(&self) -> &[HookType] {
        &self.config.hooks
    }

    pub fn conditions(&self) -> &[PluginCondition] {
        &self.config.conditions
    }

    pub async fn shutdown(&self) {
        self.plugin.shutdown().await
    }
}

impl std::fmt::Debug for PluginRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRef")
            .field("name", &self.config.name)
            .field("kind", &self.config.kind)
            .field("priority", &self.priority())
            .field("uuid", &self.uuid)
            .finish()
    }
}
