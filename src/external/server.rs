//! Exposes a local plugin manager to remote gateways.

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::InvokeHookResponse;
use crate::error::{GatewayError, HookError, PluginError};
use crate::hooks::{
    hook_registry, AgentPostInvoke, AgentPreInvoke, Hook, HookType, HttpPostRequest,
    HttpPreRequest, PromptPostFetch, PromptPreFetch, ResourcePostFetch, ResourcePreFetch,
    ToolPostInvoke, ToolPreInvoke,
};
use crate::plugin::config::PluginConfig;
use crate::plugin::manager::PluginManager;
use crate::plugin::schema::{PluginContext, PluginErrorModel};

type HookInvoker = for<'a> fn(
    &'a PluginManager,
    &'a str,
    Value,
    &'a mut PluginContext,
) -> BoxFuture<'a, Result<Value, PluginError>>;

fn invoke_typed<'a, H: Hook>(
    manager: &'a PluginManager,
    plugin_name: &'a str,
    payload: Value,
    context: &'a mut PluginContext,
) -> BoxFuture<'a, Result<Value, PluginError>> {
    Box::pin(async move {
        let hook = H::hook_type();
        let payload: H::Payload = hook_registry().decode_payload(&hook, payload)?;
        let result = manager
            .invoke_hook_for_plugin::<H>(plugin_name, payload, context)
            .await?;
        serde_json::to_value(result)
            .map_err(|e| PluginError::new(plugin_name, format!("Failed to encode result: {e}")))
    })
}

/// The plugin manager of a plugin server process and the hook tools it
/// serves.
pub struct ExternalPluginServer {
    manager: Arc<PluginManager>,
    hooks: HashMap<HookType, HookInvoker>,
}

impl ExternalPluginServer {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        let mut server = Self {
            manager,
            hooks: HashMap::new(),
        };
        server.register_hook::<PromptPreFetch>();
        server.register_hook::<PromptPostFetch>();
        server.register_hook::<ToolPreInvoke>();
        server.register_hook::<ToolPostInvoke>();
        server.register_hook::<ResourcePreFetch>();
        server.register_hook::<ResourcePostFetch>();
        server.register_hook::<AgentPreInvoke>();
        server.register_hook::<AgentPostInvoke>();
        server.register_hook::<HttpPreRequest>();
        server.register_hook::<HttpPostRequest>();
        server
    }

    /// Serves hook `H` as a tool. Hooks defined outside this crate must be
    /// added here to be reachable remotely.
    pub fn register_hook<H: Hook>(&mut self) {
        if let Err(e) = hook_registry().register_hook::<H>() {
            warn!("Cannot serve hook {}: {}", H::hook_type(), e);
            return;
        }
        self.hooks.insert(H::hook_type(), invoke_typed::<H>);
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Hooks served as tools, sorted by identifier.
    pub fn hook_types(&self) -> Vec<HookType> {
        let mut hooks: Vec<HookType> = self.hooks.keys().cloned().collect();
        hooks.sort();
        hooks
    }

    pub fn serves_hook(&self, hook: &str) -> bool {
        self.hooks.contains_key(&HookType::new(hook))
    }

    pub async fn initialize(&self) -> Result<(), GatewayError> {
        self.manager.initialize().await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await
    }

    /// Configurations of every loaded plugin, in registration order.
    pub fn get_plugin_configs(&self) -> Vec<PluginConfig> {
        self.manager
            .plugins()
            .iter()
            .map(|p| p.config().clone())
            .collect()
    }

    /// Configuration of the plugin named `name`, ignoring case.
    pub fn get_plugin_config(&self, name: &str) -> Option<PluginConfig> {
        self.manager.get_plugin(name).map(|p| p.config().clone())
    }

    /// Runs `hook_type` on a single plugin.
    ///
    /// Failures are reported inside the response rather than as an error so
    /// the caller always learns which plugin failed.
    pub async fn invoke_hook(
        &self,
        hook_type: &str,
        plugin_name: &str,
        payload: Value,
        context: Value,
    ) -> InvokeHookResponse {
        let hook = HookType::new(hook_type);
        let Some(invoker) = self.hooks.get(&hook) else {
            let err = PluginError::from(HookError::NotRegistered(hook.to_string()));
            return InvokeHookResponse::failed(plugin_name, err.to_model(plugin_name));
        };

        let mut context: PluginContext = match serde_json::from_value(context) {
            Ok(context) => context,
            Err(e) => {
                let error = PluginErrorModel::new(plugin_name, format!("Invalid context: {e}"))
                    .with_code("INVALID_CONTEXT");
                return InvokeHookResponse::failed(plugin_name, error);
            }
        };

        debug!(hook = %hook, plugin = plugin_name, "Invoking hook for remote caller");
        match invoker(&self.manager, plugin_name, payload, &mut context).await {
            Ok(result) => {
                let mut response = InvokeHookResponse::new(plugin_name);
                response.result = Some(result);
                response.context = Some(context);
                response
            }
            Err(e) => {
                debug!(hook = %hook, plugin = plugin_name, "Hook failed: {}", e);
                InvokeHookResponse::failed(plugin_name, e.to_model(plugin_name))
            }
        }
    }
}
