//! Plugin lifecycle management and hook dispatch.
//!
//! The manager instantiates the plugins listed in a manifest, keeps them in
//! an instance registry and runs the ordered, filtered chain for each hook
//! invocation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, HookError, PluginError};
use crate::hooks::{hook_registry, Hook};
use crate::plugin::base::{Plugin, PluginRef};
use crate::plugin::config::{Config, PluginMode};
use crate::plugin::executor::PluginExecutor;
use crate::plugin::loader::{ConfigLoader, PluginLoader};
use crate::plugin::registry::PluginInstanceRegistry;
use crate::plugin::schema::{GlobalContext, PluginContext, PluginContextTable, PluginResult};

pub struct PluginManager {
    config: Config,
    loader: PluginLoader,
    registry: PluginInstanceRegistry,
    executor: PluginExecutor,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl PluginManager {
    /// A manager over `config` using the built-in plugin kinds.
    pub fn new(config: Config) -> Self {
        Self::with_loader(config, PluginLoader::with_builtins())
    }

    pub fn with_loader(config: Config, loader: PluginLoader) -> Self {
        let executor = PluginExecutor::new(
            Duration::from_secs(config.plugin_settings.plugin_timeout),
            config.plugin_settings.fail_on_plugin_error,
        );
        Self {
            config,
            loader,
            registry: PluginInstanceRegistry::new(),
            executor,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// Loads the manifest at `path`. Call [`PluginManager::initialize`] before
    /// invoking hooks.
    pub async fn from_path(
        path: impl AsRef<Path>,
        loader: PluginLoader,
    ) -> Result<Self, GatewayError> {
        let config = ConfigLoader::load_config(path).await?;
        Ok(Self::with_loader(config, loader))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn plugin_count(&self) -> usize {
        self.registry.plugin_count()
    }

    pub fn get_plugin(&self, name: &str) -> Option<PluginRef> {
        self.registry.get_plugin(name)
    }

    pub fn plugins(&self) -> Vec<PluginRef> {
        self.registry.get_all_plugins()
    }

    /// Instantiates every enabled plugin of the manifest. A plugin whose
    /// construction fails is logged and left out.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        let _guard = self.init_lock.lock().await;
        if self.initialized() {
            return Ok(());
        }

        for plugin_config in &self.config.plugins {
            if plugin_config.mode == PluginMode::Disabled {
                debug!("Skipping disabled plugin '{}'", plugin_config.name);
                continue;
            }

            match self.loader.load_and_instantiate(plugin_config).await {
                Ok(plugin) => {
                    if let Err(e) = self.registry.register(PluginRef::new(plugin)) {
                        warn!("Failed to register plugin '{}': {}", plugin_config.name, e);
                    }
                }
                Err(e) => {
                    error!("Failed to load plugin '{}': {}", plugin_config.name, e);
                }
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!(
            "Plugin manager initialized with {} plugin(s)",
            self.registry.plugin_count()
        );
        Ok(())
    }

    /// Registers an already constructed plugin.
    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        plugin.initialize().await?;
        self.registry.register(PluginRef::new(plugin))
    }

    /// Runs the chain for hook `H`.
    ///
    /// `local_contexts` is the table returned by the paired earlier call (for
    /// example the `tool_pre_invoke` table when invoking `tool_post_invoke`).
    /// When `violations_as_exceptions` is set, an enforce-mode violation is
    /// returned as [`GatewayError::Violation`] instead of a blocked result.
    pub async fn invoke_hook<H: Hook>(
        &self,
        payload: H::Payload,
        global_context: &mut GlobalContext,
        local_contexts: Option<&PluginContextTable>,
        violations_as_exceptions: bool,
    ) -> Result<(PluginResult<H::Payload>, PluginContextTable), GatewayError> {
        let hook = H::hook_type();
        if !hook_registry().is_registered(&hook) {
            return Err(HookError::NotRegistered(hook.to_string()).into());
        }

        let plugins = self.registry.get_plugins_for_hook(&hook);
        if plugins.is_empty() {
            debug!("No plugins subscribed to '{}'", hook);
            return Ok((PluginResult::pass(), PluginContextTable::new()));
        }

        self.executor
            .execute::<H>(
                &plugins,
                payload,
                global_context,
                local_contexts,
                violations_as_exceptions,
            )
            .await
    }

    /// Invokes hook `H` on a single named plugin, bypassing chain and
    /// condition logic. Used by the external plugin server.
    pub async fn invoke_hook_for_plugin<H: Hook>(
        &self,
        name: &str,
        payload: H::Payload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<H::Payload>, PluginError> {
        let hook = H::hook_type();
        if !hook_registry().is_registered(&hook) {
            return Err(HookError::NotRegistered(hook.to_string()).into());
        }
        let plugin = self
            .registry
            .get_plugin(name)
            .ok_or_else(|| PluginError::NotFound {
                name: name.to_string(),
            })?;
        self.executor
            .execute_plugin::<H>(&plugin, payload, context)
            .await
    }

    pub async fn shutdown(&self) {
        let _guard = self.init_lock.lock().await;
        self.registry.shutdown().await;
        self.initialized.store(false, Ordering::SeqCst);
        info!("Plugin manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{ToolPreInvoke, ToolPreInvokePayload};
    use crate::plugin::config::PluginConfig;

    #[tokio::test]
    async fn test_empty_manager_passes_through() {
        let manager = PluginManager::new(Config::default());
        manager.initialize().await.unwrap();
        let mut global = GlobalContext::new("1");
        let (result, contexts) = manager
            .invoke_hook::<ToolPreInvoke>(
                ToolPreInvokePayload::new("t", Default::default()),
                &mut global,
                None,
                false,
            )
            .await
            .unwrap();
        assert!(result.continue_processing);
        assert!(result.modified_payload.is_none());
        assert!(contexts.is_empty());
    }

    #[tokio::test]
    async fn test_failed_constructor_excludes_plugin() {
        let config = Config {
            plugins: vec![
                PluginConfig::new("broken", "builtin.DenyListPlugin")
                    .with_config(serde_json::json!({"words": 5})),
                PluginConfig::new("ok", "builtin.PassthroughPlugin"),
                PluginConfig::new("off", "builtin.PassthroughPlugin")
                    .with_mode(PluginMode::Disabled),
            ],
            ..Default::default()
        };
        let manager = PluginManager::new(config);
        manager.initialize().await.unwrap();
        assert_eq!(manager.plugin_count(), 1);
        assert!(manager.get_plugin("OK").is_some());
        assert!(manager.get_plugin("off").is_none());
    }

    #[tokio::test]
    async fn test_invoke_for_unknown_plugin() {
        let manager = PluginManager::new(Config::default());
        manager.initialize().await.unwrap();
        let mut ctx = PluginContext::new(GlobalContext::new("1"));
        let err = manager
            .invoke_hook_for_plugin::<ToolPreInvoke>(
                "ghost",
                ToolPreInvokePayload::new("t", Default::default()),
                &mut ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotFound { .. }));
    }
}
