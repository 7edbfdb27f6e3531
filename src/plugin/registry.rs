//! Registered plugin instances and the per-hook ordering cache.

use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::error::PluginError;
use crate::hooks::HookType;
use crate::plugin::base::PluginRef;

/// Plugins in registration order, with a per-hook list sorted by priority.
#[derive(Default)]
pub struct PluginInstanceRegistry {
    plugins: RwLock<Vec<PluginRef>>,
    hook_cache: DashMap<HookType, Arc<Vec<PluginRef>>>,
}

impl PluginInstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: PluginRef) -> Result<(), PluginError> {
        let mut plugins = self.write();
        if plugins
            .iter()
            .any(|p| p.name().eq_ignore_ascii_case(plugin.name()))
        {
            return Err(PluginError::new(
                plugin.name(),
                format!("Plugin '{}' is already registered", plugin.name()),
            ));
        }
        debug!(
            plugin = plugin.name(),
            priority = plugin.priority(),
            hooks = ?plugin.hooks(),
            "Registered plugin"
        );
        plugins.push(plugin);
        self.hook_cache.clear();
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Option<PluginRef> {
        let mut plugins = self.write();
        let index = plugins
            .iter()
            .position(|p| p.name().eq_ignore_ascii_case(name))?;
        let removed = plugins.remove(index);
        self.hook_cache.clear();
        Some(removed)
    }

    /// Case-insensitive lookup.
    pub fn get_plugin(&self, name: &str) -> Option<PluginRef> {
        self.read()
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Plugins subscribed to `hook`, sorted by ascending priority. Ties keep
    /// registration order.
    pub fn get_plugins_for_hook(&self, hook: &HookType) -> Arc<Vec<PluginRef>> {
        if let Some(cached) = self.hook_cache.get(hook) {
            return cached.clone();
        }

        // Writers clear the cache under the write lock, so the list is
        // cached before the read guard is released.
        let plugins = self.read();
        let mut subscribed: Vec<PluginRef> = plugins
            .iter()
            .filter(|p| p.hooks().contains(hook))
            .cloned()
            .collect();
        subscribed.sort_by_key(|p| p.priority());

        let subscribed = Arc::new(subscribed);
        self.hook_cache.insert(hook.clone(), subscribed.clone());
        subscribed
    }

    pub fn get_all_plugins(&self) -> Vec<PluginRef> {
        self.read().clone()
    }

    pub fn plugin_count(&self) -> usize {
        self.read().len()
    }

    /// Shuts plugins down in reverse registration order and empties the
    /// registry.
    pub async fn shutdown(&self) {
        let plugins: Vec<PluginRef> = {
            let mut guard = self.write();
            self.hook_cache.clear();
            std::mem::take(&mut *guard)
        };
        for plugin in plugins.iter().rev() {
            info!("Shutting down plugin '{}'", plugin.name());
            plugin.shutdown().await;
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<PluginRef>> {
        self.plugins.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<PluginRef>> {
        self.plugins.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::base::Plugin;
    use crate::plugin::config::PluginConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Named {
        config: Arc<PluginConfig>,
        shutdowns: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Named {
        fn config(&self) -> Arc<PluginConfig> {
            self.config.clone()
        }

        async fn shutdown(&self) {
            self.shutdowns.lock().unwrap().push(self.config.name.clone());
        }
    }

    fn plugin(name: &str, priority: i32, log: &Arc<Mutex<Vec<String>>>) -> PluginRef {
        let config = PluginConfig::new(name, "test")
            .with_priority(priority)
            .with_hooks([HookType::TOOL_PRE_INVOKE]);
        PluginRef::new(Arc::new(Named {
            config: Arc::new(config),
            shutdowns: log.clone(),
        }))
    }

    #[test]
    fn test_hook_list_sorted_and_stable() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginInstanceRegistry::new();
        registry.register(plugin("c", 20, &log)).unwrap();
        registry.register(plugin("a", 10, &log)).unwrap();
        registry.register(plugin("b", 20, &log)).unwrap();

        let names: Vec<String> = registry
            .get_plugins_for_hook(&HookType::TOOL_PRE_INVOKE)
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, ["a", "c", "b"]);
        assert!(registry
            .get_plugins_for_hook(&HookType::PROMPT_PRE_FETCH)
            .is_empty());
    }

    #[test]
    fn test_cache_invalidated_on_change() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginInstanceRegistry::new();
        registry.register(plugin("a", 1, &log)).unwrap();
        assert_eq!(registry.get_plugins_for_hook(&HookType::TOOL_PRE_INVOKE).len(), 1);
        registry.register(plugin("b", 2, &log)).unwrap();
        assert_eq!(registry.get_plugins_for_hook(&HookType::TOOL_PRE_INVOKE).len(), 2);
        assert!(registry.unregister("A").is_some());
        assert_eq!(registry.get_plugins_for_hook(&HookType::TOOL_PRE_INVOKE).len(), 1);
    }

    #[test]
    fn test_cache_matches_registry_after_concurrent_writes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(PluginInstanceRegistry::new());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        registry.get_plugins_for_hook(&HookType::TOOL_PRE_INVOKE);
                    }
                })
            })
            .collect();
        for i in 0..50 {
            registry
                .register(plugin(&format!("p{i}"), i, &log))
                .unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(
            registry.get_plugins_for_hook(&HookType::TOOL_PRE_INVOKE).len(),
            50
        );
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginInstanceRegistry::new();
        registry.register(plugin("a", 1, &log)).unwrap();
        assert!(registry.register(plugin("A", 2, &log)).is_err());
        assert!(registry.get_plugin("a").is_some());
    }

    #[tokio::test]
    async fn test_shutdown_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginInstanceRegistry::new();
        registry.register(plugin("first", 1, &log)).unwrap();
        registry.register(plugin("second", 2, &log)).unwrap();
        registry.shutdown().await;
        assert_eq!(*log.lock().unwrap(), ["second", "first"]);
        assert_eq!(registry.plugin_count(), 0);
    }
}
