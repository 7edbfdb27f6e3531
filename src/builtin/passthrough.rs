use async_trait::async_trait;
use std::sync::Arc;

use crate::plugin::base::Plugin;
use crate::plugin::config::PluginConfig;

/// Subscribes to whatever its config lists and never changes anything.
pub struct PassthroughPlugin {
    config: Arc<PluginConfig>,
}

impl PassthroughPlugin {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Plugin for PassthroughPlugin {
    fn config(&self) -> Arc<PluginConfig> {
        self.config.clone()
    }
}
