//! Plugins shipped with the crate and available by `kind` name.

use std::sync::Arc;

use crate::plugin::base::Plugin;
use crate::plugin::loader::PluginLoader;

pub mod circuit_breaker;
pub mod deny_list;
pub mod passthrough;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPlugin};
pub use deny_list::{DenyListConfig, DenyListPlugin};
pub use passthrough::PassthroughPlugin;

pub const DENY_LIST_KIND: &str = "builtin.DenyListPlugin";
pub const CIRCUIT_BREAKER_KIND: &str = "builtin.CircuitBreakerPlugin";
pub const PASSTHROUGH_KIND: &str = "builtin.PassthroughPlugin";

pub fn register_builtins(loader: &mut PluginLoader) {
    loader
        .register(DENY_LIST_KIND, |config| {
            Ok(Arc::new(DenyListPlugin::new(config)?) as Arc<dyn Plugin>)
        })
        .register(CIRCUIT_BREAKER_KIND, |config| {
            Ok(Arc::new(CircuitBreakerPlugin::new(config)?) as Arc<dyn Plugin>)
        })
        .register(PASSTHROUGH_KIND, |config| {
            Ok(Arc::new(PassthroughPlugin::new(config)) as Arc<dyn Plugin>)
        });
}
