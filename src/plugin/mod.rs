//! Plugin contract, configuration and orchestration.

pub mod base;
pub mod conditions;
pub mod config;
pub mod executor;
pub mod loader;
pub mod manager;
pub mod registry;
pub mod schema;

pub use base::{Plugin, PluginRef};
pub use config::{Config, PluginCondition, PluginConfig, PluginMode};
pub use loader::{ConfigLoader, PluginLoader};
pub use manager::PluginManager;
pub use schema::{
    GlobalContext, PluginContext, PluginContextTable, PluginErrorModel, PluginResult,
    PluginViolation,
};
