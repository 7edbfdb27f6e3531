//! Plugin interception core for MCP gateways.
//!
//! Plugins subscribe to hooks (`tool_pre_invoke`, `prompt_post_fetch`, ...)
//! and may inspect, rewrite or block the payload flowing through each hook.
//! The [`plugin::PluginManager`] runs the subscribed plugins as an ordered
//! chain; plugins may live in-process or behind an MCP server
//! ([`external::ExternalPlugin`]).

pub mod builtin;
pub mod commands;
pub mod error;
pub mod external;
pub mod hooks;
pub mod plugin;
pub mod protocol;
pub mod transport;

pub use error::{GatewayError, Result};
pub use hooks::{hook_registry, Hook, HookType};
pub use plugin::{
    Config, GlobalContext, Plugin, PluginConfig, PluginContext, PluginContextTable, PluginManager,
    PluginMode, PluginResult, PluginViolation,
};
