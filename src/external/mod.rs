//! Plugins that run in another process and are reached over MCP.
//!
//! The server side exposes a plugin manager as MCP tools; the client side,
//! [`ExternalPlugin`], forwards every hook call to such a server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plugin::schema::{PluginContext, PluginErrorModel};

pub mod client;
pub mod handler;
pub mod runtime;
pub mod server;

pub use client::ExternalPlugin;
pub use handler::RpcHandler;
pub use runtime::{InProcessTransport, RunningServer, ServerRuntime};
pub use server::ExternalPluginServer;

/// Tool returning the configuration of every loaded plugin.
pub const GET_PLUGIN_CONFIGS: &str = "get_plugin_configs";
/// Tool returning one plugin's configuration by name.
pub const GET_PLUGIN_CONFIG: &str = "get_plugin_config";
/// Generic hook tool taking the hook identifier as an argument.
pub const INVOKE_HOOK: &str = "invoke_hook";

/// Reply of a hook tool call. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeHookResponse {
    pub plugin_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PluginContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PluginErrorModel>,
}

impl InvokeHookResponse {
    pub fn new(plugin_name: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            ..Default::default()
        }
    }

    pub fn failed(plugin_name: impl Into<String>, error: PluginErrorModel) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            error: Some(error),
            ..Default::default()
        }
    }
}
