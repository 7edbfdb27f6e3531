use std::io;
use thiserror::Error;

use crate::plugin::schema::{PluginErrorModel, PluginViolation};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Hook error: {0}")]
    Hook(#[from] HookError),

    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Plugin violation: {0}")]
    Violation(#[from] PluginViolationError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),

    #[error("File not found: {0}")]
    FileNotFound(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Remote returned JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Transport closed")]
    Closed,

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("Hook type '{0}' is not registered")]
    NotRegistered(String),

    #[error("Hook type '{hook}' already registered with {existing}, refusing {requested}")]
    Conflict {
        hook: String,
        existing: String,
        requested: String,
    },

    #[error("Hook type '{hook}' is bound to {expected}, not {requested}")]
    TypeMismatch {
        hook: String,
        expected: String,
        requested: String,
    },

    #[error("Failed to decode data for hook '{hook}': {source}")]
    Decode {
        hook: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Infrastructure failures of a plugin. Local and remote plugins both
/// surface their failures through this type.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("{}", .error.message)]
    Plugin { error: PluginErrorModel },

    #[error("Plugin '{plugin_name}' timed out after {timeout_ms}ms")]
    Timeout { plugin_name: String, timeout_ms: u64 },

    #[error("Plugin '{plugin_name}' transport failure: {source}")]
    Transport {
        plugin_name: String,
        #[source]
        source: TransportError,
    },

    #[error("Plugin '{name}' not found")]
    NotFound { name: String },

    #[error(transparent)]
    Hook(#[from] HookError),
}

impl PluginError {
    pub fn new(plugin_name: impl Into<String>, message: impl Into<String>) -> Self {
        PluginError::Plugin {
            error: PluginErrorModel::new(plugin_name, message),
        }
    }

    /// Name of the plugin that failed, when one is known.
    pub fn plugin_name(&self) -> Option<&str> {
        match self {
            PluginError::Plugin { error } => Some(error.plugin_name.as_str()),
            PluginError::Timeout { plugin_name, .. }
            | PluginError::Transport { plugin_name, .. } => Some(plugin_name.as_str()),
            PluginError::NotFound { name } => Some(name.as_str()),
            PluginError::Hook(_) => None,
        }
    }

    /// Flattens the error into its wire form.
    pub fn to_model(&self, plugin_name: &str) -> PluginErrorModel {
        match self {
            PluginError::Plugin { error } => error.clone(),
            PluginError::Timeout { .. } => {
                PluginErrorModel::new(plugin_name, self.to_string()).with_code("PLUGIN_TIMEOUT")
            }
            PluginError::Transport { .. } => {
                PluginErrorModel::new(plugin_name, self.to_string()).with_code("TRANSPORT_ERROR")
            }
            PluginError::NotFound { .. } => {
                PluginErrorModel::new(plugin_name, self.to_string()).with_code("PLUGIN_NOT_FOUND")
            }
            PluginError::Hook(_) => {
                PluginErrorModel::new(plugin_name, self.to_string()).with_code("HOOK_ERROR")
            }
        }
    }
}

/// An enforce-mode violation raised as an error because the caller asked for
/// `violations_as_exceptions`.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct PluginViolationError {
    pub message: String,
    pub violation: PluginViolation,
}

impl PluginViolationError {
    pub fn new(violation: PluginViolation) -> Self {
        Self {
            message: format!(
                "{} blocked by plugin '{}': {}",
                violation.code, violation.plugin_name, violation.reason
            ),
            violation,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
