//! Manifest schema.
//!
//! A manifest lists plugin entries plus global plugin and server settings:
//!
//! ```yaml
//! plugins:
//!   - name: DenyList
//!     kind: builtin.DenyListPlugin
//!     hooks: [prompt_pre_fetch, tool_pre_invoke]
//!     priority: 10
//!     mode: enforce
//!     conditions:
//!       - server_ids: [prod]
//!     config:
//!       words: [drop table]
//! plugin_settings:
//!   plugin_timeout: 30
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use crate::hooks::HookType;

/// Kind marker for plugins served by another process.
pub const EXTERNAL_PLUGIN_KIND: &str = "external";

pub const DEFAULT_PRIORITY: i32 = 100;
pub const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 8000;
/// Offset of the plain health listener from the TLS port.
pub const HEALTH_PORT_OFFSET: u16 = 1000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,

    #[serde(default)]
    pub plugin_settings: PluginSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_settings: Option<McpServerConfig>,
}

impl Config {
    pub fn find_plugin(&self, name: &str) -> Option<&PluginConfig> {
        self.plugins
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    /// Per-plugin timeout in seconds.
    #[serde(default = "default_plugin_timeout")]
    pub plugin_timeout: u64,

    /// Abort the chain on plugin errors regardless of mode.
    #[serde(default)]
    pub fail_on_plugin_error: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            plugin_timeout: default_plugin_timeout(),
            fail_on_plugin_error: false,
        }
    }
}

fn default_plugin_timeout() -> u64 {
    DEFAULT_PLUGIN_TIMEOUT_SECS
}

/// How a plugin's violations and failures affect the chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginMode {
    /// Violations block; failures abort the chain.
    #[default]
    Enforce,
    /// Violations block; failures are logged and skipped.
    EnforceIgnoreError,
    /// Violations are recorded in metadata; failures are logged and skipped.
    Permissive,
    /// Never invoked.
    Disabled,
}

impl PluginMode {
    pub fn blocks_on_violation(self) -> bool {
        matches!(self, PluginMode::Enforce | PluginMode::EnforceIgnoreError)
    }

    pub fn fails_on_error(self) -> bool {
        matches!(self, PluginMode::Enforce)
    }
}

/// Applicability rule. Every present field must match; absent fields match
/// anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_ids: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_ids: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<HashSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashSet<String>>,
    /// Global state keys exposed to the plugin when this condition matches.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<String>,
    /// Free-form block for plugin sub-policy routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,

    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub hooks: Vec<HookType>,

    #[serde(default)]
    pub mode: PluginMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default)]
    pub conditions: Vec<PluginCondition>,

    #[serde(default)]
    pub config: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp: Option<McpClientConfig>,

    /// Overrides `plugin_settings.plugin_timeout` for this plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl PluginConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            description: None,
            author: None,
            version: None,
            tags: Vec::new(),
            hooks: Vec::new(),
            mode: PluginMode::default(),
            priority: None,
            conditions: Vec::new(),
            config: Value::Null,
            mcp: None,
            timeout_ms: None,
        }
    }

    pub fn with_hooks<I: IntoIterator<Item = HookType>>(mut self, hooks: I) -> Self {
        self.hooks = hooks.into_iter().collect();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_mode(mut self, mode: PluginMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_conditions(mut self, conditions: Vec<PluginCondition>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn is_external(&self) -> bool {
        self.kind == EXTERNAL_PLUGIN_KIND
    }

    pub fn subscribes_to(&self, hook: &HookType) -> bool {
        self.hooks.contains(hook)
    }

    /// Decodes the opaque `config` blob into a plugin specific type.
    pub fn typed_config<T: serde::de::DeserializeOwned + Default>(
        &self,
    ) -> Result<T, serde_json::Error> {
        if self.config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.config.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportKind {
    Stdio,
    Sse,
    #[serde(rename = "STREAMABLEHTTP")]
    StreamableHttp,
}

impl TransportKind {
    pub fn is_http(self) -> bool {
        matches!(self, TransportKind::Sse | TransportKind::StreamableHttp)
    }
}

/// How to reach an external plugin server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientConfig {
    pub proto: TransportKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Executable launched for STDIO transports.
    #[serde(default, alias = "command", skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<McpClientTlsConfig>,
}

fn default_true() -> bool {
    true
}

/// Client side TLS material for HTTP transports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpClientTlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certfile: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub verify: bool,

    #[serde(default = "default_true")]
    pub check_hostname: bool,
}

impl Default for McpClientTlsConfig {
    fn default() -> Self {
        Self {
            certfile: None,
            keyfile: None,
            ca_bundle: None,
            verify: true,
            check_hostname: true,
        }
    }
}

impl McpClientTlsConfig {
    /// Every file path named by this block.
    pub fn referenced_files(&self) -> impl Iterator<Item = (&'static str, &PathBuf)> {
        [
            ("certfile", self.certfile.as_ref()),
            ("keyfile", self.keyfile.as_ref()),
            ("ca_bundle", self.ca_bundle.as_ref()),
        ]
        .into_iter()
        .filter_map(|(field, path)| path.map(|p| (field, p)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerTransport {
    Stdio,
    Http,
    Sse,
}

impl std::str::FromStr for ServerTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdio" => Ok(ServerTransport::Stdio),
            "http" | "streamablehttp" | "streamable-http" => Ok(ServerTransport::Http),
            "sse" => Ok(ServerTransport::Sse),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Client certificate policy of the external server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertRequirement {
    #[default]
    None,
    Optional,
    Required,
}

impl CertRequirement {
    /// Maps the numeric `ssl.CERT_*` style values 0, 1 and 2.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(CertRequirement::None),
            1 => Some(CertRequirement::Optional),
            2 => Some(CertRequirement::Required),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerTlsConfig {
    pub certfile: PathBuf,
    pub keyfile: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<PathBuf>,
    #[serde(default)]
    pub cert_reqs: CertRequirement,
}

/// Runtime settings of the external plugin server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<ServerTransport>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<McpServerTlsConfig>,
}

impl Default for McpServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            transport: None,
            tls: None,
        }
    }
}

impl McpServerConfig {
    /// Port of the plain health listener used while TLS is enabled.
    pub fn health_port(&self) -> Option<u16> {
        self.port.checked_add(HEALTH_PORT_OFFSET)
    }
}

fn default_server_host() -> String {
    DEFAULT_SERVER_HOST.to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}
