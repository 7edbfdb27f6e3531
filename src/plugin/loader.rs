//! Manifest loading and plugin instantiation.

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, PluginError};
use crate::external::ExternalPlugin;
use crate::hooks::hook_registry;
use crate::plugin::base::Plugin;
use crate::plugin::config::{
    CertRequirement, Config, McpClientTlsConfig, McpServerConfig, McpServerTlsConfig,
    PluginConfig, PluginMode, ServerTransport, EXTERNAL_PLUGIN_KIND,
};

/// Environment variable naming the manifest used by the external server.
pub const CONFIG_PATH_ENV: &str = "PLUGINS_CONFIG_PATH";
const SERVER_ENV_PREFIX: &str = "PLUGINS_SERVER_";
const CLIENT_TLS_ENV_PREFIX: &str = "PLUGINS_CLIENT_MTLS_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Yaml,
    Json,
    Toml,
}

impl ManifestFormat {
    /// Picks the format from the file extension; YAML when unknown.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => ManifestFormat::Json,
            Some("toml") => ManifestFormat::Toml,
            _ => ManifestFormat::Yaml,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads, interpolates, parses and validates a manifest file.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::Parse(format!("Failed to read {}: {e}", path.display()))
            }
        })?;

        let config = Self::load_config_str(&text, ManifestFormat::from_path(path))?;
        info!(
            "Loaded {} plugin configuration(s) from {}",
            config.plugins.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn load_config_str(text: &str, format: ManifestFormat) -> Result<Config, ConfigError> {
        let text = substitute_env_vars(text)?;
        let figment = match format {
            ManifestFormat::Yaml => Figment::from(Yaml::string(&text)),
            ManifestFormat::Json => Figment::from(Json::string(&text)),
            ManifestFormat::Toml => Figment::from(Toml::string(&text)),
        };

        let mut config: Config = figment
            .extract()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::validate(&mut config)?;
        Ok(config)
    }

    /// Validates every plugin entry. Fills client TLS defaults from the
    /// environment for HTTP transports without a `tls` block.
    pub fn validate(config: &mut Config) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for plugin in &mut config.plugins {
            if !names.insert(plugin.name.to_lowercase()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate plugin name '{}'",
                    plugin.name
                )));
            }
            apply_client_tls_env(plugin)?;
            validate_plugin(plugin)?;
        }

        if config.plugin_settings.plugin_timeout == 0 {
            return Err(ConfigError::Validation(
                "plugin_settings.plugin_timeout must be greater than 0".into(),
            ));
        }

        if let Some(server) = &config.server_settings {
            validate_server_tls(server.tls.as_ref())?;
        }
        Ok(())
    }
}

pub fn validate_plugin(plugin: &PluginConfig) -> Result<(), ConfigError> {
    let name = &plugin.name;
    if name.trim().is_empty() {
        return Err(ConfigError::MissingField("plugin name".into()));
    }
    if plugin.kind.trim().is_empty() {
        return Err(ConfigError::MissingField(format!("kind of plugin '{name}'")));
    }

    let registry = hook_registry();
    for hook in &plugin.hooks {
        if !registry.is_registered(hook) {
            return Err(ConfigError::Validation(format!(
                "Plugin '{name}' subscribes to unregistered hook '{hook}'"
            )));
        }
    }

    if plugin.is_external() && plugin.mcp.is_none() {
        return Err(ConfigError::Validation(format!(
            "External plugin '{name}' requires an 'mcp' transport section"
        )));
    }

    let Some(mcp) = &plugin.mcp else {
        return Ok(());
    };

    if mcp.proto.is_http() {
        let url = mcp.url.as_deref().ok_or_else(|| {
            ConfigError::MissingField(format!("mcp.url of plugin '{name}'"))
        })?;
        let parsed = url::Url::parse(url).map_err(|e| {
            ConfigError::Validation(format!("Plugin '{name}' has invalid URL '{url}': {e}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "Plugin '{name}' URL must use http or https"
            )));
        }
    } else {
        if mcp.script.as_deref().map_or(true, |s| s.trim().is_empty()) {
            return Err(ConfigError::MissingField(format!(
                "mcp.script of STDIO plugin '{name}'"
            )));
        }
        if mcp.tls.is_some() {
            return Err(ConfigError::Validation(format!(
                "Plugin '{name}': TLS is only supported on HTTP transports"
            )));
        }
    }

    if let Some(tls) = &mcp.tls {
        validate_client_tls(name, tls)?;
    }
    Ok(())
}

fn validate_client_tls(name: &str, tls: &McpClientTlsConfig) -> Result<(), ConfigError> {
    if tls.keyfile.is_some() && tls.certfile.is_none() {
        return Err(ConfigError::Validation(format!(
            "Plugin '{name}': tls.keyfile requires tls.certfile"
        )));
    }
    for (field, path) in tls.referenced_files() {
        ensure_file(path, &format!("tls.{field} of plugin '{name}'"))?;
    }
    Ok(())
}

fn validate_server_tls(tls: Option<&McpServerTlsConfig>) -> Result<(), ConfigError> {
    let Some(tls) = tls else {
        return Ok(());
    };
    ensure_file(&tls.certfile, "server certfile")?;
    ensure_file(&tls.keyfile, "server keyfile")?;
    match (&tls.ca_bundle, tls.cert_reqs) {
        (Some(ca), _) => ensure_file(ca, "server ca_bundle"),
        (None, CertRequirement::None) => Ok(()),
        (None, _) => Err(ConfigError::Validation(
            "Client certificate verification requires a CA bundle".into(),
        )),
    }
}

fn ensure_file(path: &Path, what: &str) -> Result<(), ConfigError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(ConfigError::FileNotFound(format!(
            "{what}: {}",
            path.display()
        )))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClientTlsEnv {
    ca_bundle: Option<PathBuf>,
    certfile: Option<PathBuf>,
    keyfile: Option<PathBuf>,
    verify: Option<bool>,
    check_hostname: Option<bool>,
}

impl ClientTlsEnv {
    fn is_empty(&self) -> bool {
        self.ca_bundle.is_none()
            && self.certfile.is_none()
            && self.keyfile.is_none()
            && self.verify.is_none()
            && self.check_hostname.is_none()
    }
}

/// Client TLS settings from `PLUGINS_CLIENT_MTLS_*`, if any are set.
pub fn client_tls_from_env() -> Result<Option<McpClientTlsConfig>, ConfigError> {
    let env: ClientTlsEnv = Figment::from(Env::prefixed(CLIENT_TLS_ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::EnvVar(e.to_string()))?;
    if env.is_empty() {
        return Ok(None);
    }
    let defaults = McpClientTlsConfig::default();
    Ok(Some(McpClientTlsConfig {
        certfile: env.certfile,
        keyfile: env.keyfile,
        ca_bundle: env.ca_bundle,
        verify: env.verify.unwrap_or(defaults.verify),
        check_hostname: env.check_hostname.unwrap_or(defaults.check_hostname),
    }))
}

fn apply_client_tls_env(plugin: &mut PluginConfig) -> Result<(), ConfigError> {
    let Some(mcp) = plugin.mcp.as_mut() else {
        return Ok(());
    };
    let uses_https = mcp.url.as_deref().is_some_and(|u| u.starts_with("https://"));
    if mcp.proto.is_http() && uses_https && mcp.tls.is_none() {
        if let Some(tls) = client_tls_from_env()? {
            debug!("Plugin '{}' uses client TLS settings from environment", plugin.name);
            mcp.tls = Some(tls);
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize)]
struct ServerEnv {
    host: Option<String>,
    port: Option<u16>,
    transport: Option<String>,
    ssl_enabled: Option<bool>,
    ssl_keyfile: Option<PathBuf>,
    ssl_certfile: Option<PathBuf>,
    ssl_ca_certs: Option<PathBuf>,
    ssl_cert_reqs: Option<u8>,
}

/// Runtime settings of the external server: manifest `server_settings`
/// overridden by `PLUGINS_SERVER_*` variables.
pub fn load_server_settings(config: &Config) -> Result<McpServerConfig, ConfigError> {
    let env: ServerEnv = Figment::from(Env::prefixed(SERVER_ENV_PREFIX))
        .extract()
        .map_err(|e| ConfigError::EnvVar(e.to_string()))?;
    merge_server_settings(config.server_settings.clone().unwrap_or_default(), env)
}

fn merge_server_settings(
    mut settings: McpServerConfig,
    env: ServerEnv,
) -> Result<McpServerConfig, ConfigError> {
    if let Some(host) = env.host {
        settings.host = host;
    }
    if let Some(port) = env.port {
        settings.port = port;
    }
    if let Some(transport) = env.transport {
        settings.transport = Some(
            transport
                .parse::<ServerTransport>()
                .map_err(ConfigError::EnvVar)?,
        );
    }

    match env.ssl_enabled {
        Some(false) => settings.tls = None,
        Some(true) => {
            let certfile = env
                .ssl_certfile
                .or_else(|| settings.tls.as_ref().map(|t| t.certfile.clone()))
                .ok_or_else(|| ConfigError::MissingField("PLUGINS_SERVER_SSL_CERTFILE".into()))?;
            let keyfile = env
                .ssl_keyfile
                .or_else(|| settings.tls.as_ref().map(|t| t.keyfile.clone()))
                .ok_or_else(|| ConfigError::MissingField("PLUGINS_SERVER_SSL_KEYFILE".into()))?;
            let ca_bundle = env
                .ssl_ca_certs
                .or_else(|| settings.tls.as_ref().and_then(|t| t.ca_bundle.clone()));
            let cert_reqs = match env.ssl_cert_reqs {
                Some(level) => CertRequirement::from_level(level).ok_or_else(|| {
                    ConfigError::EnvVar(format!("PLUGINS_SERVER_SSL_CERT_REQS={level} is not 0, 1 or 2"))
                })?,
                None => settings.tls.as_ref().map(|t| t.cert_reqs).unwrap_or_default(),
            };
            settings.tls = Some(McpServerTlsConfig {
                certfile,
                keyfile,
                ca_bundle,
                cert_reqs,
            });
        }
        None => {}
    }

    validate_server_tls(settings.tls.as_ref())?;
    Ok(settings)
}

/// Replaces `${VAR}` and `${VAR:-default}` references with environment values.
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for cap in re.captures_iter(input) {
        let Some(whole) = cap.get(0) else { continue };
        let var_name = &cap[1];
        let value = match (std::env::var(var_name), cap.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{var_name}' not found"
                )))
            }
        };
        result.push_str(&input[last..whole.start()]);
        result.push_str(&value);
        last = whole.end();
    }
    result.push_str(&input[last..]);
    Ok(result)
}

pub type PluginFactory =
    Arc<dyn Fn(PluginConfig) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync>;

/// Maps a manifest `kind` to a constructor.
#[derive(Clone)]
pub struct PluginLoader {
    factories: HashMap<String, PluginFactory>,
}

impl PluginLoader {
    /// A loader that only knows the `external` kind.
    pub fn new() -> Self {
        let mut loader = Self {
            factories: HashMap::new(),
        };
        loader.register(EXTERNAL_PLUGIN_KIND, |config| {
            Ok(Arc::new(ExternalPlugin::new(config)?) as Arc<dyn Plugin>)
        });
        loader
    }

    /// A loader with the `external` kind and the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut loader = Self::new();
        crate::builtin::register_builtins(&mut loader);
        loader
    }

    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(PluginConfig) -> Result<Arc<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        let kind = kind.into();
        if self.factories.insert(kind.clone(), Arc::new(factory)).is_some() {
            warn!("Plugin kind '{}' registered twice, keeping the latest", kind);
        }
        self
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn is_known(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Constructs and initializes the plugin described by `config`.
    pub async fn load_and_instantiate(
        &self,
        config: &PluginConfig,
    ) -> Result<Arc<dyn Plugin>, PluginError> {
        if config.mode == PluginMode::Disabled {
            return Err(PluginError::new(
                &config.name,
                format!("Plugin '{}' is disabled", config.name),
            ));
        }

        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            PluginError::new(
                &config.name,
                format!("Unknown plugin kind '{}'", config.kind),
            )
        })?;

        let plugin = factory(config.clone())?;
        plugin.initialize().await?;
        debug!("Instantiated plugin '{}' of kind '{}'", config.name, config.kind);
        Ok(plugin)
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_substitute_env_vars() {
        std::env::set_var("LOADER_TEST_HOST", "example.org");
        let out = substitute_env_vars("url: https://${LOADER_TEST_HOST}/mcp").unwrap();
        assert_eq!(out, "url: https://example.org/mcp");

        let out = substitute_env_vars("port: ${LOADER_TEST_UNSET_PORT:-8443}").unwrap();
        assert_eq!(out, "port: 8443");

        let err = substitute_env_vars("${LOADER_TEST_UNSET_NO_DEFAULT}").unwrap_err();
        assert!(matches!(err, ConfigError::EnvVar(_)));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ManifestFormat::from_path(Path::new("a.json")), ManifestFormat::Json);
        assert_eq!(ManifestFormat::from_path(Path::new("a.TOML")), ManifestFormat::Toml);
        assert_eq!(ManifestFormat::from_path(Path::new("a.yml")), ManifestFormat::Yaml);
    }

    #[test]
    fn test_duplicate_names_rejected_case_insensitively() {
        let yaml = r#"
plugins:
  - name: Guard
    kind: builtin.PassthroughPlugin
  - name: guard
    kind: builtin.PassthroughPlugin
"#;
        let err = ConfigLoader::load_config_str(yaml, ManifestFormat::Yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_unknown_hook_rejected() {
        let yaml = r#"
plugins:
  - name: a
    kind: builtin.PassthroughPlugin
    hooks: [tool_pre_explode]
"#;
        assert!(ConfigLoader::load_config_str(yaml, ManifestFormat::Yaml).is_err());
    }

    #[test]
    fn test_stdio_requires_script_and_rejects_tls() {
        let yaml = r#"
plugins:
  - name: a
    kind: external
    mcp:
      proto: STDIO
"#;
        assert!(matches!(
            ConfigLoader::load_config_str(yaml, ManifestFormat::Yaml),
            Err(ConfigError::MissingField(_))
        ));

        let yaml = r#"
plugins:
  - name: a
    kind: external
    mcp:
      proto: STDIO
      script: ./server
      tls:
        verify: false
"#;
        assert!(matches!(
            ConfigLoader::load_config_str(yaml, ManifestFormat::Yaml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_http_requires_valid_url() {
        let yaml = r#"
plugins:
  - name: a
    kind: external
    mcp:
      proto: STREAMABLEHTTP
      url: ftp://example.org/mcp
"#;
        assert!(ConfigLoader::load_config_str(yaml, ManifestFormat::Yaml).is_err());
    }

    #[test]
    fn test_server_settings_from_env_layer() {
        let mut cert = NamedTempFile::new().unwrap();
        writeln!(cert, "cert").unwrap();
        let mut key = NamedTempFile::new().unwrap();
        writeln!(key, "key").unwrap();

        let env = ServerEnv {
            port: Some(9100),
            transport: Some("sse".into()),
            ssl_enabled: Some(true),
            ssl_certfile: Some(cert.path().to_path_buf()),
            ssl_keyfile: Some(key.path().to_path_buf()),
            ..Default::default()
        };
        let settings = merge_server_settings(McpServerConfig::default(), env).unwrap();
        assert_eq!(settings.port, 9100);
        assert_eq!(settings.transport, Some(ServerTransport::Sse));
        let tls = settings.tls.unwrap();
        assert_eq!(tls.cert_reqs, CertRequirement::None);

        let env = ServerEnv {
            ssl_enabled: Some(true),
            ssl_certfile: Some(cert.path().to_path_buf()),
            ssl_keyfile: Some(key.path().to_path_buf()),
            ssl_cert_reqs: Some(2),
            ..Default::default()
        };
        let err = merge_server_settings(McpServerConfig::default(), env).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = ConfigLoader::load_config("/nonexistent/plugins.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[tokio::test]
    async fn test_loader_rejects_unknown_kind() {
        let loader = PluginLoader::with_builtins();
        let err = loader
            .load_and_instantiate(&PluginConfig::new("x", "builtin.Missing"))
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unknown plugin kind"));
        assert!(loader.is_known(EXTERNAL_PLUGIN_KIND));
    }
}
