use tracing::{error, info, warn};

use crate::error::{ConfigError, GatewayError, Result};
use crate::external::ExternalPlugin;
use crate::plugin::config::{Config, PluginMode};
use crate::plugin::loader::PluginLoader;
use crate::plugin::Plugin;

/// Validates a loaded manifest and, with `connect`, reaches every external
/// plugin server to fetch its configuration.
pub async fn run_config_check(config: &Config, loader: &PluginLoader, connect: bool) -> Result<()> {
    info!("Checking {} plugin(s)...", config.plugins.len());

    let mut all_ok = true;
    for plugin in &config.plugins {
        info!(
            "Plugin '{}': kind={} mode={:?} priority={} hooks=[{}]",
            plugin.name,
            plugin.kind,
            plugin.mode,
            plugin.effective_priority(),
            plugin
                .hooks
                .iter()
                .map(|h| h.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        if !loader.is_known(&plugin.kind) {
            error!("  ✗ Unknown plugin kind '{}'", plugin.kind);
            all_ok = false;
            continue;
        }

        if !plugin.is_external() || !connect {
            continue;
        }
        if plugin.mode == PluginMode::Disabled {
            warn!("  ! Disabled, connection test skipped");
            continue;
        }

        match check_external(plugin.clone()).await {
            Ok(hooks) => info!("  ✓ Server reachable, remote hooks: [{}]", hooks),
            Err(e) => {
                error!("  ✗ {}", e);
                all_ok = false;
            }
        }
    }

    if all_ok {
        info!("✓ All checks passed");
        Ok(())
    } else {
        Err(GatewayError::Config(ConfigError::Validation(
            "One or more plugins failed checks".to_string(),
        )))
    }
}

async fn check_external(config: crate::plugin::PluginConfig) -> Result<String> {
    let plugin = ExternalPlugin::new(config)?;
    let remote = plugin.fetch_remote_config().await;
    plugin.shutdown().await;
    let remote = remote?.ok_or_else(|| {
        GatewayError::Config(ConfigError::Validation(format!(
            "Server does not know plugin '{}'",
            plugin.name()
        )))
    })?;
    Ok(remote
        .hooks
        .iter()
        .map(|h| h.as_str())
        .collect::<Vec<_>>()
        .join(", "))
}

/// Renders the effective configuration, after environment substitution and
/// defaults, as YAML.
pub fn render_config(config: &Config) -> Result<String> {
    serde_yaml::to_string(config)
        .map_err(|e| GatewayError::Config(ConfigError::Parse(e.to_string())))
}
