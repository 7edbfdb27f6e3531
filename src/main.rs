use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;

use mcp_plugin_gateway::commands;
use mcp_plugin_gateway::external::runtime::shutdown_signal;
use mcp_plugin_gateway::external::{ExternalPluginServer, ServerRuntime};
use mcp_plugin_gateway::plugin::config::ServerTransport;
use mcp_plugin_gateway::plugin::loader::{load_server_settings, ConfigLoader, CONFIG_PATH_ENV};
use mcp_plugin_gateway::plugin::{PluginLoader, PluginManager};

#[derive(Parser, Debug)]
#[command(name = "mcp-plugin-server")]
#[command(about = "Serve gateway plugins to remote MCP gateways", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to the plugin manifest (YAML/JSON/TOML)
    #[arg(short, long, value_name = "FILE", env = CONFIG_PATH_ENV, global = true)]
    config: Option<PathBuf>,

    /// Transport to serve on: stdio, http or sse
    #[arg(long, global = true)]
    transport: Option<ServerTransport>,

    /// Bind host for HTTP transports
    #[arg(long, global = true)]
    host: Option<String>,

    /// Bind port for HTTP transports
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Also write logs to this file
    #[arg(long, value_name = "FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve the configured plugins (default)
    Serve,
    /// Validate the manifest
    Check {
        /// Connect to external plugin servers
        #[arg(long)]
        connect: bool,

        /// Print the effective configuration
        #[arg(long)]
        print: bool,
    },
}

/// Logs go to stderr; stdout carries the stdio transport.
fn init_logging(args: &Args) -> anyhow::Result<Option<WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter, Layer};

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mcp_plugin_gateway={log_level},warp=warn")));

    let stderr_layer = match args.log_format {
        LogFormat::Text => fmt::layer().with_writer(std::io::stderr).boxed(),
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
    };

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            let file_name = path
                .file_name()
                .context("--log-file must name a file")?;
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer).boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(&args)?;

    let path = args
        .config
        .clone()
        .with_context(|| format!("no manifest given; pass --config or set {CONFIG_PATH_ENV}"))?;
    info!("Loading plugin manifest from {}", path.display());
    let config = ConfigLoader::load_config(&path)
        .await
        .with_context(|| format!("failed to load {}", path.display()))?;
    info!("Loaded {} plugin configuration(s)", config.plugins.len());

    match args.command.unwrap_or(Command::Serve) {
        Command::Check { connect, print } => {
            if print {
                println!("{}", commands::render_config(&config)?);
            }
            commands::run_config_check(&config, &PluginLoader::with_builtins(), connect).await?;
            Ok(())
        }
        Command::Serve => {
            let mut settings = load_server_settings(&config)?;
            if let Some(transport) = args.transport {
                settings.transport = Some(transport);
            }
            if let Some(host) = args.host {
                settings.host = host;
            }
            if let Some(port) = args.port {
                settings.port = port;
            }

            let manager = Arc::new(PluginManager::new(config));
            let server = Arc::new(ExternalPluginServer::new(manager));
            let runtime = ServerRuntime::new(server, settings);
            if let Err(e) = runtime.run(shutdown_signal()).await {
                error!("Plugin server failed: {}", e);
                return Err(e.into());
            }
            Ok(())
        }
    }
}
