//! External plugins end to end: a gateway-side manager talking to a plugin
//! server in process, over HTTP, over SSE, over mutual TLS and over stdio.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use mcp_plugin_gateway::builtin::DENY_LIST_KIND;
use mcp_plugin_gateway::error::{GatewayError, PluginError};
use mcp_plugin_gateway::external::{
    ExternalPlugin, ExternalPluginServer, InProcessTransport, RunningServer, ServerRuntime,
};
use mcp_plugin_gateway::hooks::{
    HookType, PromptPreFetch, PromptPrehookPayload, ToolPostInvoke, ToolPostInvokePayload,
    ToolPreInvoke, ToolPreInvokePayload,
};
use mcp_plugin_gateway::plugin::config::{
    CertRequirement, McpClientConfig, McpClientTlsConfig, McpServerConfig, McpServerTlsConfig,
    ServerTransport, TransportKind, EXTERNAL_PLUGIN_KIND,
};
use mcp_plugin_gateway::plugin::{
    Config, GlobalContext, Plugin, PluginConfig, PluginContext, PluginManager, PluginResult,
};

/// Server-side plugin that marks tool calls and remembers them for the
/// post hook.
struct Stamp {
    config: Arc<PluginConfig>,
}

impl Stamp {
    fn new() -> Self {
        let config = PluginConfig::new("Stamp", "test.Stamp")
            .with_priority(10)
            .with_hooks([HookType::TOOL_PRE_INVOKE, HookType::TOOL_POST_INVOKE]);
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Plugin for Stamp {
    fn config(&self) -> Arc<PluginConfig> {
        self.config.clone()
    }

    async fn tool_pre_invoke(
        &self,
        mut payload: ToolPreInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPreInvokePayload>, PluginError> {
        context.set_state("stamped_tool", json!(payload.name));
        context
            .global_context
            .state
            .insert("stamp_seen".into(), json!(true));
        payload.args.insert("stamped".into(), json!(true));
        Ok(PluginResult::modified(payload).with_metadata("stamp", json!("pre")))
    }

    async fn tool_post_invoke(
        &self,
        _payload: ToolPostInvokePayload,
        context: &mut PluginContext,
    ) -> Result<PluginResult<ToolPostInvokePayload>, PluginError> {
        let tool = context
            .state
            .remove("stamped_tool")
            .unwrap_or(Value::Null);
        context.global_context.state.remove("stamp_seen");
        Ok(PluginResult::pass().with_metadata("stamped_tool", tool))
    }
}

fn server_config() -> Config {
    Config {
        plugins: vec![PluginConfig::new("DenyList", DENY_LIST_KIND)
            .with_hooks([HookType::PROMPT_PRE_FETCH, HookType::TOOL_PRE_INVOKE])
            .with_priority(20)
            .with_config(json!({"words": ["secret"]}))],
        ..Default::default()
    }
}

async fn plugin_server() -> Arc<ExternalPluginServer> {
    let manager = Arc::new(PluginManager::new(server_config()));
    manager.register_plugin(Arc::new(Stamp::new())).await.unwrap();
    let server = Arc::new(ExternalPluginServer::new(manager));
    server.initialize().await.unwrap();
    server
}

fn external(name: &str) -> PluginConfig {
    PluginConfig::new(name, EXTERNAL_PLUGIN_KIND)
}

fn in_process(config: PluginConfig, server: &Arc<ExternalPluginServer>) -> Arc<ExternalPlugin> {
    Arc::new(ExternalPlugin::with_transport(
        config,
        Arc::new(InProcessTransport::new(server.clone())),
    ))
}

async fn gateway_with(plugins: Vec<Arc<ExternalPlugin>>) -> PluginManager {
    let manager = PluginManager::new(Config::default());
    for plugin in plugins {
        manager.register_plugin(plugin).await.unwrap();
    }
    manager
}

fn secret_call() -> ToolPreInvokePayload {
    let mut args = Map::new();
    args.insert("text".into(), json!("the secret plan"));
    ToolPreInvokePayload::new("notes", args)
}

#[tokio::test]
async fn test_remote_config_fills_missing_hooks() {
    let server = plugin_server().await;
    let plugin = in_process(external("denylist").with_priority(1), &server);
    plugin.initialize().await.unwrap();

    let config = plugin.config();
    assert_eq!(
        config.hooks,
        vec![HookType::PROMPT_PRE_FETCH, HookType::TOOL_PRE_INVOKE]
    );
    assert_eq!(config.priority, Some(1));
    assert_eq!(config.config["words"], json!(["secret"]));
    assert!(plugin.is_connected());

    plugin.shutdown().await;
    assert!(!plugin.is_connected());
}

#[tokio::test]
async fn test_unknown_remote_plugin_fails_initialize() {
    let server = plugin_server().await;
    let plugin = in_process(external("Ghost"), &server);
    let err = plugin.initialize().await.unwrap_err();
    assert!(err.to_string().contains("Unable to retrieve configuration"));
}

#[tokio::test]
async fn test_remote_violation_blocks_like_local() {
    let server = plugin_server().await;
    let gateway = gateway_with(vec![in_process(external("DenyList"), &server)]).await;

    let mut global = GlobalContext::new("req-1");
    let (result, _) = gateway
        .invoke_hook::<ToolPreInvoke>(secret_call(), &mut global, None, false)
        .await
        .unwrap();

    assert!(!result.continue_processing);
    let violation = result.violation.unwrap();
    assert_eq!(violation.code, "deny");
    assert_eq!(violation.plugin_name, "DenyList");

    let mut prompt_args = HashMap::new();
    prompt_args.insert("topic".to_string(), "no secrets".to_string());
    let (result, _) = gateway
        .invoke_hook::<PromptPreFetch>(
            PromptPrehookPayload {
                prompt_id: "summary".into(),
                args: prompt_args,
            },
            &mut global,
            None,
            false,
        )
        .await
        .unwrap();
    assert!(!result.continue_processing);
}

#[tokio::test]
async fn test_remote_and_local_results_match() {
    let server = plugin_server().await;
    let gateway = gateway_with(vec![in_process(external("DenyList"), &server)]).await;

    let mut remote_global = GlobalContext::new("req-1");
    let (remote, _) = gateway
        .invoke_hook::<ToolPreInvoke>(secret_call(), &mut remote_global, None, false)
        .await
        .unwrap();

    let mut local_global = GlobalContext::new("req-1");
    let (local, _) = server
        .manager()
        .invoke_hook::<ToolPreInvoke>(secret_call(), &mut local_global, None, false)
        .await
        .unwrap();

    assert_eq!(remote.continue_processing, local.continue_processing);
    assert_eq!(remote.violation, local.violation);
}

#[tokio::test]
async fn test_context_round_trips_through_server() {
    let server = plugin_server().await;
    let gateway = gateway_with(vec![in_process(external("Stamp"), &server)]).await;

    let mut global = GlobalContext::new("req-1");
    let (pre, contexts) = gateway
        .invoke_hook::<ToolPreInvoke>(
            ToolPreInvokePayload::new("calc", Map::new()),
            &mut global,
            None,
            false,
        )
        .await
        .unwrap();

    assert_eq!(pre.modified_payload.unwrap().args["stamped"], json!(true));
    assert_eq!(pre.metadata["stamp"], "pre");
    assert_eq!(global.state.get("stamp_seen"), Some(&json!(true)));
    assert_eq!(
        contexts["Stamp"].get_state("stamped_tool"),
        Some(&json!("calc"))
    );

    let (post, _) = gateway
        .invoke_hook::<ToolPostInvoke>(
            ToolPostInvokePayload::new("calc", json!({"content": []})),
            &mut global,
            Some(&contexts),
            false,
        )
        .await
        .unwrap();
    assert_eq!(post.metadata["stamped_tool"], "calc");
}

#[tokio::test]
async fn test_remote_plugin_can_clear_state() {
    let server = plugin_server().await;
    let remote = in_process(external("Stamp"), &server);
    let local = Stamp::new();

    let mut remote_ctx = PluginContext::new(GlobalContext::new("req-1"));
    let mut local_ctx = PluginContext::new(GlobalContext::new("req-1"));
    let call = ToolPreInvokePayload::new("calc", Map::new());
    remote.tool_pre_invoke(call.clone(), &mut remote_ctx).await.unwrap();
    local.tool_pre_invoke(call, &mut local_ctx).await.unwrap();
    assert_eq!(remote_ctx.state, local_ctx.state);
    assert_eq!(remote_ctx.state.len(), 1);

    let done = ToolPostInvokePayload::new("calc", json!({"content": []}));
    remote.tool_post_invoke(done.clone(), &mut remote_ctx).await.unwrap();
    local.tool_post_invoke(done, &mut local_ctx).await.unwrap();

    assert!(local_ctx.state.is_empty());
    assert!(remote_ctx.state.is_empty());
    assert!(remote_ctx.global_context.state.is_empty());
    assert_eq!(remote_ctx, local_ctx);
}

#[tokio::test]
async fn test_remote_error_carries_code() {
    let server = plugin_server().await;
    let ghost = external("Ghost").with_hooks([HookType::TOOL_PRE_INVOKE]);
    let gateway = gateway_with(vec![in_process(ghost, &server)]).await;

    let mut global = GlobalContext::new("req-1");
    let err = gateway
        .invoke_hook::<ToolPreInvoke>(secret_call(), &mut global, None, false)
        .await
        .unwrap_err();

    match err {
        GatewayError::Plugin(PluginError::Plugin { error }) => {
            assert_eq!(error.code, "PLUGIN_NOT_FOUND");
            assert_eq!(error.plugin_name, "Ghost");
        }
        other => panic!("expected remote plugin error, got {other:?}"),
    }
}

fn http_settings() -> McpServerConfig {
    McpServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        transport: Some(ServerTransport::Http),
        tls: None,
    }
}

async fn start(settings: McpServerConfig) -> RunningServer {
    let runtime = ServerRuntime::new(plugin_server().await, settings);
    runtime.start().await.unwrap()
}

fn remote(name: &str, proto: TransportKind, url: String, tls: Option<McpClientTlsConfig>) -> PluginConfig {
    let mut config = external(name);
    config.mcp = Some(McpClientConfig {
        proto,
        url: Some(url),
        script: None,
        args: Vec::new(),
        env: HashMap::new(),
        cwd: None,
        tls,
    });
    config
}

async fn assert_blocks_secret(plugin: ExternalPlugin) {
    let gateway = PluginManager::new(Config::default());
    gateway.register_plugin(Arc::new(plugin)).await.unwrap();

    let mut global = GlobalContext::new("req-1");
    let (result, _) = gateway
        .invoke_hook::<ToolPreInvoke>(secret_call(), &mut global, None, false)
        .await
        .unwrap();
    assert!(!result.continue_processing);
    assert_eq!(result.violation.unwrap().code, "deny");
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_streamable_http_transport() {
    let running = start(http_settings()).await;
    let url = format!("http://{}/mcp", running.addr);

    let plugin = ExternalPlugin::new(remote("DenyList", TransportKind::StreamableHttp, url, None))
        .unwrap();
    assert_blocks_secret(plugin).await;

    running.shutdown();
    running.wait().await;
}

#[tokio::test]
async fn test_sse_transport() {
    let running = start(http_settings()).await;
    let url = format!("http://{}/sse", running.addr);

    let plugin = ExternalPlugin::new(remote("DenyList", TransportKind::Sse, url, None)).unwrap();
    assert_blocks_secret(plugin).await;

    running.shutdown();
    running.wait().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let running = start(http_settings()).await;
    assert!(running.health_addr.is_none());

    let body: Value = reqwest::get(format!("http://{}/health", running.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"status": "healthy"}));

    running.shutdown();
    running.wait().await;
}

#[tokio::test]
async fn test_unknown_http_session_is_rejected() {
    let running = start(http_settings()).await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/messages?session_id=nope", running.addr))
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    running.shutdown();
    running.wait().await;
}

struct Pki {
    dir: tempfile::TempDir,
}

impl Pki {
    /// A CA with a server certificate for 127.0.0.1 and a client
    /// certificate, all written as PEM files.
    fn generate() -> Self {
        use rcgen::{
            BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair,
        };

        let dir = tempfile::tempdir().unwrap();

        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut server_params =
            CertificateParams::new(vec!["127.0.0.1".to_string(), "localhost".to_string()])
                .unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let server_key = KeyPair::generate().unwrap();
        let server_cert = server_params
            .signed_by(&server_key, &ca_cert, &ca_key)
            .unwrap();

        let mut client_params = CertificateParams::new(vec!["gateway".to_string()]).unwrap();
        client_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let client_key = KeyPair::generate().unwrap();
        let client_cert = client_params
            .signed_by(&client_key, &ca_cert, &ca_key)
            .unwrap();

        let write = |name: &str, pem: String| {
            let mut file = std::fs::File::create(dir.path().join(name)).unwrap();
            file.write_all(pem.as_bytes()).unwrap();
        };
        write("ca.pem", ca_cert.pem());
        write("server.pem", server_cert.pem());
        write("server.key", server_key.serialize_pem());
        write("client.pem", client_cert.pem());
        write("client.key", client_key.serialize_pem());

        Self { dir }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    fn client_tls(&self, with_identity: bool) -> McpClientTlsConfig {
        McpClientTlsConfig {
            certfile: with_identity.then(|| self.path("client.pem")),
            keyfile: with_identity.then(|| self.path("client.key")),
            ca_bundle: Some(self.path("ca.pem")),
            verify: true,
            check_hostname: true,
        }
    }
}

#[tokio::test]
async fn test_mutual_tls_with_health_listener() {
    let pki = Pki::generate();
    let settings = McpServerConfig {
        tls: Some(McpServerTlsConfig {
            certfile: pki.path("server.pem"),
            keyfile: pki.path("server.key"),
            ca_bundle: Some(pki.path("ca.pem")),
            cert_reqs: CertRequirement::Required,
        }),
        ..http_settings()
    };
    let running = start(settings).await;
    let addr: SocketAddr = running.addr;

    let health_addr = running.health_addr.expect("health listener");
    assert_eq!(health_addr.port(), addr.port() + 1000);
    let body: Value = reqwest::get(format!("http://{health_addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");

    let url = format!("https://127.0.0.1:{}/mcp", addr.port());
    let plugin = ExternalPlugin::new(remote(
        "DenyList",
        TransportKind::StreamableHttp,
        url.clone(),
        Some(pki.client_tls(true)),
    ))
    .unwrap();
    assert_blocks_secret(plugin).await;

    let anonymous =
        mcp_plugin_gateway::transport::tls::build_http_client(Some(&pki.client_tls(false)))
            .unwrap();
    let outcome = anonymous
        .post(&url)
        .header("content-type", "application/json")
        .body(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
        .send()
        .await;
    assert!(outcome.is_err(), "server accepted a client without certificate");

    running.shutdown();
    running.wait().await;
}

#[tokio::test]
async fn test_tls_port_in_use_is_an_error() {
    let pki = Pki::generate();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let settings = McpServerConfig {
        port: taken.local_addr().unwrap().port(),
        tls: Some(McpServerTlsConfig {
            certfile: pki.path("server.pem"),
            keyfile: pki.path("server.key"),
            ca_bundle: None,
            cert_reqs: CertRequirement::None,
        }),
        ..http_settings()
    };

    let runtime = ServerRuntime::new(plugin_server().await, settings);
    match runtime.start().await {
        Err(GatewayError::Server(msg)) => assert!(msg.contains("Failed to bind")),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("bound a port that is already in use"),
    }
}

fn write_manifest(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("plugins.yaml");
    std::fs::write(
        &path,
        format!(
            r#"
plugins:
  - name: DenyList
    kind: {DENY_LIST_KIND}
    hooks: [tool_pre_invoke]
    config:
      words: [secret]
"#
        ),
    )
    .unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn test_stdio_plugin_server_process() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path());

    let mut config = external("DenyList");
    config.mcp = Some(McpClientConfig {
        proto: TransportKind::Stdio,
        url: None,
        script: Some(env!("CARGO_BIN_EXE_mcp-plugin-server").to_string()),
        args: vec![
            "--config".into(),
            manifest.display().to_string(),
            "--transport".into(),
            "stdio".into(),
        ],
        env: HashMap::new(),
        cwd: None,
        tls: None,
    });

    let plugin = ExternalPlugin::new(config).unwrap();
    assert_blocks_secret(plugin).await;
}
