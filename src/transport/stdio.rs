use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::stream::LineConnection;
use super::{Connection, Transport, TransportResult, TransportType};
use crate::error::TransportError;

/// Launches a plugin server as a child process and speaks newline-delimited
/// JSON-RPC over its stdin/stdout.
#[derive(Debug, Clone, Default)]
pub struct StdioTransport {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, command: String, args: Vec<String>) -> Self {
        self.command = command;
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> TransportResult<Arc<dyn Connection>> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::ConnectionFailed(format!("Failed to spawn '{}': {}", self.command, e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("Failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::ConnectionFailed("Failed to get stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(command = %command, "{}", line);
                }
            });
        }

        tracing::debug!(command = %self.command, pid = ?child.id(), "Spawned plugin server");
        Ok(Arc::new(LineConnection::new(stdout, stdin).with_child(child)))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Stdio
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_echo_process_round_trip() {
        let transport = StdioTransport::new().with_command("cat".into(), vec![]);
        let connection = transport.connect().await.unwrap();
        connection
            .send(Bytes::from_static(b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}"))
            .await
            .unwrap();
        let line = connection.recv().await.unwrap();
        assert_eq!(&line[..], b"{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}");
        connection.close().await.unwrap();
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_missing_command_fails() {
        let transport = StdioTransport::new().with_command("/nonexistent/plugin-server".into(), vec![]);
        let err = transport.connect().await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
