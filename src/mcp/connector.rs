//! Turns a server configuration into a live, initialized client.

use crate::core::config::{ServerConfig, TransportKind};
use crate::mcp::builtin;
use crate::mcp::client::McpClient;
use crate::mcp::error::McpError;
use crate::mcp::transport::{self, Connection, Teardown};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A connected client plus the cleanup that releases its resources.
pub struct ClientEntry {
    pub client: Arc<McpClient>,
    teardown: Teardown,
}

impl ClientEntry {
    pub fn new(client: Arc<McpClient>, teardown: Teardown) -> Self {
        Self { client, teardown }
    }

    /// Closes the protocol session, then runs the teardown even if closing
    /// failed. Returns the first error seen.
    pub async fn close(self) -> Result<(), String> {
        let closed = self.client.close().await;
        let torn_down = (self.teardown)().await;
        closed.and(torn_down)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<ClientEntry, McpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Builtin,
    Stdio,
    StreamableHttp,
    Sse,
}

impl Strategy {
    /// Strategies to try, most preferred first.
    pub fn plan(kind: TransportKind) -> &'static [Strategy] {
        match kind {
            TransportKind::Builtin => &[Strategy::Builtin],
            TransportKind::Stdio => &[Strategy::Stdio],
            TransportKind::Http | TransportKind::StreamableHttp => {
                &[Strategy::StreamableHttp, Strategy::Sse]
            }
            TransportKind::Sse => &[Strategy::Sse],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Builtin => "builtin",
            Strategy::Stdio => "stdio",
            Strategy::StreamableHttp => "streamable-http",
            Strategy::Sse => "sse",
        }
    }

    async fn open(self, config: &ServerConfig) -> Result<Connection, String> {
        match self {
            Strategy::Builtin => builtin::connect(config),
            Strategy::Stdio => transport::stdio::connect(config).await,
            Strategy::StreamableHttp => transport::streamable_http::connect(config),
            Strategy::Sse => transport::sse::connect(config).await,
        }
    }
}

/// Connects through the real transports, falling back along
/// [`Strategy::plan`] and handshaking on each attempt.
pub struct TransportConnector {
    handshake_timeout: Duration,
}

impl TransportConnector {
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    async fn attempt(&self, strategy: Strategy, config: &ServerConfig) -> Result<ClientEntry, String> {
        let Connection {
            transport,
            teardown,
        } = strategy.open(config).await?;
        let client = Arc::new(McpClient::new(&config.id, transport));

        let handshake = tokio::time::timeout(self.handshake_timeout, client.initialize()).await;
        let failure = match handshake {
            Ok(Ok(_)) => return Ok(ClientEntry::new(client, teardown)),
            Ok(Err(err)) => err,
            Err(_) => format!(
                "Initialize handshake timed out after {}ms",
                self.handshake_timeout.as_millis()
            ),
        };
        if let Err(err) = ClientEntry::new(client, teardown).close().await {
            debug!(server_id = %config.id, error = %err, "Cleanup after failed handshake reported an error");
        }
        Err(failure)
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<ClientEntry, McpError> {
        let plan = Strategy::plan(config.transport());
        let mut primary: Option<String> = None;
        let mut last: Option<String> = None;

        for strategy in plan {
            debug!(server_id = %config.id, strategy = strategy.as_str(), "Trying MCP transport");
            match self.attempt(*strategy, config).await {
                Ok(entry) => {
                    if let Some(primary) = &primary {
                        warn!(
                            server_id = %config.id,
                            strategy = strategy.as_str(),
                            primary_error = %primary,
                            "Connected with fallback transport"
                        );
                    } else {
                        info!(server_id = %config.id, strategy = strategy.as_str(), "Connected to MCP server");
                    }
                    return Ok(entry);
                }
                Err(err) => {
                    debug!(server_id = %config.id, strategy = strategy.as_str(), error = %err, "MCP transport failed");
                    if primary.is_none() {
                        primary = Some(err);
                    } else {
                        last = Some(err);
                    }
                }
            }
        }

        Err(McpError::TransportConnectFailed {
            primary: primary.unwrap_or_else(|| "No transport available".to_string()),
            fallback: last,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_family_prefers_streaming_then_sse() {
        assert_eq!(
            Strategy::plan(TransportKind::Http),
            &[Strategy::StreamableHttp, Strategy::Sse]
        );
        assert_eq!(Strategy::plan(TransportKind::Sse), &[Strategy::Sse]);
        assert_eq!(Strategy::plan(TransportKind::Stdio), &[Strategy::Stdio]);
    }

    #[tokio::test]
    async fn single_strategy_failure_has_no_fallback_error() {
        let connector = TransportConnector::new(Duration::from_secs(1));
        let config = ServerConfig::stdio("missing", "toolbridge-definitely-missing-binary", Vec::new());

        let err = connector.connect(&config).await.err().expect("expected failure");
        match err {
            McpError::TransportConnectFailed { primary, fallback } => {
                assert!(primary.contains("Failed to start"));
                assert!(fallback.is_none());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn builtin_connects_without_a_process() {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp directory");
        let config = ServerConfig::builtin_filesystem(
            "fs",
            vec![temp_dir.path().to_string_lossy().to_string()],
            true,
        );
        let connector = TransportConnector::new(Duration::from_secs(5));

        let entry = connector.connect(&config).await.expect("builtin connect");
        assert_eq!(
            entry.client.server_details().map(|details| details.server_info.name),
            Some("filesystem".to_string())
        );
        entry.close().await.expect("close");
    }
}
