use thiserror::Error;

/// Failures surfaced by the connection manager and the bridge.
///
/// `Clone` so one single-flight connection outcome can be handed to every
/// waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum McpError {
    #[error("Unknown MCP server: {0}")]
    ConfigNotFound(String),

    #[error("{}", describe_connect_failure(.primary, .fallback.as_deref()))]
    TransportConnectFailed {
        /// Error from the first (preferred) strategy.
        primary: String,
        /// Error from the last fallback strategy, if one was tried and failed.
        fallback: Option<String>,
    },

    #[error("Hub rejected the connection or timed out: {0}")]
    UnauthorizedOrTimeout(String),

    #[error("Unknown bridge action: {0}")]
    UnknownAction(String),

    #[error("Tool invocation failed: {0}")]
    ToolInvocation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("MCP request failed: {0}")]
    Request(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bridge error: {0}")]
    Bridge(String),
}

fn describe_connect_failure(primary: &str, fallback: Option<&str>) -> String {
    match fallback {
        Some(fallback) => format!("Connection failed: {primary} (fallback also failed: {fallback})"),
        None => format!("Connection failed: {primary}"),
    }
}

impl McpError {
    pub fn connect(primary: impl Into<String>) -> Self {
        McpError::TransportConnectFailed {
            primary: primary.into(),
            fallback: None,
        }
    }
}

impl From<crate::core::config::ConfigError> for McpError {
    fn from(err: crate::core::config::ConfigError) -> Self {
        McpError::Config(err.to_string())
    }
}
