//! Hub wire envelopes and the closed set of requests the hub may issue.

use crate::mcp::error::McpError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Every action the bridge answers. Advertised to the hub on register.
pub const ACTIONS: [&str; 7] = [
    "list_servers",
    "list_tools",
    "list_resources",
    "list_prompts",
    "call_tool",
    "read_resource",
    "get_prompt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Heartbeat,
    Request,
    Response,
    Error,
}

/// One socket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl BridgeMessage {
    fn new(id: String, kind: MessageType) -> Self {
        Self {
            id,
            kind,
            action: None,
            payload: None,
            error: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn fresh_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn register(client_id: &str, version: &str) -> Self {
        Self {
            payload: Some(json!({
                "clientId": client_id,
                "version": version,
                "capabilities": ACTIONS,
            })),
            ..Self::new(Self::fresh_id(), MessageType::Register)
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Self::fresh_id(), MessageType::Heartbeat)
    }

    pub fn request(id: &str, action: &str, payload: Option<Value>) -> Self {
        Self {
            action: Some(action.to_string()),
            payload,
            ..Self::new(id.to_string(), MessageType::Request)
        }
    }

    pub fn response(request_id: &str, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(request_id.to_string(), MessageType::Response)
        }
    }

    pub fn error(request_id: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(request_id.to_string(), MessageType::Error)
        }
    }

    pub fn to_json(&self) -> String {
        // A struct of strings and JSON values always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTarget {
    pub server_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolPayload {
    pub server_id: String,
    #[serde(alias = "toolName")]
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResourcePayload {
    pub server_id: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPromptPayload {
    pub server_id: String,
    #[serde(alias = "promptName")]
    pub name: String,
    #[serde(default)]
    pub arguments: HashMap<String, String>,
}

/// A decoded hub request. Decoding happens once, at the socket boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum BridgeRequest {
    ListServers,
    ListTools(ServerTarget),
    ListResources(ServerTarget),
    ListPrompts(ServerTarget),
    CallTool(CallToolPayload),
    ReadResource(ReadResourcePayload),
    GetPrompt(GetPromptPayload),
}

impl BridgeRequest {
    pub fn decode(message: &BridgeMessage) -> Result<Self, McpError> {
        let action = message
            .action
            .as_deref()
            .ok_or_else(|| McpError::UnknownAction("request has no action".to_string()))?;
        if !ACTIONS.contains(&action) {
            return Err(McpError::UnknownAction(action.to_string()));
        }
        // Unit variant: any payload the hub attaches is ignored.
        if action == "list_servers" {
            return Ok(Self::ListServers);
        }

        let mut tagged = Map::new();
        tagged.insert("action".to_string(), Value::String(action.to_string()));
        if let Some(payload) = message.payload.as_ref().filter(|payload| !payload.is_null()) {
            tagged.insert("payload".to_string(), payload.clone());
        }
        serde_json::from_value(Value::Object(tagged))
            .map_err(|err| McpError::UnknownAction(format!("invalid payload for {action}: {err}")))
    }
}
