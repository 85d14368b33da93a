//! Owns every live MCP client and the per-server status table.
//!
//! The UI command surface and the hub bridge both call into one
//! `ConnectionManager`. Concurrent `connect` calls for the same server share
//! a single attempt, which runs on its own task so a caller giving up does
//! not abandon a half-open transport.


use crate::core::config::{ConfigStore, ServerConfig, TransportKind};
use crate::mcp::client::McpClient;
use crate::mcp::connector::{ClientEntry, Connector};
use crate::mcp::error::McpError;
use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use rust_mcp_schema::{
    CallToolResult, GetPromptResult, ListPromptsResult, ListResourcesResult, ListToolsResult,
    ReadResourceResult,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

type PendingConnect = Shared<BoxFuture<'static, Result<(), McpError>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub connected: bool,
    pub connecting: bool,
    pub last_connected_at: Option<i64>,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Non-secret view of one configured server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub id: String,
    pub name: String,
    pub transport_kind: TransportKind,
    pub connected: bool,
    pub connecting: bool,
}

pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    store: RwLock<ConfigStore>,
    statuses: Mutex<HashMap<String, ServerStatus>>,
    clients: Mutex<HashMap<String, ClientEntry>>,
    pending: Mutex<HashMap<String, PendingConnect>>,
    connector: Arc<dyn Connector>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl ConnectionManager {
    pub fn new(store: ConfigStore, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store: RwLock::new(store),
                statuses: Mutex::new(HashMap::new()),
                clients: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                connector,
            }),
        }
    }

    pub fn list_configs(&self) -> Vec<ServerConfig> {
        self.inner.read_store().list().to_vec()
    }

    pub fn get_config(&self, id: &str) -> Result<ServerConfig, McpError> {
        self.inner.config(id)
    }

    /// Changes take effect on the next connect or restart.
    pub fn upsert_config(&self, config: ServerConfig) -> Result<(), McpError> {
        let id = config.id.clone();
        self.inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .upsert(config)?;
        debug!(server_id = %id, "Saved MCP server config");
        Ok(())
    }

    pub async fn remove_config(&self, id: &str) -> Result<(), McpError> {
        let removed = self
            .inner
            .store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)?;
        if !removed {
            return Err(McpError::ConfigNotFound(id.to_string()));
        }
        if let Err(err) = self.disconnect(id).await {
            debug!(server_id = %id, error = %err, "Ignoring disconnect failure for removed server");
        }
        lock(&self.inner.statuses).remove(id);
        info!(server_id = %id, "Removed MCP server config");
        Ok(())
    }

    /// One entry per configured server; untouched servers read as disconnected.
    pub fn get_status(&self) -> HashMap<String, ServerStatus> {
        let ids: Vec<String> = self
            .inner
            .read_store()
            .list()
            .iter()
            .map(|config| config.id.clone())
            .collect();
        let statuses = lock(&self.inner.statuses);
        ids.into_iter()
            .map(|id| {
                let status = statuses.get(&id).cloned().unwrap_or_default();
                (id, status)
            })
            .collect()
    }

    pub fn status(&self, id: &str) -> ServerStatus {
        lock(&self.inner.statuses)
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn server_summaries(&self) -> Vec<ServerSummary> {
        let configs = self.list_configs();
        let statuses = lock(&self.inner.statuses);
        configs
            .iter()
            .map(|config| {
                let status = statuses.get(&config.id).cloned().unwrap_or_default();
                ServerSummary {
                    id: config.id.clone(),
                    name: config.display_name().to_string(),
                    transport_kind: config.transport(),
                    connected: status.connected,
                    connecting: status.connecting,
                }
            })
            .collect()
    }

    /// Live client for `id`, if connected. Does not connect.
    pub fn client(&self, id: &str) -> Option<Arc<McpClient>> {
        lock(&self.inner.clients)
            .get(id)
            .map(|entry| entry.client.clone())
    }

    /// Idempotent and single-flight: callers racing on the same id all wait
    /// on one attempt and see the same outcome.
    pub async fn connect(&self, id: &str) -> Result<(), McpError> {
        let config = self.inner.config(id)?;
        let attempt = {
            let mut pending = lock(&self.inner.pending);
            if lock(&self.inner.clients).contains_key(id) {
                return Ok(());
            }
            match pending.get(id) {
                Some(existing) => {
                    debug!(server_id = %id, "Joining in-flight MCP connection");
                    existing.clone()
                }
                None => {
                    self.inner.mark_connecting(id);
                    let inner = self.inner.clone();
                    let task = tokio::spawn(async move { inner.run_connect(config).await });
                    let attempt: BoxFuture<'static, Result<(), McpError>> = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(McpError::connect(format!("Connection task failed: {err}")))
                        })
                    }
                    .boxed();
                    let attempt = attempt.shared();
                    pending.insert(id.to_string(), attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Closes and tears down the client, tolerating errors from either.
    pub async fn disconnect(&self, id: &str) -> Result<(), McpError> {
        let in_flight = lock(&self.inner.pending).get(id).cloned();
        if let Some(in_flight) = in_flight {
            let _ = in_flight.await;
        }

        let entry = lock(&self.inner.clients).remove(id);
        let known = entry.is_some() || self.inner.read_store().contains(id);
        if let Some(entry) = entry {
            if let Err(err) = entry.close().await {
                warn!(server_id = %id, error = %err, "Error while closing MCP server");
            }
            info!(server_id = %id, "Disconnected MCP server");
        }
        if !known {
            return Err(McpError::ConfigNotFound(id.to_string()));
        }

        let mut statuses = lock(&self.inner.statuses);
        let status = statuses.entry(id.to_string()).or_default();
        status.connected = false;
        status.connecting = false;
        Ok(())
    }

    pub async fn restart_server(&self, id: &str) -> Result<(), McpError> {
        self.disconnect(id).await?;
        self.connect(id).await
    }

    pub async fn stop_server(&self, id: &str) -> Result<(), McpError> {
        self.disconnect(id).await
    }

    /// Never fails: problems are reported in the returned value. Latency
    /// covers the liveness round-trip only, not the connect.
    pub async fn check_connectivity(&self, id: &str) -> ConnectivityReport {
        let outcome = async {
            let client = self.ensure_client(id).await?;
            let started = Instant::now();
            client.check_alive().await?;
            Ok::<_, McpError>(started.elapsed())
        }
        .await;
        match outcome {
            Ok(elapsed) => ConnectivityReport {
                ok: true,
                latency_ms: Some(elapsed.as_millis() as u64),
                error: None,
            },
            Err(err) => {
                self.inner.record_error(id, &err);
                ConnectivityReport {
                    ok: false,
                    latency_ms: None,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Best effort; any failure reads as `None`.
    pub async fn get_server_version(&self, id: &str) -> Option<String> {
        match self.ensure_client(id).await {
            Ok(client) => client.server_version(),
            Err(err) => {
                debug!(server_id = %id, error = %err, "Server version unavailable");
                None
            }
        }
    }

    pub async fn list_tools(&self, id: &str) -> Result<ListToolsResult, McpError> {
        let client = self.ensure_client(id).await?;
        self.inner.observe(id, client.list_tools().await)
    }

    pub async fn list_resources(&self, id: &str) -> Result<ListResourcesResult, McpError> {
        let client = self.ensure_client(id).await?;
        self.inner.observe(id, client.list_resources().await)
    }

    pub async fn list_prompts(&self, id: &str) -> Result<ListPromptsResult, McpError> {
        let client = self.ensure_client(id).await?;
        self.inner.observe(id, client.list_prompts().await)
    }

    pub async fn call_tool(
        &self,
        id: &str,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let client = self.ensure_client(id).await?;
        self.inner.observe(id, client.call_tool(name, arguments).await)
    }

    pub async fn read_resource(&self, id: &str, uri: &str) -> Result<ReadResourceResult, McpError> {
        let client = self.ensure_client(id).await?;
        self.inner.observe(id, client.read_resource(uri).await)
    }

    pub async fn get_prompt(
        &self,
        id: &str,
        name: &str,
        arguments: HashMap<String, String>,
    ) -> Result<GetPromptResult, McpError> {
        let client = self.ensure_client(id).await?;
        self.inner.observe(id, client.get_prompt(name, arguments).await)
    }

    /// Connects every `autoConnect` server. Failures are logged and left in
    /// the status table.
    pub async fn initialize(&self) {
        let ids: Vec<String> = self
            .list_configs()
            .into_iter()
            .filter(|config| config.auto_connect)
            .map(|config| config.id)
            .collect();
        let results = join_all(ids.iter().map(|id| self.connect(id))).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(err) = result {
                warn!(server_id = %id, error = %err, "Auto-connect failed");
            }
        }
    }

    /// Tears down every tracked client. One failure never stops the others;
    /// all of them are returned.
    pub async fn shutdown(&self) -> Vec<(String, String)> {
        let in_flight: Vec<PendingConnect> = lock(&self.inner.pending).values().cloned().collect();
        join_all(in_flight).await;

        let entries: Vec<(String, ClientEntry)> = lock(&self.inner.clients).drain().collect();
        let mut failures = Vec::new();
        let closes = entries.into_iter().map(|(id, entry)| async move {
            let result = entry.close().await;
            (id, result)
        });
        for (id, result) in join_all(closes).await {
            let mut statuses = lock(&self.inner.statuses);
            let status = statuses.entry(id.clone()).or_default();
            status.connected = false;
            status.connecting = false;
            drop(statuses);
            if let Err(err) = result {
                warn!(server_id = %id, error = %err, "Error while shutting down MCP server");
                failures.push((id, err));
            }
        }
        info!(failed = failures.len(), "MCP connection manager shut down");
        failures
    }

    async fn ensure_client(&self, id: &str) -> Result<Arc<McpClient>, McpError> {
        self.connect(id).await?;
        self.client(id)
            .ok_or_else(|| McpError::Request(format!("{id} disconnected before the call")))
    }
}

impl ManagerInner {
    fn read_store(&self) -> std::sync::RwLockReadGuard<'_, ConfigStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn config(&self, id: &str) -> Result<ServerConfig, McpError> {
        self.read_store()
            .get(id)
            .cloned()
            .ok_or_else(|| McpError::ConfigNotFound(id.to_string()))
    }

    fn mark_connecting(&self, id: &str) {
        let mut statuses = lock(&self.statuses);
        statuses.entry(id.to_string()).or_default().connecting = true;
    }

    fn record_error(&self, id: &str, err: &McpError) {
        let mut statuses = lock(&self.statuses);
        if let Some(status) = statuses.get_mut(id) {
            status.last_error = Some(err.to_string());
            status.last_error_at = Some(now_millis());
        }
    }

    fn observe<T>(&self, id: &str, result: Result<T, McpError>) -> Result<T, McpError> {
        if let Err(err) = &result {
            self.record_error(id, err);
        }
        result
    }

    /// Body of the spawned connect task. Status is final before it returns.
    async fn run_connect(self: Arc<Self>, config: ServerConfig) -> Result<(), McpError> {
        let id = config.id.clone();
        let outcome = self.connector.connect(&config).await;
        let still_configured = self.read_store().contains(&id);

        let orphan = {
            let mut pending = lock(&self.pending);
            let mut clients = lock(&self.clients);
            let mut statuses = lock(&self.statuses);
            pending.remove(&id);
            let status = statuses.entry(id.clone()).or_default();
            status.connecting = false;

            match outcome {
                Ok(entry) if still_configured => {
                    clients.insert(id.clone(), entry);
                    status.connected = true;
                    status.last_connected_at = Some(now_millis());
                    status.last_error = None;
                    status.last_error_at = None;
                    None
                }
                Ok(entry) => {
                    status.connected = false;
                    Some((entry, McpError::ConfigNotFound(id.clone())))
                }
                Err(err) => {
                    status.connected = false;
                    status.last_error = Some(err.to_string());
                    status.last_error_at = Some(now_millis());
                    warn!(server_id = %id, error = %err, "MCP connection failed");
                    return Err(err);
                }
            }
        };

        match orphan {
            Some((entry, err)) => {
                debug!(server_id = %id, "Config removed during connect; closing new client");
                if let Err(close_err) = entry.close().await {
                    debug!(server_id = %id, error = %close_err, "Error closing orphaned client");
                }
                Err(err)
            }
            None => Ok(()),
        }
    }
}
