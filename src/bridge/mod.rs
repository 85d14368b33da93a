//! Persistent client connection to the remote hub.
//!
//! The hub sends `request` envelopes naming one of [`message::ACTIONS`];
//! each is answered with exactly one `response` or `error` envelope carrying
//! the request id. A dropped socket is reopened on a fixed interval until
//! `max_reconnect_attempts` consecutive attempts have failed.

pub mod dispatch;
pub mod message;
pub mod socket;


use crate::core::config::BridgeSettings;
use crate::mcp::error::McpError;
use crate::mcp::ConnectionManager;
use crate::utils::url::{hub_url_with_token, parse_hub_url, redact_token};
use message::{BridgeMessage, BridgeRequest, MessageType};
use serde::Serialize;
use socket::{HubChannel, HubConnector};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

pub struct BridgeClient {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    settings: BridgeSettings,
    hub_url: Url,
    token: RwLock<String>,
    manager: Arc<ConnectionManager>,
    connector: Arc<dyn HubConnector>,
    state_tx: watch::Sender<ConnectionState>,
    runtime: Mutex<BridgeRuntime>,
}

#[derive(Default)]
struct BridgeRuntime {
    reconnect_attempts: u32,
    manual_disconnect: bool,
    session_seq: u64,
    session: Option<ActiveSession>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BridgeClient {
    pub fn new(
        settings: BridgeSettings,
        token: impl Into<String>,
        manager: Arc<ConnectionManager>,
        connector: Arc<dyn HubConnector>,
    ) -> Result<Self, McpError> {
        let raw = settings
            .hub_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| McpError::Config("bridge.hub_url is not set".to_string()))?;
        let hub_url = parse_hub_url(raw).map_err(McpError::Config)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(BridgeInner {
                settings,
                hub_url,
                token: RwLock::new(token.into()),
                manager,
                connector,
                state_tx,
                runtime: Mutex::new(BridgeRuntime::default()),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.runtime).reconnect_attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        lock(&self.inner.runtime)
            .reconnect_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Opens the hub socket. A no-op while connected or connecting; while a
    /// reconnect is scheduled, the timer is dropped and the attempt counter
    /// starts over.
    pub async fn connect(&self) -> Result<(), McpError> {
        {
            let mut runtime = lock(&self.inner.runtime);
            match self.state() {
                ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
                ConnectionState::Reconnecting | ConnectionState::Disconnected => {}
            }
            if let Some(task) = runtime.reconnect_task.take() {
                task.abort();
            }
            runtime.reconnect_attempts = 0;
            runtime.manual_disconnect = false;
            self.inner.set_state(ConnectionState::Connecting);
        }
        self.inner.clone().open_session().await
    }

    /// Closes the socket and cancels heartbeat and reconnect timers.
    pub fn disconnect(&self) {
        let mut runtime = lock(&self.inner.runtime);
        runtime.manual_disconnect = true;
        runtime.reconnect_attempts = 0;
        if let Some(task) = runtime.reconnect_task.take() {
            task.abort();
        }
        if let Some(session) = runtime.session.take() {
            session.cancel.cancel();
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Used by the next socket open; the current socket is left alone.
    pub fn update_token(&self, token: impl Into<String>) {
        *self
            .inner
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token.into();
    }
}

impl BridgeInner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = ?previous, to = ?state, "Bridge state changed");
        }
    }

    fn session_url(&self) -> Url {
        let token = self.token.read().unwrap_or_else(PoisonError::into_inner);
        hub_url_with_token(&self.hub_url, &token)
    }

    async fn open_session(self: Arc<Self>) -> Result<(), McpError> {
        let url = self.session_url();
        debug!(url = %redact_token(&url), "Opening hub socket");

        let timeout = self.settings.connect_timeout();
        let opened = match time::timeout(timeout, self.connector.open(&url)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::UnauthorizedOrTimeout(format!(
                "no answer within {}ms",
                timeout.as_millis()
            ))),
        };

        match opened {
            Ok(channel) => self.on_open(channel),
            Err(err) => {
                warn!(error = %err, "Hub connection failed");
                let mut runtime = lock(&self.runtime);
                self.schedule_reconnect(&mut runtime);
                Err(err)
            }
        }
    }

    fn on_open(self: &Arc<Self>, channel: HubChannel) -> Result<(), McpError> {
        let HubChannel { outbound, inbound } = channel;
        let cancel = CancellationToken::new();
        let session_id = {
            let mut runtime = lock(&self.runtime);
            if runtime.manual_disconnect {
                return Err(McpError::Bridge(
                    "Disconnected while the hub socket was opening".to_string(),
                ));
            }
            runtime.session_seq += 1;
            runtime.reconnect_attempts = 0;
            runtime.reconnect_task = None;
            runtime.session = Some(ActiveSession {
                id: runtime.session_seq,
                cancel: cancel.clone(),
            });
            self.set_state(ConnectionState::Connected);
            runtime.session_seq
        };

        let register = BridgeMessage::register(&self.settings.client_id, env!("CARGO_PKG_VERSION"));
        let _ = outbound.send(register.to_json());

        tokio::spawn(heartbeat_loop(
            self.settings.heartbeat_interval(),
            outbound.clone(),
            cancel.clone(),
        ));
        tokio::spawn(self.clone().read_loop(session_id, inbound, outbound, cancel));
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        session_id: u64,
        mut inbound: mpsc::UnboundedReceiver<String>,
        outbound: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                frame = inbound.recv() => match frame {
                    Some(text) => self.handle_frame(&text, &outbound),
                    None => break,
                },
            }
        }
        cancel.cancel();
        self.on_close(session_id);
    }

    fn handle_frame(self: &Arc<Self>, text: &str, outbound: &mpsc::UnboundedSender<String>) {
        let message: BridgeMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Ignoring malformed hub frame");
                return;
            }
        };
        match message.kind {
            MessageType::Request => {
                tokio::spawn(self.clone().answer(message, outbound.clone()));
            }
            MessageType::Heartbeat => {}
            other => debug!(kind = ?other, id = %message.id, "Ignoring hub frame"),
        }
    }

    /// Sends exactly one `response` or `error` for `message`.
    async fn answer(self: Arc<Self>, message: BridgeMessage, outbound: mpsc::UnboundedSender<String>) {
        let reply = match BridgeRequest::decode(&message) {
            Ok(request) => {
                let action = message.action.as_deref().unwrap_or_default();
                debug!(id = %message.id, action, "Handling hub request");
                match self.run_request(request).await {
                    Ok(payload) => BridgeMessage::response(&message.id, payload),
                    Err(err) => {
                        warn!(id = %message.id, action, error = %err, "Hub request failed");
                        BridgeMessage::error(&message.id, err.to_string())
                    }
                }
            }
            Err(err) => BridgeMessage::error(&message.id, err.to_string()),
        };
        if outbound.send(reply.to_json()).is_err() {
            debug!(id = %message.id, "Hub socket closed before the reply was sent");
        }
    }

    /// Runs the request on its own task so a panic or a timeout still
    /// produces an error reply. Timing out aborts the task.
    async fn run_request(&self, request: BridgeRequest) -> Result<serde_json::Value, McpError> {
        let manager = self.manager.clone();
        let mut task = tokio::spawn(async move { dispatch::dispatch(&manager, request).await });
        let limit = self.settings.request_timeout();
        match time::timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(McpError::Bridge(format!("Request handler failed: {join_err}"))),
            Err(_) => {
                task.abort();
                Err(McpError::Bridge(format!(
                    "Request timed out after {}ms",
                    limit.as_millis()
                )))
            }
        }
    }

    fn on_close(self: &Arc<Self>, session_id: u64) {
        let mut runtime = lock(&self.runtime);
        if runtime.session.as_ref().map(|session| session.id) != Some(session_id) {
            return;
        }
        runtime.session = None;
        info!("Hub socket closed");
        self.schedule_reconnect(&mut runtime);
    }

    /// Called after a close or a failed open.
    fn schedule_reconnect(self: &Arc<Self>, runtime: &mut BridgeRuntime) {
        let settings = &self.settings;
        if runtime.manual_disconnect
            || !settings.auto_reconnect
            || runtime.reconnect_attempts >= settings.max_reconnect_attempts
        {
            if runtime.reconnect_attempts >= settings.max_reconnect_attempts && settings.auto_reconnect {
                warn!(
                    attempts = runtime.reconnect_attempts,
                    "Giving up on the hub after repeated reconnect failures"
                );
            }
            runtime.reconnect_task = None;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        runtime.reconnect_attempts += 1;
        let attempt = runtime.reconnect_attempts;
        let delay = settings.reconnect_interval();
        self.set_state(ConnectionState::Reconnecting);
        info!(attempt, delay_ms = delay.as_millis() as u64, "Scheduling hub reconnect");

        let inner = self.clone();
        runtime.reconnect_task = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            if lock(&inner.runtime).manual_disconnect {
                return;
            }
            let _ = inner.open_session().await;
        }));
    }
}

async fn heartbeat_loop(
    period: std::time::Duration,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                if outbound.send(BridgeMessage::heartbeat().to_json()).is_err() {
                    return;
                }
            }
        }
    }
}
