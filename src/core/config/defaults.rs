use crate::core::config::data::BridgeSettings;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Bound on one MCP `initialize` handshake, per transport attempt.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

const SETTINGS_FILE_NAME: &str = "config.toml";
const SERVERS_FILE_NAME: &str = "servers.json";

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            hub_url: None,
            client_id: format!("toolbridge-{}", std::process::id()),
            auto_reconnect: true,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl BridgeSettings {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "toolbridge", "toolbridge")
}

/// Directory holding `config.toml` and `servers.json`.
///
/// Falls back to the working directory when the platform reports no home.
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn settings_path() -> PathBuf {
    config_dir().join(SETTINGS_FILE_NAME)
}

pub fn default_servers_path() -> PathBuf {
    config_dir().join(SERVERS_FILE_NAME)
}
