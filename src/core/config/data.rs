use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// How a server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// In-process reference server, no external executable.
    Builtin,
    /// Subprocess speaking newline-delimited JSON-RPC on stdin/stdout.
    Stdio,
    /// HTTP endpoint; streamable HTTP first, legacy SSE as fallback.
    Http,
    #[serde(alias = "streamable-http", alias = "streamable_http")]
    StreamableHttp,
    /// Legacy HTTP+SSE endpoint.
    Sse,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Stdio => "stdio",
            Self::Http => "http",
            Self::StreamableHttp => "streamableHttp",
            Self::Sse => "sse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuiltinKind {
    Filesystem,
}

/// A persisted tool-server entry.
///
/// `url` is a legacy alias of `base_url`. Both are kept mirrored on load and
/// save so older readers of the file keep working.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "transport", skip_serializing_if = "Option::is_none")]
    pub transport_kind: Option<TransportKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builtin_type: Option<BuiltinKind>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub auto_connect: bool,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl ServerConfig {
    fn empty(id: &str, kind: TransportKind) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            transport_kind: Some(kind),
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            base_url: None,
            url: None,
            headers: BTreeMap::new(),
            builtin_type: None,
            allowed_paths: Vec::new(),
            read_only: false,
            auto_connect: false,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn builtin_filesystem(id: &str, allowed_paths: Vec<String>, read_only: bool) -> Self {
        Self {
            builtin_type: Some(BuiltinKind::Filesystem),
            allowed_paths,
            read_only,
            ..Self::empty(id, TransportKind::Builtin)
        }
    }

    pub fn stdio(id: &str, command: &str, args: Vec<String>) -> Self {
        Self {
            command: Some(command.to_string()),
            args,
            ..Self::empty(id, TransportKind::Stdio)
        }
    }

    pub fn http(id: &str, kind: TransportKind, base_url: &str) -> Self {
        Self {
            base_url: Some(base_url.to_string()),
            url: Some(base_url.to_string()),
            ..Self::empty(id, kind)
        }
    }

    /// Transport kind, derived from the presence of `command` when the
    /// entry predates the explicit field.
    pub fn transport(&self) -> TransportKind {
        self.transport_kind.unwrap_or_else(|| self.derived_transport())
    }

    fn derived_transport(&self) -> TransportKind {
        if self.command.is_some() {
            TransportKind::Stdio
        } else if self.builtin_type.is_some() {
            TransportKind::Builtin
        } else {
            TransportKind::Http
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Canonical endpoint for the HTTP family.
    pub fn endpoint(&self) -> Option<&str> {
        self.base_url.as_deref().or(self.url.as_deref())
    }

    /// Fills defaults and mirrors the legacy `url` alias.
    pub fn normalize(&mut self, now_millis: i64) {
        self.id = self.id.trim().to_string();
        if self.transport_kind.is_none() {
            self.transport_kind = Some(self.derived_transport());
        }
        self.mirror_url_alias();
        if self.transport() == TransportKind::Builtin && self.builtin_type.is_none() {
            self.builtin_type = Some(BuiltinKind::Filesystem);
        }
        if self.created_at.is_none() {
            self.created_at = Some(now_millis);
        }
        if self.updated_at.is_none() {
            self.updated_at = self.created_at;
        }
    }

    pub fn mirror_url_alias(&mut self) {
        match (&self.base_url, &self.url) {
            (None, Some(url)) => self.base_url = Some(url.clone()),
            (Some(base), _) => self.url = Some(base.clone()),
            (None, None) => {}
        }
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

/// Application settings (TOML).
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Settings {
    /// Tracing filter used when `RUST_LOG` is unset (e.g. "info", "toolbridge=debug")
    pub log_level: Option<String>,
    /// Overrides the default location of the server list
    pub servers_file: Option<PathBuf>,
    #[serde(default)]
    pub bridge: BridgeSettings,
}

/// Bridge client settings. Durations are milliseconds.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct BridgeSettings {
    pub hub_url: Option<String>,
    pub client_id: String,
    pub auto_reconnect: bool,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}
