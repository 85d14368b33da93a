use crate::core::config::data::{path_display, ServerConfig, Settings};
use std::error::Error as StdError;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// Errors that can occur when loading or saving configuration files.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the file from disk.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The server list is not a valid JSON array of server entries.
    ParseServers {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// The settings file is not valid TOML.
    ParseSettings {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Failed to serialize or write the file.
    Write {
        path: PathBuf,
        message: String,
    },

    /// A server entry the store refuses to hold.
    InvalidServer { message: String },
}

impl ConfigError {
    fn display_path(path: &Path) -> String {
        path_display(path)
    }

    fn write(path: &Path, message: impl fmt::Display) -> Self {
        ConfigError::Write {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "Failed to read {}: {}", Self::display_path(path), source)
            }
            ConfigError::ParseServers { path, source } => {
                write!(
                    f,
                    "Failed to parse server list at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::ParseSettings { path, source } => {
                write!(
                    f,
                    "Failed to parse settings at {}: {}",
                    Self::display_path(path),
                    source
                )
            }
            ConfigError::Write { path, message } => {
                write!(f, "Failed to write {}: {}", Self::display_path(path), message)
            }
            ConfigError::InvalidServer { message } => {
                write!(f, "Invalid server config: {}", message)
            }
        }
    }
}

impl StdError for ConfigError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::ParseServers { source, .. } => Some(source),
            ConfigError::ParseSettings { source, .. } => Some(source),
            ConfigError::Write { .. } | ConfigError::InvalidServer { .. } => None,
        }
    }
}

/// Reads and normalizes the server list. A missing file is an empty list.
pub fn load_servers(path: &Path) -> Result<Vec<ServerConfig>, ConfigError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }
    let mut servers: Vec<ServerConfig> =
        serde_json::from_str(&contents).map_err(|source| ConfigError::ParseServers {
            path: path.to_path_buf(),
            source,
        })?;

    let now = chrono::Utc::now().timestamp_millis();
    for server in &mut servers {
        server.normalize(now);
    }
    Ok(dedupe_servers(servers))
}

/// Drops entries without an id and collapses repeated ids. The last entry
/// for an id wins but keeps the position of the first.
pub(crate) fn dedupe_servers(servers: Vec<ServerConfig>) -> Vec<ServerConfig> {
    let mut unique: Vec<ServerConfig> = Vec::with_capacity(servers.len());
    for server in servers {
        if server.id.is_empty() {
            warn!("Skipping server entry without an id");
            continue;
        }
        match unique.iter_mut().find(|existing| existing.id == server.id) {
            Some(existing) => {
                warn!(
                    server_id = %server.id,
                    "Duplicate server id in server list; keeping the last entry"
                );
                *existing = server;
            }
            None => unique.push(server),
        }
    }
    unique
}

/// Writes the server list through a temp file in the same directory so a
/// crash mid-write leaves the previous file intact.
pub fn save_servers(path: &Path, servers: &[ServerConfig]) -> Result<(), ConfigError> {
    let mirrored: Vec<ServerConfig> = servers
        .iter()
        .cloned()
        .map(|mut server| {
            server.mirror_url_alias();
            server
        })
        .collect();
    let contents =
        serde_json::to_string_pretty(&mirrored).map_err(|err| ConfigError::write(path, err))?;
    write_atomically(path, contents.as_bytes())
}

pub fn load_settings(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::ParseSettings {
        path: path.to_path_buf(),
        source,
    })
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let contents = toml::to_string_pretty(settings).map_err(|err| ConfigError::write(path, err))?;
    write_atomically(path, contents.as_bytes())
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<(), ConfigError> {
    let parent = path.parent().filter(|dir| !dir.as_os_str().is_empty());

    if let Some(dir) = parent {
        fs::create_dir_all(dir).map_err(|err| ConfigError::write(path, err))?;
    }

    let mut temp_file = match parent {
        Some(dir) => NamedTempFile::new_in(dir),
        None => NamedTempFile::new(),
    }
    .map_err(|err| ConfigError::write(path, err))?;

    temp_file
        .write_all(contents)
        .map_err(|err| ConfigError::write(path, err))?;
    temp_file
        .as_file_mut()
        .sync_all()
        .map_err(|err| ConfigError::write(path, err))?;
    temp_file
        .persist(path)
        .map_err(|err| ConfigError::write(path, err.error))?;
    Ok(())
}
