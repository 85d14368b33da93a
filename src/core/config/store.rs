use crate::core::config::data::ServerConfig;
use crate::core::config::io::{dedupe_servers, load_servers, save_servers, ConfigError};
use std::path::PathBuf;

/// Durable list of server configurations.
///
/// Holds no connection state. Every mutation is written through to disk
/// immediately when the store is backed by a file, and only takes effect in
/// memory once that write succeeded.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    servers: Vec<ServerConfig>,
}

impl ConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let servers = load_servers(&path)?;
        Ok(Self {
            path: Some(path),
            servers,
        })
    }

    /// A store that never touches disk.
    pub fn in_memory(servers: Vec<ServerConfig>) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        let servers = servers
            .into_iter()
            .map(|mut server| {
                server.normalize(now);
                server
            })
            .collect();
        Self {
            path: None,
            servers: dedupe_servers(servers),
        }
    }

    pub fn list(&self) -> &[ServerConfig] {
        &self.servers
    }

    pub fn get(&self, id: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Inserts or replaces the entry with the same id and saves.
    ///
    /// `createdAt` of an existing entry is preserved; `updatedAt` is bumped.
    pub fn upsert(&mut self, mut server: ServerConfig) -> Result<(), ConfigError> {
        let now = chrono::Utc::now().timestamp_millis();
        server.normalize(now);
        if server.id.is_empty() {
            return Err(ConfigError::InvalidServer {
                message: "server id must not be empty".to_string(),
            });
        }
        server.updated_at = Some(now);

        let mut candidate = self.servers.clone();
        match candidate.iter_mut().find(|existing| existing.id == server.id) {
            Some(existing) => {
                server.created_at = existing.created_at.or(server.created_at);
                *existing = server;
            }
            None => candidate.push(server),
        }
        self.commit(candidate)
    }

    /// Removes the entry and saves. Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> Result<bool, ConfigError> {
        if !self.contains(id) {
            return Ok(false);
        }
        let candidate = self
            .servers
            .iter()
            .filter(|server| server.id != id)
            .cloned()
            .collect();
        self.commit(candidate)?;
        Ok(true)
    }

    /// Persists `candidate`, then adopts it. A failed write leaves the
    /// in-memory list untouched.
    fn commit(&mut self, candidate: Vec<ServerConfig>) -> Result<(), ConfigError> {
        if let Some(path) = &self.path {
            save_servers(path, &candidate)?;
        }
        self.servers = candidate;
        Ok(())
    }
}
