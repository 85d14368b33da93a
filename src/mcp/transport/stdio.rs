use super::stream::StreamTransport;
use super::Connection;
use crate::core::config::ServerConfig;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Spawns the configured command and speaks JSON-RPC over its stdio.
///
/// The child is killed by the returned teardown, and also when the handle is
/// dropped without one.
pub async fn connect(config: &ServerConfig) -> Result<Connection, String> {
    let command = config
        .command
        .as_deref()
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .ok_or_else(|| "Stdio MCP server requires a command.".to_string())?;

    debug!(server_id = %config.id, command = %command, args = ?config.args, "Starting MCP stdio server");
    let mut cmd = Command::new(command);
    cmd.args(&config.args)
        .envs(&config.env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|err| format!("Failed to start `{command}`: {err}"))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| "Unable to retrieve stdin.".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Unable to retrieve stdout.".to_string())?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| "Unable to retrieve stderr.".to_string())?;

    spawn_stderr_drain(config.id.clone(), stderr);
    let transport = StreamTransport::spawn(&config.id, stdout, stdin);

    let child = Arc::new(Mutex::new(Some(child)));
    let server_id = config.id.clone();
    Ok(Connection {
        transport,
        teardown: Box::new(move || Box::pin(async move { kill_child(&server_id, &child).await })),
    })
}

async fn kill_child(server_id: &str, child: &Mutex<Option<Child>>) -> Result<(), String> {
    let Some(mut child) = child.lock().await.take() else {
        return Ok(());
    };
    if let Ok(Some(status)) = child.try_wait() {
        debug!(server_id = %server_id, status = %status, "MCP stdio server already exited");
        return Ok(());
    }
    child.kill().await.map_err(|err| {
        warn!(server_id = %server_id, error = %err, "Failed to stop MCP stdio server");
        err.to_string()
    })
}

fn spawn_stderr_drain(server_id: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!(server_id = %server_id, line = %line, "MCP stdio server stderr");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_command_is_rejected_before_spawning() {
        let mut config = ServerConfig::stdio("blank", "  ", Vec::new());
        let err = connect(&config).await.err().expect("expected error");
        assert!(err.contains("requires a command"));

        config.command = None;
        assert!(connect(&config).await.is_err());
    }

    #[tokio::test]
    async fn unknown_executable_reports_spawn_failure() {
        let config = ServerConfig::stdio("nope", "toolbridge-definitely-missing-binary", Vec::new());
        let err = connect(&config).await.err().expect("expected error");
        assert!(err.contains("Failed to start"));
    }
}
