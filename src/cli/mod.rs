//! Command-line interface parsing and handling
//!
//! Each subcommand maps onto one connection manager operation. Servers are
//! connected on demand and torn down before the process exits.

use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;

use crate::bridge::socket::WebSocketConnector;
use crate::bridge::{BridgeClient, ConnectionState};
use crate::core::config::defaults::{default_servers_path, settings_path, DEFAULT_HANDSHAKE_TIMEOUT_MS};
use crate::core::config::io::load_settings;
use crate::core::config::{ConfigStore, ServerConfig, Settings};
use crate::mcp::connector::TransportConnector;
use crate::mcp::ConnectionManager;
use crate::utils::logging;

#[derive(Parser, Debug)]
#[command(name = "toolbridge", version)]
#[command(about = "Manage MCP tool servers and relay requests from a remote hub")]
#[command(
    long_about = "Toolbridge supervises connections to MCP tool servers (builtin, stdio, \
streamable HTTP and legacy SSE) and can hold a persistent connection to a remote hub \
that issues tool, resource and prompt requests against them.\n\n\
Environment Variables:\n\
  RUST_LOG           Tracing filter (overrides log_level in config.toml)\n\
  TOOLBRIDGE_TOKEN   Bearer token for the hub connection"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Server list (JSON); overrides servers_file in the settings
    #[arg(long, global = true, value_name = "PATH")]
    pub servers: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage configured servers
    Servers {
        #[command(subcommand)]
        action: ServersCommand,
    },
    /// Show connection status for one server or all of them
    Status { id: Option<String> },
    /// Connect to a server
    Connect { id: String },
    /// Disconnect from a server
    Disconnect { id: String },
    /// Disconnect and reconnect a server
    Restart { id: String },
    /// Stop a server
    Stop { id: String },
    /// Probe a server and report latency
    Check { id: String },
    /// Print the server's reported version
    Version { id: String },
    /// List a server's tools
    Tools { id: String },
    /// List a server's resources
    Resources { id: String },
    /// List a server's prompts
    Prompts { id: String },
    /// Invoke a tool
    Call {
        id: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, value_name = "JSON")]
        args: Option<String>,
    },
    /// Read a resource
    Read { id: String, uri: String },
    /// Fetch a prompt
    Prompt {
        id: String,
        name: String,
        /// Prompt argument, repeatable
        #[arg(short = 'a', long = "arg", value_name = "KEY=VALUE")]
        args: Vec<String>,
    },
    /// Connect to the hub and serve its requests until Ctrl+C
    Bridge {
        /// Hub URL; overrides bridge.hub_url in the settings
        #[arg(long, value_name = "URL")]
        hub_url: Option<String>,
        #[arg(long, env = "TOOLBRIDGE_TOKEN", hide_env_values = true)]
        token: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ServersCommand {
    /// List configured servers
    List,
    /// Add or replace a server from a JSON object
    Upsert {
        #[arg(value_name = "JSON")]
        json: String,
    },
    /// Remove a server
    Remove { id: String },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let settings_file = args.config.clone().unwrap_or_else(settings_path);
    let settings = load_settings(&settings_file)?;
    logging::init(settings.log_level.as_deref(), args.log_file.as_deref())?;

    let servers_file = args
        .servers
        .clone()
        .or_else(|| settings.servers_file.clone())
        .unwrap_or_else(default_servers_path);
    let store = ConfigStore::load(servers_file)?;
    let connector = Arc::new(TransportConnector::new(Duration::from_millis(
        DEFAULT_HANDSHAKE_TIMEOUT_MS,
    )));
    let manager = Arc::new(ConnectionManager::new(store, connector));

    let outcome = run_command(args.command, &manager, &settings).await;

    for (id, err) in manager.shutdown().await {
        warn!(server_id = %id, error = %err, "Server teardown failed");
    }
    outcome
}

async fn run_command(
    command: Commands,
    manager: &Arc<ConnectionManager>,
    settings: &Settings,
) -> Result<(), Box<dyn Error>> {
    match command {
        Commands::Servers { action } => match action {
            ServersCommand::List => {
                print_servers(&manager.list_configs());
                Ok(())
            }
            ServersCommand::Upsert { json } => {
                let config: ServerConfig = serde_json::from_str(&json)
                    .map_err(|err| format!("Invalid server JSON: {err}"))?;
                let id = config.id.clone();
                manager.upsert_config(config)?;
                println!("✅ Saved server: {id}");
                Ok(())
            }
            ServersCommand::Remove { id } => {
                manager.remove_config(&id).await?;
                println!("✅ Removed server: {id}");
                Ok(())
            }
        },
        Commands::Status { id } => match id {
            Some(id) => {
                manager.get_config(&id)?;
                print_json(&manager.status(&id))
            }
            None => print_json(&manager.get_status()),
        },
        Commands::Connect { id } => {
            manager.connect(&id).await?;
            println!("✅ Connected: {id}");
            Ok(())
        }
        Commands::Disconnect { id } => {
            manager.disconnect(&id).await?;
            println!("✅ Disconnected: {id}");
            Ok(())
        }
        Commands::Restart { id } => {
            manager.restart_server(&id).await?;
            println!("✅ Restarted: {id}");
            Ok(())
        }
        Commands::Stop { id } => {
            manager.stop_server(&id).await?;
            println!("✅ Stopped: {id}");
            Ok(())
        }
        Commands::Check { id } => print_json(&manager.check_connectivity(&id).await),
        Commands::Version { id } => {
            match manager.get_server_version(&id).await {
                Some(version) => println!("{version}"),
                None => println!("unknown"),
            }
            Ok(())
        }
        Commands::Tools { id } => print_json(&manager.list_tools(&id).await?),
        Commands::Resources { id } => print_json(&manager.list_resources(&id).await?),
        Commands::Prompts { id } => print_json(&manager.list_prompts(&id).await?),
        Commands::Call { id, tool, args } => {
            let arguments = args.as_deref().map(parse_tool_args).transpose()?;
            print_json(&manager.call_tool(&id, &tool, arguments).await?)
        }
        Commands::Read { id, uri } => print_json(&manager.read_resource(&id, &uri).await?),
        Commands::Prompt { id, name, args } => {
            let arguments = parse_prompt_args(&args)?;
            print_json(&manager.get_prompt(&id, &name, arguments).await?)
        }
        Commands::Bridge { hub_url, token } => {
            run_bridge(manager.clone(), settings, hub_url, token.unwrap_or_default()).await
        }
    }
}

async fn run_bridge(
    manager: Arc<ConnectionManager>,
    settings: &Settings,
    hub_url: Option<String>,
    token: String,
) -> Result<(), Box<dyn Error>> {
    let mut bridge_settings = settings.bridge.clone();
    if hub_url.is_some() {
        bridge_settings.hub_url = hub_url;
    }
    let client_id = bridge_settings.client_id.clone();

    manager.initialize().await;
    let bridge = BridgeClient::new(
        bridge_settings,
        token,
        manager,
        Arc::new(WebSocketConnector),
    )?;

    if let Err(err) = bridge.connect().await {
        if bridge.state() == ConnectionState::Disconnected {
            return Err(err.into());
        }
        warn!(error = %err, "Initial hub connection failed; retrying");
    }
    println!("✅ Bridge running as {client_id}. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    bridge.disconnect();
    Ok(())
}

fn parse_tool_args(raw: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err("Tool arguments must be a JSON object".to_string()),
        Err(err) => Err(format!("Invalid tool arguments: {err}")),
    }
}

fn parse_prompt_args(raw: &[String]) -> Result<HashMap<String, String>, String> {
    raw.iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(key, value)| (key.trim().to_string(), value.to_string()))
                .filter(|(key, _)| !key.is_empty())
                .ok_or_else(|| format!("Prompt arguments must look like KEY=VALUE, got `{pair}`"))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_servers(configs: &[ServerConfig]) {
    if configs.is_empty() {
        println!("No servers configured.");
        return;
    }
    let width = configs.iter().map(|config| config.id.len()).max().unwrap_or(0);
    for config in configs {
        let auto = if config.auto_connect { "  (auto-connect)" } else { "" };
        println!(
            "{:<width$}  {:<14}  {}{}",
            config.id,
            config.transport().as_str(),
            config.display_name(),
            auto,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_call_with_json_arguments() {
        let args = Args::try_parse_from([
            "toolbridge",
            "call",
            "fs",
            "read_file",
            "--args",
            r#"{"path":"a.txt"}"#,
        ])
        .expect("parse");
        match args.command {
            Commands::Call { id, tool, args } => {
                assert_eq!(id, "fs");
                assert_eq!(tool, "read_file");
                let map = parse_tool_args(args.as_deref().expect("args")).expect("object");
                assert_eq!(map["path"], "a.txt");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let args = Args::try_parse_from([
            "toolbridge",
            "servers",
            "list",
            "--servers",
            "/tmp/servers.json",
        ])
        .expect("parse");
        assert_eq!(args.servers, Some(PathBuf::from("/tmp/servers.json")));
        assert!(matches!(
            args.command,
            Commands::Servers {
                action: ServersCommand::List
            }
        ));
    }

    #[test]
    fn tool_arguments_must_be_an_object() {
        assert!(parse_tool_args("[1,2]").is_err());
        assert!(parse_tool_args("{").is_err());
    }

    #[test]
    fn prompt_arguments_split_on_first_equals() {
        let parsed = parse_prompt_args(&["topic=a=b".to_string(), "tone= dry".to_string()])
            .expect("parse");
        assert_eq!(parsed["topic"], "a=b");
        assert_eq!(parsed["tone"], " dry");
        assert!(parse_prompt_args(&["novalue".to_string()]).is_err());
        assert!(parse_prompt_args(&["=x".to_string()]).is_err());
    }
}
