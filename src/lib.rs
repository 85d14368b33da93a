//! Toolbridge supervises connections to MCP tool servers and relays requests
//! from a remote coordinating hub into them.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] holds server configuration, settings and their persistence.
//! - [`mcp`] provides the protocol client, transports (builtin, stdio,
//!   streamable HTTP, legacy SSE), the in-process filesystem server and the
//!   [`mcp::ConnectionManager`] that owns every live connection.
//! - [`bridge`] keeps one authenticated, heartbeating socket to the hub and
//!   answers its requests through the connection manager.
//! - [`cli`] exposes the manager operations and the bridge as subcommands.
//!
//! The binary (`src/main.rs`) routes straight into [`crate::cli::main`].

pub mod bridge;
pub mod cli;
pub mod core;
pub mod mcp;
pub mod utils;
