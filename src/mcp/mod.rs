pub mod builtin;
pub mod client;
pub mod connector;
pub mod error;
pub mod manager;
pub mod transport;

pub use error::McpError;
pub use manager::{ConnectionManager, ConnectivityReport, ServerStatus, ServerSummary};
