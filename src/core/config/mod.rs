pub mod data;
pub mod defaults;
pub mod io;
pub mod store;


pub use data::{BridgeSettings, BuiltinKind, ServerConfig, Settings, TransportKind};
pub use io::ConfigError;
pub use store::ConfigStore;
