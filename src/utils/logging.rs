//! Tracing subscriber setup for the binary.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "info";

/// Filter precedence: `RUST_LOG`, then the configured level, then
/// [`DEFAULT_FILTER`].
pub fn build_filter(configured: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        configured
            .and_then(|level| EnvFilter::try_new(level).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    })
}

/// Installs the global subscriber. Output goes to stderr, or is appended to
/// `log_file` when given. Calling this twice is harmless.
pub fn init(configured: Option<&str>, log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = build_filter(configured);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .try_init()
        }
        None => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(err) = installed {
        tracing::debug!(error = %err, "Tracing subscriber already installed");
    }
    Ok(())
}
