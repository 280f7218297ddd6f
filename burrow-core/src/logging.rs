use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

/// Initializes the process-wide tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init(level: LogLevel) -> Result<()> {
    let level = match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "burrow={level},burrow_core={level},burrow_protocol={level},russh=warn,rustls=warn,tungstenite=warn"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| Error::config(format!("logging init failed: {}", e)))
}
