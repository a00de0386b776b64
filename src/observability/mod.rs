//! # Observability
//!
//! Structured logging setup for binaries and tests embedding the client.
//! The library itself only emits `tracing` events; it never installs a
//! global subscriber. Hosts that want one can call [`init_logging`].

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Install a global fmt subscriber filtered by `RUST_LOG` (defaulting to
/// `info`). Returns quietly if a subscriber is already installed, so tests
/// can call it repeatedly.
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    };
    if result.is_err() {
        tracing::debug!("logging already initialized, keeping existing subscriber");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging(LogFormat::Text);
        init_logging(LogFormat::Json);
    }
}
