//! # Logging
//!
//! The runtime emits `tracing` events at its lifecycle points (worker
//! start/stop/break, dispatch refusals, reclamation, deadlock refusals,
//! shutdown). Nothing is printed unless a subscriber is installed; embedding
//! applications may install their own or call [`init_logging`].
//!
//! `RUST_LOG` takes precedence over [`LogConfig::level`].

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

/// Build the filter used by [`init_logging`].
///
/// `RUST_LOG` wins when set and valid; otherwise the configured level
/// applies to every target.
pub fn env_filter(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install a formatted stderr subscriber for the runtime's events.
///
/// Returns false if a global subscriber was already installed, in which
/// case the existing one keeps receiving events.
pub fn init_logging(config: &LogConfig) -> bool {
    if config.level == LogLevel::Off && std::env::var_os("RUST_LOG").is_none() {
        return false;
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_thread_names(config.thread_names)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}
