//! Logging bootstrap
//!
//! The runtime only emits `tracing` events. Hosts that do not install their
//! own subscriber can call [`init_logging`] once at startup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format of the installed subscriber
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_names(true))
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(false))
            .with(filter)
            .try_init(),
    };
    installed.is_ok()
}
