//! Logging initialisation.
//!
//! The engine logs through `tracing`; embedding programs call
//! [`init_logging`] once to install a subscriber.

use tracing_subscriber::EnvFilter;

use crate::error::{InfraError, Result};

/// Initializes the logging system.
///
/// `RUST_LOG` wins when set; otherwise the level is `debug` if `verbose`
/// and `info` if not. `json` switches to one JSON object per line.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level(verbose)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| InfraError::internal(format!("Failed to initialize logging: {e}")))
}

const fn default_level(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}
