//! Logging setup for the command-line binary.

use crate::error::{LedgerError, Result};
use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise the level follows the verbosity
/// count: warnings only by default, then info, debug and trace. Stdout is
/// left to the snapshot output.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let base_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(base_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| LedgerError::ConfigError(format!("logging already initialised: {e}")))
}
