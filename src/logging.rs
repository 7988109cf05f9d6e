//! Logger setup.
//!
//! Diagnostics go to stderr so that stdout carries guest output only.

use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};

/// Start the global logger.
///
/// `verbosity` is the number of `-v` flags; `RUST_LOG` overrides it. Keep the
/// returned handle alive for as long as logging is needed.
pub fn initialize(verbosity: u8) -> Result<LoggerHandle, FlexiLoggerError> {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    Logger::try_with_env_or_str(level)?
        .format(flexi_logger::detailed_format)
        .start()
}
