//! Logging and tracing initialization for blockvault.
//!
//! Everything the core library emits through `tracing` ends up here. The
//! console gets warnings and errors (everything with `--verbose`) so that
//! progress bars stay readable; a configured log file gets the full stream
//! at the filter level, which is what the one-line error diagnostic points
//! users at.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter, Layer,
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
#[derive(Debug, Default)]
pub struct LogConfig {
    /// Output console logs as JSON (for machine parsing)
    pub json: bool,
    /// Enable verbose logging (sets default level to DEBUG)
    pub verbose: bool,
    /// Append logs to this file as well.
    pub file: Option<PathBuf>,
}

/// Default filter directive when `RUST_LOG` is not set.
fn default_directive(verbose: bool) -> String {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    format!(
        "blockvault={0},blockvault_core={0}",
        level.as_str().to_lowercase()
    )
}

/// Initialize the tracing subscriber with the given configuration.
///
/// Call once, after the configuration is loaded. The level can be
/// overridden at runtime via the `RUST_LOG` environment variable. Fails only
/// if the log file cannot be opened.
pub fn init(config: &LogConfig) -> io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(config.verbose)));

    let console_level = if config.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };

    let file_layer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer);

    if config.json {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(io::stderr)
                    .with_filter(console_level),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(io::stderr)
                    .with_filter(console_level),
            )
            .init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_covers_both_crates() {
        assert_eq!(
            default_directive(false),
            "blockvault=info,blockvault_core=info"
        );
        assert_eq!(
            default_directive(true),
            "blockvault=debug,blockvault_core=debug"
        );
    }
}
