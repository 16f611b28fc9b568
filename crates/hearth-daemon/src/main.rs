//! `hearthd`: the background process of the Hearth integration host.
//!
//! Loads the layered configuration, sets up logging and brings every enabled
//! module up. `SIGHUP` shuts the session down and runs a fresh one against
//! the current registry file; `SIGINT` / `SIGTERM` shut down and exit.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod reload;
mod session;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hearth_config::{Config, LoggingSection};
use hearth_telemetry::{LogConfig, LogFormat};
use tracing::info;

use crate::reload::{Control, Signals};
use crate::session::{Session, SessionSettings};

/// Hearth daemon: discovers and runs integration modules.
#[derive(Parser)]
#[command(name = "hearthd")]
#[command(author, version, about = "Hearth daemon: discovers and runs integration modules")]
struct Args {
    /// Configuration file that overrides every other layer.
    #[arg(short, long, env = "HEARTH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long)]
    verbose: bool,
}

fn log_config(logging: &LoggingSection, verbose: bool) -> LogConfig {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let format = logging.format.parse().unwrap_or_else(|e| {
        eprintln!("{e}; using compact logs");
        LogFormat::Compact
    });
    logging
        .directives
        .iter()
        .fold(LogConfig::new(level).with_format(format), |config, d| {
            config.with_directive(d.clone())
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let resolved = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Err(e) = hearth_telemetry::setup_logging(&log_config(&resolved.config.logging, args.verbose)) {
        eprintln!("Failed to initialize logging: {e}");
    }
    info!(files = ?resolved.loaded_files, home = %resolved.hearth_home.display(), "Configuration loaded");

    let paths = resolved.config.resolve_paths(&resolved.hearth_home);
    let settings = SessionSettings::from_config(&resolved.config, paths)?;
    let mut signals = Signals::install().context("failed to install signal handlers")?;

    loop {
        let session = Session::start(&settings).await;
        let control = signals.next().await;
        info!(?control, "Stopping session");
        session.stop().await;
        if control == Control::Shutdown {
            break;
        }
    }

    info!("hearthd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_from_section() {
        let section = LoggingSection {
            level: "warn".into(),
            format: "json".into(),
            directives: vec!["hearth_modules=trace".into()],
        };
        let config = log_config(&section, false);
        assert_eq!(config.level, "warn");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directives, vec!["hearth_modules=trace"]);

        assert_eq!(log_config(&section, true).level, "debug");
    }

    #[test]
    fn test_unknown_format_falls_back() {
        let section = LoggingSection {
            format: "fancy".into(),
            ..LoggingSection::default()
        };
        assert_eq!(log_config(&section, false).format, LogFormat::Compact);
    }
}
