//! Logging utilities for db_mirror
//!
//! This module provides logging setup and configuration.

use std::fs::File;
use std::path::Path;
use tracing::Level;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Parse a level name, falling back to INFO
pub fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging based on configuration.
///
/// Without a `[logging]` section, events at INFO and above go to stderr.
/// `RUST_LOG` directives are honored on top of the configured level.
pub fn init_logging(config: &Option<LoggingConfig>) -> Result<()> {
    let (level, json, file, stdout) = match config {
        Some(cfg) => (
            parse_level(&cfg.level),
            cfg.format.eq_ignore_ascii_case("json"),
            cfg.file.as_deref(),
            cfg.stdout,
        ),
        None => (Level::INFO, false, None, false),
    };

    let directive = format!("db_mirror={}", level)
        .parse::<Directive>()
        .map_err(|e| Error::Config(format!("Invalid log level: {}", e)))?;
    let env_filter = EnvFilter::from_default_env().add_directive(directive);
    let builder = fmt::Subscriber::builder().with_env_filter(env_filter);

    let installed = match (file, json) {
        (Some(path), json) => {
            if let Some(parent) = Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = File::create(path)?;
            let builder = builder.with_ansi(false).with_writer(file);
            if json {
                tracing::subscriber::set_global_default(builder.json().finish())
            } else {
                tracing::subscriber::set_global_default(builder.finish())
            }
        }
        (None, true) if stdout => tracing::subscriber::set_global_default(builder.json().finish()),
        (None, false) if stdout => tracing::subscriber::set_global_default(builder.finish()),
        (None, true) => {
            tracing::subscriber::set_global_default(builder.json().with_writer(std::io::stderr).finish())
        }
        (None, false) => tracing::subscriber::set_global_default(builder.with_writer(std::io::stderr).finish()),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("DEBUG", Level::DEBUG)]
    #[case("warning", Level::WARN)]
    #[case("error", Level::ERROR)]
    #[case("verbose", Level::INFO)]
    fn test_parse_level(#[case] raw: &str, #[case] expected: Level) {
        assert_eq!(parse_level(raw), expected);
    }
}
