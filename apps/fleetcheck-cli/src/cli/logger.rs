//! Logging setup on `tracing-subscriber` layers: an `EnvFilter` layer for
//! `RUST_LOG` support over a configured default level, and a format layer
//! (text or JSON) writing to stdout or a file.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Deserialize, Debug, Clone)]
pub enum LoggerLevel {
    #[serde(alias = "DEBUG", alias = "debug")]
    Debug,
    #[serde(alias = "INFO", alias = "info")]
    Info,
    #[serde(alias = "WARN", alias = "warn")]
    Warn,
    #[serde(alias = "ERROR", alias = "error")]
    Error,
}

impl LoggerLevel {
    pub fn to_tracing_level(&self) -> LevelFilter {
        match self {
            LoggerLevel::Debug => LevelFilter::DEBUG,
            LoggerLevel::Info => LevelFilter::INFO,
            LoggerLevel::Warn => LevelFilter::WARN,
            LoggerLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub enum LogFormat {
    #[serde(alias = "json")]
    Json,
    #[serde(alias = "text")]
    Text,
}

fn default_log_level() -> LoggerLevel {
    LoggerLevel::Info
}

fn default_log_stdout() -> bool {
    false
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Deserialize, Debug, Clone)]
pub struct LoggerSettings {
    #[serde(default = "default_log_level")]
    pub level: LoggerLevel,
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Log file path; default is `fleetcheck.log` in the working
    /// directory. Ignored when `stdout` is set.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_log_stdout(),
            format: default_log_format(),
            log_file: None,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// level when present. Safe to call more than once; later calls are
/// no-ops.
pub fn setup_logging(settings: &LoggerSettings) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(settings.level.to_tracing_level().into()));

    let writer_layer = if settings.stdout {
        match settings.format {
            LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
            LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        }
    } else {
        let path = settings
            .log_file
            .clone()
            .unwrap_or_else(|| PathBuf::from("fleetcheck.log"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let writer = Mutex::new(file);
                match settings.format {
                    LogFormat::Json => tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer)
                        .with_ansi(false)
                        .boxed(),
                    LogFormat::Text => tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .boxed(),
                }
            }
            // Fall back to stderr rather than losing logs entirely.
            Err(_) => tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed(),
        }
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(writer_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_aliases_deserialize() {
        let level: LoggerLevel = serde_yaml::from_str("DEBUG").unwrap();
        assert!(matches!(level, LoggerLevel::Debug));
        let level: LoggerLevel = serde_yaml::from_str("warn").unwrap();
        assert!(matches!(level, LoggerLevel::Warn));
    }

    #[test]
    fn test_defaults() {
        let settings = LoggerSettings::default();
        assert!(!settings.stdout);
        assert_eq!(settings.format, LogFormat::Text);
    }
}
