//! Process-wide tracing setup for the engine binary.
//!
//! Engine events go to a rolling file and, in text mode, to stdout. The lock
//! audit trail under the `guard` target fires on every admission and bundle, so
//! it stays at `warn` unless `guard_audit` is on. `RUST_LOG` overrides both.

use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const GUARD_TARGET: &str = "guard";

/// Filter directives derived from the config.
pub fn filter_directives(config: &AppConfig) -> String {
    let guard_level = if config.guard_audit { "debug" } else { "warn" };
    format!("{},{GUARD_TARGET}={guard_level}", config.log_level)
}

fn file_appender(config: &AppConfig) -> RollingFileAppender {
    match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    }
}

/// Install the global subscriber. Keep the returned guard alive for the life of
/// the process or buffered file output is lost.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender(config));

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(config)));
    let registry = tracing_subscriber::registry().with(filter);

    // Targets are only useful to tell audit lines apart from engine events.
    let show_target = config.guard_audit;
    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(show_target)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(show_target).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_audit_controls_guard_target() {
        let mut config = AppConfig::default();
        assert_eq!(filter_directives(&config), "info,guard=warn");

        config.guard_audit = true;
        config.log_level = "debug".to_string();
        assert_eq!(filter_directives(&config), "debug,guard=debug");
    }

    #[test]
    fn test_directives_parse() {
        let config = AppConfig {
            guard_audit: true,
            ..AppConfig::default()
        };
        assert!(EnvFilter::try_new(filter_directives(&config)).is_ok());
    }
}
