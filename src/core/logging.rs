//! Logging configuration and initialization
//!
//! This module sets up the tracing subscriber for structured logging
//! throughout the application. Output always goes to stderr: on the stdio
//! transport stdout carries JSON-RPC frames.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Normalize a user supplied log level to a tracing filter directive
///
/// Accepts debug, info, warning/warn, error and critical. Anything else
/// falls back to "info". Trailing text after the first word is ignored.
pub fn normalize_level(log_level: &str) -> &'static str {
    let level = log_level
        .split_whitespace()
        .next()
        .unwrap_or("info")
        .to_lowercase();

    match level.as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warning" | "warn" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
}

/// Initialize the logging system with the specified level
///
/// `RUST_LOG` takes precedence over the configured level when set.
pub fn init_logging(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(normalize_level(log_level)));

    // try_init so that a second call (tests, embedding) is harmless
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_level() {
        assert_eq!(normalize_level("WARNING"), "warn");
        assert_eq!(normalize_level("critical"), "error");
        assert_eq!(normalize_level("debug # verbose"), "debug");
        assert_eq!(normalize_level("loud"), "info");
        assert_eq!(normalize_level(""), "info");
    }
}
