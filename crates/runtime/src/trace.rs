//! Tracing setup helpers for embedding binaries.
//!
//! The runtime itself only emits `tracing` events; installing a subscriber
//! is the caller's job. `MCPORTER_LOG_LEVEL` (`debug|info|warn|error`,
//! default `warn`) controls the filter unless `RUST_LOG` overrides it.

use tracing_subscriber::EnvFilter;

/// Environment variable selecting the log level.
pub const LOG_LEVEL_ENV: &str = "MCPORTER_LOG_LEVEL";

/// Build the filter from `RUST_LOG` (if set) or `MCPORTER_LOG_LEVEL`.
pub fn env_filter() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_default();
    match level.as_str() {
        "debug" | "info" | "warn" | "error" => EnvFilter::new(level),
        _ => EnvFilter::new("warn"),
    }
}

/// Install a formatted subscriber on stderr. Call once from `main`.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_is_warn() {
        // Only meaningful when neither env var is set, which holds in CI.
        if std::env::var("RUST_LOG").is_err() && std::env::var(LOG_LEVEL_ENV).is_err() {
            assert_eq!(env_filter().to_string(), "warn");
        }
    }
}
