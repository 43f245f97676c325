//! # Logging
//!
//! Structured logging setup for test binaries and the CLI.
//!
//! `RUST_LOG` wins when set; otherwise the level comes from
//! `KUBE_FIXTURES_LOG_LEVEL`. `KUBE_FIXTURES_LOG_FORMAT=json` switches to JSON
//! lines.

use crate::config::FixtureConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// Returns `false` when a subscriber was already installed, so every test may call it.
pub fn init_tracing(config: &FixtureConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config.log_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.log_format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}

fn default_directive(level: &str) -> String {
    let level = match level.to_ascii_lowercase().as_str() {
        "error" => "error",
        "warn" | "warning" => "warn",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    format!("kube_fixtures={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive("DEBUG"), "kube_fixtures=debug");
        assert_eq!(default_directive("warning"), "kube_fixtures=warn");
        assert_eq!(default_directive("bogus"), "kube_fixtures=info");
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = FixtureConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
