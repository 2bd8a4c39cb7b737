//! Tracing subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level when it is set.

use tracing_subscriber::EnvFilter;

use crate::config::Settings;

/// Build the filter for `level`, letting `RUST_LOG` override it.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install a stderr `fmt` subscriber at `level`.
///
/// Calling this more than once is harmless; later calls leave the first
/// subscriber in place.
pub fn init(level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Install the subscriber at `settings.application.log_level`.
pub fn init_from_config(settings: &Settings) {
    init(&settings.application.log_level);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    #[serial]
    fn test_configured_level_used_without_rust_log() {
        std::env::remove_var("RUST_LOG");
        assert_eq!(env_filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    #[serial]
    fn test_rust_log_overrides_level() {
        std::env::set_var("RUST_LOG", "rust_scpi=trace");
        let filter = env_filter("warn");
        std::env::remove_var("RUST_LOG");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    #[serial]
    fn test_init_twice_is_harmless() {
        init("info");
        init("debug");
    }
}
