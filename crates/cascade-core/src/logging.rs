//! Shared logging initialization for cascade binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

/// Environment variable consulted when no explicit level is given.
pub const LOG_ENV: &str = "CASCADE_LOG";

fn parse_level(raw: &str) -> tracing::Level {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output.
///
/// The level is taken from `level` when given, otherwise from `CASCADE_LOG`,
/// otherwise `info`. Only the first call installs a subscriber; later calls
/// are no-ops. Never returns an error.
pub fn init(level: Option<&str>) {
    if INIT.get().is_some() {
        return;
    }
    let raw = level
        .map(str::to_string)
        .or_else(|| std::env::var(LOG_ENV).ok())
        .unwrap_or_else(|| "info".to_string());
    let _ = tracing_subscriber::fmt()
        .with_max_level(parse_level(&raw))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_known_names() {
        assert_eq!(parse_level("DEBUG"), tracing::Level::DEBUG);
        assert_eq!(parse_level("warning"), tracing::Level::WARN);
        assert_eq!(parse_level("trace"), tracing::Level::TRACE);
    }

    #[test]
    fn test_parse_level_falls_back_to_info() {
        assert_eq!(parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn test_init_is_idempotent() {
        init(Some("debug"));
        init(Some("error"));
    }
}
