//! Shared logging initialization for loopwatch binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

fn parse_level(raw: Option<&str>) -> tracing::Level {
    match raw.unwrap_or("info").trim().to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize process-level tracing output from `LW_LOG`.
///
/// Safe to call multiple times; only the first call installs a subscriber.
/// Best-effort, never returns an error.
pub fn init() {
    let raw = std::env::var("LW_LOG").ok();
    init_with_level(parse_level(raw.as_deref()));
}

/// Initialize tracing output at an explicit level (used by `--verbose`).
pub fn init_with_level(level: tracing::Level) {
    if INIT.get().is_some() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}
