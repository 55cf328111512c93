use std::str::FromStr;

use tracing::Level;

/// Level named by `settings.logging.level`; unknown names fall back to INFO.
pub fn parse_level(name: &str) -> Level {
    match name.trim().to_ascii_lowercase().as_str() {
        "warning" => Level::WARN,
        other => Level::from_str(other).unwrap_or(Level::INFO),
    }
}

/// Install the broker's fmt subscriber.
///
/// Sessions and timers log from many threads, so thread ids are included.
/// Returns `false` when a global subscriber was already installed, which is
/// the normal case in tests.
pub fn init(level: &str) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .with_target(false)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}
