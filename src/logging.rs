//! Process logger.
//!
//! The logger is installed before the configuration is read, filtered by
//! `RUST_LOG` or `info`. Once the configuration is loaded its
//! `logging.level` replaces that filter, unless `RUST_LOG` is set.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError, debug};
use parking_lot::RwLock;
use std::sync::OnceLock;

const INITIAL_FILTER: &str = "info";

static LOGGER: OnceLock<ReloadableLogger> = OnceLock::new();

/// An `env_logger` whose filter can be swapped after installation.
pub struct ReloadableLogger {
    inner: RwLock<env_logger::Logger>,
}

impl ReloadableLogger {
    pub fn new(filter: &str) -> Self {
        Self {
            inner: RwLock::new(build(filter)),
        }
    }

    /// Replace the filter and return the new maximum level.
    pub fn reload(&self, filter: &str) -> LevelFilter {
        let logger = build(filter);
        let max = logger.filter();
        *self.inner.write() = logger;
        max
    }

    pub fn max_level(&self) -> LevelFilter {
        self.inner.read().filter()
    }
}

impl Log for ReloadableLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.read().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.inner.read().log(record);
    }

    fn flush(&self) {
        self.inner.read().flush();
    }
}

fn build(filter: &str) -> env_logger::Logger {
    env_logger::Builder::new()
        .parse_filters(filter)
        .format_timestamp_millis()
        .build()
}

/// The filter to use: `RUST_LOG` when set and non-empty, else `fallback`.
fn effective_filter(fallback: &str, from_env: Option<String>) -> String {
    from_env
        .filter(|spec| !spec.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn env_filter() -> Option<String> {
    std::env::var(env_logger::DEFAULT_FILTER_ENV).ok()
}

/// Install the process logger. Call once, before anything logs.
pub fn init() -> Result<(), SetLoggerError> {
    let logger = LOGGER.get_or_init(|| {
        ReloadableLogger::new(&effective_filter(INITIAL_FILTER, env_filter()))
    });
    log::set_logger(logger)?;
    log::set_max_level(logger.max_level());
    Ok(())
}

/// Apply the configured filter to the installed logger.
pub fn apply_configured(level: &str) {
    let Some(logger) = LOGGER.get() else {
        return;
    };
    if env_filter().is_some_and(|spec| !spec.trim().is_empty()) {
        debug!("RUST_LOG is set, ignoring logging.level '{}'", level);
        return;
    }
    log::set_max_level(logger.reload(level));
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    fn metadata(level: Level) -> Metadata<'static> {
        Metadata::builder()
            .level(level)
            .target("garage_controller::config")
            .build()
    }

    #[test]
    fn test_env_filter_takes_precedence() {
        assert_eq!(effective_filter("debug", Some("warn".to_string())), "warn");
        assert_eq!(effective_filter("debug", Some("  ".to_string())), "debug");
        assert_eq!(effective_filter("debug", None), "debug");
    }

    #[test]
    fn test_reload_changes_filter() {
        let logger = ReloadableLogger::new(INITIAL_FILTER);
        assert!(logger.enabled(&metadata(Level::Info)));
        assert!(!logger.enabled(&metadata(Level::Debug)));
        assert_eq!(logger.max_level(), LevelFilter::Info);

        assert_eq!(logger.reload("garage_controller=debug"), LevelFilter::Debug);
        assert!(logger.enabled(&metadata(Level::Debug)));

        assert_eq!(logger.reload("warn"), LevelFilter::Warn);
        assert!(!logger.enabled(&metadata(Level::Info)));
    }
}
