use std::sync::Once;

use env_logger::Env;
use log::{debug, LevelFilter};

static LOG_ONCE: Once = Once::new();

fn env_level() -> LevelFilter {
    std::env::var("AVRCAL_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

fn level_to_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    }
}

/// Initialize stderr logging based on `AVRCAL_LOG`/`RUST_LOG`.
/// Safe to call multiple times; only the first call installs the logger.
pub fn init_logging() {
    init_logging_with(env_level());
}

/// Initialize stderr logging with an explicit level (e.g. from `--verbose`).
pub fn init_logging_with(level: LevelFilter) {
    LOG_ONCE.call_once(|| {
        install(level);
    });
}

/// Install the stderr logger. Returns false when another logger already
/// owns the global slot; that logger is kept.
fn install(level: LevelFilter) -> bool {
    let env = Env::default().default_filter_or(level_to_str(level));
    match env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_module_path(true)
        .format_target(true)
        .try_init()
    {
        Ok(()) => true,
        Err(e) => {
            debug!("stderr logger not installed: {e}");
            false
        }
    }
}
