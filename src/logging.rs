use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_DIR: &str = "logs";
const LOG_FILE: &str = "aq_scraper.log";

/// Installs the global tracing subscriber: human-readable console output
/// plus JSON lines in a daily-rotated file under `logs/`.
///
/// `RUST_LOG` overrides the default `aq_scraper=info` filter.
pub fn init_logging() {
    let _ = fs::create_dir_all(LOG_DIR);

    let file_appender = tracing_appender::rolling::daily(LOG_DIR, LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("aq_scraper=info".parse().unwrap()))
        .with(fmt::layer().json().with_writer(file_writer))
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();

    // The guard flushes buffered lines on drop; logging lives for the whole
    // process, so it must never drop.
    std::mem::forget(guard);
}
