use std::env;

use preloader_service::config::{Config, LogFormat};
use sentry::integrations::tracing::EventFilter;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

/// The default filter: the preloader crates log at `level`, dependencies at most at `INFO`.
fn default_rust_log(level: LevelFilter) -> String {
    match level.into_level() {
        None => String::new(),
        Some(level) if level <= Level::INFO => level.to_string(),
        Some(level) => format!("INFO,preloader={level},preloader_service={level}"),
    }
}

/// Initializes logging for the preloader.
///
/// Honors `RUST_LOG` and otherwise filters by the configured level. Also sets `RUST_BACKTRACE`
/// if [`enable_backtraces`](preloader_service::config::Logging::enable_backtraces) is on.
///
/// # Safety
/// Calls [`std::env::set_var`], so no other thread may exist yet.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: Forwarded to the caller.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| default_rust_log(config.logging.level));

    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_writer(std::io::stderr)
        .with_target(true);

    let fmt_layer = match (config.logging.format, console::user_attended_stderr()) {
        (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
        (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
            layer.compact().with_ansi(false).boxed()
        }
        (LogFormat::Json, _) => layer
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
    };

    // Warnings become sentry logs too, errors are additionally reported as events.
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            Level::ERROR => EventFilter::Event | EventFilter::Log,
            Level::WARN | Level::INFO => EventFilter::Log,
            Level::DEBUG | Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&rust_log)))
        .with(sentry_layer)
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
