//! Structured logging initialization.
//!
//! The RUST_LOG environment variable takes precedence over the configured
//! level.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber.
pub fn init(config: &LoggingConfig) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(config.level.as_str())
    };

    let registry = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer()
        .with_target(config.target)
        .with_thread_names(config.thread_names);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(layer.with_ansi(true)).init(),
        (LogFormat::Pretty, false) => registry
            .with(layer.with_ansi(true).without_time())
            .init(),
        (LogFormat::Compact, true) => registry.with(layer.compact().with_ansi(true)).init(),
        (LogFormat::Compact, false) => registry
            .with(layer.compact().with_ansi(true).without_time())
            .init(),
        (LogFormat::Json, true) => registry.with(layer.json()).init(),
        (LogFormat::Json, false) => registry.with(layer.json().without_time()).init(),
    }
}
