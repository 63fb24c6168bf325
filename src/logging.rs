//! Structured logging setup.
//!
//! Logs go to stderr so that command output on stdout stays clean.
//! `RUST_LOG` takes precedence over `[logging] level`.

use std::sync::Once;

use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Install the global tracing subscriber. Later calls are no-ops.
pub fn init(cfg: &LoggingConfig) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&cfg.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let fmt_layer = if cfg.json {
            fmt::layer()
                .with_writer(std::io::stderr)
                .json()
                .with_current_span(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .boxed()
        };

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("Warning: a global tracing subscriber was already installed");
        }
    });
}
