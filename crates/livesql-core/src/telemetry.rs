//! Tracing subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global tracing subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over `config.level`. Subsequent calls, or a
/// subscriber installed by the host application, leave the existing one in
/// place.
pub fn init_tracing(config: &LoggingConfig) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{},livesql_core={}", config.level, config.level)));

        let result = if config.format == "json" {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
        };

        if result.is_err() {
            tracing::debug!("tracing subscriber already installed, keeping it");
        }
    });
}
