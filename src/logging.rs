use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize console logging.
/// Uses `RUST_LOG` if set, else `default_level`. Returns the filter actually applied.
pub fn init_logging(default_level: &str) -> String {
    let level = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let (filter, level) = match EnvFilter::try_new(&level) {
        Ok(filter) => (filter, level),
        Err(_) => (EnvFilter::new("info"), "info".to_string()),
    };

    // A subscriber may already be installed (tests, embedding applications).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init();

    level
}
