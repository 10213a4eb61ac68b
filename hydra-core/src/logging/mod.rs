//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; binaries and tests call
//! [`init_tracing`] once to install a subscriber.

mod config;

pub use config::{LogFormat, LoggingConfig, LoggingConfigBuilder};

use anyhow::{Context, Result};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install a global tracing subscriber.
///
/// Fails if the filter does not parse or a global subscriber is already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(config.log_filter())
        .with_context(|| format!("Invalid log filter '{}'", config.log_filter()))?;

    tracing_subscriber::registry()
        .with(output_layer(config).with_filter(filter))
        .try_init()
        .context("Failed to initialize tracing subscriber")
}

/// Install a subscriber for tests, writing through the test harness.
///
/// The filter comes from `HYDRA_LOG_LEVEL` or `RUST_LOG` and defaults to
/// `warn`. Safe to call from many tests; only the first call installs
/// anything.
pub fn init_test_tracing() {
    let filter = std::env::var("HYDRA_LOG_LEVEL")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "warn".to_string());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn output_layer(config: &LoggingConfig) -> BoxedLayer {
    let location = config.include_location();
    let threads = config.include_thread_names();

    match config.log_format() {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_file(location)
            .with_line_number(location)
            .with_thread_names(threads)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(location)
            .with_line_number(location)
            .with_thread_names(threads)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(location)
            .with_line_number(location)
            .with_thread_names(threads)
            .boxed(),
    }
}
