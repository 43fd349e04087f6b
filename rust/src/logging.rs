use std::path::Path;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "pika_relay_core=debug,info";

/// Logging initialization.
///
/// - stderr via `tracing-subscriber::fmt`, filtered by `RUST_LOG` or
///   `pika_relay_core=debug,info`
/// - with a `data_dir`, also appends to `<data_dir>/pika_relay.log` so logs
///   survive the terminal
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging(data_dir: Option<&Path>) {
    let env_filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let file_layer = data_dir.and_then(|dir| {
        let _ = std::fs::create_dir_all(dir);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("pika_relay.log"))
            .ok()?;
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter()),
        )
    });

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter());

    let _ = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}
