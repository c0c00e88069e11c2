//! Logging setup: env-filtered structured logs on stderr, suitable for a
//! router's process supervisor to capture.

use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _,
};

/// Initialize the global subscriber. `default_directive` applies when
/// `RUST_LOG` is unset.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();
}
