//! Subscriber setup for binaries and embedders that don't bring their own.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`), plus the
/// [`ErrorLayer`] that lets errors capture their span traces.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(ErrorLayer::default())
        .try_init();
    if result.is_err() {
        tracing::debug!("A global tracing subscriber is already installed");
    }
}
