//! Tracing configuration and initialization.

use tracing_subscriber::{
    EnvFilter,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise `verbose` picks between an
/// operator-friendly default and debug chatter from our own crates.
pub fn init(verbose: bool) -> Result<(), TryInitError> {
    let default_filter = if verbose {
        "info,blobfs=debug"
    } else {
        "warn,blobfs=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
}
