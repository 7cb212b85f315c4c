//! Tracing setup for embedding processes.
//!
//! Per-job correlation comes from spans carrying `request_id` /
//! `stream_name` fields; every coordinator task enters one before touching
//! job state.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "catalyst_vod=info,hls_vod=info,transcode_pool=info";

/// Install a global subscriber with an `EnvFilter` seeded from `RUST_LOG`,
/// falling back to [`DEFAULT_LOG_FILTER`].
///
/// Returns an error when a subscriber is already installed, so embedding
/// processes that configure their own logging can call this unconditionally.
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}
