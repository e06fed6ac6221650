//! Tracing setup shared by the binaries.

use tracing_subscriber::EnvFilter;

/// Initialize tracing: compact format on stderr, filtered by
/// `RUST_LOG` and quiet (warnings only) by default.  Timestamps are
/// omitted since the usual log targets add their own.
pub fn initialize_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
