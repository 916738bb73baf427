//! Diagnostic tracing for the supervisor.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. It is separate from
//! product output: progress events and the final run report go to stdout, and
//! durable state lives in `.foreman/tasks/`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn`, or `foreman=debug` with `verbose`.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=foreman=trace foreman launch "add a health endpoint"
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,foreman=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
