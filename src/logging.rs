//! Subscriber setup for the `mlc` binary. Library code only emits `tracing`
//! events and never installs a subscriber itself.

use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "ml_connector=info,mlc=info";

/// Install the global subscriber, writing to stderr so stdout stays clean
/// for command output. A second call is a no-op.
pub fn init(json: bool) {
    let filter = filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref());

    // Each builder method returns a different type, so the two formats are
    // spelled out separately.
    let result = if json {
        let layer = fmt::layer()
            .json()
            .with_ansi(false)
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()
    } else {
        let layer = fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()
    };
    if let Err(e) = result {
        tracing::debug!(error = %e, "subscriber already installed");
    }
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
