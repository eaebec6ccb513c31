//! Shared infrastructure: errors, counters, CLI arguments

pub mod cli;
pub mod error;
pub mod metrics;

pub use error::{PipelineError, PipelineResult};
pub use metrics::{AtomicCounters, CounterSnapshot, RateSnapshot};

/// Install the tracing subscriber used by the binaries.
///
/// `RUST_LOG` overrides the default `ephys_recorder=info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ephys_recorder=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
