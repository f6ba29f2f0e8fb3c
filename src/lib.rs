pub mod config;
pub mod pipeline;

use tracing_subscriber::EnvFilter;

pub use pipeline::extraction::{CancellationFlag, ExtractionError};
pub use pipeline::processor::{DocumentAnalysis, DocumentAnalyzer};

/// Install the global subscriber. Honors `RUST_LOG`, otherwise falls back to
/// [`config::default_log_filter`]. Logs go to stderr so stdout stays clean
/// for JSON output. A second call is a no-op.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
