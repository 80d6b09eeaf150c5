//! Development-time tracing for debugging the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of patcheval product output.
//!
//! - **Run logs (`io/log_dir`, `io/trace`, `io/checkpoint`)**: Product artifacts in
//!   the per-run log directory. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing subscriber for development logging.
///
/// Reads `RUST_LOG` env var. If unset, defaults to `warn`, or to
/// `patcheval=debug` when `verbose` is set (`--verbose` on the CLI).
/// Output: stderr, compact format, so it never interleaves with the progress
/// lines on stdout.
///
/// # Example
/// ```bash
/// RUST_LOG=patcheval::stage=debug patcheval run v6.6 v6.6.1
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,patcheval=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
