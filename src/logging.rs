//! Diagnostic tracing for the engine and CLI.
//!
//! Reads `RUST_LOG`; defaults to `warn`, or `forge_exec=debug` when the CLI
//! runs with `--verbose`. Output goes to stderr so command output on stdout
//! stays machine-readable.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default directive when `--verbose` is set and `RUST_LOG` is not.
const VERBOSE_DIRECTIVE: &str = "forge_exec=debug";

/// Install the global subscriber. Safe to call more than once.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    // A second call (tests, embedding hosts) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose { VERBOSE_DIRECTIVE } else { "warn" }
}
