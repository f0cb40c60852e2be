//! Log output on stderr.
//!
//! `RUST_LOG` overrides the filter chosen from the `--debug` flag.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "imagelock=info,warn";
const DEBUG_FILTER: &str = "imagelock=debug,info";

/// The filter directives for the given verbosity, ignoring `RUST_LOG`.
pub fn default_directives(debug: bool) -> &'static str {
    if debug { DEBUG_FILTER } else { DEFAULT_FILTER }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(debug)
                .with_filter(filter),
        )
        .try_init();
}
