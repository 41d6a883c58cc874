//! Logging initialization
//!
//! Console logging through tracing-subscriber. The default level is `info`,
//! lowered to `debug` by the CLI's debug flag; `RUST_LOG` overrides both.

use tracing_subscriber::EnvFilter;

/// Initialize the process-global subscriber.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(debug: bool, force_color: bool) {
    let default_directive = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let result = if force_color {
        builder.with_ansi(true).try_init()
    } else {
        builder.try_init()
    };
    // Already-initialized (tests, embedders) is fine.
    let _ = result;
}
