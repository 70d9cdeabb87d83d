//! `tracing` subscriber setup. Default verbosity is `warn`; `--debug` raises it to `debug` for
//! this crate while leaving dependencies at their own default.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "warn";
const DEBUG_FILTER: &str = "mirrorfs=debug,warn";

/// Install the global subscriber. Safe to call once per process; a second call is a logic
/// error in the caller, not something this function guards against.
pub fn init(debug: bool) {
    let directive = if debug { DEBUG_FILTER } else { DEFAULT_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
