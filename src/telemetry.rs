//! Tracing setup for binaries and tests embedding the session client.

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Installs the global subscriber once; later calls are no-ops so tests
/// can all call it. `filter` is a tracing directive string and yields to
/// `RUST_LOG` when that is set.
pub fn init_tracing(filter: &str) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    });
}
