//! Tracing initialisation for tests.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset: chatty for our own crates,
/// quiet for dependencies.
const DEFAULT_FILTER: &str = "info,colloquy_core=debug,colloquy_config=debug";

/// Initialise a tracing subscriber wired to the test-harness writer.
///
/// Idempotent — the first caller wins, later calls are silently ignored —
/// so every test that cares about log output can call it unconditionally.
pub fn init_test_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
