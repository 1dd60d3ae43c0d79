//! Logging initialization for binaries and tests.

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize env_logger. Safe to call more than once; only the first
/// call takes effect.
pub fn init() {
    INIT.call_once(|| {
        env_logger::init();
        log::info!("Logging initialized");
    });
}
