//! Logging bootstrap.
//! Hosts embedding the bridge call [`init`] once at startup; the level
//! comes from `RUST_LOG` with an `info` default.

use std::sync::Once;

use env_logger::Env;

static INIT: Once = Once::new();

/// Initializes env_logger. Idempotent, so tests and hosts can call it
/// without coordinating.
pub fn init() {
    INIT.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
        log::info!("logging initialized");
    });
}
