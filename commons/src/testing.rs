//! Shared helpers for unit tests.

use tokio::runtime::Runtime;

/// Wire `log` output into the test harness.
///
/// Safe to call from every test; registrations after the first are
/// silently ignored, which is exactly what concurrently running tests
/// need.
pub fn try_init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A runtime for driving async code from synchronous tests, with
/// logging already wired up.
pub fn init_runtime() -> anyhow::Result<Runtime> {
    try_init_logging();
    Runtime::new().map_err(anyhow::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_drives_futures() {
        let runtime = init_runtime().unwrap();
        assert_eq!(runtime.block_on(async { 2 + 2 }), 4);
    }

    #[test]
    fn repeated_logging_init_is_harmless() {
        try_init_logging();
        try_init_logging();
    }
}
