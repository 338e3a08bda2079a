//! Test/example-only tracing setup, grounded on the pack's
//! `tracing-over-rapace` demo convention: the library itself never
//! installs a subscriber, but examples and integration tests need one.

#[cfg(feature = "diagnostics")]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_test_writer()
        .try_init();
}
