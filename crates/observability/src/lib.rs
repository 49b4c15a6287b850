//! Process-wide tracing setup shared by binaries and integration tests.

/// Subscriber installation (filters, output formats).
pub mod subscriber;

pub use subscriber::{LogFormat, init_with};

/// Initialize JSON logging, filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    init_with(LogFormat::Json);
}

/// Initialize human-readable logging, for local runs and tests.
pub fn init_pretty() {
    init_with(LogFormat::Pretty);
}
