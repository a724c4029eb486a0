//! Telemetry for the runner.
//!
//! Structured `tracing` output only. Logs go to stderr or a file so that
//! stdout stays free for test results.

mod logging;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
